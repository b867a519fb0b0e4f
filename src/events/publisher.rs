//! Publishing of log mirrors, lifecycle notifications and health status

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::types::{HealthEvent, LifecycleEvent};
use crate::config::FlowConfig;
use crate::error::TransportError;
use crate::event::FlowEvent;
use crate::transport::{
    PublishOptions, Transport, DEPLOYMENT_EXCHANGE, FLOWEVENTS_EXCHANGE, FLOWLOGS_EXCHANGE,
    HEALTH_ROUTING_KEY,
};

/// Nesting depth kept when truncating oversized payloads
const TRUNCATE_DEPTH: usize = 4;
/// Characters kept per string when truncating oversized payloads
const TRUNCATE_STRING_LENGTH: usize = 1000;
/// Items kept per array when truncating oversized payloads
const TRUNCATE_ARRAY_LENGTH: usize = 100;

/// Publishes runtime output to the transport's well-known exchanges
#[derive(Clone)]
pub struct EventPublisher {
    transport: Arc<dyn Transport>,
    max_event_size_bytes: usize,
}

impl EventPublisher {
    /// Create a publisher for `transport`
    pub fn new(transport: Arc<dyn Transport>, config: &FlowConfig) -> Self {
        Self {
            transport,
            max_event_size_bytes: config.max_event_size_bytes,
        }
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Mirror `event` to the `flowlogs` exchange
    ///
    /// Payloads whose serialized envelope exceeds the configured size are
    /// replaced with a truncated rendering. The routed event is unaffected.
    pub async fn publish_event(&self, event: &FlowEvent) -> Result<(), TransportError> {
        let mut message = event.format();
        let size = serde_json::to_vec(&message).map(|b| b.len()).unwrap_or(0);
        if size > self.max_event_size_bytes {
            tracing::debug!(
                event_id = %event.id(),
                size,
                max = self.max_event_size_bytes,
                "Truncating oversized log event"
            );
            if let Some(data) = message.get_mut("data") {
                *data = truncate(data);
            }
        }
        self.transport
            .publish(FLOWLOGS_EXCHANGE, "", message, PublishOptions::default())
            .await
    }

    /// Mirror `event` in the background, logging failures
    pub fn publish_detached(&self, event: FlowEvent) {
        let publisher = self.clone();
        spawn_best_effort(async move {
            if let Err(e) = publisher.publish_event(&event).await {
                tracing::warn!(event_id = %event.id(), error = %e, "Failed to publish log event");
            }
        });
    }

    /// Publish a lifecycle notification to the `flowevents` exchange
    pub async fn publish_lifecycle(&self, lifecycle: &LifecycleEvent) -> Result<(), TransportError> {
        let body = to_json(lifecycle)?;
        let routing_key = lifecycle.data.function_fqn.clone();
        self.transport
            .publish(FLOWEVENTS_EXCHANGE, &routing_key, body, PublishOptions::default())
            .await
    }

    /// Publish a lifecycle notification in the background, logging failures
    pub fn publish_lifecycle_detached(&self, lifecycle: LifecycleEvent) {
        let publisher = self.clone();
        spawn_best_effort(async move {
            if let Err(e) = publisher.publish_lifecycle(&lifecycle).await {
                tracing::debug!(error = %e, "Failed to publish lifecycle event");
            }
        });
    }

    /// Publish a health status to `deployment` / `health`
    pub async fn publish_health(&self, health: &HealthEvent) -> Result<(), TransportError> {
        let body = to_json(health)?;
        self.transport
            .publish(DEPLOYMENT_EXCHANGE, HEALTH_ROUTING_KEY, body, PublishOptions::default())
            .await
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("max_event_size_bytes", &self.max_event_size_bytes)
            .finish()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, TransportError> {
    serde_json::to_value(value).map_err(|e| TransportError::InvalidState(e.to_string()))
}

fn spawn_best_effort<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::trace!("No async runtime, dropping publication"),
    }
}

/// Render an oversized payload as a bounded string
///
/// Nesting deeper than 4 levels is elided, strings are cut at 1000
/// characters and arrays at 100 items.
pub fn truncate(value: &Value) -> Value {
    match truncate_at(value, 0) {
        Value::String(s) => Value::String(s),
        other => Value::String(other.to_string()),
    }
}

fn truncate_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::String(s) => {
            let total = s.chars().count();
            if total > TRUNCATE_STRING_LENGTH {
                let kept: String = s.chars().take(TRUNCATE_STRING_LENGTH).collect();
                Value::String(format!(
                    "{}... {} more characters",
                    kept,
                    total - TRUNCATE_STRING_LENGTH
                ))
            } else {
                value.clone()
            }
        }
        Value::Object(_) if depth >= TRUNCATE_DEPTH => Value::String("[Object]".to_string()),
        Value::Array(_) if depth >= TRUNCATE_DEPTH => Value::String("[Array]".to_string()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_at(v, depth + 1)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => {
            let mut kept: Vec<Value> = items
                .iter()
                .take(TRUNCATE_ARRAY_LENGTH)
                .map(|v| truncate_at(v, depth + 1))
                .collect();
            if items.len() > TRUNCATE_ARRAY_LENGTH {
                kept.push(Value::String(format!(
                    "... {} more items",
                    items.len() - TRUNCATE_ARRAY_LENGTH
                )));
            }
            Value::Array(kept)
        }
        other => other.clone(),
    }
}
