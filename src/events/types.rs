//! Out-of-band notifications published by the runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::event::FlowEvent;

/// Phase of a handler invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    /// The handler is about to run
    Activated,
    /// The handler finished successfully
    Completed,
    /// The handler failed
    Terminated,
}

/// Details of a lifecycle notification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleData {
    /// ID of the event that triggered the handler
    pub flow_event_id: String,
    /// Function identifier of the handling element
    pub function_fqn: String,
    /// Routing key the event arrived on
    pub input_stream_id: String,
    /// Handler run time in milliseconds, once finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// A handler lifecycle notification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Source URI of the handling element
    pub source: String,
    /// Invocation phase
    #[serde(rename = "type")]
    pub kind: LifecycleKind,
    /// Details
    pub data: LifecycleData,
    /// When the phase was reached
    pub time: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Create a notification for `event` being handled by `function_fqn` at `source`
    pub fn new(
        kind: LifecycleKind,
        source: impl Into<String>,
        function_fqn: impl Into<String>,
        event: &FlowEvent,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            source: source.into(),
            kind,
            data: LifecycleData {
                flow_event_id: event.id().to_string(),
                function_fqn: function_fqn.into(),
                input_stream_id: event.get_stream_id(),
                duration: duration.map(|d| d.as_millis() as u64),
            },
            time: Utc::now(),
        }
    }

    /// Check if the handler has finished, successfully or not
    pub fn is_finished(&self) -> bool {
        self.kind != LifecycleKind::Activated
    }
}

/// Outcome of a reconfiguration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    /// Every element accepted the update
    #[serde(rename = "updated")]
    Updated,
    /// At least one element rejected the update
    #[serde(rename = "updating failed")]
    UpdatingFailed,
}

/// Payload of a health status message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Deployment the status refers to
    pub deployment_id: Option<String>,
    /// Outcome
    pub status: HealthState,
}

/// Envelope a `HealthStatus` is published in
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEvent {
    /// Unique message ID
    pub event_id: String,
    /// Creation time
    pub event_time: DateTime<Utc>,
    /// Message type
    pub event_type: String,
    /// Always `application/json`
    pub content_type: String,
    /// Status payload
    pub data: HealthStatus,
}

impl HealthEvent {
    /// Message type of health status messages
    pub const EVENT_TYPE: &'static str = "com.flowstudio.event.health";

    /// Wrap a status for `deployment_id`
    pub fn new(deployment_id: Option<String>, status: HealthState) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_time: Utc::now(),
            event_type: Self::EVENT_TYPE.to_string(),
            content_type: "application/json".to_string(),
            data: HealthStatus {
                deployment_id,
                status,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ElementMetadata;
    use serde_json::json;

    #[test]
    fn test_lifecycle_serialization() {
        let event = FlowEvent::output(ElementMetadata::new("src"), json!({}));
        let lifecycle = LifecycleEvent::new(
            LifecycleKind::Completed,
            "flows/f/deployments/d/elements/sink",
            "test.sink",
            &event,
            Some(Duration::from_millis(12)),
        );

        let value = serde_json::to_value(&lifecycle).unwrap();
        assert_eq!(value["type"], json!("completed"));
        assert_eq!(value["data"]["inputStreamId"], json!("src.default"));
        assert_eq!(value["data"]["functionFqn"], json!("test.sink"));
        assert_eq!(value["data"]["duration"], json!(12));
        assert!(lifecycle.is_finished());
    }

    #[test]
    fn test_activated_has_no_duration() {
        let event = FlowEvent::output(ElementMetadata::new("src"), json!({}));
        let lifecycle = LifecycleEvent::new(LifecycleKind::Activated, "s", "f", &event, None);
        let value = serde_json::to_value(&lifecycle).unwrap();
        assert!(value["data"].get("duration").is_none());
        assert!(!lifecycle.is_finished());
    }

    #[test]
    fn test_health_event_shape() {
        let health = HealthEvent::new(Some("dep".to_string()), HealthState::UpdatingFailed);
        let value = serde_json::to_value(&health).unwrap();
        assert_eq!(value["data"], json!({"deploymentId": "dep", "status": "updating failed"}));
        assert_eq!(value["eventType"], json!(HealthEvent::EVENT_TYPE));
    }
}
