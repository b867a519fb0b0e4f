//! Subscription table and the handler invocation pipeline
//!
//! The table is built once during composition and never changes afterwards.
//! Each subscription pairs a source routing key with a bound target handler,
//! the limiter guarding that handler, and its backlog monitor.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use super::backlog::BacklogMonitor;
use crate::config::FlowConfig;
use crate::definition::{ElementDefinition, FlowDefinition};
use crate::element::{BoundElement, BoundHandler, ElementContext, FlowElement};
use crate::error::{ElementError, FlowError};
use crate::event::FlowEvent;
use crate::events::{EventBus, EventPublisher, LifecycleEvent, LifecycleKind};
use crate::logger::FlowLogger;
use crate::module::ModuleRegistry;
use crate::queue::{Queue, QueueOptions};

tokio::task_local! {
    static ELEMENT_SCOPE: String;
}

/// Whether the current code runs inside element code started by the runtime
pub(crate) fn in_element_scope() -> bool {
    ELEMENT_SCOPE.try_with(|_| ()).is_ok()
}

/// Run element code, turning a panic into `ElementError::Panicked`
pub(crate) async fn guarded<F, T>(label: &str, future: F) -> Result<T, ElementError>
where
    F: Future<Output = Result<T, ElementError>>,
{
    ELEMENT_SCOPE
        .scope(label.to_string(), AssertUnwindSafe(future).catch_unwind())
        .await
        .unwrap_or_else(|panic| Err(ElementError::Panicked(panic_message(panic.as_ref()))))
}

/// Synchronous counterpart of `guarded`
pub(crate) fn guarded_sync<T>(
    label: &str,
    f: impl FnOnce() -> Result<T, ElementError>,
) -> Result<T, ElementError> {
    ELEMENT_SCOPE
        .sync_scope(label.to_string(), || std::panic::catch_unwind(AssertUnwindSafe(f)))
        .unwrap_or_else(|panic| Err(ElementError::Panicked(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One target handler subscribed to a source routing key
pub(crate) struct Subscription {
    pub target: String,
    pub stream: String,
    pub function_fqn: String,
    pub element: Arc<dyn FlowElement>,
    pub handler: BoundHandler,
    pub limiter: Queue,
    pub monitor: Arc<BacklogMonitor>,
}

impl Subscription {
    fn label(&self) -> String {
        format!("{}.{}", self.target, self.stream)
    }
}

/// Elements, subscriptions and limiters of a composed flow
#[derive(Default)]
pub(crate) struct RoutingTable {
    elements: Vec<(String, Arc<dyn FlowElement>)>,
    subscriptions: HashMap<String, Vec<Arc<Subscription>>>,
    limiters: BTreeMap<String, Queue>,
    monitors: Vec<Arc<BacklogMonitor>>,
}

impl RoutingTable {
    /// Instantiate every element of `flow` and wire its connections
    ///
    /// Any failure aborts the whole composition.
    pub fn compose(
        registry: &ModuleRegistry,
        flow: &FlowDefinition,
        config: &FlowConfig,
        mut context_for: impl FnMut(&ElementDefinition) -> ElementContext,
    ) -> Result<Self, FlowError> {
        let mut table = Self::default();
        let mut bound: HashMap<&str, BoundElement> = HashMap::new();

        for definition in &flow.elements {
            if bound.contains_key(definition.id.as_str()) {
                return Err(FlowError::DuplicateElement(definition.id.clone()));
            }
            let element = registry.instantiate(
                &definition.id,
                &definition.key(),
                context_for(definition),
                definition.properties.clone(),
            )?;
            tracing::debug!(element_id = %definition.id, key = %definition.key(), "Element created");
            table
                .elements
                .push((definition.id.clone(), element.element.clone()));
            bound.insert(definition.id.as_str(), element);
        }

        for connection in &flow.connections {
            if connection.source.is_empty() || connection.target.is_empty() {
                continue;
            }
            if !bound.contains_key(connection.source.as_str()) {
                return Err(FlowError::ElementNotInitialized(connection.source.clone()));
            }
            let target = bound
                .get(connection.target.as_str())
                .ok_or_else(|| FlowError::ElementNotInitialized(connection.target.clone()))?;
            let handler = target
                .handlers
                .get(&connection.target_stream)
                .ok_or_else(|| FlowError::MissingHandler {
                    element: connection.target.clone(),
                    stream: connection.target_stream.clone(),
                })?;

            let (limiter_key, options) = match handler.options.concurrent {
                Some(concurrent) => (
                    format!("{}:{}", connection.target, connection.target_stream),
                    QueueOptions {
                        concurrent,
                        timeout: handler.options.timeout,
                    },
                ),
                None => (connection.target.clone(), QueueOptions::from(target.options)),
            };
            let limiter = table
                .limiters
                .entry(limiter_key)
                .or_insert_with(|| Queue::new(options))
                .clone();

            let monitor = Arc::new(BacklogMonitor::new(
                format!("{}.{}", connection.target, connection.target_stream),
                config.backlog_size_threshold,
                config.backlog_latency_threshold,
            ));
            table.monitors.push(monitor.clone());

            let subscription = Subscription {
                target: connection.target.clone(),
                stream: connection.target_stream.clone(),
                function_fqn: target
                    .element
                    .context()
                    .metadata()
                    .function_fqn
                    .unwrap_or_default(),
                element: target.element.clone(),
                handler: handler.clone(),
                limiter,
                monitor,
            };
            tracing::debug!(
                stream_id = %connection.routing_key(),
                target_stream = %subscription.label(),
                "Subscription created"
            );
            table
                .subscriptions
                .entry(connection.routing_key())
                .or_default()
                .push(Arc::new(subscription));
        }

        Ok(table)
    }

    /// Elements in definition order
    pub fn elements(&self) -> &[(String, Arc<dyn FlowElement>)] {
        &self.elements
    }

    /// Element by ID
    pub fn element(&self, id: &str) -> Option<&Arc<dyn FlowElement>> {
        self.elements
            .iter()
            .find(|(element_id, _)| element_id == id)
            .map(|(_, element)| element)
    }

    /// Subscriptions of a routing key
    pub fn subscribers(&self, stream_id: &str) -> &[Arc<Subscription>] {
        self.subscriptions
            .get(stream_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Limiters keyed `element` or `element:stream`
    pub fn limiters(&self) -> &BTreeMap<String, Queue> {
        &self.limiters
    }

    /// Backlog monitors of every subscription
    pub fn monitors(&self) -> &[Arc<BacklogMonitor>] {
        &self.monitors
    }
}

/// Where side effects of handler invocations go
#[derive(Clone)]
pub(crate) struct Observers {
    pub publisher: Option<Arc<EventPublisher>>,
    pub lifecycle: EventBus<LifecycleEvent>,
    pub lifecycle_events: bool,
    pub logger: FlowLogger,
}

impl Observers {
    fn notify(&self, subscription: &Subscription, kind: LifecycleKind, event: &FlowEvent, started: Option<Instant>) {
        let source = subscription.element.context().metadata().source();
        let lifecycle = LifecycleEvent::new(
            kind,
            source,
            subscription.function_fqn.clone(),
            event,
            started.map(|s| s.elapsed()),
        );
        self.lifecycle.publish(lifecycle.clone());
        if self.lifecycle_events {
            if let Some(publisher) = &self.publisher {
                publisher.publish_lifecycle_detached(lifecycle);
            }
        }
    }
}

/// Queue `event` for `subscription`; must be called within a tokio runtime
pub(crate) fn dispatch(subscription: &Arc<Subscription>, event: FlowEvent, observers: &Observers) {
    if let Some(warning) = subscription.monitor.enqueued() {
        observers.logger.warn(warning.to_string());
    }

    let started = Instant::now();
    let outcome = subscription
        .limiter
        .add(invoke(subscription.clone(), event.clone(), observers.clone()));

    let subscription = subscription.clone();
    let observers = observers.clone();
    tokio::spawn(async move {
        if let Err(e) = outcome.await {
            observers.notify(&subscription, LifecycleKind::Terminated, &event, Some(started));
            report(&subscription, &ElementError::from(e), &observers.logger);
        }
        subscription.monitor.dequeued();
    });
}

async fn invoke(subscription: Arc<Subscription>, event: FlowEvent, observers: Observers) {
    let label = subscription.label();
    let started = Instant::now();
    observers.notify(&subscription, LifecycleKind::Activated, &event, None);

    let result = guarded(&label, (subscription.handler.invoke)(event.clone())).await;

    match result {
        Ok(()) => {
            tracing::trace!(target_stream = %label, event_id = %event.id(), "Handler completed");
            observers.notify(&subscription, LifecycleKind::Completed, &event, Some(started));
        }
        Err(error) => {
            tracing::debug!(target_stream = %label, event_id = %event.id(), error = %error, "Handler failed");
            observers.notify(&subscription, LifecycleKind::Terminated, &event, Some(started));
            report(&subscription, &error, &observers.logger);
        }
    }
}

/// Hand a failed invocation to the element's own error handler
fn report(subscription: &Subscription, error: &ElementError, logger: &FlowLogger) {
    let handled = guarded_sync(&subscription.label(), || {
        subscription.element.handle_api_error(error);
        Ok(())
    });
    if handled.is_err() {
        logger.error(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn explode() -> Result<(), ElementError> {
        panic!("kaboom")
    }

    fn explode_sync() -> Result<(), ElementError> {
        panic!("{} failed", "sync")
    }

    #[tokio::test]
    async fn test_guarded_catches_panics() {
        let result = guarded("a.default", explode()).await;
        assert!(matches!(result, Err(ElementError::Panicked(msg)) if msg == "kaboom"));

        let ok = guarded("a.default", async { Ok::<_, ElementError>(in_element_scope()) }).await;
        assert!(ok.unwrap());
        assert!(!in_element_scope());
    }

    #[test]
    fn test_guarded_sync() {
        let result = guarded_sync("a", explode_sync);
        assert!(matches!(result, Err(ElementError::Panicked(msg)) if msg == "sync failed"));
        assert!(guarded_sync("a", || Ok(in_element_scope())).unwrap());
    }
}
