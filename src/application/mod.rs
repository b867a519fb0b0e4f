//! Flow application: composition, routing and lifecycle of a running flow
//!
//! A `FlowApplication` is built from a set of modules and a flow definition.
//! Building instantiates every element, wires every connection through a
//! concurrency limiter, and sets up the control channel on the transport.
//! Composition is all-or-nothing: if any element or connection cannot be
//! set up, the application is destroyed before it ever runs.
//!
//! ```rust,ignore
//! let app = FlowApplication::builder()
//!     .module(builtin::core_module()?)
//!     .flow(FlowDefinition::from_json(&json)?)
//!     .transport(transport)
//!     .build()
//!     .await?;
//!
//! app.emit(FlowEvent::output(ElementMetadata::new("trigger"), json!({"n": 1})));
//! app.run_until_shutdown().await;
//! ```

pub mod backlog;
mod control;
mod router;
#[cfg(test)]
mod tests;

pub use control::{
    ControlMessage, ElementUpdate, FlowUpdate, DEPLOYMENT_DESTROY, DEPLOYMENT_MESSAGE,
    DEPLOYMENT_UPDATE,
};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch, OnceCell};
use tokio::task::JoinHandle;

use crate::api::Api;
use crate::config::{ExitMode, FlowConfig, RpcConfig};
use crate::definition::{DeploymentMessage, ElementMetadata, FlowContext, FlowDefinition};
use crate::element::{Dispatcher, ElementContext};
use crate::error::{FlowError, RpcError, TransportError};
use crate::event::FlowEvent;
use crate::events::{EventBus, EventPublisher, EventReceiver, EventTap, HealthState, LifecycleEvent};
use crate::logger::{FlowLogger, LogSink};
use crate::module::{FlowModule, ModuleRegistry};
use crate::queue::QueueStats;
use crate::rpc::RpcClient;
use crate::transport::{
    Binding, Delivery, ExchangeKind, Message, MessageHandler, Transport, DEPLOYMENT_EXCHANGE,
    FLOWEVENTS_EXCHANGE, FLOWLOGS_EXCHANGE,
};

use router::{guarded, Observers, RoutingTable};

/// Lifecycle state of a flow application
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AppState {
    /// Created, composition not started
    Uninitialized,
    /// Composing elements and connections
    Initializing,
    /// Routing events
    Running,
    /// Shut down; there is no way back
    Destroyed,
}

/// Builder for a `FlowApplication`
#[derive(Default)]
pub struct FlowApplicationBuilder {
    modules: Vec<FlowModule>,
    flow: FlowDefinition,
    transport: Option<Arc<dyn Transport>>,
    api: Option<Arc<dyn Api>>,
    log_sink: Option<Arc<dyn LogSink>>,
    config: FlowConfig,
    rpc_config: RpcConfig,
}

impl FlowApplicationBuilder {
    /// Create a builder with an empty flow and default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module
    pub fn module(mut self, module: FlowModule) -> Self {
        self.modules.push(module);
        self
    }

    /// Add several modules, in order
    pub fn modules(mut self, modules: impl IntoIterator<Item = FlowModule>) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Set the flow to run
    pub fn flow(mut self, flow: FlowDefinition) -> Self {
        self.flow = flow;
        self
    }

    /// Connect the flow to a broker
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share an HTTP capability with every element
    pub fn api(mut self, api: Arc<dyn Api>) -> Self {
        self.api = Some(api);
        self
    }

    /// Forward every log call to an external sink
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Runtime configuration
    pub fn config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }

    /// RPC client configuration
    pub fn rpc_config(mut self, config: RpcConfig) -> Self {
        self.rpc_config = config;
        self
    }

    /// Compose the flow and start routing
    ///
    /// On a composition error the application is destroyed (which exits
    /// the process in `ExitMode::Process`) and the error is returned.
    pub async fn build(self) -> Result<FlowApplication, FlowError> {
        let runtime = Arc::new(Runtime::new(&self));
        runtime.set_state(AppState::Initializing);

        if let Err(e) = runtime.compose(&self.modules, &self.flow) {
            runtime.logger.error(e.to_string());
            runtime.destroy(1).await;
            return Err(e);
        }

        runtime.setup_transport().await;
        runtime.start_watchdog();
        runtime.set_state(AppState::Running);
        runtime.logger.log("Flow Deployment is running");

        Ok(FlowApplication { runtime })
    }
}

impl fmt::Debug for FlowApplicationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowApplicationBuilder")
            .field("modules", &self.modules)
            .field("elements", &self.flow.elements.len())
            .field("has_transport", &self.transport.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// A running flow
///
/// Cheap to clone; all clones refer to the same flow.
#[derive(Clone)]
pub struct FlowApplication {
    runtime: Arc<Runtime>,
}

impl FlowApplication {
    /// Start building an application
    pub fn builder() -> FlowApplicationBuilder {
        FlowApplicationBuilder::new()
    }

    /// Current lifecycle state
    pub fn state(&self) -> AppState {
        self.runtime.state()
    }

    /// Current deployment context
    pub fn context(&self) -> FlowContext {
        self.runtime.context()
    }

    /// Current flow-scoped properties
    pub fn properties(&self) -> Map<String, Value> {
        self.runtime
            .flow_properties
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// IDs of the flow's elements, in definition order
    pub fn element_ids(&self) -> Vec<String> {
        self.runtime
            .table
            .get()
            .map(|t| t.elements().iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// The application's own logger
    pub fn logger(&self) -> &FlowLogger {
        &self.runtime.logger
    }

    /// Route `event` to the subscribers of its stream and mirror it to the log stream
    pub fn emit(&self, event: FlowEvent) {
        self.runtime.emit(event);
    }

    /// Route `complete`, mirror only `partial`
    pub fn emit_partial(&self, complete: FlowEvent, partial: FlowEvent) {
        self.runtime.emit_partial(complete, partial);
    }

    /// Observe every event routed on `stream_id` from now on
    pub fn subscribe(&self, stream_id: impl Into<String>) -> EventTap {
        EventTap::new(stream_id, self.runtime.taps.subscribe())
    }

    /// Observe handler lifecycle notifications from now on
    pub fn lifecycle(&self) -> EventReceiver<LifecycleEvent> {
        self.runtime.observers.lifecycle.subscribe()
    }

    /// Limiter statistics, keyed `element` or `element:stream`
    ///
    /// With an element ID, only that element's limiters are returned.
    pub fn queue_stats(&self, element_id: Option<&str>) -> BTreeMap<String, QueueStats> {
        let Some(table) = self.runtime.table.get() else {
            return BTreeMap::new();
        };
        table
            .limiters()
            .iter()
            .filter(|(key, _)| match element_id {
                Some(id) => key.as_str() == id || key.strip_prefix(id).is_some_and(|rest| rest.starts_with(':')),
                None => true,
            })
            .map(|(key, queue)| (key.clone(), queue.get_stats()))
            .collect()
    }

    /// Wait until every limiter has drained
    pub async fn idle(&self) {
        if let Some(table) = self.runtime.table.get() {
            for queue in table.limiters().values() {
                queue.on_idle().await;
            }
        }
    }

    /// The flow's RPC client, created on first use
    pub async fn rpc_client(&self) -> Result<Arc<RpcClient>, RpcError> {
        self.runtime.rpc_client().await
    }

    /// Handle a control message body as received from the `deployment` exchange
    pub async fn handle_control(&self, body: Value) -> Delivery {
        self.runtime.handle_control(body).await
    }

    /// Apply a reconfiguration and publish the resulting health status
    pub async fn update(&self, update: FlowUpdate) -> HealthState {
        self.runtime.update(update).await
    }

    /// Deliver a custom message to one element, or to all of them
    pub async fn send_message(&self, message: DeploymentMessage) {
        self.runtime.send_message(message).await;
    }

    /// Shut the flow down
    ///
    /// Calls `on_destroy` on every element, closes the RPC client, waits the
    /// configured grace period, then closes the transport. In
    /// `ExitMode::Process` the process exits with `exit_code` afterwards.
    pub async fn destroy(&self, exit_code: i32) {
        self.runtime.destroy(exit_code).await;
    }

    /// Wait until a `destroy` has completed
    pub async fn wait_for_shutdown(&self) {
        let mut finished = self.runtime.finished.subscribe();
        let _ = finished.wait_for(Option::is_some).await;
    }

    /// Exit code of a completed `destroy`
    pub fn exit_code(&self) -> Option<i32> {
        *self.runtime.finished.borrow()
    }

    /// Run until shut down by a control message, a signal, or a crash
    ///
    /// SIGTERM and Ctrl-C destroy the flow with exit code 0. A panic outside
    /// element code destroys it with exit code 1.
    pub async fn run_until_shutdown(&self) {
        let mut crashed = crash_signal();

        tokio::select! {
            _ = shutdown_signal() => {
                self.runtime.logger.log("Flow Deployment is terminating");
                self.destroy(0).await;
            }
            _ = crashed.recv() => {
                self.runtime.logger.error("Uncaught panic!");
                self.destroy(1).await;
            }
            _ = self.wait_for_shutdown() => {}
        }
    }
}

impl fmt::Debug for FlowApplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowApplication")
            .field("state", &self.state())
            .field("context", &self.context())
            .field("elements", &self.element_ids())
            .finish()
    }
}

/// Notified of every panic outside element code
///
/// The panic hook is installed once per process and chains the hook that
/// was in place before it.
fn crash_signal() -> broadcast::Receiver<()> {
    static CRASHES: OnceLock<broadcast::Sender<()>> = OnceLock::new();
    CRASHES
        .get_or_init(|| {
            let (crashes, _) = broadcast::channel(1);
            let notify = crashes.clone();
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                previous(info);
                if !router::in_element_scope() {
                    let _ = notify.send(());
                }
            }));
            crashes
        })
        .subscribe()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Shared state behind a `FlowApplication`
struct Runtime {
    config: FlowConfig,
    rpc_config: RpcConfig,
    context: RwLock<FlowContext>,
    flow_properties: Arc<RwLock<Map<String, Value>>>,
    logger: FlowLogger,
    transport: Option<Arc<dyn Transport>>,
    publisher: Option<Arc<EventPublisher>>,
    api: Option<Arc<dyn Api>>,
    log_sink: Option<Arc<dyn LogSink>>,
    observers: Observers,
    taps: EventBus<FlowEvent>,
    table: OnceLock<RoutingTable>,
    rpc: OnceCell<Arc<RpcClient>>,
    state: Mutex<AppState>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    finished: watch::Sender<Option<i32>>,
}

impl Runtime {
    fn new(builder: &FlowApplicationBuilder) -> Self {
        let config = builder.config.clone();
        let context = builder.flow.context.clone();
        let publisher = builder
            .transport
            .clone()
            .map(|t| Arc::new(EventPublisher::new(t, &config)));
        let logger = FlowLogger::for_application(&context)
            .with_sink(builder.log_sink.clone())
            .with_publisher(publisher.clone());
        let observers = Observers {
            publisher: publisher.clone(),
            lifecycle: EventBus::with_capacity(config.tap_capacity),
            lifecycle_events: config.lifecycle_events,
            logger: logger.clone(),
        };

        Self {
            taps: EventBus::with_capacity(config.tap_capacity),
            rpc_config: builder.rpc_config.clone(),
            context: RwLock::new(context),
            flow_properties: Arc::new(RwLock::new(builder.flow.properties.clone())),
            logger,
            transport: builder.transport.clone(),
            publisher,
            api: builder.api.clone(),
            log_sink: builder.log_sink.clone(),
            observers,
            table: OnceLock::new(),
            rpc: OnceCell::new(),
            state: Mutex::new(AppState::Uninitialized),
            watchdog: Mutex::new(None),
            finished: watch::Sender::new(None),
            config,
        }
    }

    fn state(&self) -> AppState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `next` unless already destroyed; returns the previous state
    fn set_state(&self, next: AppState) -> AppState {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = *state;
        if previous != AppState::Destroyed {
            *state = next;
            tracing::debug!(from = ?previous, to = ?next, "Flow application state changed");
        }
        previous
    }

    fn context(&self) -> FlowContext {
        self.context
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn compose(self: &Arc<Self>, modules: &[FlowModule], flow: &FlowDefinition) -> Result<(), FlowError> {
        let registry = ModuleRegistry::from_modules(modules)?;
        let dispatcher: Weak<dyn Dispatcher> = Arc::<Runtime>::downgrade(self);
        let context = self.context();

        let table = RoutingTable::compose(&registry, flow, &self.config, |definition| {
            let metadata = ElementMetadata::for_element(
                &context,
                &definition.id,
                definition.name.clone(),
                &definition.function_fqn,
            );
            ElementContext::new(metadata)
                .with_log_sink(self.log_sink.clone())
                .with_api(self.api.clone())
                .with_publisher(self.publisher.clone())
                .with_dispatcher(dispatcher.clone())
                .with_flow_properties(self.flow_properties.clone())
        })?;

        self.table
            .set(table)
            .map_err(|_| FlowError::InvalidState("flow is already composed".to_string()))
    }

    async fn setup_transport(self: &Arc<Self>) {
        let Some(transport) = &self.transport else {
            return;
        };

        let weak = Arc::downgrade(self);
        let handler: MessageHandler = Arc::new(move |message: Message| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(runtime) => runtime.handle_control(message.body).await,
                    None => Delivery::Nack { requeue: false },
                }
            }
            .boxed()
        });
        let deployment_id = self.context().deployment_id.unwrap_or_default();

        let setup = async {
            transport
                .assert_exchange(DEPLOYMENT_EXCHANGE, ExchangeKind::Direct)
                .await?;
            transport
                .assert_exchange(FLOWLOGS_EXCHANGE, ExchangeKind::Fanout)
                .await?;
            transport
                .assert_exchange(FLOWEVENTS_EXCHANGE, ExchangeKind::Fanout)
                .await?;
            transport
                .create_subscriber(
                    handler,
                    Binding::new(DEPLOYMENT_EXCHANGE, deployment_id),
                    "flow-control",
                )
                .await?;
            Ok::<_, TransportError>(())
        };
        if let Err(e) = setup.await {
            self.logger
                .error(format!("could not assert Exchange!\nError:\n{}", e));
        }
    }

    fn start_watchdog(&self) {
        let Some(table) = self.table.get() else {
            return;
        };
        if table.monitors().is_empty() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let handle = backlog::spawn_watchdog(
            table.monitors().to_vec(),
            self.config.backlog_check_interval,
            self.logger.clone(),
        );
        *self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    fn mirror(&self, event: &FlowEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.publish_detached(event.clone());
        }
    }

    /// Route `event` to its subscribers; false once the flow is destroyed
    fn route(&self, event: &FlowEvent) -> bool {
        if self.state() == AppState::Destroyed {
            tracing::debug!(stream_id = %event.get_stream_id(), "Dropping event emitted after destroy");
            return false;
        }
        self.taps.publish(event.clone());

        let Some(table) = self.table.get() else {
            return true;
        };
        let subscribers = table.subscribers(&event.get_stream_id());
        if subscribers.is_empty() {
            return true;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            self.logger.error(format!(
                "Cannot route event {} on {}: no async runtime",
                event.id(),
                event.get_stream_id()
            ));
            return true;
        }
        for subscription in subscribers {
            router::dispatch(subscription, event.clone(), &self.observers);
        }
        true
    }

    async fn destroy(&self, exit_code: i32) {
        if self.set_state(AppState::Destroyed) == AppState::Destroyed {
            return;
        }
        tracing::info!(exit_code, "Destroying flow application");

        if let Some(table) = self.table.get() {
            for (id, element) in table.elements() {
                if let Err(e) = guarded(id, element.on_destroy()).await {
                    self.logger.error(format!("{} failed to shut down: {}", id, e));
                }
            }
        }
        if let Some(rpc) = self.rpc.get() {
            rpc.close();
        }
        if let Some(watchdog) = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            watchdog.abort();
        }

        if !self.config.shutdown_grace.is_zero() {
            tokio::time::sleep(self.config.shutdown_grace).await;
        }
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.close().await {
                tracing::error!(error = %e, "Failed to close transport");
            }
        }

        self.finished.send_replace(Some(exit_code));
        if self.config.exit_mode == ExitMode::Process {
            std::process::exit(exit_code);
        }
    }
}

#[async_trait]
impl Dispatcher for Runtime {
    fn emit(&self, event: FlowEvent) {
        if self.route(&event) {
            self.mirror(&event);
        }
    }

    fn emit_partial(&self, complete: FlowEvent, partial: FlowEvent) {
        if self.route(&complete) {
            self.mirror(&partial);
        }
    }

    async fn rpc_client(&self) -> Result<Arc<RpcClient>, RpcError> {
        let transport = self
            .transport
            .clone()
            .ok_or(RpcError::Transport(TransportError::Unavailable))?;
        if self.state() == AppState::Destroyed {
            return Err(RpcError::Closed);
        }
        self.rpc
            .get_or_try_init(|| async {
                RpcClient::new(transport, self.rpc_config.clone(), self.logger.clone())
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Ok(mut watchdog) = self.watchdog.lock() {
            if let Some(handle) = watchdog.take() {
                handle.abort();
            }
        }
    }
}
