//! Flow elements: user-defined processing units
//!
//! An element is a type implementing [`FlowElement`] (its runtime hooks) and
//! [`FlowFunction`] (how to describe and construct it). The descriptor binds
//! a function identifier to the element's input stream handlers:
//!
//! ```rust,ignore
//! impl FlowFunction for Delay {
//!     fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
//!         Ok(ElementDescriptor::new("core.task.delay")?
//!             .stream(InputStream::new("default", |el, ev| el.on_default(ev).boxed())))
//!     }
//!
//!     fn create(context: ElementContext, properties: Value) -> Result<Self, ElementError> {
//!         let properties = Properties::new(&context, Some(schema()), properties)?;
//!         Ok(Self { context, properties })
//!     }
//! }
//! ```
//!
//! Elements are shared between concurrent handler invocations, so every hook
//! takes `&self` and mutable state lives behind interior mutability.

pub mod properties;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::api::Api;
use crate::definition::{fill_template, DeploymentMessage, ElementMetadata, FlowContext, DEFAULT_STREAM};
use crate::error::{ElementError, FlowError, RpcError};
use crate::event::FlowEvent;
use crate::events::EventPublisher;
use crate::logger::{FlowLogger, LogSink};
use crate::queue::QueueOptions;
use crate::rpc::RpcClient;

use properties::{validate_properties, PropertySchema};

static FQN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z][a-zA-Z0-9]*[.-])*[a-zA-Z][a-zA-Z0-9]*$")
        .unwrap_or_else(|_| unreachable!("static pattern"))
});

/// A validated function identifier, e.g. `core.task.delay`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionFqn(String);

impl FunctionFqn {
    /// Validate `fqn`: dot- or hyphen-separated alphanumeric segments, each starting with a letter
    pub fn parse(fqn: &str) -> Result<Self, FlowError> {
        if FQN_RE.is_match(fqn) {
            Ok(Self(fqn.to_string()))
        } else {
            Err(FlowError::InvalidFunctionFqn(fqn.to_string()))
        }
    }

    /// The identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionFqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options of an input stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Give this stream its own limiter with this concurrency
    pub concurrent: Option<usize>,
    /// Emit only new data instead of merging it into the input event's data
    pub stop_propagation: bool,
    /// Per-invocation timeout of the stream's own limiter
    pub timeout: Option<Duration>,
}

/// Element-wide limiter options, shared by streams without their own limiter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementOptions {
    /// Concurrent invocations across the element's shared streams
    pub concurrent: usize,
    /// Per-invocation timeout
    pub timeout: Option<Duration>,
}

impl Default for ElementOptions {
    fn default() -> Self {
        Self {
            concurrent: 1,
            timeout: None,
        }
    }
}

impl From<ElementOptions> for QueueOptions {
    fn from(options: ElementOptions) -> Self {
        QueueOptions {
            concurrent: options.concurrent.max(1),
            timeout: options.timeout,
        }
    }
}

/// Future returned by a stream handler
pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), ElementError>>;

/// Handler method of an element for one input stream
pub type StreamHandler<E> = for<'a> fn(&'a E, FlowEvent) -> HandlerFuture<'a>;

/// Binding of an input stream name to a handler
pub struct InputStream<E> {
    name: String,
    options: StreamOptions,
    handler: StreamHandler<E>,
}

impl<E> InputStream<E> {
    /// Bind `handler` to the stream `name`
    pub fn new(name: impl Into<String>, handler: StreamHandler<E>) -> Self {
        Self {
            name: name.into(),
            options: StreamOptions::default(),
            handler,
        }
    }

    /// Bind `handler` to the `default` stream
    pub fn default_stream(handler: StreamHandler<E>) -> Self {
        Self::new(DEFAULT_STREAM, handler)
    }

    /// Give the stream its own limiter
    pub fn concurrent(mut self, concurrent: usize) -> Self {
        self.options.concurrent = Some(concurrent.max(1));
        self
    }

    /// Do not merge input data into emitted events
    pub fn stop_propagation(mut self) -> Self {
        self.options.stop_propagation = true;
        self
    }

    /// Time out invocations on the stream's own limiter
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream options
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }
}

impl<E> Clone for InputStream<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            options: self.options.clone(),
            handler: self.handler,
        }
    }
}

impl<E> fmt::Debug for InputStream<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// Static description of an element type
pub struct ElementDescriptor<E> {
    function_fqn: FunctionFqn,
    options: ElementOptions,
    streams: Vec<InputStream<E>>,
}

impl<E> ElementDescriptor<E> {
    /// Describe an element with function identifier `fqn`
    pub fn new(fqn: &str) -> Result<Self, FlowError> {
        Ok(Self {
            function_fqn: FunctionFqn::parse(fqn)?,
            options: ElementOptions::default(),
            streams: Vec::new(),
        })
    }

    /// Element-wide concurrency (minimum 1)
    pub fn concurrent(mut self, concurrent: usize) -> Self {
        self.options.concurrent = concurrent.max(1);
        self
    }

    /// Element-wide invocation timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Add an input stream; a later binding for the same name replaces the earlier one
    pub fn stream(mut self, stream: InputStream<E>) -> Self {
        self.streams.retain(|s| s.name != stream.name);
        self.streams.push(stream);
        self
    }

    /// Function identifier
    pub fn function_fqn(&self) -> &FunctionFqn {
        &self.function_fqn
    }

    /// Element-wide options
    pub fn options(&self) -> ElementOptions {
        self.options
    }

    /// Declared input streams
    pub fn streams(&self) -> &[InputStream<E>] {
        &self.streams
    }
}

impl<E> fmt::Debug for ElementDescriptor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementDescriptor")
            .field("function_fqn", &self.function_fqn)
            .field("options", &self.options)
            .field("streams", &self.streams)
            .finish()
    }
}

/// Runtime hooks of an element
///
/// All hooks except `context` have defaults. Errors returned from hooks
/// are logged by the runtime and never stop the flow.
#[async_trait]
pub trait FlowElement: Send + Sync + 'static {
    /// The context the element was created with
    fn context(&self) -> &ElementContext;

    /// Replace the element's own properties
    ///
    /// Implementations validate the whole value and apply nothing on failure.
    /// The default accepts only an empty update.
    fn on_properties_changed(&self, properties: Value) -> Result<(), ElementError> {
        match properties {
            Value::Null => Ok(()),
            Value::Object(map) if map.is_empty() => Ok(()),
            _ => Err(ElementError::PropertiesNotSupported(self.context().metadata().id)),
        }
    }

    /// The deployment context changed
    fn on_context_changed(&self, context: &FlowContext, name: Option<&str>) {
        self.context().update_context(context, name);
    }

    /// Flow-scoped properties changed; they are already visible through the context
    fn on_flow_properties_changed(&self, properties: &Map<String, Value>) -> Result<(), ElementError> {
        let _ = properties;
        Ok(())
    }

    /// A custom control message arrived
    async fn on_message(&self, message: DeploymentMessage) -> Result<(), ElementError> {
        let _ = message;
        Ok(())
    }

    /// The flow is shutting down
    async fn on_destroy(&self) -> Result<(), ElementError> {
        Ok(())
    }

    /// Log a failed handler invocation
    fn handle_api_error(&self, error: &ElementError) {
        self.context().handle_api_error(error);
    }
}

/// Element types that can be declared in a module
pub trait FlowFunction: FlowElement + Sized {
    /// Function identifier, options and input streams
    fn describe() -> Result<ElementDescriptor<Self>, FlowError>;

    /// Construct an instance from its context and initial properties
    fn create(context: ElementContext, properties: Value) -> Result<Self, ElementError>;
}

/// What an element can ask of the running flow
#[async_trait]
pub(crate) trait Dispatcher: Send + Sync {
    /// Route an event and mirror it to the log stream
    fn emit(&self, event: FlowEvent);

    /// Route `complete`, mirror only `partial`
    fn emit_partial(&self, complete: FlowEvent, partial: FlowEvent);

    /// The flow's RPC client
    async fn rpc_client(&self) -> Result<Arc<RpcClient>, RpcError>;
}

/// Everything the runtime injects into an element
#[derive(Clone)]
pub struct ElementContext {
    metadata: Arc<RwLock<ElementMetadata>>,
    logger: FlowLogger,
    api: Option<Arc<dyn Api>>,
    dispatcher: Option<Weak<dyn Dispatcher>>,
    flow_properties: Arc<RwLock<Map<String, Value>>>,
    streams: Arc<RwLock<HashMap<String, StreamOptions>>>,
}

impl ElementContext {
    /// Context of an element outside any running flow
    ///
    /// Emitted events are returned but go nowhere.
    pub fn new(metadata: ElementMetadata) -> Self {
        let metadata = Arc::new(RwLock::new(metadata));
        Self {
            logger: FlowLogger::shared(metadata.clone()),
            metadata,
            api: None,
            dispatcher: None,
            flow_properties: Arc::new(RwLock::new(Map::new())),
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Forward log calls to an external sink
    pub fn with_log_sink(mut self, sink: Option<Arc<dyn LogSink>>) -> Self {
        self.logger = self.logger.with_sink(sink);
        self
    }

    /// Inject the HTTP capability
    pub fn with_api(mut self, api: Option<Arc<dyn Api>>) -> Self {
        self.api = api;
        self
    }

    pub(crate) fn with_publisher(mut self, publisher: Option<Arc<EventPublisher>>) -> Self {
        self.logger = self.logger.with_publisher(publisher);
        self
    }

    pub(crate) fn with_dispatcher(mut self, dispatcher: Weak<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub(crate) fn with_flow_properties(mut self, properties: Arc<RwLock<Map<String, Value>>>) -> Self {
        self.flow_properties = properties;
        self
    }

    pub(crate) fn set_stream_options(&self, streams: HashMap<String, StreamOptions>) {
        *self
            .streams
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = streams;
    }

    /// Current identity of the element
    pub fn metadata(&self) -> ElementMetadata {
        self.metadata
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Element ID
    pub fn id(&self) -> String {
        self.metadata().id
    }

    /// The element's logger
    pub fn logger(&self) -> &FlowLogger {
        &self.logger
    }

    /// The HTTP capability, if the flow has one
    pub fn api(&self) -> Option<&Arc<dyn Api>> {
        self.api.as_ref()
    }

    /// Options of one of the element's input streams
    pub fn stream_options(&self, stream: &str) -> StreamOptions {
        self.streams
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply a new deployment context and, if given, a new display name
    pub fn update_context(&self, context: &FlowContext, name: Option<&str>) {
        let mut metadata = self
            .metadata
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(flow_id) = &context.flow_id {
            metadata.flow_id = Some(flow_id.clone());
        }
        if let Some(deployment_id) = &context.deployment_id {
            metadata.deployment_id = Some(deployment_id.clone());
        }
        if let Some(name) = name {
            metadata.name = Some(name.to_string());
        }
    }

    /// Current flow-scoped properties
    pub fn flow_properties(&self) -> Map<String, Value> {
        self.flow_properties
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the flow-scoped properties seen by this context
    pub fn replace_flow_properties(&self, properties: Map<String, Value>) {
        *self
            .flow_properties
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = properties;
    }

    /// Fill `${flow.key}` and `${key}` placeholders from the flow properties
    pub fn interpolate(&self, value: &Value) -> Value {
        let properties = Value::Object(self.flow_properties());
        let scoped = serde_json::json!({ "flow": properties.clone() });
        fill_template(value, &[&scoped, &properties])
    }

    /// Emit a prepared event
    pub fn emit(&self, event: FlowEvent) -> FlowEvent {
        if let Some(dispatcher) = self.dispatcher.as_ref().and_then(Weak::upgrade) {
            dispatcher.emit(event.clone());
        }
        event
    }

    /// Emit `data` on output `stream`
    pub fn emit_output(&self, data: impl Into<Value>, stream: &str) -> FlowEvent {
        self.emit(FlowEvent::new(self.metadata(), data, stream))
    }

    /// Emit `data` on `stream` in response to `input`
    ///
    /// Unless the input stream declares `stop_propagation`, the routed event
    /// carries the input data merged with `data` (new keys win) and only
    /// `data` itself is mirrored to the log stream.
    pub fn emit_event(&self, data: impl Into<Value>, input: Option<&FlowEvent>, stream: &str) -> FlowEvent {
        let partial = FlowEvent::new(self.metadata(), data, stream);

        let Some(input) = input else {
            return self.emit(partial);
        };
        let stop = input
            .input_stream()
            .map(|s| self.stream_options(s).stop_propagation)
            .unwrap_or(false);
        if stop {
            return self.emit(partial);
        }

        let (Value::Object(mut merged), Value::Object(new)) = (input.get_data(), partial.get_data()) else {
            return self.emit(partial);
        };
        merged.extend(new);
        let complete = FlowEvent::new(self.metadata(), Value::Object(merged), stream);

        if let Some(dispatcher) = self.dispatcher.as_ref().and_then(Weak::upgrade) {
            dispatcher.emit_partial(complete.clone(), partial);
        }
        complete
    }

    /// Validate an event's payload against `schema` and deserialize it
    pub fn validate_event_data<P: DeserializeOwned>(
        &self,
        schema: Option<&PropertySchema>,
        event: &FlowEvent,
        strict: bool,
    ) -> Result<P, ElementError> {
        validate_properties(&self.logger, schema, &event.get_data(), strict)
    }

    /// Routing key RPC workers of this element listen on
    pub fn rpc_routing_key(&self) -> String {
        self.metadata().rpc_routing_key()
    }

    /// Call `function` on this element's RPC worker
    ///
    /// Remote errors carry the location of this call as their local trace.
    #[track_caller]
    pub fn call_rpc_function(
        &self,
        function: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, ElementError>> + Send + '_ {
        self.call_rpc_function_at(function.to_string(), args, Location::caller())
    }

    async fn call_rpc_function_at(
        &self,
        function: String,
        args: Vec<Value>,
        caller: &'static Location<'static>,
    ) -> Result<Value, ElementError> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(RpcError::Closed)?;
        let client = match dispatcher.rpc_client().await {
            Ok(client) => client,
            Err(e) => {
                self.logger.error(e.to_string());
                return Err(e.into());
            }
        };
        Ok(client
            .call_function_at(&self.rpc_routing_key(), &function, args, caller)
            .await?)
    }

    /// Log an error with as much detail as its kind provides
    pub fn handle_api_error(&self, error: &ElementError) {
        match error {
            ElementError::Rpc(rpc) => {
                self.logger.error(rpc.to_string());
                if let Some(stack) = rpc.stack() {
                    self.logger.error(stack);
                }
            }
            ElementError::Api(api) => {
                self.logger.error(api.to_string());
                if let Some(source) = std::error::Error::source(api) {
                    self.logger.error(source.to_string());
                }
            }
            other => self.logger.error(other.to_string()),
        }
    }
}

impl fmt::Debug for ElementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementContext")
            .field("metadata", &self.metadata())
            .field("has_api", &self.api.is_some())
            .field("attached", &self.dispatcher.is_some())
            .finish()
    }
}

/// Type-erased handler of one input stream
pub(crate) type HandlerFn = Arc<dyn Fn(FlowEvent) -> HandlerFuture<'static> + Send + Sync>;

/// A bound input stream of an instantiated element
#[derive(Clone)]
pub(crate) struct BoundHandler {
    pub options: StreamOptions,
    pub invoke: HandlerFn,
}

/// An instantiated element with its handlers bound to it
pub(crate) struct BoundElement {
    pub element: Arc<dyn FlowElement>,
    pub options: ElementOptions,
    pub handlers: HashMap<String, BoundHandler>,
}

/// Creates elements of one declared type
pub(crate) trait ElementFactory: Send + Sync {
    fn function_fqn(&self) -> &FunctionFqn;

    fn instantiate(&self, context: ElementContext, properties: Value) -> Result<BoundElement, ElementError>;
}

/// `ElementFactory` backed by a `FlowFunction` descriptor
pub(crate) struct Declaration<E> {
    descriptor: ElementDescriptor<E>,
}

impl<E: FlowFunction> Declaration<E> {
    pub fn describe() -> Result<Self, FlowError> {
        Ok(Self {
            descriptor: E::describe()?,
        })
    }
}

impl<E: FlowFunction> ElementFactory for Declaration<E> {
    fn function_fqn(&self) -> &FunctionFqn {
        &self.descriptor.function_fqn
    }

    fn instantiate(&self, context: ElementContext, properties: Value) -> Result<BoundElement, ElementError> {
        context.set_stream_options(
            self.descriptor
                .streams
                .iter()
                .map(|s| (s.name.clone(), s.options.clone()))
                .collect(),
        );

        let element = Arc::new(E::create(context, properties)?);

        let handlers = self
            .descriptor
            .streams
            .iter()
            .map(|stream| {
                let el = element.clone();
                let handler = stream.handler;
                let name: Arc<str> = Arc::from(stream.name.as_str());
                let invoke: HandlerFn = Arc::new(move |event: FlowEvent| {
                    let el = el.clone();
                    let event = event.delivered_on(&name);
                    async move { handler(&*el, event).await }.boxed()
                });
                (
                    stream.name.clone(),
                    BoundHandler {
                        options: stream.options.clone(),
                        invoke,
                    },
                )
            })
            .collect();

        Ok(BoundElement {
            element,
            options: self.descriptor.options,
            handlers,
        })
    }
}
