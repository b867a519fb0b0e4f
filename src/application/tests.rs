//! Scenario tests for composed flows

use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;

use super::*;
use crate::builtin::core_module;
use crate::definition::ElementDefinition;
use crate::element::properties::{FieldSpec, Properties, PropertySchema};
use crate::element::{ElementDescriptor, FlowElement, FlowFunction, InputStream};
use crate::error::ElementError;
use crate::events::LifecycleKind;
use crate::logger::{LogLevel, MemoryLogSink};
use crate::rpc::{RpcCall, REPLY_QUEUE};
use crate::transport::{MemoryTransport, PublishOptions, RPC_EXCHANGE};

/// Emits `{"y": 2}` for every input; `isolated` stops propagation
struct Stamp {
    context: ElementContext,
}

impl Stamp {
    async fn on_input(&self, event: FlowEvent) -> Result<(), ElementError> {
        self.context.emit_event(json!({"y": 2}), Some(&event), "default");
        Ok(())
    }
}

impl FlowElement for Stamp {
    fn context(&self) -> &ElementContext {
        &self.context
    }
}

impl FlowFunction for Stamp {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("stamp")?
            .stream(InputStream::<Self>::default_stream(|el, ev| el.on_input(ev).boxed()))
            .stream(
                InputStream::<Self>::new("isolated", |el, ev| el.on_input(ev).boxed())
                    .stop_propagation()
                    .concurrent(2),
            ))
    }

    fn create(context: ElementContext, _properties: Value) -> Result<Self, ElementError> {
        Ok(Self { context })
    }
}

/// Re-emits its input, one at a time
struct Relay {
    context: ElementContext,
}

impl Relay {
    async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
        self.context
            .emit_event(event.get_data(), Some(&event), "default");
        Ok(())
    }
}

impl FlowElement for Relay {
    fn context(&self) -> &ElementContext {
        &self.context
    }
}

impl FlowFunction for Relay {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("relay")?
            .stream(InputStream::default_stream(|el, ev| el.on_default(ev).boxed())))
    }

    fn create(context: ElementContext, _properties: Value) -> Result<Self, ElementError> {
        Ok(Self { context })
    }
}

/// Fails every input; panics when the input asks for it
struct Faulty {
    context: ElementContext,
}

impl Faulty {
    async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
        if event.data()["panic"] == json!(true) {
            panic!("handler exploded");
        }
        Err(ElementError::execution_failed("boom"))
    }
}

impl FlowElement for Faulty {
    fn context(&self) -> &ElementContext {
        &self.context
    }
}

impl FlowFunction for Faulty {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("faulty")?
            .concurrent(2)
            .stream(InputStream::default_stream(|el, ev| el.on_default(ev).boxed())))
    }

    fn create(context: ElementContext, _properties: Value) -> Result<Self, ElementError> {
        Ok(Self { context })
    }
}

/// Takes 200ms per input on a stream that times out after 20ms
struct Slow {
    context: ElementContext,
}

impl Slow {
    async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.context
            .emit_event(json!({"slow": true}), Some(&event), "default");
        Ok(())
    }
}

impl FlowElement for Slow {
    fn context(&self) -> &ElementContext {
        &self.context
    }
}

impl FlowFunction for Slow {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("slow")?.stream(
            InputStream::<Self>::default_stream(|el, ev| el.on_default(ev).boxed())
                .concurrent(1)
                .timeout(Duration::from_millis(20)),
        ))
    }

    fn create(context: ElementContext, _properties: Value) -> Result<Self, ElementError> {
        Ok(Self { context })
    }
}

/// Calls `explode` on its RPC worker and emits where the call was made
struct Caller {
    context: ElementContext,
}

impl Caller {
    async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
        #[rustfmt::skip]
        let (line, call) = (line!(), self.context.call_rpc_function("explode", vec![]));
        let stack = match call.await {
            Err(ElementError::Rpc(e)) => e.stack(),
            _ => None,
        };
        self.context
            .emit_event(json!({"line": line, "stack": stack}), Some(&event), "default");
        Ok(())
    }
}

impl FlowElement for Caller {
    fn context(&self) -> &ElementContext {
        &self.context
    }
}

impl FlowFunction for Caller {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("caller")?
            .stream(InputStream::default_stream(|el, ev| el.on_default(ev).boxed())))
    }

    fn create(context: ElementContext, _properties: Value) -> Result<Self, ElementError> {
        Ok(Self { context })
    }
}

#[derive(Debug, Deserialize)]
struct TagProperties {
    value: String,
}

/// Emits its current `value` property; echoes custom messages on `messages`
struct Tagger {
    context: ElementContext,
    properties: Properties<TagProperties>,
}

impl Tagger {
    async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
        let value = self.properties.get().value.clone();
        self.context
            .emit_event(json!({"value": value}), Some(&event), "default");
        Ok(())
    }
}

#[async_trait]
impl FlowElement for Tagger {
    fn context(&self) -> &ElementContext {
        &self.context
    }

    fn on_properties_changed(&self, properties: Value) -> Result<(), ElementError> {
        self.properties.set(properties)
    }

    async fn on_message(&self, message: DeploymentMessage) -> Result<(), ElementError> {
        self.context
            .emit_output(Value::Object(message.payload), "messages");
        Ok(())
    }

    async fn on_destroy(&self) -> Result<(), ElementError> {
        self.context.logger().log("tagger destroyed");
        Ok(())
    }
}

impl FlowFunction for Tagger {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("tagger")?
            .stream(InputStream::default_stream(|el, ev| el.on_default(ev).boxed())))
    }

    fn create(context: ElementContext, properties: Value) -> Result<Self, ElementError> {
        let schema = PropertySchema::new().field("value", FieldSpec::string().required());
        let properties = Properties::new(&context, Some(schema), properties)?;
        Ok(Self {
            context,
            properties,
        })
    }
}

fn test_module() -> FlowModule {
    FlowModule::new("test")
        .declare::<Stamp>()
        .and_then(|m| m.declare::<Relay>())
        .and_then(|m| m.declare::<Faulty>())
        .and_then(|m| m.declare::<Tagger>())
        .and_then(|m| m.declare::<Slow>())
        .and_then(|m| m.declare::<Caller>())
        .unwrap()
}

fn element(id: &str, fqn: &str) -> ElementDefinition {
    ElementDefinition::new(id, "test", fqn)
}

/// An element that only feeds events into the flow under test
fn source(id: &str) -> ElementDefinition {
    element(id, "relay")
}

fn tagger(id: &str, value: &str) -> ElementDefinition {
    element(id, "tagger").with_properties(json!({"value": value}))
}

fn flow() -> FlowDefinition {
    FlowDefinition::new(FlowContext::new("flow-1", "dep-1"))
}

fn config() -> FlowConfig {
    FlowConfig::new().shutdown_grace(Duration::ZERO)
}

async fn start(flow: FlowDefinition) -> FlowApplication {
    FlowApplication::builder()
        .module(test_module())
        .flow(flow)
        .config(config())
        .build()
        .await
        .unwrap()
}

fn inject(app: &FlowApplication, source: &str, data: Value) {
    app.emit(FlowEvent::output(ElementMetadata::new(source), data));
}

async fn next(tap: &mut EventTap) -> FlowEvent {
    tokio::time::timeout(Duration::from_secs(2), tap.recv())
        .await
        .unwrap()
        .unwrap()
}

/// A recording transport that stays open after `close`
struct KeepOpen(MemoryTransport);

#[async_trait]
impl Transport for KeepOpen {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        self.0.assert_exchange(name, kind).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Value,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.0.publish(exchange, routing_key, body, options).await
    }

    async fn create_subscriber(
        &self,
        handler: MessageHandler,
        binding: Binding,
        name: &str,
    ) -> Result<(), TransportError> {
        self.0.create_subscriber(handler, binding, name).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Let detached publications reach the transport
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_unknown_function_fails_composition() {
    let sink = Arc::new(MemoryLogSink::new());
    let flow = flow()
        .element(element("a", "relay"))
        .element(element("b", "missing"))
        .connect("a", "b");

    let result = FlowApplication::builder()
        .module(test_module())
        .flow(flow)
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await;

    assert!(matches!(result, Err(FlowError::UnknownElement(key)) if key == "test.missing"));
    assert_eq!(
        sink.messages(LogLevel::Error),
        vec!["Could not create FlowElement for test.missing".to_string()]
    );
    assert!(sink.messages(LogLevel::Info).is_empty());
}

#[tokio::test]
async fn test_missing_handler_fails_composition() {
    let sink = Arc::new(MemoryLogSink::new());
    let flow = flow()
        .element(element("a", "relay"))
        .element(element("b", "relay"))
        .connect("a", "b")
        .connect_streams("a", "default", "b", "nope");

    let result = FlowApplication::builder()
        .module(test_module())
        .flow(flow)
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await;

    assert!(matches!(
        result,
        Err(FlowError::MissingHandler { element, stream }) if element == "b" && stream == "nope"
    ));
    assert_eq!(sink.messages(LogLevel::Error).len(), 1);
}

#[tokio::test]
async fn test_unknown_source_fails_composition() {
    let sink = Arc::new(MemoryLogSink::new());
    let result = FlowApplication::builder()
        .module(test_module())
        .flow(flow().element(element("a", "relay")).connect("ghost", "a"))
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await;

    assert!(matches!(result, Err(FlowError::ElementNotInitialized(id)) if id == "ghost"));
    assert_eq!(
        sink.messages(LogLevel::Error),
        vec!["ghost has not been initialized".to_string()]
    );
    assert!(sink.messages(LogLevel::Info).is_empty());
}

#[tokio::test]
async fn test_invalid_properties_fail_composition() {
    let result = FlowApplication::builder()
        .module(test_module())
        .flow(flow().element(element("x", "tagger").with_properties(json!({"value": 1}))))
        .config(config())
        .build()
        .await;

    assert!(matches!(
        result,
        Err(FlowError::ElementCreation { element_id, source: ElementError::Validation(_), .. }) if element_id == "x"
    ));
}

#[tokio::test]
async fn test_duplicate_element_fails_composition() {
    let result = FlowApplication::builder()
        .module(test_module())
        .flow(flow().element(element("a", "relay")).element(element("a", "stamp")))
        .config(config())
        .build()
        .await;

    assert!(matches!(result, Err(FlowError::DuplicateElement(id)) if id == "a"));
}

#[tokio::test]
async fn test_running_flow() {
    let app = start(
        flow()
            .element(element("a", "relay"))
            .element(element("b", "relay"))
            .connect("a", "b"),
    )
    .await;

    assert_eq!(app.state(), AppState::Running);
    assert_eq!(app.element_ids(), vec!["a", "b"]);
    assert_eq!(app.context().deployment_id.as_deref(), Some("dep-1"));
}

#[tokio::test]
async fn test_failing_branch_does_not_block_others() {
    let sink = Arc::new(MemoryLogSink::new());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(
            flow()
                .element(source("src-a"))
                .element(source("src-b"))
                .element(element("f", "faulty"))
                .element(element("r", "relay"))
                .connect("src-a", "f")
                .connect("src-b", "r"),
        )
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await
        .unwrap();
    let mut lifecycle = app.lifecycle();
    let mut output = app.subscribe("r.default");

    inject(&app, "src-a", json!({"panic": false}));
    inject(&app, "src-a", json!({"panic": true}));
    inject(&app, "src-b", json!({"ok": true}));

    assert_eq!(next(&mut output).await.get_data(), json!({"ok": true}));

    let mut terminated = 0;
    while terminated < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), lifecycle.recv())
            .await
            .unwrap()
            .unwrap();
        if event.kind == LifecycleKind::Terminated {
            assert_eq!(event.data.function_fqn, "faulty");
            assert!(event.data.duration.is_some());
            terminated += 1;
        }
    }

    let errors = sink.messages(LogLevel::Error);
    assert!(errors.contains(&"Handler execution failed: boom".to_string()));
    assert!(errors.contains(&"Handler panicked: handler exploded".to_string()));
    assert_eq!(app.state(), AppState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_events_are_delivered_in_order() {
    let app = FlowApplication::builder()
        .module(core_module().unwrap())
        .module(test_module())
        .flow(
            flow()
                .element(ElementDefinition::new("trigger", "core", "passthrough"))
                .element(
                    ElementDefinition::new("task", "core", "task.delay")
                        .with_properties(json!({"delay": 100})),
                )
                .element(element("sink", "relay"))
                .connect("trigger", "task")
                .connect("task", "sink"),
        )
        .config(config())
        .build()
        .await
        .unwrap();
    let mut output = app.subscribe("sink.default");

    let started = tokio::time::Instant::now();
    for n in 0..10 {
        inject(&app, "trigger", json!({"n": n}));
    }

    let mut received = Vec::new();
    for _ in 0..10 {
        let event = output.recv().await.unwrap();
        received.push(event.get_data()["n"].as_i64().unwrap());
    }

    assert_eq!(received, (0..10).collect::<Vec<_>>());
    assert!(started.elapsed() >= Duration::from_millis(1000));

    app.idle().await;
    let stats = app.queue_stats(Some("task"));
    assert_eq!(stats["task"].total, 10);
    assert_eq!(stats["task"].peak, 9);
    assert_eq!(app.queue_stats(Some("sink"))["sink"].size, 0);
}

#[tokio::test]
async fn test_update_applies_to_later_events() {
    let app = start(
        flow()
            .element(source("src"))
            .element(tagger("x", "a"))
            .connect("src", "x"),
    )
    .await;
    let mut output = app.subscribe("x.default");

    inject(&app, "src", json!({"n": 1}));
    assert_eq!(next(&mut output).await.get_data(), json!({"n": 1, "value": "a"}));

    let update = ControlMessage::update(&FlowUpdate::new().element_properties("x", json!({"value": "b"})));
    assert_eq!(app.handle_control(update.to_json()).await, Delivery::Ack);

    inject(&app, "src", json!({"n": 2}));
    assert_eq!(next(&mut output).await.get_data(), json!({"n": 2, "value": "b"}));
}

#[tokio::test]
async fn test_rejected_update_keeps_previous_properties() {
    let sink = Arc::new(MemoryLogSink::new());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(
            flow()
                .element(source("src"))
                .element(tagger("x", "a"))
                .element(tagger("y", "a"))
                .connect("src", "x")
                .connect("src", "y"),
        )
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await
        .unwrap();
    let mut x = app.subscribe("x.default");
    let mut y = app.subscribe("y.default");

    let state = app
        .update(
            FlowUpdate::new()
                .element_properties("x", json!({"value": 5}))
                .element_properties("y", json!({"value": "b"}))
                .element_properties("ghost", json!({"value": "c"})),
        )
        .await;
    assert_eq!(state, HealthState::UpdatingFailed);

    inject(&app, "src", json!({}));
    assert_eq!(next(&mut x).await.get_data(), json!({"value": "a"}));
    assert_eq!(next(&mut y).await.get_data(), json!({"value": "b"}));

    assert!(sink
        .messages(LogLevel::Warn)
        .contains(&"Cannot update unknown element ghost".to_string()));
    assert!(sink
        .messages(LogLevel::Error)
        .iter()
        .any(|m| m.starts_with("Updating properties of x failed")));
}

#[tokio::test]
async fn test_update_of_element_without_properties_fails() {
    let sink = Arc::new(MemoryLogSink::new());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(flow().element(element("r", "relay")).element(tagger("x", "a")))
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await
        .unwrap();

    let empty = FlowUpdate::new().element_properties("r", json!({}));
    assert_eq!(app.update(empty).await, HealthState::Updated);

    let state = app
        .update(
            FlowUpdate::new()
                .element_properties("r", json!({"value": "b"}))
                .element_properties("x", json!({"value": "b"})),
        )
        .await;
    assert_eq!(state, HealthState::UpdatingFailed);
    assert!(sink
        .messages(LogLevel::Error)
        .contains(&"Updating properties of r failed: r does not accept property updates".to_string()));
}

#[tokio::test]
async fn test_context_and_flow_properties_update() {
    let app = start(
        flow()
            .element(source("src"))
            .element(tagger("x", "a"))
            .connect("src", "x"),
    )
    .await;
    let mut output = app.subscribe("x.default");

    let mut properties = Map::new();
    properties.insert("stage".to_string(), json!("prod"));
    let mut update = FlowUpdate::new()
        .context(FlowContext {
            deployment_id: Some("dep-2".to_string()),
            ..Default::default()
        })
        .properties(properties.clone());
    update.elements.push(ElementUpdate {
        id: "x".to_string(),
        name: Some("Renamed".to_string()),
        properties: None,
    });

    assert_eq!(app.update(update).await, HealthState::Updated);
    assert_eq!(app.properties(), properties);
    assert_eq!(app.context().deployment_id.as_deref(), Some("dep-2"));
    assert_eq!(app.context().flow_id.as_deref(), Some("flow-1"));

    inject(&app, "src", json!({}));
    let event = next(&mut output).await;
    assert_eq!(event.metadata().deployment_id.as_deref(), Some("dep-2"));
    assert_eq!(event.metadata().name.as_deref(), Some("Renamed"));
    assert_eq!(event.source(), "flows/flow-1/deployments/dep-2/elements/x");
}

#[tokio::test]
async fn test_stop_propagation() {
    let transport = Arc::new(MemoryTransport::recording());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(
            flow()
                .element(source("src"))
                .element(source("src-2"))
                .element(element("s", "stamp"))
                .connect("src", "s")
                .connect_streams("src-2", "default", "s", "isolated"),
        )
        .transport(transport.clone())
        .config(config())
        .build()
        .await
        .unwrap();
    let mut output = app.subscribe("s.default");

    inject(&app, "src", json!({"x": 1}));
    assert_eq!(next(&mut output).await.get_data(), json!({"x": 1, "y": 2}));

    inject(&app, "src-2", json!({"x": 1}));
    assert_eq!(next(&mut output).await.get_data(), json!({"y": 2}));

    settle().await;
    let mirrored: Vec<Value> = transport
        .published_to(FLOWLOGS_EXCHANGE)
        .into_iter()
        .filter(|m| m.message["source"] == json!("flows/flow-1/deployments/dep-1/elements/s"))
        .filter(|m| m.message["type"] == json!("default"))
        .map(|m| m.message["data"].clone())
        .collect();
    assert_eq!(mirrored, vec![json!({"y": 2}), json!({"y": 2})]);
}

#[tokio::test]
async fn test_queue_stats_keys() {
    let app = start(
        flow()
            .element(source("src"))
            .element(element("s", "stamp"))
            .element(element("r", "relay"))
            .connect("src", "s")
            .connect_streams("src", "default", "s", "isolated")
            .connect("s", "r"),
    )
    .await;

    let all: Vec<String> = app.queue_stats(None).into_keys().collect();
    assert_eq!(all, vec!["r", "s", "s:isolated"]);

    let own: Vec<String> = app.queue_stats(Some("s")).into_keys().collect();
    assert_eq!(own, vec!["s", "s:isolated"]);
    assert!(app.queue_stats(Some("unknown")).is_empty());
}

#[tokio::test]
async fn test_transport_setup_and_health() {
    let transport = Arc::new(MemoryTransport::recording());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(flow().element(tagger("x", "a")))
        .transport(transport.clone())
        .config(config())
        .build()
        .await
        .unwrap();

    let exchanges = transport.exchanges();
    assert_eq!(exchanges[DEPLOYMENT_EXCHANGE], ExchangeKind::Direct);
    assert_eq!(exchanges[FLOWLOGS_EXCHANGE], ExchangeKind::Fanout);
    assert_eq!(exchanges[FLOWEVENTS_EXCHANGE], ExchangeKind::Fanout);
    assert!(transport
        .subscribers()
        .contains(&("flow-control".to_string(), Binding::new(DEPLOYMENT_EXCHANGE, "dep-1"))));

    let mut properties = Map::new();
    properties.insert("unit".to_string(), json!("kg"));
    let update = ControlMessage::update(&FlowUpdate::new().properties(properties.clone()));
    let verdicts = transport
        .deliver(DEPLOYMENT_EXCHANGE, "dep-1", update.to_json())
        .await
        .unwrap();
    assert_eq!(verdicts, vec![Delivery::Ack]);
    assert_eq!(app.properties(), properties);

    let health: Vec<_> = transport
        .published_to(DEPLOYMENT_EXCHANGE)
        .into_iter()
        .filter(|m| m.routing_key == "health")
        .collect();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].message["eventType"], json!("com.flowstudio.event.health"));
    assert_eq!(health[0].message["data"]["status"], json!("updated"));
    assert_eq!(health[0].message["data"]["deploymentId"], json!("dep-1"));
}

#[tokio::test]
async fn test_invalid_control_messages_are_rejected() {
    let sink = Arc::new(MemoryLogSink::new());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(flow().element(tagger("x", "a")))
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await
        .unwrap();
    let rejected = Delivery::Nack { requeue: false };

    assert_eq!(
        app.handle_control(json!({"type": "com.flowstudio.deployment.restart"})).await,
        rejected
    );
    assert_eq!(app.handle_control(json!(42)).await, rejected);
    assert_eq!(
        app.handle_control(json!({"type": DEPLOYMENT_UPDATE, "data": {"elements": 3}}))
            .await,
        rejected
    );

    assert!(sink
        .messages(LogLevel::Warn)
        .contains(&"Unknown control message type: com.flowstudio.deployment.restart".to_string()));
    assert_eq!(app.state(), AppState::Running);
}

#[tokio::test]
async fn test_custom_messages() {
    let app = start(flow().element(tagger("x", "a")).element(tagger("y", "a"))).await;
    let mut x = app.subscribe("x.messages");
    let mut y = app.subscribe("y.messages");

    let mut payload = Map::new();
    payload.insert("hello".to_string(), json!("x"));
    let message = ControlMessage::message(&DeploymentMessage::to_element("x", payload));
    assert_eq!(app.handle_control(message.to_json()).await, Delivery::Ack);

    assert_eq!(x.try_recv().unwrap().get_data(), json!({"hello": "x"}));
    assert!(y.try_recv().is_none());

    let mut payload = Map::new();
    payload.insert("hello".to_string(), json!("all"));
    app.send_message(DeploymentMessage::broadcast(payload)).await;

    assert_eq!(x.try_recv().unwrap().get_data(), json!({"hello": "all"}));
    assert_eq!(y.try_recv().unwrap().get_data(), json!({"hello": "all"}));
}

#[tokio::test]
async fn test_lifecycle_notifications() {
    let transport = Arc::new(MemoryTransport::recording());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(
            flow()
                .element(source("src"))
                .element(element("r", "relay"))
                .connect("src", "r"),
        )
        .transport(transport.clone())
        .config(config())
        .build()
        .await
        .unwrap();
    let mut lifecycle = app.lifecycle();

    inject(&app, "src", json!({"n": 1}));

    let activated = lifecycle.recv().await.unwrap();
    assert_eq!(activated.kind, LifecycleKind::Activated);
    assert_eq!(activated.source, "flows/flow-1/deployments/dep-1/elements/r");
    assert_eq!(activated.data.function_fqn, "relay");
    assert_eq!(activated.data.input_stream_id, "src.default");
    assert_eq!(activated.data.duration, None);

    let completed = lifecycle.recv().await.unwrap();
    assert_eq!(completed.kind, LifecycleKind::Completed);
    assert!(completed.is_finished());
    assert_eq!(completed.data.flow_event_id, activated.data.flow_event_id);

    settle().await;
    let published = transport.published_to(FLOWEVENTS_EXCHANGE);
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|m| m.routing_key == "relay"));
}

#[tokio::test]
async fn test_destroy_message() {
    let transport = Arc::new(MemoryTransport::recording());
    let sink = Arc::new(MemoryLogSink::new());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(
            flow()
                .element(source("src"))
                .element(tagger("x", "a"))
                .connect("src", "x"),
        )
        .transport(transport.clone())
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await
        .unwrap();
    let mut output = app.subscribe("x.default");

    let verdicts = transport
        .deliver(DEPLOYMENT_EXCHANGE, "dep-1", ControlMessage::destroy().to_json())
        .await
        .unwrap();
    assert_eq!(verdicts, vec![Delivery::Ack]);

    tokio::time::timeout(Duration::from_secs(2), app.wait_for_shutdown())
        .await
        .unwrap();
    assert_eq!(app.state(), AppState::Destroyed);
    assert!(transport.is_closed());
    assert!(sink
        .messages(LogLevel::Info)
        .contains(&"tagger destroyed".to_string()));

    inject(&app, "src", json!({}));
    assert!(output.try_recv().is_none());
    assert!(matches!(app.rpc_client().await, Err(RpcError::Closed)));

    app.destroy(0).await;
    let destroyed = sink
        .messages(LogLevel::Info)
        .iter()
        .filter(|m| m.as_str() == "tagger destroyed")
        .count();
    assert_eq!(destroyed, 1);
}

#[tokio::test]
async fn test_rpc_client_requires_transport() {
    let app = start(flow().element(tagger("x", "a"))).await;
    assert!(matches!(
        app.rpc_client().await,
        Err(RpcError::Transport(TransportError::Unavailable))
    ));
}

#[tokio::test]
async fn test_backlog_warnings_are_logged() {
    let sink = Arc::new(MemoryLogSink::new());
    let app = FlowApplication::builder()
        .module(core_module().unwrap())
        .module(test_module())
        .flow(
            flow()
                .element(source("trigger"))
                .element(
                    ElementDefinition::new("task", "core", "task.delay")
                        .with_properties(json!({"delay": 100})),
                )
                .connect("trigger", "task"),
        )
        .log_sink(sink.clone())
        .config(
            config()
                .backlog_size_threshold(2)
                .backlog_latency_threshold(Duration::from_millis(50))
                .backlog_check_interval(Duration::from_millis(10)),
        )
        .build()
        .await
        .unwrap();

    for n in 0..4 {
        inject(&app, "trigger", json!({"n": n}));
    }
    tokio::time::timeout(Duration::from_secs(5), app.idle())
        .await
        .unwrap();

    let warnings = sink.messages(LogLevel::Warn);
    assert!(warnings.contains(
        &"Backlog for task.default is growing: 2 events waiting or in progress".to_string()
    ));
    assert!(warnings.contains(
        &"Backlog for task.default is growing: 4 events waiting or in progress".to_string()
    ));
    assert!(warnings
        .iter()
        .any(|w| w.starts_with("Slow processing detected for task.default: ")));
}

#[tokio::test]
async fn test_timed_out_handler_is_terminated_but_not_cancelled() {
    let sink = Arc::new(MemoryLogSink::new());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(
            flow()
                .element(source("src"))
                .element(element("slow", "slow"))
                .connect("src", "slow"),
        )
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await
        .unwrap();
    let mut lifecycle = app.lifecycle();
    let mut output = app.subscribe("slow.default");

    inject(&app, "src", json!({"n": 1}));

    let mut kinds = Vec::new();
    while kinds.last() != Some(&LifecycleKind::Completed) {
        let event = tokio::time::timeout(Duration::from_secs(2), lifecycle.recv())
            .await
            .unwrap()
            .unwrap();
        if event.kind == LifecycleKind::Terminated {
            assert!(Duration::from_millis(event.data.duration.unwrap()) >= Duration::from_millis(20));
        }
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![
            LifecycleKind::Activated,
            LifecycleKind::Terminated,
            LifecycleKind::Completed
        ]
    );

    assert_eq!(next(&mut output).await.get_data(), json!({"n": 1, "slow": true}));
    assert!(sink
        .messages(LogLevel::Error)
        .contains(&"Task timed out after 20ms".to_string()));
}

#[tokio::test]
async fn test_panic_outside_elements_destroys_flow() {
    let sink = Arc::new(MemoryLogSink::new());
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(flow().element(tagger("x", "a")))
        .log_sink(sink.clone())
        .config(config())
        .build()
        .await
        .unwrap();

    let runner = {
        let app = app.clone();
        tokio::spawn(async move { app.run_until_shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let crashed = tokio::spawn(async { panic!("outside any element") }).await;
    assert!(crashed.is_err());

    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(app.state(), AppState::Destroyed);
    assert_eq!(app.exit_code(), Some(1));
    assert!(sink
        .messages(LogLevel::Error)
        .contains(&"Uncaught panic!".to_string()));
    assert!(sink
        .messages(LogLevel::Info)
        .contains(&"tagger destroyed".to_string()));
}

#[tokio::test]
async fn test_events_are_not_mirrored_after_destroy() {
    let transport = Arc::new(KeepOpen(MemoryTransport::recording()));
    let app = FlowApplication::builder()
        .module(test_module())
        .flow(
            flow()
                .element(source("src"))
                .element(element("r", "relay"))
                .connect("src", "r"),
        )
        .transport(transport.clone())
        .config(config())
        .build()
        .await
        .unwrap();

    inject(&app, "src", json!({"n": 1}));
    settle().await;
    let before = transport.0.published_to(FLOWLOGS_EXCHANGE).len();
    assert!(before > 0);

    app.destroy(0).await;
    assert_eq!(app.exit_code(), Some(0));
    settle().await;
    let destroyed = transport.0.published_to(FLOWLOGS_EXCHANGE).len();

    inject(&app, "src", json!({"n": 2}));
    settle().await;
    assert_eq!(transport.0.published_to(FLOWLOGS_EXCHANGE).len(), destroyed);
}

#[tokio::test]
async fn test_rpc_error_traces_element_call_site() {
    let transport = Arc::new(MemoryTransport::recording());
    let replies = transport.clone();
    let worker: MessageHandler = Arc::new(move |message: Message| {
        let replies = replies.clone();
        async move {
            let call: RpcCall = serde_json::from_value(message.body).unwrap();
            assert_eq!(call.function_name, "explode");
            let reply = json!({"type": "error", "message": "boom", "stack": "Error: boom\n  at worker.py:7"});
            let correlation_id = message.options.correlation_id.unwrap();
            replies
                .publish("", REPLY_QUEUE, reply, PublishOptions::reply(correlation_id))
                .await
                .unwrap();
            Delivery::Ack
        }
        .boxed()
    });
    transport
        .create_subscriber(worker, Binding::new(RPC_EXCHANGE, "flow-1dep-1caller"), "worker")
        .await
        .unwrap();

    let app = FlowApplication::builder()
        .module(test_module())
        .flow(
            flow()
                .element(source("src"))
                .element(element("caller", "caller"))
                .connect("src", "caller"),
        )
        .transport(transport.clone())
        .config(config())
        .build()
        .await
        .unwrap();
    let mut output = app.subscribe("caller.default");

    inject(&app, "src", json!({}));

    let data = next(&mut output).await.get_data();
    let stack = data["stack"].as_str().unwrap();
    assert!(stack.starts_with("Remote Stack\n  at worker.py:7\nLocal Stack\n"));
    assert!(stack.contains(&format!("{}:{}:", file!(), data["line"])));
}
