//! Built-in `core` module
//!
//! | Key                | Behavior                                        |
//! |--------------------|-------------------------------------------------|
//! | `core.passthrough` | re-emits every input on `default`               |
//! | `core.task.delay`  | waits `delay` milliseconds, then re-emits       |
//! | `core.log`         | logs the payload, optionally with a `prefix`    |

use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::definition::DEFAULT_STREAM;
use crate::element::properties::{FieldSpec, Properties, PropertySchema};
use crate::element::{ElementContext, ElementDescriptor, FlowElement, FlowFunction, InputStream};
use crate::error::{ElementError, FlowError};
use crate::event::FlowEvent;
use crate::module::FlowModule;

/// Name of the built-in module
pub const CORE_MODULE: &str = "core";

/// The `core` module with every built-in element declared
pub fn core_module() -> Result<FlowModule, FlowError> {
    FlowModule::new(CORE_MODULE)
        .declare::<Passthrough>()?
        .declare::<Delay>()?
        .declare::<Log>()
}

/// Re-emits its input unchanged
pub struct Passthrough {
    context: ElementContext,
}

impl Passthrough {
    async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
        self.context
            .emit_event(event.get_data(), Some(&event), DEFAULT_STREAM);
        Ok(())
    }
}

impl FlowElement for Passthrough {
    fn context(&self) -> &ElementContext {
        &self.context
    }
}

impl FlowFunction for Passthrough {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("passthrough")?
            .concurrent(16)
            .stream(InputStream::default_stream(|el, ev| el.on_default(ev).boxed())))
    }

    fn create(context: ElementContext, _properties: Value) -> Result<Self, ElementError> {
        Ok(Self { context })
    }
}

#[derive(Debug, Deserialize)]
struct DelayProperties {
    delay: u64,
}

/// Holds every input for `delay` milliseconds before re-emitting it
///
/// Runs one input at a time, so inputs leave in arrival order.
pub struct Delay {
    context: ElementContext,
    properties: Properties<DelayProperties>,
}

impl Delay {
    fn schema() -> PropertySchema {
        PropertySchema::new().field("delay", FieldSpec::integer().min(0.0).default_value(0))
    }

    async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
        let delay = self.properties.get().delay;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.context
            .emit_event(event.get_data(), Some(&event), DEFAULT_STREAM);
        Ok(())
    }
}

impl FlowElement for Delay {
    fn context(&self) -> &ElementContext {
        &self.context
    }

    fn on_properties_changed(&self, properties: Value) -> Result<(), ElementError> {
        self.properties.set(properties)
    }
}

impl FlowFunction for Delay {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("task.delay")?
            .stream(InputStream::default_stream(|el, ev| el.on_default(ev).boxed())))
    }

    fn create(context: ElementContext, properties: Value) -> Result<Self, ElementError> {
        let properties = Properties::new(&context, Some(Self::schema()), properties)?;
        Ok(Self {
            context,
            properties,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LogProperties {
    #[serde(default)]
    prefix: Option<String>,
}

/// Logs every input payload at info level
///
/// `prefix` may reference flow properties, e.g. `"${flow.stage}"`.
pub struct Log {
    context: ElementContext,
    properties: Properties<LogProperties>,
}

impl Log {
    fn schema() -> PropertySchema {
        PropertySchema::new().field("prefix", FieldSpec::string())
    }

    async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
        let data = event.get_data();
        match &self.properties.get().prefix {
            Some(prefix) => self.context.logger().log(format!("{}: {}", prefix, data)),
            None => self.context.logger().log(data),
        }
        Ok(())
    }
}

impl FlowElement for Log {
    fn context(&self) -> &ElementContext {
        &self.context
    }

    fn on_properties_changed(&self, properties: Value) -> Result<(), ElementError> {
        self.properties.set(properties)
    }

    fn on_flow_properties_changed(&self, _properties: &Map<String, Value>) -> Result<(), ElementError> {
        self.properties.refresh()
    }
}

impl FlowFunction for Log {
    fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
        Ok(ElementDescriptor::new("log")?
            .concurrent(4)
            .stream(InputStream::default_stream(|el, ev| el.on_default(ev).boxed())))
    }

    fn create(context: ElementContext, properties: Value) -> Result<Self, ElementError> {
        let properties = Properties::interpolated(&context, Some(Self::schema()), properties)?;
        Ok(Self {
            context,
            properties,
        })
    }
}
