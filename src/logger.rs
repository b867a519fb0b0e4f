//! Per-element structured logging
//!
//! Every `FlowLogger` call is written to `tracing` with the element's
//! identity attached. When configured, the call is also forwarded to an
//! external `LogSink` and mirrored as a `FlowEvent` on `flow.log.{level}`.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::definition::{ElementMetadata, FlowContext};
use crate::error::display_value;
use crate::event::FlowEvent;
use crate::events::EventPublisher;

/// Log level of a `FlowLogger` call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Debug output
    Debug,
    /// Errors
    Error,
    /// Regular log lines
    Info,
    /// Warnings
    Warn,
    /// Very detailed output
    Verbose,
}

impl LogLevel {
    /// Level name as used in the log stream ID
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Error => "error",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Verbose => "verbose",
        }
    }

    /// Stream the mirrored event is emitted on
    pub fn stream(&self) -> String {
        format!("flow.log.{}", self.as_str())
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External logger the runtime forwards to in addition to `tracing`
pub trait LogSink: Send + Sync {
    /// Debug output
    fn debug(&self, message: &Value, metadata: &ElementMetadata);
    /// Errors
    fn error(&self, message: &Value, metadata: &ElementMetadata);
    /// Regular log lines
    fn log(&self, message: &Value, metadata: &ElementMetadata);
    /// Warnings
    fn warn(&self, message: &Value, metadata: &ElementMetadata);
    /// Very detailed output
    fn verbose(&self, message: &Value, metadata: &ElementMetadata);
}

/// Structured logger bound to one element (or to the application itself)
#[derive(Clone)]
pub struct FlowLogger {
    metadata: Arc<RwLock<ElementMetadata>>,
    sink: Option<Arc<dyn LogSink>>,
    publisher: Option<Arc<EventPublisher>>,
}

impl FlowLogger {
    /// Create a logger that only writes to `tracing`
    pub fn new(metadata: ElementMetadata) -> Self {
        Self::shared(Arc::new(RwLock::new(metadata)))
    }

    /// Create a logger reading its identity from shared metadata
    pub fn shared(metadata: Arc<RwLock<ElementMetadata>>) -> Self {
        Self {
            metadata,
            sink: None,
            publisher: None,
        }
    }

    /// Logger used by the application runtime itself
    pub fn for_application(context: &FlowContext) -> Self {
        Self::new(
            ElementMetadata::new("none")
                .with_function_fqn("FlowApplication")
                .with_context(context),
        )
    }

    /// Forward calls to an external sink
    pub fn with_sink(mut self, sink: Option<Arc<dyn LogSink>>) -> Self {
        self.sink = sink;
        self
    }

    /// Mirror calls as events through `publisher`
    pub fn with_publisher(mut self, publisher: Option<Arc<EventPublisher>>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Current identity of the logger
    pub fn metadata(&self) -> ElementMetadata {
        self.metadata
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Log at debug level
    pub fn debug(&self, message: impl Into<Value>) {
        self.write(LogLevel::Debug, message.into());
    }

    /// Log at error level
    pub fn error(&self, message: impl Into<Value>) {
        self.write(LogLevel::Error, message.into());
    }

    /// Log at info level
    pub fn log(&self, message: impl Into<Value>) {
        self.write(LogLevel::Info, message.into());
    }

    /// Log at warn level
    pub fn warn(&self, message: impl Into<Value>) {
        self.write(LogLevel::Warn, message.into());
    }

    /// Log at verbose level
    pub fn verbose(&self, message: impl Into<Value>) {
        self.write(LogLevel::Verbose, message.into());
    }

    fn write(&self, level: LogLevel, message: Value) {
        let metadata = self.metadata();

        if let Some(publisher) = &self.publisher {
            let event = FlowEvent::new(metadata.clone(), message.clone(), level.stream());
            publisher.publish_detached(event);
        }

        emit_tracing(level, &message, &metadata);

        if let Some(sink) = &self.sink {
            match level {
                LogLevel::Debug => sink.debug(&message, &metadata),
                LogLevel::Error => sink.error(&message, &metadata),
                LogLevel::Info => sink.log(&message, &metadata),
                LogLevel::Warn => sink.warn(&message, &metadata),
                LogLevel::Verbose => sink.verbose(&message, &metadata),
            }
        }
    }
}

fn emit_tracing(level: LogLevel, message: &Value, metadata: &ElementMetadata) {
    let text = display_value(message);
    let element_id = metadata.id.as_str();
    let function_fqn = metadata.function_fqn.as_deref().unwrap_or_default();
    let flow_id = metadata.flow_id.as_deref().unwrap_or_default();
    let deployment_id = metadata.deployment_id.as_deref().unwrap_or_default();

    match level {
        LogLevel::Debug => {
            tracing::debug!(element_id, function_fqn, flow_id, deployment_id, "{}", text)
        }
        LogLevel::Error => {
            tracing::error!(element_id, function_fqn, flow_id, deployment_id, "{}", text)
        }
        LogLevel::Info => {
            tracing::info!(element_id, function_fqn, flow_id, deployment_id, "{}", text)
        }
        LogLevel::Warn => {
            tracing::warn!(element_id, function_fqn, flow_id, deployment_id, "{}", text)
        }
        LogLevel::Verbose => {
            tracing::trace!(element_id, function_fqn, flow_id, deployment_id, "{}", text)
        }
    }
}

impl fmt::Debug for FlowLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowLogger")
            .field("metadata", &self.metadata())
            .field("has_sink", &self.sink.is_some())
            .field("has_publisher", &self.publisher.is_some())
            .finish()
    }
}

/// A `LogSink` that keeps every call in memory
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: std::sync::Mutex<Vec<(LogLevel, Value, ElementMetadata)>>,
}

impl MemoryLogSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded calls
    pub fn entries(&self) -> Vec<(LogLevel, Value, ElementMetadata)> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Rendered messages logged at `level`
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, message, _)| display_value(&message))
            .collect()
    }

    fn record(&self, level: LogLevel, message: &Value, metadata: &ElementMetadata) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((level, message.clone(), metadata.clone()));
    }
}

impl LogSink for MemoryLogSink {
    fn debug(&self, message: &Value, metadata: &ElementMetadata) {
        self.record(LogLevel::Debug, message, metadata);
    }

    fn error(&self, message: &Value, metadata: &ElementMetadata) {
        self.record(LogLevel::Error, message, metadata);
    }

    fn log(&self, message: &Value, metadata: &ElementMetadata) {
        self.record(LogLevel::Info, message, metadata);
    }

    fn warn(&self, message: &Value, metadata: &ElementMetadata) {
        self.record(LogLevel::Warn, message, metadata);
    }

    fn verbose(&self, message: &Value, metadata: &ElementMetadata) {
        self.record(LogLevel::Verbose, message, metadata);
    }
}
