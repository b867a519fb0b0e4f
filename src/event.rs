//! The event envelope exchanged between elements
//!
//! A `FlowEvent` is immutable once built. Its payload is owned by the event
//! and only ever handed out as a copy, so neither the emitter nor any
//! receiver can change what other subscribers see.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::definition::{ElementMetadata, DEFAULT_STREAM};

/// Content type of an event payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// `application/json`
    #[serde(rename = "application/json")]
    Json,
    /// `text/plain`
    #[serde(rename = "text/plain")]
    Text,
}

impl ContentType {
    /// MIME string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event routed between elements
#[derive(Clone, Debug)]
pub struct FlowEvent {
    id: Uuid,
    metadata: Arc<ElementMetadata>,
    stream: String,
    data: Arc<Value>,
    content_type: ContentType,
    time: DateTime<Utc>,
    input_stream: Option<Arc<str>>,
}

impl FlowEvent {
    /// Create an event on `stream`, inferring the content type from `data`
    ///
    /// - a string that parses as a JSON object or array is stored parsed, as JSON
    /// - any other string is stored as text
    /// - objects and arrays are JSON
    /// - `null` becomes an empty JSON object
    /// - numbers and booleans are stringified as text
    pub fn new(metadata: ElementMetadata, data: impl Into<Value>, stream: impl Into<String>) -> Self {
        let (data, content_type) = normalize(data.into());
        Self::build(metadata, data, stream.into(), content_type)
    }

    /// Create an event on the `default` stream
    pub fn output(metadata: ElementMetadata, data: impl Into<Value>) -> Self {
        Self::new(metadata, data, DEFAULT_STREAM)
    }

    /// Create an event with an explicit content type; the payload is stored as given
    pub fn with_content_type(
        metadata: ElementMetadata,
        data: impl Into<Value>,
        stream: impl Into<String>,
        content_type: ContentType,
    ) -> Self {
        Self::build(metadata, data.into(), stream.into(), content_type)
    }

    /// Create an event from any serializable payload
    pub fn from_serialize<T: Serialize>(
        metadata: ElementMetadata,
        data: &T,
        stream: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(metadata, serde_json::to_value(data)?, stream))
    }

    /// Create a JSON event `{message, stack}` describing an error
    ///
    /// The stack is the chain of source errors, outermost first.
    pub fn from_error(
        metadata: ElementMetadata,
        error: &(dyn StdError + 'static),
        stream: impl Into<String>,
    ) -> Self {
        let mut stack = vec![format!("Error: {}", error)];
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push(format!("    caused by: {}", cause));
            source = cause.source();
        }
        let data = json!({ "message": error.to_string(), "stack": stack.join("\n") });
        Self::build(metadata, data, stream.into(), ContentType::Json)
    }

    /// Override the creation time
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    fn build(metadata: ElementMetadata, data: Value, stream: String, content_type: ContentType) -> Self {
        Self {
            id: Uuid::new_v4(),
            metadata: Arc::new(metadata),
            stream,
            data: Arc::new(data),
            content_type,
            time: Utc::now(),
            input_stream: None,
        }
    }

    /// Unique event ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Metadata of the emitting element
    pub fn metadata(&self) -> &ElementMetadata {
        &self.metadata
    }

    /// Output stream (the event `type`)
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// A copy of the payload; a `null` payload reads as `{}`
    pub fn get_data(&self) -> Value {
        match self.data.as_ref() {
            Value::Null => Value::Object(Map::new()),
            data => data.clone(),
        }
    }

    /// Borrow the payload without copying
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Deserialize the payload into `T`
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.get_data())
    }

    /// Payload content type
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Creation time
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Input stream of the receiving element this copy was delivered on
    pub fn input_stream(&self) -> Option<&str> {
        self.input_stream.as_deref()
    }

    /// Copy of this event marked as delivered on the receiver's `stream`
    pub fn delivered_on(&self, stream: &str) -> Self {
        let mut delivered = self.clone();
        delivered.input_stream = Some(Arc::from(stream));
        delivered
    }

    /// Routing key `{elementId}.{stream}`
    pub fn get_stream_id(&self) -> String {
        format!("{}.{}", self.metadata.id, self.stream)
    }

    /// Source URI of the emitting element
    pub fn source(&self) -> String {
        self.metadata.source()
    }

    /// Serializable envelope for external sinks
    ///
    /// JSON payloads are embedded as structured data, text payloads as strings.
    pub fn format(&self) -> Value {
        let mut envelope = Map::new();
        envelope.insert("specversion".into(), json!("1.0"));
        envelope.insert("id".into(), json!(self.id.to_string()));
        envelope.insert("source".into(), json!(self.source()));
        envelope.insert("type".into(), json!(self.stream));
        if let Some(fqn) = &self.metadata.function_fqn {
            envelope.insert("subject".into(), json!(fqn));
        }
        envelope.insert("datacontenttype".into(), json!(self.content_type.as_str()));
        envelope.insert(
            "time".into(),
            json!(self.time.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        envelope.insert("data".into(), self.data.as_ref().clone());
        Value::Object(envelope)
    }
}

impl Serialize for FlowEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.format().serialize(serializer)
    }
}

fn normalize(data: Value) -> (Value, ContentType) {
    match data {
        Value::Null => (Value::Object(Map::new()), ContentType::Json),
        Value::Object(_) | Value::Array(_) => (data, ContentType::Json),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => (parsed, ContentType::Json),
            _ => (Value::String(s), ContentType::Text),
        },
        other => (Value::String(other.to_string()), ContentType::Text),
    }
}
