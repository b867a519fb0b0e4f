//! Flow definition input format
//!
//! A flow definition is the declarative, JSON-compatible description of a
//! flow: its elements, the connections between their streams, the
//! deployment context, and flow-scoped properties.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Name of the stream used when a connection does not name one
pub const DEFAULT_STREAM: &str = "default";

fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}

/// A complete flow definition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Elements to instantiate
    #[serde(default)]
    pub elements: Vec<ElementDefinition>,
    /// Stream connections between elements
    #[serde(default)]
    pub connections: Vec<ConnectionDefinition>,
    /// Deployment context
    #[serde(default)]
    pub context: FlowContext,
    /// Flow-scoped properties, referenced by elements via interpolation
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl FlowDefinition {
    /// Parse a flow definition from JSON text
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Create an empty definition with the given context
    pub fn new(context: FlowContext) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    /// Add an element
    pub fn element(mut self, element: ElementDefinition) -> Self {
        self.elements.push(element);
        self
    }

    /// Connect `source.default` to `target.default`
    pub fn connect(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.connect_streams(source, DEFAULT_STREAM, target, DEFAULT_STREAM)
    }

    /// Connect `source.source_stream` to `target.target_stream`
    pub fn connect_streams(
        mut self,
        source: impl Into<String>,
        source_stream: impl Into<String>,
        target: impl Into<String>,
        target_stream: impl Into<String>,
    ) -> Self {
        let id = format!("connection-{}", self.connections.len() + 1);
        self.connections.push(ConnectionDefinition {
            id,
            name: None,
            source: source.into(),
            source_stream: source_stream.into(),
            target: target.into(),
            target_stream: target_stream.into(),
        });
        self
    }

    /// Set a flow-scoped property
    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// An element entry in a flow definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDefinition {
    /// Unique element ID within the flow
    pub id: String,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Module the element's function is declared in
    pub module: String,
    /// Function identifier within the module
    pub function_fqn: String,
    /// Initial element properties
    #[serde(default)]
    pub properties: Value,
}

impl ElementDefinition {
    /// Create an element definition without properties
    pub fn new(
        id: impl Into<String>,
        module: impl Into<String>,
        function_fqn: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            module: module.into(),
            function_fqn: function_fqn.into(),
            properties: Value::Null,
        }
    }

    /// Set the initial properties
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Registry key `{module}.{functionFqn}`
    pub fn key(&self) -> String {
        format!("{}.{}", self.module, self.function_fqn)
    }
}

/// A connection from one element's output stream to another's input stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDefinition {
    /// Connection ID
    #[serde(default)]
    pub id: String,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Source element ID
    #[serde(default)]
    pub source: String,
    /// Source output stream
    #[serde(default = "default_stream")]
    pub source_stream: String,
    /// Target element ID
    #[serde(default)]
    pub target: String,
    /// Target input stream
    #[serde(default = "default_stream")]
    pub target_stream: String,
}

impl ConnectionDefinition {
    /// Routing key of the source side, `{source}.{sourceStream}`
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.source, self.source_stream)
    }
}

/// Deployment context shared by every element of a flow
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContext {
    /// Flow ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Deployment ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    /// Diagram ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram_id: Option<String>,
    /// Optional owner of the deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Value>,
}

impl FlowContext {
    /// Create a context for a flow deployment
    pub fn new(flow_id: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        Self {
            flow_id: Some(flow_id.into()),
            deployment_id: Some(deployment_id.into()),
            ..Default::default()
        }
    }

    /// Overlay the fields that are set in `other`
    pub fn merge(&mut self, other: &FlowContext) {
        if other.flow_id.is_some() {
            self.flow_id = other.flow_id.clone();
        }
        if other.deployment_id.is_some() {
            self.deployment_id = other.deployment_id.clone();
        }
        if other.diagram_id.is_some() {
            self.diagram_id = other.diagram_id.clone();
        }
        if other.owner.is_some() {
            self.owner = other.owner.clone();
        }
    }

    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        self.flow_id.is_none()
            && self.deployment_id.is_none()
            && self.diagram_id.is_none()
            && self.owner.is_none()
    }
}

/// Identity of an element, attached to its events and log lines
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementMetadata {
    /// Element ID
    pub id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Function identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_fqn: Option<String>,
    /// Flow ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Deployment ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
}

impl ElementMetadata {
    /// Metadata with only an ID, for events injected from outside a flow
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Build metadata for an element of a deployed flow
    pub fn for_element(
        context: &FlowContext,
        id: impl Into<String>,
        name: Option<String>,
        function_fqn: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name,
            function_fqn: Some(function_fqn.into()),
            flow_id: context.flow_id.clone(),
            deployment_id: context.deployment_id.clone(),
        }
    }

    /// Set the function identifier
    pub fn with_function_fqn(mut self, fqn: impl Into<String>) -> Self {
        self.function_fqn = Some(fqn.into());
        self
    }

    /// Set flow and deployment IDs
    pub fn with_context(mut self, context: &FlowContext) -> Self {
        self.flow_id = context.flow_id.clone();
        self.deployment_id = context.deployment_id.clone();
        self
    }

    /// Source URI `flows/{flowId}/deployments/{deploymentId}/elements/{id}`
    pub fn source(&self) -> String {
        format!(
            "flows/{}/deployments/{}/elements/{}",
            self.flow_id.as_deref().unwrap_or("undefined"),
            self.deployment_id.as_deref().unwrap_or("undefined"),
            self.id
        )
    }

    /// Routing key used for RPC calls made on behalf of this element
    pub fn rpc_routing_key(&self) -> String {
        format!(
            "{}{}{}",
            self.flow_id.as_deref().unwrap_or_default(),
            self.deployment_id.as_deref().unwrap_or_default(),
            self.id
        )
    }
}

/// Custom message addressed to one element, or to all of them
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMessage {
    /// Target element; broadcast when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    /// Remaining message fields
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl DeploymentMessage {
    /// Message for every element
    pub fn broadcast(payload: Map<String, Value>) -> Self {
        Self {
            element_id: None,
            payload,
        }
    }

    /// Message for one element
    pub fn to_element(element_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            element_id: Some(element_id.into()),
            payload,
        }
    }
}

static TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([^}]+?)\s*\}").unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Replace `${path}` placeholders in every string of `value`
///
/// Each variable set is tried in order; the first set that resolves every
/// placeholder of a string wins. Strings with unresolvable placeholders are
/// left untouched.
pub fn fill_template(value: &Value, variables: &[&Value]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fill_template(v, variables)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| fill_template(v, variables)).collect())
        }
        Value::String(s) if s.contains("${") => variables
            .iter()
            .find_map(|vars| interpolate_str(s, vars))
            .map(Value::String)
            .unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

fn interpolate_str(template: &str, variables: &Value) -> Option<String> {
    let mut resolved = true;
    let out = TEMPLATE_RE.replace_all(template, |caps: &Captures<'_>| {
        match lookup_path(variables, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                resolved = false;
                String::new()
            }
            Some(other) => other.to_string(),
        }
    });
    resolved.then(|| out.into_owned())
}

/// Look up a dotted path (`a.b.0.c`) inside a JSON value
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
