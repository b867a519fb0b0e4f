//! Error types for flowkit
//!
//! Errors are split by where they can occur: flow composition, element
//! execution, the concurrency limiter, the transport, and the RPC bridge.
//! Only composition errors are fatal to a flow; everything else is isolated
//! to the element or caller that triggered it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiError;

/// Errors that can occur while composing a flow
#[derive(Error, Debug)]
pub enum FlowError {
    /// A module has no name or an invalid name
    #[error("FlowModule ({0}) metadata is missing or invalid")]
    InvalidModule(String),

    /// A function identifier does not match the FQN grammar
    #[error("Flow Function FQN ({0}) is not valid")]
    InvalidFunctionFqn(String),

    /// An element declares no function identifier
    #[error("FlowFunction ({0}) metadata is missing or invalid")]
    MissingFunctionFqn(String),

    /// No registered declaration for `{module}.{functionFqn}`
    #[error("Could not create FlowElement for {0}")]
    UnknownElement(String),

    /// The element's constructor rejected its properties or context
    #[error("Could not create FlowElement {element_id} ({key}): {source}")]
    ElementCreation {
        /// The element ID from the flow definition
        element_id: String,
        /// The `{module}.{functionFqn}` registry key
        key: String,
        /// The underlying element error
        #[source]
        source: ElementError,
    },

    /// Two elements in one flow share an ID
    #[error("Duplicate element ID: {0}")]
    DuplicateElement(String),

    /// A connection references an element that was never instantiated
    #[error("{0} has not been initialized")]
    ElementNotInitialized(String),

    /// A connection targets a stream without a registered handler
    #[error("{element} does not implement a handler for {stream}")]
    MissingHandler {
        /// Target element ID
        element: String,
        /// Target stream name
        stream: String,
    },

    /// The application was asked to do something its state forbids
    #[error("Invalid application state: {0}")]
    InvalidState(String),

    /// The transport failed while the flow was being set up
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A single failed property constraint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Fully-qualified property path, e.g. `nested.items.0.value`
    pub path: String,
    /// Constraint name to human readable description
    pub constraints: BTreeMap<String, String>,
    /// The offending value
    pub value: serde_json::Value,
}

impl Violation {
    /// Create a violation with a single constraint
    pub fn new(
        path: impl Into<String>,
        constraint: impl Into<String>,
        description: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        let mut constraints = BTreeMap::new();
        constraints.insert(constraint.into(), description.into());
        Self {
            path: path.into(),
            constraints,
            value,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let constraints = serde_json::to_string(&self.constraints).map_err(|_| fmt::Error)?;
        write!(
            f,
            "Validation for property \"{}\" failed:\n{}\nvalue: {}",
            self.path,
            constraints,
            display_value(&self.value)
        )
    }
}

/// Render a JSON value the way log lines show it: bare strings, JSON otherwise
pub(crate) fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Errors raised by elements
#[derive(Error, Debug)]
pub enum ElementError {
    /// Properties or event data failed validation
    #[error("Properties Validation failed")]
    Validation(Vec<Violation>),

    /// A handler failed while processing an event
    #[error("Handler execution failed: {0}")]
    ExecutionFailed(String),

    /// A call through the injected API capability failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// An RPC call failed
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// The element has no properties that could be replaced
    #[error("{0} does not accept property updates")]
    PropertiesNotSupported(String),

    /// The limiter rejected or dropped the invocation
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error("{0}")]
    Other(String),
}

impl ElementError {
    /// Create a new execution failed error
    pub fn execution_failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Violations carried by a validation error
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation(v) => v,
            _ => &[],
        }
    }
}

/// Errors produced by the concurrency limiter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The task exceeded its per-task timeout
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    /// The task was dropped before producing a result (it panicked)
    #[error("Task aborted before completion")]
    Aborted,
}

/// Errors from the transport/broker connection
#[derive(Error, Debug)]
pub enum TransportError {
    /// Publishing a message failed
    #[error("Publish to {exchange}/{routing_key} failed: {reason}")]
    Publish {
        /// Target exchange
        exchange: String,
        /// Routing key used
        routing_key: String,
        /// Reason given by the transport
        reason: String,
    },

    /// Creating a subscriber failed
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// The connection has been closed
    #[error("Transport connection is closed")]
    Closed,

    /// No transport is configured
    #[error("No transport connection available")]
    Unavailable,

    /// Internal transport state is unusable
    #[error("Invalid transport state: {0}")]
    InvalidState(String),
}

/// Errors from the RPC bridge
#[derive(Error, Debug)]
pub enum RpcError {
    /// The remote worker replied with an error
    #[error("{message}")]
    Remote {
        /// Message sent by the remote side
        message: String,
        /// Remote stack trace, if provided
        remote_stack: Option<String>,
        /// Call site recorded when the call was made
        local_trace: String,
    },

    /// The reply did not have a recognized shape
    #[error("Malformed RPC response: {0}")]
    Malformed(serde_json::Value),

    /// The call arguments exceed `MAX_RPC_MSG_SIZE_BYTES`
    #[error("Max RPC message size exceeded: {size} bytes / {max} bytes")]
    MessageTooLarge {
        /// Serialized argument size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// No reply arrived within the configured timeout
    #[error("RPC call {0} timed out")]
    Timeout(String),

    /// The bridge was closed while the call was outstanding
    #[error("RPC client closed")]
    Closed,

    /// The transport failed to deliver the call
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RpcError {
    /// Combined trace for diagnostics: remote stack followed by local call site
    pub fn stack(&self) -> Option<String> {
        match self {
            Self::Remote {
                remote_stack: Some(remote),
                local_trace,
                ..
            } => Some(format!("Remote Stack\n{}\nLocal Stack\n{}", remote, local_trace)),
            Self::Remote { local_trace, .. } => Some(local_trace.clone()),
            _ => None,
        }
    }
}
