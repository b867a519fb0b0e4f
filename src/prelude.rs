//! Prelude module for flowkit
//!
//! This module re-exports the most commonly used types for convenient importing:
//!
//! ```rust,ignore
//! use flowkit::prelude::*;
//! ```

// Error types
pub use crate::error::{ElementError, FlowError, QueueError, RpcError, TransportError, Violation};

// Flow definitions and events
pub use crate::definition::{
    ConnectionDefinition, DeploymentMessage, ElementDefinition, ElementMetadata, FlowContext,
    FlowDefinition,
};
pub use crate::event::{ContentType, FlowEvent};

// Elements and modules
pub use crate::element::properties::{FieldSpec, Properties, PropertySchema};
pub use crate::element::{
    ElementContext, ElementDescriptor, FlowElement, FlowFunction, FunctionFqn, InputStream,
};
pub use crate::module::{FlowModule, ModuleRegistry};

// Running flows
pub use crate::application::{AppState, ControlMessage, FlowApplication, FlowUpdate};
pub use crate::builtin::core_module;
pub use crate::config::{ExitMode, FlowConfig, RpcConfig};
pub use crate::events::{EventTap, HealthState, LifecycleEvent, LifecycleKind};
pub use crate::logger::{FlowLogger, LogSink, MemoryLogSink};
pub use crate::queue::{Queue, QueueOptions, QueueStats};

// Capabilities
pub use crate::api::{Api, ApiError, HttpApi, StaticToken, TokenProvider};
pub use crate::rpc::RpcClient;
pub use crate::transport::{MemoryTransport, Transport};

// Re-exports from dependencies
pub use async_trait::async_trait;
pub use futures::FutureExt;
pub use serde::{Deserialize, Serialize};
pub use serde_json::{self, json, Value};
