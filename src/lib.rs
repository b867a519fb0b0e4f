//! # flowkit
//!
//! An event-routing runtime that composes independently written processing
//! elements into a running flow.
//!
//! flowkit provides:
//! - **Declarative composition** of elements and stream connections from a `FlowDefinition`
//! - **Bounded concurrency** per element or per input stream
//! - **Failure isolation**: a failing handler never takes down the flow
//! - **Live reconfiguration** through control messages
//! - **Observability** via structured logging, log mirroring and lifecycle notifications
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowkit::prelude::*;
//!
//! struct Upper {
//!     context: ElementContext,
//! }
//!
//! impl Upper {
//!     async fn on_default(&self, event: FlowEvent) -> Result<(), ElementError> {
//!         let text = event.get_data()["text"].as_str().unwrap_or_default().to_uppercase();
//!         self.context.emit_event(json!({"text": text}), Some(&event), "default");
//!         Ok(())
//!     }
//! }
//!
//! impl FlowElement for Upper {
//!     fn context(&self) -> &ElementContext { &self.context }
//! }
//!
//! impl FlowFunction for Upper {
//!     fn describe() -> Result<ElementDescriptor<Self>, FlowError> {
//!         Ok(ElementDescriptor::new("upper")?
//!             .stream(InputStream::default_stream(|el, ev| el.on_default(ev).boxed())))
//!     }
//!
//!     fn create(context: ElementContext, _properties: Value) -> Result<Self, ElementError> {
//!         Ok(Self { context })
//!     }
//! }
//!
//! let app = FlowApplication::builder()
//!     .module(FlowModule::new("text").declare::<Upper>()?)
//!     .flow(FlowDefinition::new(FlowContext::new("flow-1", "dep-1"))
//!         .element(ElementDefinition::new("upper", "text", "upper")))
//!     .build()
//!     .await?;
//! ```

#![warn(missing_docs)]

// Core modules
pub mod api;
pub mod application;
pub mod builtin;
pub mod config;
pub mod definition;
pub mod element;
pub mod error;
pub mod event;
pub mod events;
pub mod logger;
pub mod module;
pub mod queue;
pub mod rpc;
pub mod transport;

/// Convenient re-exports for common usage
pub mod prelude;
