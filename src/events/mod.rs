//! Observability output of a running flow
//!
//! - `EventBus` fans events out to in-process observers (lifecycle
//!   subscribers, and `EventTap`s filtering by routing key)
//! - `EventPublisher` mirrors log events, lifecycle notifications and
//!   health status to the transport
//!
//! # Lifecycle notifications
//!
//! Every handler invocation produces `activated`, then either `completed`
//! or `terminated` carrying the elapsed time in milliseconds.

mod bus;
mod publisher;
mod tap;
mod types;

pub use bus::{EventBus, EventReceiver};
pub use publisher::{truncate, EventPublisher};
pub use tap::EventTap;
pub use types::{HealthEvent, HealthState, HealthStatus, LifecycleData, LifecycleEvent, LifecycleKind};
