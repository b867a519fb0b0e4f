//! Broker abstraction used for control messages, logs and RPC
//!
//! The runtime only needs a handful of broker operations: declaring
//! exchanges, publishing JSON messages, and consuming messages bound to an
//! exchange and routing key. Anything that can provide those (AMQP, NATS,
//! an in-process bus) can back a flow application.
//!
//! # Example
//!
//! ```rust,ignore
//! use flowkit::transport::{Binding, MemoryTransport, Transport};
//!
//! let transport = MemoryTransport::new();
//! transport.assert_exchange("deployment", ExchangeKind::Direct).await?;
//! transport.publish("deployment", "health", body, PublishOptions::default()).await?;
//! ```

mod memory;

pub use memory::{MemoryTransport, PublishedMessage};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// Exchange carrying control messages and health status
pub const DEPLOYMENT_EXCHANGE: &str = "deployment";
/// Exchange carrying mirrored log events
pub const FLOWLOGS_EXCHANGE: &str = "flowlogs";
/// Exchange carrying handler lifecycle notifications
pub const FLOWEVENTS_EXCHANGE: &str = "flowevents";
/// Exchange carrying RPC calls
pub const RPC_EXCHANGE: &str = "rpc_direct_exchange";
/// Routing key for health status messages
pub const HEALTH_ROUTING_KEY: &str = "health";

/// Exchange routing behavior
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Deliver to bindings whose routing key matches exactly
    Direct,
    /// Deliver to every binding
    Fanout,
}

/// Where a subscriber's queue is bound
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    /// Exchange to bind to; the empty string is the default exchange
    pub exchange: String,
    /// Routing key to bind with
    pub routing_key: String,
    /// Queue survives broker restarts
    pub durable: bool,
    /// Queue is private to this connection
    pub exclusive: bool,
}

impl Binding {
    /// Bind a private, non-durable queue to `exchange` with `routing_key`
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            durable: false,
            exclusive: true,
        }
    }

    /// Consume a named queue directly through the default exchange
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new("", name)
    }
}

/// Per-message properties
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Correlates a reply with its request
    pub correlation_id: Option<String>,
    /// Queue the reply should be sent to
    pub reply_to: Option<String>,
}

impl PublishOptions {
    /// Options for an RPC request
    pub fn request(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
        }
    }

    /// Options for an RPC reply
    pub fn reply(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
        }
    }
}

/// A message handed to a subscriber
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// JSON body
    pub body: Value,
    /// Message properties
    pub options: PublishOptions,
}

/// Outcome a subscriber reports for a message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Processed
    Ack,
    /// Rejected
    Nack {
        /// Put the message back on the queue
        requeue: bool,
    },
}

/// Subscriber callback
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, Delivery> + Send + Sync>;

/// Broker connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare an exchange if it does not exist yet
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError>;

    /// Publish a JSON message
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Value,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Start consuming messages matching `binding`
    async fn create_subscriber(
        &self,
        handler: MessageHandler,
        binding: Binding,
        name: &str,
    ) -> Result<(), TransportError>;

    /// Close the connection; further publishes fail
    async fn close(&self) -> Result<(), TransportError>;
}
