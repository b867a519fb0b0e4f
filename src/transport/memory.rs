//! In-process transport for tests and single-process deployments

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use super::{Binding, Delivery, ExchangeKind, Message, MessageHandler, PublishOptions, Transport};
use crate::error::TransportError;

/// A message recorded by `MemoryTransport`
#[derive(Clone, Debug, PartialEq)]
pub struct PublishedMessage {
    /// Target exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// JSON body
    pub message: Value,
    /// Message properties
    pub options: PublishOptions,
}

struct Subscriber {
    name: String,
    binding: Binding,
    handler: MessageHandler,
}

/// In-memory transport
///
/// Delivers every published message inline to matching subscribers. A
/// transport created with `recording` also keeps each published message
/// for inspection; one created with `new` keeps nothing, so it can back a
/// long-running process.
pub struct MemoryTransport {
    exchanges: RwLock<HashMap<String, ExchangeKind>>,
    recording: bool,
    published: RwLock<Vec<PublishedMessage>>,
    subscribers: RwLock<Vec<Subscriber>>,
    closed: AtomicBool,
    failing: AtomicBool,
}

impl MemoryTransport {
    /// Create an empty transport that does not record published messages
    pub fn new() -> Self {
        Self {
            exchanges: RwLock::new(HashMap::new()),
            recording: false,
            published: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    /// Create an empty transport that records every published message
    pub fn recording() -> Self {
        Self {
            recording: true,
            ..Self::new()
        }
    }

    /// Make every publish fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every published message, in order; always empty unless recording
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Messages published to `exchange`
    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.exchange == exchange)
            .collect()
    }

    /// Declared exchanges
    pub fn exchanges(&self) -> HashMap<String, ExchangeKind> {
        self.exchanges
            .read()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Names and bindings of registered subscribers
    pub fn subscribers(&self) -> Vec<(String, Binding)> {
        self.subscribers
            .read()
            .map(|subs| {
                subs.iter()
                    .map(|s| (s.name.clone(), s.binding.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver a message to matching subscribers without recording it
    ///
    /// Returns each subscriber's verdict, in registration order.
    pub async fn deliver(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Value,
    ) -> Result<Vec<Delivery>, TransportError> {
        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            options: PublishOptions::default(),
        };
        self.dispatch(message).await
    }

    fn matching(&self, exchange: &str, routing_key: &str) -> Result<Vec<MessageHandler>, TransportError> {
        let kind = self
            .exchanges
            .read()
            .map_err(|e| TransportError::InvalidState(e.to_string()))?
            .get(exchange)
            .copied()
            .unwrap_or(ExchangeKind::Direct);

        let subscribers = self
            .subscribers
            .read()
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;

        Ok(subscribers
            .iter()
            .filter(|s| s.binding.exchange == exchange)
            .filter(|s| kind == ExchangeKind::Fanout || s.binding.routing_key == routing_key)
            .map(|s| s.handler.clone())
            .collect())
    }

    async fn dispatch(&self, message: Message) -> Result<Vec<Delivery>, TransportError> {
        let handlers = self.matching(&message.exchange, &message.routing_key)?;
        let mut deliveries = Vec::with_capacity(handlers.len());
        for handler in handlers {
            deliveries.push(handler(message.clone()).await);
        }
        Ok(deliveries)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("exchanges", &self.exchanges())
            .field("recording", &self.recording)
            .field("published", &self.published().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.exchanges
            .write()
            .map_err(|e| TransportError::InvalidState(e.to_string()))?
            .entry(name.to_string())
            .or_insert(kind);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Value,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: "transport is failing".to_string(),
            });
        }

        if self.recording {
            self.published
                .write()
                .map_err(|e| TransportError::InvalidState(e.to_string()))?
                .push(PublishedMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message: body.clone(),
                    options: options.clone(),
                });
        }

        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            options,
        };
        self.dispatch(message).await?;
        Ok(())
    }

    async fn create_subscriber(
        &self,
        handler: MessageHandler,
        binding: Binding,
        name: &str,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tracing::debug!(subscriber = name, exchange = %binding.exchange, routing_key = %binding.routing_key, "Subscriber created");
        self.subscribers
            .write()
            .map_err(|e| TransportError::InvalidState(e.to_string()))?
            .push(Subscriber {
                name: name.to_string(),
                binding,
                handler,
            });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers
            .write()
            .map_err(|e| TransportError::InvalidState(e.to_string()))?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Delivery::Ack }.boxed()
        })
    }

    #[tokio::test]
    async fn test_direct_routing() {
        let transport = MemoryTransport::recording();
        transport.assert_exchange("deployment", ExchangeKind::Direct).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        transport
            .create_subscriber(counting_handler(hits.clone()), Binding::new("deployment", "dep-1"), "control")
            .await
            .unwrap();

        transport.publish("deployment", "dep-1", json!({}), PublishOptions::default()).await.unwrap();
        transport.publish("deployment", "health", json!({}), PublishOptions::default()).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(transport.published_to("deployment").len(), 2);
    }

    #[tokio::test]
    async fn test_fanout_routing() {
        let transport = MemoryTransport::recording();
        transport.assert_exchange("flowlogs", ExchangeKind::Fanout).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            transport
                .create_subscriber(counting_handler(hits.clone()), Binding::new("flowlogs", ""), name)
                .await
                .unwrap();
        }

        transport.publish("flowlogs", "anything", json!(1), PublishOptions::default()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deliver_returns_verdicts() {
        let transport = MemoryTransport::recording();
        let handler: MessageHandler = Arc::new(|msg: Message| {
            async move {
                if msg.body["ok"] == json!(true) {
                    Delivery::Ack
                } else {
                    Delivery::Nack { requeue: false }
                }
            }
            .boxed()
        });
        transport.create_subscriber(handler, Binding::new("x", "k"), "s").await.unwrap();

        let verdicts = transport.deliver("x", "k", json!({"ok": false})).await.unwrap();
        assert_eq!(verdicts, vec![Delivery::Nack { requeue: false }]);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_new_transport_does_not_record() {
        let transport = MemoryTransport::new();
        transport.assert_exchange("flowlogs", ExchangeKind::Fanout).await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        transport
            .create_subscriber(counting_handler(hits.clone()), Binding::new("flowlogs", ""), "logs")
            .await
            .unwrap();

        for n in 0..3 {
            transport.publish("flowlogs", "", json!(n), PublishOptions::default()).await.unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_closed_and_failing() {
        let transport = MemoryTransport::recording();

        transport.set_failing(true);
        let err = transport.publish("x", "k", json!({}), PublishOptions::default()).await;
        assert!(matches!(err, Err(TransportError::Publish { .. })));
        transport.set_failing(false);

        transport.close().await.unwrap();
        assert!(transport.is_closed());
        let err = transport.publish("x", "k", json!({}), PublishOptions::default()).await;
        assert!(matches!(err, Err(TransportError::Closed)));
    }
}
