//! Broadcast bus used for event taps and lifecycle notifications

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus for in-process observers
///
/// Uses tokio broadcast channels; every subscriber gets its own clone of
/// each message. Publishing never blocks, and a subscriber that falls more
/// than `capacity` messages behind skips the oldest ones.
pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
    subscriber_count: Arc<AtomicUsize>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            subscriber_count: self.subscriber_count.clone(),
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> EventBus<T> {
    /// Create a new bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new bus with the given capacity (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish a message to all subscribers
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, message: T) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    /// Subscribe to messages published from now on
    pub fn subscribe(&self) -> EventReceiver<T> {
        self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        EventReceiver {
            receiver: self.sender.subscribe(),
            subscriber_count: self.subscriber_count.clone(),
        }
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }

    /// Check if there are any active subscribers
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count.load(Ordering::SeqCst))
            .finish()
    }
}

/// Receiving side of an `EventBus`
pub struct EventReceiver<T> {
    receiver: broadcast::Receiver<T>,
    subscriber_count: Arc<AtomicUsize>,
}

impl<T: Clone> EventReceiver<T> {
    /// Receive the next message
    ///
    /// Returns `None` once the bus is gone. Lagged messages are skipped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event receiver lagged, some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive a message without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl<T> Drop for EventReceiver<T> {
    fn drop(&mut self) {
        self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
    }
}
