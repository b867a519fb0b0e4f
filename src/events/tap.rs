//! Observers of one routing key

use super::bus::EventReceiver;
use crate::event::FlowEvent;

/// Receives every event routed on one `{elementId}.{streamId}` key
///
/// Taps only observe; they never take part in delivery to elements.
pub struct EventTap {
    stream_id: String,
    receiver: EventReceiver<FlowEvent>,
}

impl EventTap {
    pub(crate) fn new(stream_id: impl Into<String>, receiver: EventReceiver<FlowEvent>) -> Self {
        Self {
            stream_id: stream_id.into(),
            receiver,
        }
    }

    /// Routing key this tap observes
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Wait for the next matching event; `None` once the flow is gone
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        loop {
            let event = self.receiver.recv().await?;
            if event.get_stream_id() == self.stream_id {
                return Some(event);
            }
        }
    }

    /// Next matching event that has already been routed
    pub fn try_recv(&mut self) -> Option<FlowEvent> {
        while let Some(event) = self.receiver.try_recv() {
            if event.get_stream_id() == self.stream_id {
                return Some(event);
            }
        }
        None
    }
}

impl std::fmt::Debug for EventTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTap")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}
