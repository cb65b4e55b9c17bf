// Bounded FIFO of messages waiting for a connection or inflight capacity.
use crate::client::sequencer::OutboundMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Result of admitting a message to the buffer.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Buffer was full; the oldest entry was evicted to make room.
    Evicted(OutboundMessage),
    /// Buffer was full and eviction is disabled; the new message was not admitted.
    Rejected(OutboundMessage),
}

impl PushOutcome {
    pub fn dropped(&self) -> Option<&OutboundMessage> {
        match self {
            Self::Queued => None,
            Self::Evicted(message) | Self::Rejected(message) => Some(message),
        }
    }
}

/// Eviction and insertion happen under one lock, so the size never exceeds capacity.
///
/// ```
/// use link_client::client::buffer::{MessageBuffer, PushOutcome};
/// use link_client::client::sequencer::OutboundMessage;
/// use link_transport::QoS;
///
/// let buffer = MessageBuffer::new(2, true);
/// for seq in 1..=3 {
///     let outcome = buffer.push(OutboundMessage::new("/t", QoS::AtLeastOnce, seq, 8));
///     assert_eq!(outcome.dropped().map(|message| message.seq), (seq == 3).then_some(1));
/// }
/// assert_eq!(buffer.len(), 2);
/// assert_eq!(buffer.pop_front().map(|message| message.seq), Some(2));
/// ```
#[derive(Debug)]
pub struct MessageBuffer {
    capacity: usize,
    drop_oldest: bool,
    queue: Mutex<VecDeque<OutboundMessage>>,
}

impl MessageBuffer {
    pub fn new(capacity: usize, drop_oldest: bool) -> Self {
        Self {
            capacity,
            drop_oldest,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4_096))),
        }
    }

    pub fn push(&self, message: OutboundMessage) -> PushOutcome {
        let outcome = {
            let mut queue = self.queue.lock();
            if self.capacity == 0 {
                PushOutcome::Rejected(message)
            } else if queue.len() < self.capacity {
                queue.push_back(message);
                PushOutcome::Queued
            } else if self.drop_oldest {
                let evicted = queue.pop_front();
                queue.push_back(message);
                match evicted {
                    Some(evicted) => PushOutcome::Evicted(evicted),
                    None => PushOutcome::Queued,
                }
            } else {
                PushOutcome::Rejected(message)
            }
        };
        self.publish_depth();
        outcome
    }

    pub fn pop_front(&self) -> Option<OutboundMessage> {
        let message = self.queue.lock().pop_front();
        if message.is_some() {
            self.publish_depth();
        }
        message
    }

    /// Put a message back at the head after a failed hand-off. May exceed capacity
    /// by the single returned entry until the next pop.
    pub fn push_front(&self, message: OutboundMessage) {
        self.queue.lock().push_front(message);
        self.publish_depth();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn publish_depth(&self) {
        metrics::gauge!("link_buffered").set(self.len() as f64);
    }
}
