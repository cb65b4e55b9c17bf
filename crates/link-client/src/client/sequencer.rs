// Per-topic sequence numbers and the outbound message they stamp.
use bytes::Bytes;
use link_transport::QoS;
use link_wire::{build_payload, unix_ms_now};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Strictly increasing counter starting at 1. A number is consumed only when a
/// message is actually built.
#[derive(Debug)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number the next call to `next` will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: Arc<str>,
    pub qos: QoS,
    pub seq: u64,
    pub publish_ts_ms: u64,
    pub payload: Bytes,
    pub enqueued_at: Instant,
}

impl OutboundMessage {
    /// Stamp a payload with the current wall clock.
    pub fn new(topic: impl Into<Arc<str>>, qos: QoS, seq: u64, payload_bytes: usize) -> Self {
        Self::with_timestamp(topic, qos, seq, unix_ms_now(), payload_bytes)
    }

    pub fn with_timestamp(
        topic: impl Into<Arc<str>>,
        qos: QoS,
        seq: u64,
        publish_ts_ms: u64,
        payload_bytes: usize,
    ) -> Self {
        Self {
            topic: topic.into(),
            qos,
            seq,
            publish_ts_ms,
            payload: build_payload(publish_ts_ms, seq, payload_bytes),
            enqueued_at: Instant::now(),
        }
    }
}
