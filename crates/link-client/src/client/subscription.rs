// Inbound consumer: header parsing, one-way latency and receive counters.
use crate::client::shutdown_signalled;
use crate::counters::CounterRegistry;
use link_transport::{InboundMessage, QoS};
use link_wire::{PayloadHeader, unix_ms_now};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

pub const RECEIPT_CHANNEL_CAPACITY: usize = 1024;

/// One consumed message as seen by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub topic: String,
    pub qos: QoS,
    pub bytes: usize,
    pub seq: Option<u64>,
    pub publish_ts_ms: Option<u64>,
    pub recv_ts_ms: u64,
    pub latency_ms: Option<u64>,
}

#[derive(Clone)]
pub struct SubscriptionConsumer {
    counters: Arc<CounterRegistry>,
    receipts: broadcast::Sender<Receipt>,
}

impl SubscriptionConsumer {
    pub fn new(counters: Arc<CounterRegistry>) -> Self {
        let (receipts, _) = broadcast::channel(RECEIPT_CHANNEL_CAPACITY);
        Self { counters, receipts }
    }

    /// Stream of receipts for observers. Slow observers lose the oldest entries.
    pub fn receipts(&self) -> broadcast::Receiver<Receipt> {
        self.receipts.subscribe()
    }

    /// Account for one inbound message received at `recv_ts_ms`.
    pub fn consume(&self, message: &InboundMessage, recv_ts_ms: u64) -> Receipt {
        let header = PayloadHeader::parse(&message.payload);
        let receipt = Receipt {
            topic: message.topic.clone(),
            qos: message.qos,
            bytes: message.payload.len(),
            seq: header.seq,
            publish_ts_ms: header.publish_ts_ms,
            recv_ts_ms,
            latency_ms: header.latency_ms(recv_ts_ms),
        };

        match self.counters.topic(&message.topic) {
            Some(counters) => counters.record_received(),
            None => self.counters.record_unmatched(&message.topic),
        }
        if let Some(latency) = receipt.latency_ms {
            metrics::histogram!("link_recv_latency_ms", "topic" => receipt.topic.clone())
                .record(latency as f64);
        }
        // Unknown fields print as -1 so downstream parsers see one line shape.
        debug!(
            topic = %receipt.topic,
            seq = sentinel(receipt.seq),
            qos = receipt.qos.level(),
            bytes = receipt.bytes,
            latency_ms = sentinel(receipt.latency_ms),
            pub_ts_ms = sentinel(receipt.publish_ts_ms),
            recv_ts_ms = receipt.recv_ts_ms,
            "recv"
        );
        let _ = self.receipts.send(receipt.clone());
        receipt
    }

    /// Drain the inbound stream until shutdown or until the transport drops it.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                message = inbound.recv() => message,
            };
            let Some(message) = message else {
                debug!("inbound stream closed");
                break;
            };
            self.consume(&message, unix_ms_now());
        }
        // Count what already arrived before stopping.
        while let Ok(message) = inbound.try_recv() {
            self.consume(&message, unix_ms_now());
        }
        debug!("consumer stopped");
    }
}

fn sentinel(value: Option<u64>) -> i64 {
    value.map_or(-1, |value| i64::try_from(value).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn inbound(topic: &str, payload: &'static [u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            qos: QoS::AtLeastOnce,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn latency_and_counters_for_well_formed_payload() {
        let counters = Arc::new(CounterRegistry::new(["/driver/offer"]));
        let consumer = SubscriptionConsumer::new(Arc::clone(&counters));
        let receipt = consumer.consume(&inbound("/driver/offer", b"ts=1000|seq=4|xxxx"), 1_030);

        assert_eq!(receipt.seq, Some(4));
        assert_eq!(receipt.latency_ms, Some(30));
        assert_eq!(receipt.bytes, 18);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.topic("/driver/offer").map(|t| t.received), Some(1));
    }

    #[test]
    fn skewed_or_garbage_payloads_still_count() {
        let counters = Arc::new(CounterRegistry::new(["/driver/ride"]));
        let consumer = SubscriptionConsumer::new(Arc::clone(&counters));

        let skewed = consumer.consume(&inbound("/driver/ride", b"ts=2000|seq=1|"), 1_000);
        assert_eq!(skewed.latency_ms, None);
        let garbage = consumer.consume(&inbound("/driver/ride", b"{\"hello\":1}"), 1_000);
        assert_eq!(garbage.seq, None);
        assert_eq!(garbage.latency_ms, None);

        assert_eq!(counters.snapshot().totals().received, 2);
    }

    #[test]
    fn unknown_topics_are_unmatched() {
        let counters = Arc::new(CounterRegistry::new(["/driver/ride"]));
        let consumer = SubscriptionConsumer::new(Arc::clone(&counters));
        consumer.consume(&inbound("/elsewhere", b"ts=1|seq=1|"), 5);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.unmatched, 1);
        assert_eq!(snapshot.totals().received, 0);
    }

    #[tokio::test]
    async fn run_publishes_receipts_and_stops_on_close() {
        let counters = Arc::new(CounterRegistry::new(["/driver/offer"]));
        let consumer = SubscriptionConsumer::new(Arc::clone(&counters));
        let mut receipts = consumer.receipts();
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(rx, shutdown_rx));

        tx.send(inbound("/driver/offer", b"ts=1|seq=9|")).await.expect("send");
        let receipt = receipts.recv().await.expect("receipt");
        assert_eq!(receipt.seq, Some(9));

        drop(tx);
        task.await.expect("consumer exits");
        assert_eq!(counters.snapshot().totals().received, 1);
    }

    #[test]
    fn sentinel_marks_unknown_values() {
        assert_eq!(sentinel(None), -1);
        assert_eq!(sentinel(Some(12)), 12);
    }
}
