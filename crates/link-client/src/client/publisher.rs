// Publish pipeline: per-topic tickers, inflight admission, buffering and ack tracking.
//
// All transmissions go through one dispatch lock so buffered messages leave in FIFO
// order and a direct send never overtakes the buffer. Ack waits run as detached tasks;
// scheduling never waits on them.
use crate::client::buffer::{MessageBuffer, PushOutcome};
use crate::client::connection::ConnectionHandle;
use crate::client::inflight::{InflightEntry, InflightPermit, InflightSet};
use crate::client::sequencer::{OutboundMessage, Sequencer};
use crate::client::shutdown_signalled;
use crate::config::PublishTopic;
use crate::counters::{CounterRegistry, TopicCounters};
use link_transport::{DeliveryOutcome, DeliveryToken, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// What happened to one scheduled tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Sent { seq: u64 },
    Buffered { seq: u64 },
    /// Built but discarded: no buffer and no inflight capacity, or the buffer
    /// rejected it.
    Dropped { seq: u64 },
    /// Not built at all; no sequence number was consumed.
    Skipped,
}

#[derive(Clone)]
pub struct PublishPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    transport: Arc<dyn Transport>,
    connection: ConnectionHandle,
    counters: Arc<CounterRegistry>,
    inflight: Arc<InflightSet>,
    buffer: Option<Arc<MessageBuffer>>,
    write_timeout: Duration,
    dispatch: tokio::sync::Mutex<()>,
    wake: Notify,
    ack_waits: Mutex<JoinSet<()>>,
}

enum HandOff {
    Sent,
    /// The link went away before the transport accepted the message.
    Requeue(OutboundMessage),
}

impl PublishPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        connection: ConnectionHandle,
        counters: Arc<CounterRegistry>,
        inflight: Arc<InflightSet>,
        buffer: Option<Arc<MessageBuffer>>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                transport,
                connection,
                counters,
                inflight,
                buffer,
                write_timeout,
                dispatch: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                ack_waits: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.as_ref().map_or(0, |buffer| buffer.len())
    }

    pub fn inflight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Zero when buffering is disabled.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer.as_ref().map_or(0, |buffer| buffer.capacity())
    }

    pub fn max_inflight(&self) -> usize {
        self.inner.inflight.capacity()
    }

    /// Run one scheduled tick for `topic`.
    pub async fn tick(&self, topic: &PublishTopic, sequencer: &Sequencer) -> TickOutcome {
        let inner = &self.inner;
        let Some(buffer) = inner.buffer.as_ref() else {
            return self.tick_unbuffered(topic, sequencer).await;
        };

        let message = OutboundMessage::new(
            topic.topic.as_str(),
            topic.qos,
            sequencer.next(),
            topic.payload_bytes,
        );
        let seq = message.seq;
        let _dispatch = inner.dispatch.lock().await;
        self.flush_locked(buffer).await;

        if inner.connection.is_connected()
            && buffer.is_empty()
            && let Some(permit) = inner.inflight.try_reserve()
        {
            return match self.hand_off(message, permit).await {
                HandOff::Sent => TickOutcome::Sent { seq },
                HandOff::Requeue(message) => self.buffer_message(buffer, message),
            };
        }
        self.buffer_message(buffer, message)
    }

    async fn tick_unbuffered(&self, topic: &PublishTopic, sequencer: &Sequencer) -> TickOutcome {
        let inner = &self.inner;
        if !inner.connection.is_connected() {
            debug!(topic = %topic.topic, "not connected; skipping tick");
            return TickOutcome::Skipped;
        }
        let message = OutboundMessage::new(
            topic.topic.as_str(),
            topic.qos,
            sequencer.next(),
            topic.payload_bytes,
        );
        let seq = message.seq;
        let _dispatch = inner.dispatch.lock().await;
        let Some(permit) = inner.inflight.try_reserve() else {
            debug!(topic = %topic.topic, seq, "inflight saturated; dropping message");
            self.record_dropped(&message);
            return TickOutcome::Dropped { seq };
        };
        match self.hand_off(message, permit).await {
            HandOff::Sent => TickOutcome::Sent { seq },
            HandOff::Requeue(message) => {
                self.record_dropped(&message);
                TickOutcome::Dropped { seq }
            }
        }
    }

    /// Send buffered messages while the link is up and inflight has room.
    pub async fn flush(&self) {
        let Some(buffer) = self.inner.buffer.as_ref() else {
            return;
        };
        let _dispatch = self.inner.dispatch.lock().await;
        self.flush_locked(buffer).await;
    }

    async fn flush_locked(&self, buffer: &MessageBuffer) {
        let inner = &self.inner;
        let mut flushed = 0usize;
        while inner.connection.is_connected() {
            let Some(permit) = inner.inflight.try_reserve() else {
                break;
            };
            let Some(message) = buffer.pop_front() else {
                break;
            };
            match self.hand_off(message, permit).await {
                HandOff::Sent => flushed += 1,
                HandOff::Requeue(message) => {
                    buffer.push_front(message);
                    break;
                }
            }
        }
        if flushed > 0 {
            debug!(flushed, remaining = buffer.len(), "flushed buffered messages");
        }
    }

    fn buffer_message(&self, buffer: &MessageBuffer, message: OutboundMessage) -> TickOutcome {
        let seq = message.seq;
        match buffer.push(message) {
            PushOutcome::Queued => TickOutcome::Buffered { seq },
            PushOutcome::Evicted(evicted) => {
                debug!(topic = %evicted.topic, seq = evicted.seq, "buffer full; evicted oldest");
                self.record_dropped(&evicted);
                TickOutcome::Buffered { seq }
            }
            PushOutcome::Rejected(rejected) => {
                debug!(topic = %rejected.topic, seq = rejected.seq, "buffer full; rejected newest");
                self.record_dropped(&rejected);
                TickOutcome::Dropped { seq }
            }
        }
    }

    /// Give one message to the transport and start tracking its token.
    async fn hand_off(&self, message: OutboundMessage, permit: InflightPermit) -> HandOff {
        let inner = &self.inner;
        let counters = inner.counters.topic(&message.topic).cloned();
        let result = inner
            .transport
            .publish(&message.topic, message.qos, message.payload.clone(), false)
            .await;
        match result {
            Ok(token) => {
                if let Some(counters) = counters.as_ref() {
                    counters.record_published();
                }
                debug!(
                    topic = %message.topic,
                    seq = message.seq,
                    qos = message.qos.level(),
                    bytes = message.payload.len(),
                    pub_ts_ms = message.publish_ts_ms,
                    "publish"
                );
                let entry = InflightEntry {
                    topic: Arc::clone(&message.topic),
                    seq: message.seq,
                    sent_at: Instant::now(),
                };
                inner.inflight.insert(token.id(), entry, permit);
                self.track(token, counters);
                HandOff::Sent
            }
            Err(err) if err.is_connection_loss() => {
                debug!(topic = %message.topic, seq = message.seq, error = %err, "link down during hand-off");
                HandOff::Requeue(message)
            }
            Err(err) => {
                warn!(topic = %message.topic, seq = message.seq, error = %err, "publish failed");
                if let Some(counters) = counters.as_ref() {
                    counters.record_published();
                    counters.record_failed(false);
                }
                HandOff::Sent
            }
        }
    }

    fn track(&self, token: DeliveryToken, counters: Option<Arc<TopicCounters>>) {
        let inner = Arc::clone(&self.inner);
        let mut ack_waits = self.inner.ack_waits.lock();
        while ack_waits.try_join_next().is_some() {}
        ack_waits.spawn(async move {
            let id = token.id();
            let outcome = tokio::time::timeout(inner.write_timeout, token.wait()).await;
            let entry = inner.inflight.remove(id);
            match (outcome, counters) {
                (Ok(DeliveryOutcome::Acked), Some(counters)) => counters.record_acknowledged(),
                (Ok(DeliveryOutcome::Failed(reason)), counters) => {
                    if let Some(entry) = entry.as_ref() {
                        debug!(topic = %entry.topic, seq = entry.seq, reason = %reason, "delivery failed");
                    }
                    if let Some(counters) = counters {
                        counters.record_failed(false);
                    }
                }
                (Err(_), counters) => {
                    if let Some(entry) = entry.as_ref() {
                        debug!(topic = %entry.topic, seq = entry.seq, "delivery timed out");
                    }
                    if let Some(counters) = counters {
                        counters.record_failed(true);
                    }
                }
                (Ok(DeliveryOutcome::Acked), None) => {}
            }
            inner.wake.notify_one();
        });
    }

    /// Wait for every outstanding ack wait. Each is bounded by the write timeout.
    pub async fn drain_acks(&self) {
        let mut ack_waits = std::mem::take(&mut *self.inner.ack_waits.lock());
        while ack_waits.join_next().await.is_some() {}
    }

    fn record_dropped(&self, message: &OutboundMessage) {
        if let Some(counters) = self.inner.counters.topic(&message.topic) {
            counters.record_dropped();
        }
    }

    /// Flush whenever the link comes back or an ack frees inflight room.
    pub async fn run_flusher(self, mut shutdown: watch::Receiver<bool>) {
        if self.inner.buffer.is_none() {
            return;
        }
        let mut connection = self.inner.connection.watch();
        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.inner.wake.notified() => {}
            }
            if self.inner.connection.is_connected() {
                self.flush().await;
            }
        }
        debug!("flusher stopped");
    }

    /// Drive one topic's schedule until shutdown.
    pub async fn run_ticker(self, topic: PublishTopic, mut shutdown: watch::Receiver<bool>) {
        let sequencer = Sequencer::new();
        let mut interval = tokio::time::interval(topic.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(topic = %topic.topic, period_ms = topic.period.as_millis() as u64, "ticker started");
        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                _ = interval.tick() => {}
            }
            let outcome = self.tick(&topic, &sequencer).await;
            debug!(topic = %topic.topic, ?outcome, "tick");
        }
        debug!(topic = %topic.topic, next_seq = sequencer.peek(), "ticker stopped");
    }
}
