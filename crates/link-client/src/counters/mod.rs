// Per-topic link counters and point-in-time snapshots.
//
// The topic map is fixed when the registry is built, so readers and writers only
// touch atomics. Snapshots read each field independently and may be slightly skewed
// against concurrent increments.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct TopicCounters {
    topic: String,
    published: AtomicU64,
    acknowledged: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
    inflight: AtomicU64,
}

impl TopicCounters {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            published: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            received: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message handed to the transport. Counted regardless of the ack outcome.
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("link_published_total", "topic" => self.topic.clone()).increment(1);
    }

    pub fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.release_inflight();
        metrics::counter!("link_acked_total", "topic" => self.topic.clone()).increment(1);
    }

    /// Delivery failed. `timed_out` separates write-timeout expiry from transport errors.
    pub fn record_failed(&self, timed_out: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        self.release_inflight();
        let reason = if timed_out { "timeout" } else { "error" };
        metrics::counter!(
            "link_delivery_failed_total",
            "topic" => self.topic.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Message discarded before transmission: buffer overflow or no buffer.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("link_buffer_dropped_total", "topic" => self.topic.clone()).increment(1);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("link_received_total", "topic" => self.topic.clone()).increment(1);
    }

    pub fn snapshot(&self) -> TopicSnapshot {
        TopicSnapshot {
            topic: self.topic.clone(),
            published: self.published.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
        }
    }

    fn release_inflight(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSnapshot {
    pub topic: String,
    pub published: u64,
    pub acknowledged: u64,
    pub received: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dropped: u64,
    pub inflight: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterTotals {
    pub published: u64,
    pub acknowledged: u64,
    pub received: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dropped: u64,
    pub inflight: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Sorted by topic name.
    pub topics: Vec<TopicSnapshot>,
    /// Messages that arrived on topics this process never subscribed to.
    pub unmatched: u64,
}

impl CountersSnapshot {
    pub fn topic(&self, topic: &str) -> Option<&TopicSnapshot> {
        self.topics.iter().find(|snapshot| snapshot.topic == topic)
    }

    pub fn totals(&self) -> CounterTotals {
        self.topics
            .iter()
            .fold(CounterTotals::default(), |mut totals, topic| {
                totals.published += topic.published;
                totals.acknowledged += topic.acknowledged;
                totals.received += topic.received;
                totals.failed += topic.failed;
                totals.timed_out += topic.timed_out;
                totals.dropped += topic.dropped;
                totals.inflight += topic.inflight;
                totals
            })
    }
}

/// All counters of one link, keyed by topic.
///
/// ```
/// use link_client::counters::CounterRegistry;
///
/// let registry = CounterRegistry::new(["/driver/location", "/driver/offer"]);
/// let location = registry.topic("/driver/location").expect("registered");
/// location.record_published();
/// location.record_acknowledged();
///
/// let totals = registry.snapshot().totals();
/// assert_eq!(totals.published, 1);
/// assert_eq!(totals.acknowledged, 1);
/// assert_eq!(totals.inflight, 0);
/// ```
#[derive(Debug, Default)]
pub struct CounterRegistry {
    topics: HashMap<String, Arc<TopicCounters>>,
    unmatched: AtomicU64,
}

impl CounterRegistry {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics = topics
            .into_iter()
            .map(Into::into)
            .map(|topic: String| (topic.clone(), Arc::new(TopicCounters::new(topic))))
            .collect();
        Self {
            topics,
            unmatched: AtomicU64::new(0),
        }
    }

    pub fn topic(&self, topic: &str) -> Option<&Arc<TopicCounters>> {
        self.topics.get(topic)
    }

    pub fn record_unmatched(&self, topic: &str) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(topic, "message on unregistered topic");
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let mut topics: Vec<TopicSnapshot> = self
            .topics
            .values()
            .map(|counters| counters.snapshot())
            .collect();
        topics.sort_by(|left, right| left.topic.cmp(&right.topic));
        CountersSnapshot {
            topics,
            unmatched: self.unmatched.load(Ordering::Relaxed),
        }
    }
}
