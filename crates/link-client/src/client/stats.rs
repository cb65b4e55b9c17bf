// Periodic consolidated snapshots of link counters and occupancy.
use crate::client::connection::{ConnectionHandle, ConnectionState};
use crate::client::publisher::PublishPipeline;
use crate::client::shutdown_signalled;
use crate::counters::{CounterRegistry, CounterTotals, CountersSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub connection: ConnectionState,
    pub counters: CountersSnapshot,
    pub inflight: usize,
    pub max_inflight: usize,
    pub buffered: usize,
    pub buffer_capacity: usize,
}

impl StatsSnapshot {
    pub fn totals(&self) -> CounterTotals {
        self.counters.totals()
    }

    /// One line per topic, then a totals line.
    pub fn log(&self) {
        for topic in &self.counters.topics {
            info!(
                topic = %topic.topic,
                published = topic.published,
                acknowledged = topic.acknowledged,
                inflight = topic.inflight,
                received = topic.received,
                failed = topic.failed,
                timed_out = topic.timed_out,
                dropped = topic.dropped,
                connection = %self.connection,
                "stats"
            );
        }
        let totals = self.totals();
        info!(
            published = totals.published,
            acknowledged = totals.acknowledged,
            inflight = self.inflight,
            max_inflight = self.max_inflight,
            buffered = self.buffered,
            buffer_capacity = self.buffer_capacity,
            received = totals.received,
            failed = totals.failed,
            dropped = totals.dropped,
            unmatched = self.counters.unmatched,
            connection = %self.connection,
            "stats totals"
        );
    }
}

#[derive(Clone)]
pub struct StatsAggregator {
    connection: ConnectionHandle,
    counters: Arc<CounterRegistry>,
    pipeline: PublishPipeline,
    interval: Duration,
}

impl StatsAggregator {
    pub fn new(
        connection: ConnectionHandle,
        counters: Arc<CounterRegistry>,
        pipeline: PublishPipeline,
        interval: Duration,
    ) -> Self {
        Self {
            connection,
            counters,
            pipeline,
            interval,
        }
    }

    /// Point-in-time read. Fields are loaded independently and may be slightly skewed.
    pub fn capture(&self) -> StatsSnapshot {
        StatsSnapshot {
            connection: self.connection.state(),
            counters: self.counters.snapshot(),
            inflight: self.pipeline.inflight(),
            max_inflight: self.pipeline.max_inflight(),
            buffered: self.pipeline.buffered(),
            buffer_capacity: self.pipeline.buffer_capacity(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                _ = interval.tick() => {}
            }
            self.capture().log();
        }
    }
}
