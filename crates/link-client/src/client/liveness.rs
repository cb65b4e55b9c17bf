// Level-to-edge liveness reporting on top of the connection state.
use crate::client::connection::ConnectionHandle;
use crate::client::shutdown_signalled;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    Dead,
    Alive,
}

/// Emits an event only when the observed level differs from the previous one.
///
/// ```
/// use link_client::client::liveness::{LivenessDetector, LivenessEvent};
///
/// let mut detector = LivenessDetector::starting_at(true);
/// assert_eq!(detector.observe(true), None);
/// assert_eq!(detector.observe(false), Some(LivenessEvent::Dead));
/// assert_eq!(detector.observe(false), None);
/// assert_eq!(detector.observe(true), Some(LivenessEvent::Alive));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LivenessDetector {
    last: bool,
}

impl LivenessDetector {
    pub fn starting_at(alive: bool) -> Self {
        Self { last: alive }
    }

    pub fn observe(&mut self, alive: bool) -> Option<LivenessEvent> {
        if alive == self.last {
            return None;
        }
        self.last = alive;
        Some(if alive {
            LivenessEvent::Alive
        } else {
            LivenessEvent::Dead
        })
    }
}

pub struct LivenessMonitor {
    connection: ConnectionHandle,
    poll_interval: Duration,
    events: broadcast::Sender<LivenessEvent>,
}

impl LivenessMonitor {
    /// `events` is shared so observers can subscribe after the monitor is spawned.
    pub fn new(
        connection: ConnectionHandle,
        poll_interval: Duration,
        events: broadcast::Sender<LivenessEvent>,
    ) -> Self {
        Self {
            connection,
            poll_interval,
            events,
        }
    }

    /// Poll until shutdown. The reference level is whatever holds when this starts.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut detector = LivenessDetector::starting_at(self.connection.is_connected());
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and would only re-read the seed.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,
                _ = interval.tick() => {}
            }
            let Some(event) = detector.observe(self.connection.is_connected()) else {
                continue;
            };
            match event {
                LivenessEvent::Dead => {
                    warn!(state = %self.connection.state(), "connection dead (lost connectivity)")
                }
                LivenessEvent::Alive => info!("connection alive (reconnected)"),
            }
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_alive_emits_nothing() {
        let mut detector = LivenessDetector::starting_at(true);
        assert!((0..100).all(|_| detector.observe(true).is_none()));
    }

    #[test]
    fn flapping_emits_one_event_per_edge() {
        let mut detector = LivenessDetector::starting_at(false);
        let events: Vec<_> = [false, true, true, false, false, true]
            .into_iter()
            .filter_map(|alive| detector.observe(alive))
            .collect();
        assert_eq!(
            events,
            vec![LivenessEvent::Alive, LivenessEvent::Dead, LivenessEvent::Alive]
        );
    }
}
