// Exponential reconnect backoff with a hard cap.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

/// Delay generator: `base, 2·base, 4·base, …` clamped at `max`.
///
/// ```
/// use link_client::client::backoff::{Backoff, BackoffPolicy};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(BackoffPolicy {
///     base: Duration::from_secs(1),
///     max: Duration::from_secs(5),
/// });
/// let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
/// assert_eq!(delays, vec![1, 2, 4, 5, 5]);
///
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.base.min(policy.max);
        Self { policy, current }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.base.min(self.policy.max);
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(base_ms: u64, max_ms: u64) -> Backoff {
        Backoff::new(BackoffPolicy {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        })
    }

    #[test]
    fn doubles_until_cap() {
        let mut backoff = backoff(1_000, 10_000);
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000, 10_000]);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = backoff(250, 10_000);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn base_above_cap_is_clamped() {
        let mut backoff = backoff(20_000, 10_000);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10_000));
    }

    #[test]
    fn huge_cap_does_not_overflow() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::MAX / 2 + Duration::from_secs(1),
            max: Duration::MAX,
        });
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }
}
