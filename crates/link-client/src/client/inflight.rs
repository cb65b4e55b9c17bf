// Messages handed to the transport and still waiting for their delivery verdict.
use link_transport::TokenId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub topic: Arc<str>,
    pub seq: u64,
    pub sent_at: Instant,
}

/// Admission slot reserved before a hand-off. Dropping it unused returns the slot.
#[derive(Debug)]
pub struct InflightPermit(OwnedSemaphorePermit);

/// Bounded set keyed by delivery token. Each entry holds one semaphore permit, so the
/// set can never grow past `capacity`.
#[derive(Debug)]
pub struct InflightSet {
    capacity: usize,
    permits: Arc<Semaphore>,
    entries: Mutex<HashMap<TokenId, (InflightEntry, InflightPermit)>>,
}

impl InflightSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Reserve a slot without waiting. `None` means the set is saturated.
    pub fn try_reserve(&self) -> Option<InflightPermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(InflightPermit)
    }

    pub fn insert(&self, token: TokenId, entry: InflightEntry, permit: InflightPermit) {
        let len = {
            let mut entries = self.entries.lock();
            entries.insert(token, (entry, permit));
            entries.len()
        };
        metrics::gauge!("link_inflight").set(len as f64);
    }

    /// Remove on ack, timeout or failure; the slot is released with the entry.
    pub fn remove(&self, token: TokenId) -> Option<InflightEntry> {
        let (removed, len) = {
            let mut entries = self.entries.lock();
            let removed = entries.remove(&token);
            (removed, entries.len())
        };
        metrics::gauge!("link_inflight").set(len as f64);
        removed.map(|(entry, _permit)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64) -> InflightEntry {
        InflightEntry {
            topic: Arc::from("/t"),
            seq,
            sent_at: Instant::now(),
        }
    }

    #[test]
    fn admission_is_bounded() {
        let set = InflightSet::new(2);
        let first = set.try_reserve().expect("slot 1");
        let second = set.try_reserve().expect("slot 2");
        assert!(set.try_reserve().is_none());

        set.insert(TokenId(1), entry(1), first);
        set.insert(TokenId(2), entry(2), second);
        assert_eq!(set.len(), 2);

        let removed = set.remove(TokenId(1)).expect("entry");
        assert_eq!(removed.seq, 1);
        assert!(set.try_reserve().is_some());
    }

    #[test]
    fn unused_permit_returns_slot() {
        let set = InflightSet::new(1);
        let permit = set.try_reserve().expect("slot");
        drop(permit);
        assert!(set.try_reserve().is_some());
        assert!(set.is_empty());
    }

    #[test]
    fn removing_unknown_token_is_harmless() {
        let set = InflightSet::new(1);
        assert!(set.remove(TokenId(42)).is_none());
        assert_eq!(set.capacity(), 1);
    }
}
