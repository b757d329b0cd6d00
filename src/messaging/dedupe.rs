use crate::time::Clock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(600);

/// Sweep the whole table every this many marks.
const SWEEP_EVERY: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupeKey {
    tenant_id: String,
    msg_id: String,
}

/// Recently accepted message ids, scoped by tenant.
///
/// Only guards against client resubmits arriving at this node; ids seen by
/// other nodes are not visible here.
pub struct MessageDeduplicator<C: Clock> {
    clock: C,
    ttl: Duration,
    entries: DashMap<DedupeKey, i64>,
    marks: AtomicU64,
}

impl<C: Clock> MessageDeduplicator<C> {
    pub fn new(clock: C, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_DEDUPE_TTL } else { ttl };
        Self {
            clock,
            ttl,
            entries: DashMap::new(),
            marks: AtomicU64::new(0),
        }
    }

    /// Record `msg_id`. Returns false when it was already recorded and unexpired.
    pub fn try_mark(&self, tenant_id: &str, msg_id: &str) -> bool {
        if msg_id.is_empty() {
            return true;
        }
        let now = self.clock.unix_millis();
        let expires_at = now + self.ttl.as_millis() as i64;
        let key = DedupeKey {
            tenant_id: tenant_id.to_string(),
            msg_id: msg_id.to_string(),
        };
        let fresh = {
            let mut entry = self.entries.entry(key).or_insert(i64::MIN);
            if *entry > now {
                false
            } else {
                *entry = expires_at;
                true
            }
        };
        let marks = self
            .marks
            .fetch_add(1, Ordering::Relaxed);
        if marks % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.evict_expired();
        }
        fresh
    }

    /// Forget an id so a retry after a failed delivery is not rejected.
    pub fn forget(&self, tenant_id: &str, msg_id: &str) {
        self.entries.remove(&DedupeKey {
            tenant_id: tenant_id.to_string(),
            msg_id: msg_id.to_string(),
        });
    }

    pub fn evict_expired(&self) {
        let now = self.clock.unix_millis();
        self.entries.retain(|_, expires_at| *expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    #[test]
    fn duplicate_within_ttl_is_rejected() {
        let clock = ManualClock::new();
        let dedupe = MessageDeduplicator::new(clock.clone(), Duration::from_secs(10));
        assert!(dedupe.try_mark("t", "m1"));
        assert!(!dedupe.try_mark("t", "m1"));
        assert!(dedupe.try_mark("other", "m1"));
        clock.advance(Duration::from_secs(11));
        assert!(dedupe.try_mark("t", "m1"));
    }

    #[test]
    fn empty_ids_and_forgotten_ids_pass() {
        let dedupe = MessageDeduplicator::new(ManualClock::new(), Duration::ZERO);
        assert!(dedupe.try_mark("t", ""));
        assert!(dedupe.try_mark("t", ""));
        assert!(dedupe.try_mark("t", "m"));
        dedupe.forget("t", "m");
        assert!(dedupe.try_mark("t", "m"));
    }

    #[test]
    fn eviction_drops_only_expired() {
        let clock = ManualClock::new();
        let dedupe = MessageDeduplicator::new(clock.clone(), Duration::from_secs(5));
        dedupe.try_mark("t", "old");
        clock.advance(Duration::from_secs(3));
        dedupe.try_mark("t", "new");
        clock.advance(Duration::from_secs(3));
        dedupe.evict_expired();
        assert_eq!(dedupe.len(), 1);
        assert!(!dedupe.try_mark("t", "new"));
    }
}
