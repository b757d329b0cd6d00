//! Distributed key-value capability backing leases, routes and node liveness.
//!
//! The gateway only needs TTL'd keys, prefix listing and one conditional
//! write used for capacity-checked admission. `InMemoryStore` serves
//! single-node deployments and tests; clustered backends plug in behind
//! the same trait.

use crate::time::Clock;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MEMORY_STORE: &str = "memory://";

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store codec error for {key}: {message}")]
    Codec { key: String, message: String },
}

/// Bound on the number of live keys under `prefix`. A limit of zero is unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityGuard {
    pub prefix: String,
    pub limit: u32,
}

impl CapacityGuard {
    pub fn new(prefix: impl Into<String>, limit: u32) -> Self {
        Self {
            prefix: prefix.into(),
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardedWrite {
    Written { replaced: bool },
    Rejected { prefix: String, live: u32, limit: u32 },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write `value` under `key`, expiring after `ttl` (zero never expires).
    async fn register(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write only if every guard's live count, excluding `key`, is below its limit.
    async fn register_guarded(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        guards: &[CapacityGuard],
    ) -> Result<GuardedWrite, StoreError>;

    /// Extend the TTL of a live key. Returns false when the key is gone.
    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete only when the stored value equals `expected`.
    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Live entries whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Add one to the counter at `key` and return the new value. A missing
    /// or expired counter starts at one and expires after `ttl`.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: Option<i64>,
}

impl StoredValue {
    fn live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

/// Process-local store with clock-driven expiry.
pub struct InMemoryStore<C: Clock> {
    clock: C,
    entries: Mutex<BTreeMap<String, StoredValue>>,
    unavailable: AtomicBool,
}

impl<C: Clock> InMemoryStore<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            entries: Mutex::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = self.clock.unix_millis();
        self.entries.lock().values().filter(|v| v.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Duration) -> Option<i64> {
        if ttl.is_zero() {
            None
        } else {
            Some(self.clock.unix_millis() + ttl.as_millis() as i64)
        }
    }

    fn live_under(entries: &BTreeMap<String, StoredValue>, prefix: &str, now_ms: i64) -> usize {
        entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.live(now_ms))
            .count()
    }
}

#[async_trait]
impl<C: Clock> KvStore for InMemoryStore<C> {
    async fn register(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        let stored = StoredValue {
            value: value.to_string(),
            expires_at_ms: self.expiry(ttl),
        };
        self.entries.lock().insert(key.to_string(), stored);
        Ok(())
    }

    async fn register_guarded(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        guards: &[CapacityGuard],
    ) -> Result<GuardedWrite, StoreError> {
        self.check()?;
        let now = self.clock.unix_millis();
        let expires_at_ms = self.expiry(ttl);
        let mut entries = self.entries.lock();
        let replaced = entries.get(key).is_some_and(|v| v.live(now));
        for guard in guards {
            if guard.limit == 0 {
                continue;
            }
            let mut live = Self::live_under(&entries, &guard.prefix, now);
            if replaced && key.starts_with(&guard.prefix) {
                live -= 1;
            }
            if live >= guard.limit as usize {
                return Ok(GuardedWrite::Rejected {
                    prefix: guard.prefix.clone(),
                    live: live as u32,
                    limit: guard.limit,
                });
            }
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(GuardedWrite::Written { replaced })
    }

    async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.unix_millis();
        let expires_at_ms = self.expiry(ttl);
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => {
                entry.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = self.clock.unix_millis();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|v| v.live(now))
            .map(|v| v.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.unix_millis();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|v| v.live(now)))
    }

    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = self.clock.unix_millis();
        let mut entries = self.entries.lock();
        let matches = entries
            .get(key)
            .is_some_and(|v| v.live(now) && v.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.check()?;
        let now = self.clock.unix_millis();
        let mut entries = self.entries.lock();
        let mut expired = Vec::new();
        let mut out = Vec::new();
        for (key, value) in entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            if value.live(now) {
                out.push((key.clone(), value.value.clone()));
            } else {
                expired.push(key.clone());
            }
        }
        for key in expired {
            entries.remove(&key);
        }
        Ok(out)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.check()?;
        let now = self.clock.unix_millis();
        let fresh_expiry = self.expiry(ttl);
        let mut entries = self.entries.lock();
        let (current, expires_at_ms) = match entries.get(key) {
            Some(entry) if entry.live(now) => {
                let current = entry.value.parse::<u64>().map_err(|err| StoreError::Codec {
                    key: key.to_string(),
                    message: err.to_string(),
                })?;
                (current, entry.expires_at_ms)
            }
            _ => (0, fresh_expiry),
        };
        let next = current.saturating_add(1);
        entries.insert(
            key.to_string(),
            StoredValue {
                value: next.to_string(),
                expires_at_ms,
            },
        );
        Ok(next)
    }
}

/// Open the store named by a connection string.
pub fn open_store<C: Clock>(connection_string: &str, clock: C) -> Result<Arc<dyn KvStore>> {
    let conn = connection_string.trim();
    if conn.is_empty() {
        bail!("store connection string is required");
    }
    if conn == MEMORY_STORE {
        return Ok(Arc::new(InMemoryStore::new(clock)));
    }
    bail!("unsupported store connection string {conn}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    #[tokio::test]
    async fn entries_expire_with_clock() {
        let clock = ManualClock::new();
        let store = InMemoryStore::new(clock.clone());
        store
            .register("node/a", "x", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("node/a").await.unwrap().as_deref(), Some("x"));
        clock.advance(Duration::from_secs(5));
        assert!(store.renew("node/a", Duration::from_secs(10)).await.unwrap());
        clock.advance(Duration::from_secs(9));
        assert!(store.get("node/a").await.unwrap().is_some());
        clock.advance(Duration::from_secs(2));
        assert!(store.get("node/a").await.unwrap().is_none());
        assert!(!store.renew("node/a", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn guarded_write_counts_live_keys_only() {
        let clock = ManualClock::new();
        let store = InMemoryStore::new(clock.clone());
        let guards = [CapacityGuard::new("lease/t/", 2)];
        let ttl = Duration::from_secs(30);
        assert_eq!(
            store
                .register_guarded("lease/t/u1/d1", "a", ttl, &guards)
                .await
                .unwrap(),
            GuardedWrite::Written { replaced: false }
        );
        store
            .register_guarded("lease/t/u2/d1", "b", ttl, &guards)
            .await
            .unwrap();
        let rejected = store
            .register_guarded("lease/t/u3/d1", "c", ttl, &guards)
            .await
            .unwrap();
        assert!(matches!(rejected, GuardedWrite::Rejected { live: 2, .. }));
        // Rewriting an existing key does not count against the cap.
        assert_eq!(
            store
                .register_guarded("lease/t/u1/d1", "a2", ttl, &guards)
                .await
                .unwrap(),
            GuardedWrite::Written { replaced: true }
        );
        clock.advance(Duration::from_secs(31));
        assert_eq!(
            store
                .register_guarded("lease/t/u3/d1", "c", ttl, &guards)
                .await
                .unwrap(),
            GuardedWrite::Written { replaced: false }
        );
    }

    #[tokio::test]
    async fn delete_if_requires_matching_value() {
        let store = InMemoryStore::new(ManualClock::new());
        store.register("k", "v1", Duration::ZERO).await.unwrap();
        assert!(!store.delete_if("k", "v2").await.unwrap());
        assert!(store.delete_if("k", "v1").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let store = InMemoryStore::new(ManualClock::new());
        store.register("route/t/u/d1", "1", Duration::ZERO).await.unwrap();
        store.register("route/t/u/d2", "2", Duration::ZERO).await.unwrap();
        store.register("route/t/v/d1", "3", Duration::ZERO).await.unwrap();
        let listed = store.list("route/t/u/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "route/t/u/d1");
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryStore::new(ManualClock::new());
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[test]
    fn open_store_rejects_missing_connection_string() {
        assert!(open_store("", ManualClock::new()).is_err());
        assert!(open_store("etcd://x", ManualClock::new()).is_err());
        assert!(open_store("memory://", ManualClock::new()).is_ok());
    }

    #[tokio::test]
    async fn counters_start_fresh_after_expiry() {
        let clock = ManualClock::new();
        let store = InMemoryStore::new(clock.clone());
        let ttl = Duration::from_secs(2);
        assert_eq!(store.increment("rl/t/1", ttl).await.unwrap(), 1);
        assert_eq!(store.increment("rl/t/1", ttl).await.unwrap(), 2);
        clock.advance(Duration::from_secs(1));
        // Later increments keep the first expiry.
        assert_eq!(store.increment("rl/t/1", ttl).await.unwrap(), 3);
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.increment("rl/t/1", ttl).await.unwrap(), 1);

        store.register("rl/t/2", "nope", ttl).await.unwrap();
        assert!(matches!(
            store.increment("rl/t/2", ttl).await,
            Err(StoreError::Codec { .. })
        ));
    }
}
