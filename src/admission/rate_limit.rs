//! Cluster-wide per-tenant message rate limit.
//!
//! Fixed one-second windows: every node increments the same store counter
//! `ratelimit/msg/{tenant}/{unix_second}`, so the limit holds across the
//! cluster. Counters outlive their window by one second and then expire.

use crate::cluster::{KvStore, StoreError};
use crate::time::Clock;
use std::sync::Arc;
use std::time::Duration;

const WINDOW_KEY_TTL: Duration = Duration::from_secs(2);

pub fn message_window_key(tenant_id: &str, unix_second: i64) -> String {
    format!("ratelimit/msg/{tenant_id}/{unix_second}")
}

pub struct MessageRateLimiter<C: Clock> {
    store: Arc<dyn KvStore>,
    clock: C,
}

impl<C: Clock> MessageRateLimiter<C> {
    pub fn new(store: Arc<dyn KvStore>, clock: C) -> Self {
        Self { store, clock }
    }

    /// Take one message from the tenant's current window. A limit of zero
    /// or below is unlimited and never touches the store.
    pub async fn try_consume(&self, tenant_id: &str, max_qps: i64) -> Result<bool, StoreError> {
        if max_qps <= 0 {
            return Ok(true);
        }
        let second = self.clock.unix_millis().div_euclid(1000);
        let used = self
            .store
            .increment(&message_window_key(tenant_id, second), WINDOW_KEY_TTL)
            .await?;
        Ok(used <= max_qps as u64)
    }
}
