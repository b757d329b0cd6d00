use super::policy::AcquirePolicy;
use super::HookOperation;
use crate::ops::metrics::MetricsRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct LimiterEntry {
    max: u32,
    semaphore: Arc<Semaphore>,
}

/// Bounds in-flight hook calls per (tenant, operation).
///
/// When a tenant's limit changes the entry is replaced; permits held on the
/// old semaphore drain back to it and are not counted against the new one.
pub struct HookConcurrencyLimiter {
    entries: DashMap<(String, HookOperation), LimiterEntry>,
    metrics: Arc<MetricsRegistry>,
}

impl HookConcurrencyLimiter {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            entries: DashMap::new(),
            metrics,
        }
    }

    fn semaphore(&self, tenant_id: &str, op: HookOperation, max: u32) -> Arc<Semaphore> {
        let key = (tenant_id.to_string(), op);
        let mut entry = self.entries.entry(key).or_insert_with(|| LimiterEntry {
            max,
            semaphore: Arc::new(Semaphore::new(max as usize)),
        });
        if entry.max != max {
            *entry = LimiterEntry {
                max,
                semaphore: Arc::new(Semaphore::new(max as usize)),
            };
        }
        entry.semaphore.clone()
    }

    /// Wait up to the queue timeout for a slot; `None` when the wait expired.
    pub async fn acquire(
        &self,
        tenant_id: &str,
        op: HookOperation,
        policy: AcquirePolicy,
    ) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(tenant_id, op, policy.max_concurrency.max(1));
        let permit = if policy.queue_timeout.is_zero() {
            semaphore.try_acquire_owned().ok()
        } else {
            tokio::time::timeout(policy.queue_timeout, semaphore.acquire_owned())
                .await
                .ok()
                .and_then(Result::ok)
        };
        if permit.is_none() {
            self.metrics.counter_inc(
                "courier_hook_limiter_rejected_total",
                1,
                &[("tenant", tenant_id), ("op", op.label()), ("reason", "queue_timeout")],
            );
        }
        permit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(max: u32, wait_ms: u64) -> AcquirePolicy {
        AcquirePolicy {
            max_concurrency: max,
            queue_timeout: Duration::from_millis(wait_ms),
        }
    }

    #[tokio::test]
    async fn rejects_after_queue_timeout() {
        let metrics = Arc::new(MetricsRegistry::new());
        let limiter = HookConcurrencyLimiter::new(metrics.clone());
        let held = limiter.acquire("t", HookOperation::Auth, policy(1, 5)).await;
        assert!(held.is_some());
        assert!(limiter.acquire("t", HookOperation::Auth, policy(1, 5)).await.is_none());
        assert!(limiter.acquire("t", HookOperation::Auth, policy(1, 0)).await.is_none());
        // Other operations and tenants have their own budget.
        assert!(limiter.acquire("t", HookOperation::CheckMessage, policy(1, 0)).await.is_some());
        assert!(limiter.acquire("u", HookOperation::Auth, policy(1, 0)).await.is_some());
        assert_eq!(metrics.counter_total("courier_hook_limiter_rejected_total"), 2);

        drop(held);
        assert!(limiter.acquire("t", HookOperation::Auth, policy(1, 0)).await.is_some());
    }

    #[tokio::test]
    async fn waiter_gets_released_slot() {
        let limiter = Arc::new(HookConcurrencyLimiter::new(Arc::new(MetricsRegistry::new())));
        let held = limiter.acquire("t", HookOperation::Auth, policy(1, 0)).await;
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .acquire("t", HookOperation::Auth, policy(1, 2_000))
                    .await
                    .is_some()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn limit_change_takes_effect() {
        let limiter = HookConcurrencyLimiter::new(Arc::new(MetricsRegistry::new()));
        let _a = limiter.acquire("t", HookOperation::Auth, policy(1, 0)).await;
        assert!(limiter.acquire("t", HookOperation::Auth, policy(1, 0)).await.is_none());
        let _b = limiter.acquire("t", HookOperation::Auth, policy(2, 0)).await;
        assert!(_b.is_some());
        let _c = limiter.acquire("t", HookOperation::Auth, policy(2, 0)).await;
        assert!(_c.is_some());
        assert!(limiter.acquire("t", HookOperation::Auth, policy(2, 0)).await.is_none());
    }
}
