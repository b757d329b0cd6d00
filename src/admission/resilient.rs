use super::{AdmissionOutcome, ConnectionAdmission, LeaseRequest, LeaseTarget};
use crate::cluster::StoreError;
use crate::config::AdmissionConfig;
use crate::ops::metrics::MetricsRegistry;
use crate::time::Clock;
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// A failed unregister waiting for another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterWork {
    pub target: LeaseTarget,
    pub attempt: u32,
}

/// Bounded queue of failed unregisters. Enqueue never waits.
#[derive(Clone)]
pub struct UnregisterRetryQueue {
    tx: mpsc::Sender<UnregisterWork>,
    pending: Arc<AtomicI64>,
}

impl UnregisterRetryQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<UnregisterWork>) {
        let (tx, rx) = mpsc::channel(capacity.clamp(1, 1_000_000));
        (
            Self {
                tx,
                pending: Arc::new(AtomicI64::new(0)),
            },
            rx,
        )
    }

    pub fn try_enqueue(&self, work: UnregisterWork) -> bool {
        if self.tx.try_send(work).is_err() {
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    fn on_dequeued(&self) -> i64 {
        self.pending.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// Passes register and renew straight through. Unregister failures are
/// absorbed into the retry queue; the lease TTL bounds the damage if every
/// retry fails.
pub struct ResilientAdmission {
    inner: Arc<dyn ConnectionAdmission>,
    queue: UnregisterRetryQueue,
    metrics: Arc<MetricsRegistry>,
}

impl ResilientAdmission {
    pub fn new(
        inner: Arc<dyn ConnectionAdmission>,
        queue: UnregisterRetryQueue,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            inner,
            queue,
            metrics,
        }
    }
}

#[async_trait]
impl ConnectionAdmission for ResilientAdmission {
    async fn register(&self, request: &LeaseRequest) -> Result<AdmissionOutcome, StoreError> {
        self.inner.register(request).await
    }

    async fn renew_lease(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        heartbeat_timeout: Duration,
    ) -> Result<bool, StoreError> {
        self.inner
            .renew_lease(tenant_id, user_id, device_id, heartbeat_timeout)
            .await
    }

    async fn unregister(&self, target: &LeaseTarget) -> Result<(), StoreError> {
        let Err(err) = self.inner.unregister(target).await else {
            return Ok(());
        };
        let tenant = target.tenant_id.as_str();
        self.metrics
            .counter_inc("courier_admission_unregister_failed_total", 1, &[("tenant", tenant)]);
        tracing::warn!(
            tenant,
            user = %target.user_id,
            device = %target.device_id,
            "admission unregister failed: {err}"
        );
        let queued = self.queue.try_enqueue(UnregisterWork {
            target: target.clone(),
            attempt: 1,
        });
        if queued {
            self.metrics.gauge_set(
                "courier_admission_unregister_retry_pending",
                self.queue.pending(),
                &[],
            );
        } else {
            self.metrics.counter_inc(
                "courier_admission_unregister_retry_dropped_total",
                1,
                &[("tenant", tenant)],
            );
        }
        Ok(())
    }
}

/// Background consumer of the unregister retry queue.
pub struct AdmissionRetryWorker<C: Clock> {
    inner: Arc<dyn ConnectionAdmission>,
    queue: UnregisterRetryQueue,
    rx: mpsc::Receiver<UnregisterWork>,
    metrics: Arc<MetricsRegistry>,
    clock: C,
    max_attempts: u32,
    backoff_base: Duration,
}

impl<C: Clock> AdmissionRetryWorker<C> {
    pub fn new(
        inner: Arc<dyn ConnectionAdmission>,
        queue: UnregisterRetryQueue,
        rx: mpsc::Receiver<UnregisterWork>,
        metrics: Arc<MetricsRegistry>,
        clock: C,
        cfg: &AdmissionConfig,
    ) -> Self {
        Self {
            inner,
            queue,
            rx,
            metrics,
            clock,
            max_attempts: cfg.retry_max_attempts.clamp(1, 10),
            backoff_base: Duration::from_millis(cfg.retry_backoff_base_ms),
        }
    }

    /// `base * 2^(attempt-1)` capped at 5 s, plus `now_ms % 17` ms of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        let delay = (self.backoff_base * factor).min(MAX_BACKOFF);
        let jitter = self.clock.unix_millis().rem_euclid(17) as u64;
        delay + Duration::from_millis(jitter)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                work = self.rx.recv() => {
                    let Some(work) = work else { break };
                    let pending = self.queue.on_dequeued();
                    self.metrics
                        .gauge_set("courier_admission_unregister_retry_pending", pending, &[]);
                    if !self.process(work, &mut shutdown).await {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Retry one item to completion. Returns false if shutdown interrupted it.
    async fn process(&self, work: UnregisterWork, shutdown: &mut watch::Receiver<bool>) -> bool {
        let target = &work.target;
        let tenant = target.tenant_id.as_str();
        let mut attempt = work.attempt.max(1);
        loop {
            match self.inner.unregister(target).await {
                Ok(()) => {
                    self.metrics.counter_inc(
                        "courier_admission_unregister_retry_ok_total",
                        1,
                        &[("tenant", tenant)],
                    );
                    return true;
                }
                Err(err) => {
                    self.metrics.counter_inc(
                        "courier_admission_unregister_retry_failed_total",
                        1,
                        &[("tenant", tenant)],
                    );
                    tracing::warn!(
                        tenant,
                        user = %target.user_id,
                        device = %target.device_id,
                        attempt,
                        "admission unregister retry failed: {err}"
                    );
                    if attempt >= self.max_attempts {
                        self.metrics.counter_inc(
                            "courier_admission_unregister_retry_giveup_total",
                            1,
                            &[("tenant", tenant)],
                        );
                        return true;
                    }
                }
            }
            let delay = self.backoff(attempt);
            attempt += 1;
            tokio::select! {
                _ = self.clock.sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}
