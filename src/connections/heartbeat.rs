use super::registry::ConnectionRegistry;
use super::session::ConnectionSession;
use crate::admission::{ConnectionAdmission, LeaseTarget};
use crate::config::HeartbeatConfig;
use crate::messaging::CloseCode;
use crate::ops::metrics::MetricsRegistry;
use crate::time::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const MIN_BATCH: usize = 1024;
/// A full pass over the snapshot should take about this many ticks.
const TARGET_FULL_SWEEP_TICKS: usize = 5;
const MIN_RENEW_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub visited: usize,
    pub renewed: usize,
    pub renew_failed: usize,
    pub timed_out: usize,
    /// Lease already gone at renewal; the session was closed.
    pub lease_lost: usize,
    /// Closed sessions whose close never reached the connection task.
    pub reaped: usize,
}

/// Walks a periodically refreshed registry snapshot a batch per tick,
/// renewing leases and closing sessions that stopped sending frames.
pub struct HeartbeatSweeper<C: Clock> {
    node_id: String,
    registry: Arc<ConnectionRegistry>,
    admission: Arc<dyn ConnectionAdmission>,
    metrics: Arc<MetricsRegistry>,
    clock: C,
    default_timeout: Duration,
    tick: Duration,
    snapshot_refresh_ms: i64,
    snapshot: Vec<Arc<ConnectionSession>>,
    snapshot_at_ms: Option<i64>,
    cursor: usize,
}

impl<C: Clock> HeartbeatSweeper<C> {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        admission: Arc<dyn ConnectionAdmission>,
        metrics: Arc<MetricsRegistry>,
        clock: C,
        cfg: &HeartbeatConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            registry,
            admission,
            metrics,
            clock,
            default_timeout: Duration::from_secs(u64::from(cfg.default_timeout_seconds.max(1))),
            tick: Duration::from_millis(cfg.tick_ms.max(10)),
            snapshot_refresh_ms: cfg.snapshot_refresh_ms as i64,
            snapshot: Vec::new(),
            snapshot_at_ms: None,
            cursor: 0,
        }
    }

    fn batch_size(len: usize) -> usize {
        len.min(MIN_BATCH.max(len.div_ceil(TARGET_FULL_SWEEP_TICKS)))
    }

    pub async fn sweep_tick(&mut self) -> SweepStats {
        let now = self.clock.unix_millis();
        let stale = self
            .snapshot_at_ms
            .map_or(true, |at| now - at >= self.snapshot_refresh_ms);
        if stale {
            self.registry.copy_all_sessions(&mut self.snapshot);
            self.snapshot_at_ms = Some(now);
            if self.cursor >= self.snapshot.len() {
                self.cursor = 0;
            }
        }
        let mut stats = SweepStats::default();
        let batch = Self::batch_size(self.snapshot.len());
        for _ in 0..batch {
            if self.cursor >= self.snapshot.len() {
                self.cursor = 0;
            }
            let session = self.snapshot[self.cursor].clone();
            self.cursor += 1;
            self.process(&session, now, &mut stats).await;
        }
        stats
    }

    /// Visit every registered session once, ignoring batching.
    pub async fn sweep_all(&mut self) -> SweepStats {
        let now = self.clock.unix_millis();
        let mut sessions = Vec::new();
        self.registry.copy_all_sessions(&mut sessions);
        let mut stats = SweepStats::default();
        for session in &sessions {
            self.process(session, now, &mut stats).await;
        }
        stats
    }

    async fn process(&self, session: &ConnectionSession, now: i64, stats: &mut SweepStats) {
        stats.visited += 1;
        if !session.socket.is_open() {
            if session.socket.close_lost() {
                self.reap(session, stats).await;
            }
            return;
        }
        let timeout = session.heartbeat_timeout(self.default_timeout);
        let timeout_ms = timeout.as_millis() as i64;
        let tenant = session.tenant_id.as_str();
        if now - session.last_seen_ms() <= timeout_ms {
            let renew_every = MIN_RENEW_INTERVAL_MS.max(timeout_ms / 2);
            if now - session.last_lease_renew_ms() < renew_every {
                return;
            }
            match self
                .admission
                .renew_lease(tenant, &session.user_id, &session.device_id, timeout)
                .await
            {
                Ok(true) => {
                    session.mark_lease_renewed(now);
                    stats.renewed += 1;
                }
                Ok(false) => {
                    // Expired while the session was live; make the client
                    // reconnect so admission runs again.
                    stats.lease_lost += 1;
                    self.metrics
                        .counter_inc("courier_lease_lost_total", 1, &[("tenant", tenant)]);
                    tracing::warn!(
                        tenant,
                        user = %session.user_id,
                        device = %session.device_id,
                        "lease expired under live session"
                    );
                    session
                        .socket
                        .close(CloseCode::HeartbeatTimeout, "lease expired");
                }
                Err(err) => {
                    stats.renew_failed += 1;
                    self.metrics
                        .counter_inc("courier_lease_renew_failed_total", 1, &[("tenant", tenant)]);
                    tracing::debug!(tenant, user = %session.user_id, "lease renew failed: {err}");
                }
            }
            return;
        }
        stats.timed_out += 1;
        self.metrics
            .counter_inc("courier_heartbeat_timeouts_total", 1, &[("tenant", tenant)]);
        tracing::warn!(
            tenant,
            user = %session.user_id,
            device = %session.device_id,
            "heartbeat timeout"
        );
        session
            .socket
            .close(CloseCode::HeartbeatTimeout, "heartbeat timeout");
    }

    async fn reap(&self, session: &ConnectionSession, stats: &mut SweepStats) {
        if !self.registry.try_remove_session(session) {
            return;
        }
        stats.reaped += 1;
        let tenant = session.tenant_id.as_str();
        self.metrics
            .counter_inc("courier_sessions_reaped_total", 1, &[("tenant", tenant)]);
        let target = LeaseTarget {
            tenant_id: session.tenant_id.clone(),
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            node_id: self.node_id.clone(),
            connection_id: session.connection_id.clone(),
        };
        if let Err(err) = self.admission.unregister(&target).await {
            tracing::warn!(tenant, user = %session.user_id, "reaped session unregister failed: {err}");
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.sweep_tick().await;
                    if stats.timed_out > 0 {
                        tracing::debug!(timed_out = stats.timed_out, "heartbeat sweep closed sessions");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionOutcome, LeaseRequest};
    use crate::cluster::StoreError;
    use crate::connections::session::{Outbound, SessionSocket};
    use crate::hook::TenantRuntimeConfig;
    use crate::time::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAdmission {
        renewals: AtomicUsize,
        fail: AtomicBool,
        lease_gone: AtomicBool,
        unregistered: parking_lot::Mutex<Vec<LeaseTarget>>,
    }

    #[async_trait]
    impl ConnectionAdmission for CountingAdmission {
        async fn register(&self, _request: &LeaseRequest) -> Result<AdmissionOutcome, StoreError> {
            Ok(AdmissionOutcome::AllowedNew)
        }

        async fn renew_lease(
            &self,
            _tenant_id: &str,
            _user_id: &str,
            _device_id: &str,
            _heartbeat_timeout: Duration,
        ) -> Result<bool, StoreError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("down".into()));
            }
            Ok(!self.lease_gone.load(Ordering::SeqCst))
        }

        async fn unregister(&self, target: &LeaseTarget) -> Result<(), StoreError> {
            self.unregistered.lock().push(target.clone());
            Ok(())
        }
    }

    fn cfg() -> HeartbeatConfig {
        HeartbeatConfig {
            tick_ms: 1000,
            default_timeout_seconds: 30,
            snapshot_refresh_ms: 5000,
        }
    }

    fn tenant(timeout_seconds: u64) -> Arc<TenantRuntimeConfig> {
        Arc::new(TenantRuntimeConfig {
            heartbeat_timeout_seconds: timeout_seconds,
            ..TenantRuntimeConfig::default()
        })
    }

    #[tokio::test]
    async fn stale_session_is_closed_with_timeout_code() {
        let clock = ManualClock::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (socket, mut rx) = SessionSocket::channel(4);
        let session = Arc::new(ConnectionSession::new(
            "t",
            "u",
            "d",
            socket,
            tenant(10),
            clock.unix_millis(),
        ));
        registry.try_add(session.clone());
        let admission = Arc::new(CountingAdmission::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let mut sweeper =
            HeartbeatSweeper::new(
            "n1",
            registry,
            admission,
            metrics.clone(),
            clock.clone(),
            &cfg(),
        );
        clock.advance(Duration::from_secs(11));
        let stats = sweeper.sweep_all().await;
        assert_eq!(stats.timed_out, 1);
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: 4100,
                reason: "heartbeat timeout".into()
            })
        );
        assert_eq!(metrics.counter_total("courier_heartbeat_timeouts_total"), 1);
    }

    #[tokio::test]
    async fn renewal_waits_for_half_timeout_and_failures_keep_session() {
        let clock = ManualClock::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (socket, _rx) = SessionSocket::channel(4);
        let session = Arc::new(ConnectionSession::new(
            "t",
            "u",
            "d",
            socket,
            tenant(10),
            clock.unix_millis(),
        ));
        registry.try_add(session.clone());
        let admission = Arc::new(CountingAdmission::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let mut sweeper = HeartbeatSweeper::new(
            "n1",
            registry,
            admission.clone(),
            metrics.clone(),
            clock.clone(),
            &cfg(),
        );

        clock.advance(Duration::from_secs(4));
        session.touch(clock.unix_millis());
        assert_eq!(sweeper.sweep_all().await.renewed, 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(sweeper.sweep_all().await.renewed, 1);
        assert_eq!(session.last_lease_renew_ms(), clock.unix_millis());

        admission.fail.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(5));
        session.touch(clock.unix_millis());
        let stats = sweeper.sweep_all().await;
        assert_eq!(stats.renew_failed, 1);
        assert!(session.socket.is_open());
        assert_eq!(metrics.counter_total("courier_lease_renew_failed_total"), 1);
    }

    #[tokio::test]
    async fn lost_lease_closes_the_session() {
        let clock = ManualClock::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (socket, mut rx) = SessionSocket::channel(4);
        let session = Arc::new(ConnectionSession::new(
            "t",
            "u",
            "d",
            socket,
            tenant(10),
            clock.unix_millis(),
        ));
        registry.try_add(session.clone());
        let admission = Arc::new(CountingAdmission::default());
        admission.lease_gone.store(true, Ordering::SeqCst);
        let metrics = Arc::new(MetricsRegistry::new());
        let mut sweeper = HeartbeatSweeper::new(
            "n1",
            registry,
            admission,
            metrics.clone(),
            clock.clone(),
            &cfg(),
        );
        clock.advance(Duration::from_secs(6));
        session.touch(clock.unix_millis());
        let stats = sweeper.sweep_all().await;
        assert_eq!(stats.lease_lost, 1);
        assert_eq!(stats.renewed, 0);
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: 4100,
                reason: "lease expired".into()
            })
        );
        assert_eq!(metrics.counter_total("courier_lease_lost_total"), 1);
    }

    #[tokio::test]
    async fn session_whose_close_was_dropped_is_reaped() {
        let clock = ManualClock::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (socket, _rx) = SessionSocket::channel(1);
        let session = Arc::new(ConnectionSession::new(
            "t",
            "u",
            "d",
            socket,
            tenant(10),
            clock.unix_millis(),
        ));
        registry.try_add(session.clone());
        // The client stopped reading: the outbound queue is full.
        assert!(session.socket.try_send_frame(bytes::Bytes::from_static(b"x")));
        let admission = Arc::new(CountingAdmission::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let mut sweeper = HeartbeatSweeper::new(
            "n1",
            registry.clone(),
            admission.clone(),
            metrics.clone(),
            clock.clone(),
            &cfg(),
        );
        clock.advance(Duration::from_secs(11));
        assert_eq!(sweeper.sweep_all().await.timed_out, 1);
        assert!(session.socket.close_lost());
        assert_eq!(registry.len(), 1);

        let stats = sweeper.sweep_all().await;
        assert_eq!(stats.reaped, 1);
        assert!(registry.is_empty());
        let unregistered = admission.unregistered.lock().clone();
        assert_eq!(unregistered.len(), 1);
        assert_eq!(unregistered[0].node_id, "n1");
        assert_eq!(unregistered[0].connection_id, session.connection_id);
        assert_eq!(metrics.counter_total("courier_sessions_reaped_total"), 1);

        // Nothing left to reap on the next pass.
        assert_eq!(sweeper.sweep_all().await.reaped, 0);
    }

    #[test]
    fn batch_spreads_large_snapshots() {
        assert_eq!(HeartbeatSweeper::<ManualClock>::batch_size(10), 10);
        assert_eq!(HeartbeatSweeper::<ManualClock>::batch_size(2_000), 1_024);
        assert_eq!(HeartbeatSweeper::<ManualClock>::batch_size(10_000), 2_000);
    }

    #[tokio::test]
    async fn tick_walks_snapshot_in_batches() {
        let clock = ManualClock::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (socket, rx) = SessionSocket::channel(1);
            receivers.push(rx);
            registry.try_add(Arc::new(ConnectionSession::new(
                "t",
                format!("u{i}"),
                "d",
                socket,
                tenant(30),
                clock.unix_millis(),
            )));
        }
        let mut sweeper = HeartbeatSweeper::new(
            "n1",
            registry,
            Arc::new(CountingAdmission::default()),
            Arc::new(MetricsRegistry::new()),
            clock,
            &cfg(),
        );
        assert_eq!(sweeper.sweep_tick().await.visited, 3);
    }
}
