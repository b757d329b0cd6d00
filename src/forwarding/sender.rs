//! Sending side of node RPC: breaker gating, bounded retry, and home-node
//! offline buffering.

use super::breaker::{BreakerPolicy, CircuitBreaker};
use super::pool::{NodeClient, NodeClientPool, NodeRpcError};
use super::rpc::{BufferOfflineRequest, DrainOfflineRequest, ForwardBatchRequest, ForwardSingleRequest};
use crate::cluster::{pick_node, NodeInfo, NodeSnapshot};
use crate::config::NodeRpcConfig;
use crate::messaging::{MessageRequest, OfflineBufferStore};
use crate::ops::metrics::MetricsRegistry;
use crate::time::Clock;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const RETRY_DELAY_STEP: Duration = Duration::from_millis(50);

/// Outbound node RPC with one breaker per peer node id.
pub struct NodeForwarder<C: Clock> {
    pool: Arc<NodeClientPool>,
    breaker: CircuitBreaker<String, C>,
    policy: BreakerPolicy,
    clock: C,
    metrics: Arc<MetricsRegistry>,
    max_attempts: u32,
}

impl<C: Clock> NodeForwarder<C> {
    pub fn new(
        pool: Arc<NodeClientPool>,
        cfg: &NodeRpcConfig,
        clock: C,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            pool,
            breaker: CircuitBreaker::new(clock.clone()),
            policy: BreakerPolicy::new(
                cfg.breaker_failure_threshold,
                Duration::from_millis(cfg.breaker_open_ms),
            ),
            clock,
            metrics,
            max_attempts: cfg.max_attempts.clamp(1, 5),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker<String, C> {
        &self.breaker
    }

    async fn invoke<T, F, Fut>(
        &self,
        tenant_id: &str,
        node: &NodeInfo,
        via: &str,
        call: F,
    ) -> Result<T, NodeRpcError>
    where
        F: Fn(NodeClient) -> Fut,
        Fut: Future<Output = Result<T, NodeRpcError>>,
    {
        let Some(trial) = self.breaker.begin(&node.node_id) else {
            self.metrics.counter_inc(
                "courier_node_circuit_open_total",
                1,
                &[("tenant", tenant_id), ("via", via)],
            );
            return Err(NodeRpcError::CircuitOpen(node.node_id.clone()));
        };
        let client = self.pool.get(&node.endpoint);
        let mut attempt = 1;
        loop {
            let started = self.clock.now();
            let result = call(client.clone()).await;
            let elapsed = self.clock.now().saturating_duration_since(started);
            self.metrics.histogram_observe(
                "courier_node_forward_duration_ms",
                elapsed.as_secs_f64() * 1000.0,
                &[("via", via)],
            );
            match result {
                Ok(value) => {
                    trial.succeed();
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    tracing::debug!(node = %node.node_id, via, attempt, "node rpc retry: {err}");
                    self.clock.sleep(RETRY_DELAY_STEP * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.metrics.counter_inc(
                        "courier_node_forward_failed_total",
                        1,
                        &[("tenant", tenant_id), ("via", via), ("status", err.label())],
                    );
                    if trial.fail(self.policy) {
                        tracing::warn!(node = %node.node_id, via, "node breaker opened: {err}");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// True when the peer accepted the message.
    pub async fn forward_single(
        &self,
        node: &NodeInfo,
        to_user_id: &str,
        message: &MessageRequest,
    ) -> bool {
        let request = ForwardSingleRequest {
            tenant_id: message.tenant_id.clone(),
            to_user_id: to_user_id.to_string(),
            message: message.clone(),
        };
        let request = &request;
        let result = self
            .invoke(&message.tenant_id, node, "single", move |client| async move {
                client.forward_single(request).await
            })
            .await;
        self.accepted(&message.tenant_id, node, "single", result)
    }

    pub async fn forward_batch(
        &self,
        node: &NodeInfo,
        to_user_ids: &[String],
        message: &MessageRequest,
    ) -> bool {
        let request = ForwardBatchRequest {
            tenant_id: message.tenant_id.clone(),
            to_user_ids: to_user_ids.to_vec(),
            message: message.clone(),
        };
        let request = &request;
        let result = self
            .invoke(&message.tenant_id, node, "batch", move |client| async move {
                client.forward_batch(request).await
            })
            .await;
        self.accepted(&message.tenant_id, node, "batch", result)
    }

    pub async fn buffer_offline(
        &self,
        node: &NodeInfo,
        tenant_id: &str,
        to_user_id: &str,
        frame: Bytes,
        ttl: Duration,
    ) -> bool {
        let request = BufferOfflineRequest {
            tenant_id: tenant_id.to_string(),
            to_user_id: to_user_id.to_string(),
            frame,
            ttl_seconds: ttl.as_secs(),
        };
        let request = &request;
        let result = self
            .invoke(tenant_id, node, "buffer_offline", move |client| async move {
                client.buffer_offline(request).await
            })
            .await;
        self.accepted(tenant_id, node, "buffer_offline", result)
    }

    /// Frames held for the user on `node`; `None` when the peer could not be reached.
    pub async fn drain_offline(
        &self,
        node: &NodeInfo,
        tenant_id: &str,
        user_id: &str,
    ) -> Option<Vec<Bytes>> {
        let request = DrainOfflineRequest {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
        };
        let request = &request;
        self.invoke(tenant_id, node, "drain_offline", move |client| async move {
            client.drain_offline(request).await
        })
        .await
        .map(|response| response.frames)
        .ok()
    }

    fn accepted(
        &self,
        tenant_id: &str,
        node: &NodeInfo,
        via: &str,
        result: Result<super::rpc::ForwardAck, NodeRpcError>,
    ) -> bool {
        match result {
            Ok(ack) if ack.ok => true,
            Ok(ack) => {
                tracing::debug!(tenant = tenant_id, node = %node.node_id, via, reason = %ack.reason, "peer rejected rpc");
                false
            }
            Err(NodeRpcError::CircuitOpen(_)) => false,
            Err(err) => {
                tracing::debug!(tenant = tenant_id, node = %node.node_id, via, "node rpc failed: {err}");
                false
            }
        }
    }
}

/// Places offline frames on the user's rendezvous home node so any node the
/// user reconnects through can find them.
pub struct OfflineRouter<C: Clock> {
    node_id: String,
    snapshot: Arc<NodeSnapshot>,
    local: Arc<OfflineBufferStore<C>>,
    forwarder: Arc<NodeForwarder<C>>,
    metrics: Arc<MetricsRegistry>,
}

impl<C: Clock> OfflineRouter<C> {
    pub fn new(
        node_id: impl Into<String>,
        snapshot: Arc<NodeSnapshot>,
        local: Arc<OfflineBufferStore<C>>,
        forwarder: Arc<NodeForwarder<C>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            snapshot,
            local,
            forwarder,
            metrics,
        }
    }

    pub fn local_store(&self) -> &Arc<OfflineBufferStore<C>> {
        &self.local
    }

    /// Remote home node for the user, or `None` when this node is home.
    fn remote_home(&self, tenant_id: &str, user_id: &str) -> Option<NodeInfo> {
        let nodes = self.snapshot.current();
        pick_node(tenant_id, user_id, &nodes)
            .filter(|node| node.node_id != self.node_id)
            .cloned()
    }

    fn buffer_local(
        &self,
        tenant_id: &str,
        user_id: &str,
        frame: Bytes,
        ttl: Duration,
        via: &str,
    ) -> bool {
        let ok = self.local.try_add(tenant_id, user_id, frame, ttl);
        let name = if ok {
            "courier_offline_buffered_total"
        } else {
            "courier_offline_buffer_skipped_total"
        };
        self.metrics
            .counter_inc(name, 1, &[("tenant", tenant_id), ("via", via)]);
        ok
    }

    /// Buffer at the home node; a rejected or failed RPC falls back to this
    /// node. A zero `ttl` means the store default.
    pub async fn buffer(&self, tenant_id: &str, user_id: &str, frame: Bytes, ttl: Duration) -> bool {
        let Some(home) = self.remote_home(tenant_id, user_id) else {
            return self.buffer_local(tenant_id, user_id, frame, ttl, "local");
        };
        let ttl = if ttl.is_zero() {
            self.local.limits().default_ttl
        } else {
            ttl
        };
        if self
            .forwarder
            .buffer_offline(&home, tenant_id, user_id, frame.clone(), ttl)
            .await
        {
            self.metrics.counter_inc(
                "courier_offline_buffered_total",
                1,
                &[("tenant", tenant_id), ("via", "rpc")],
            );
            return true;
        }
        self.buffer_local(tenant_id, user_id, frame, ttl, "local_fallback")
    }

    /// Home-node frames first, then anything that fell back to this node.
    pub async fn drain(&self, tenant_id: &str, user_id: &str) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if let Some(home) = self.remote_home(tenant_id, user_id) {
            match self.forwarder.drain_offline(&home, tenant_id, user_id).await {
                Some(remote) => frames.extend(remote),
                None => {
                    self.metrics.counter_inc(
                        "courier_offline_drain_failed_total",
                        1,
                        &[("tenant", tenant_id)],
                    );
                }
            }
        }
        frames.extend(self.local.drain(tenant_id, user_id));
        if !frames.is_empty() {
            self.metrics.counter_inc(
                "courier_offline_drained_total",
                frames.len() as u64,
                &[("tenant", tenant_id), ("node", "self")],
            );
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::pick_node_id;
    use crate::messaging::OfflineLimits;
    use crate::time::ManualClock;

    fn forwarder(clock: ManualClock, metrics: Arc<MetricsRegistry>) -> Arc<NodeForwarder<ManualClock>> {
        let cfg = NodeRpcConfig {
            timeout_ms: 50,
            max_attempts: 1,
            breaker_failure_threshold: 1,
            breaker_open_ms: 60_000,
        };
        let pool = Arc::new(NodeClientPool::from_config(&cfg, None));
        Arc::new(NodeForwarder::new(pool, &cfg, clock, metrics))
    }

    fn message() -> MessageRequest {
        MessageRequest {
            tenant_id: "t".into(),
            user_id: "alice".into(),
            device_id: "d".into(),
            msg_id: "m".into(),
            msg_type: crate::messaging::MessageType::SingleChat,
            to_user_id: "bob".into(),
            group_id: String::new(),
            msg_body: Bytes::from_static(b"x"),
            timestamp_ms: 1,
        }
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_io() {
        let clock = ManualClock::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let forwarder = forwarder(clock, metrics.clone());
        let node = NodeInfo::new("n2", "127.0.0.1:1");
        forwarder
            .breaker()
            .on_failure(&"n2".to_string(), forwarder.policy);
        assert!(!forwarder.forward_single(&node, "bob", &message()).await);
        assert_eq!(metrics.counter_total("courier_node_circuit_open_total"), 1);
        assert_eq!(metrics.counter_total("courier_node_forward_failed_total"), 0);
    }

    #[tokio::test]
    async fn cancelled_forward_releases_half_open_trial() {
        let clock = ManualClock::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let cfg = NodeRpcConfig {
            timeout_ms: 10_000,
            max_attempts: 1,
            breaker_failure_threshold: 1,
            breaker_open_ms: 1_000,
        };
        let pool = Arc::new(NodeClientPool::from_config(&cfg, None));
        let forwarder = NodeForwarder::new(pool, &cfg, clock.clone(), metrics);
        // Accepts connections into the backlog and never answers.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = NodeInfo::new("n2", &silent.local_addr().unwrap().to_string());
        let key = "n2".to_string();
        forwarder.breaker().on_failure(&key, forwarder.policy);
        clock.advance(Duration::from_secs(2));

        let msg = message();
        let call = forwarder.forward_single(&node, "bob", &msg);
        assert!(tokio::time::timeout(Duration::from_millis(100), call)
            .await
            .is_err());

        clock.advance(Duration::from_secs(3600));
        assert!(forwarder.breaker().try_begin(&key));
    }

    #[tokio::test]
    async fn unreachable_home_falls_back_to_local_buffer() {
        let clock = ManualClock::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let nodes = vec![NodeInfo::new("n1", "127.0.0.1:1"), NodeInfo::new("n2", "127.0.0.1:1")];
        // Find a user whose home is the peer so the RPC path is taken.
        let user = (0..64)
            .map(|i| format!("user-{i}"))
            .find(|u| pick_node_id("t", u, &nodes) == Some("n2"))
            .unwrap();
        let local = Arc::new(OfflineBufferStore::new(
            OfflineLimits::default(),
            clock.clone(),
            metrics.clone(),
        ));
        let fwd = forwarder(clock, metrics.clone());
        fwd.breaker().on_failure(&"n2".to_string(), fwd.policy);
        let router = OfflineRouter::new(
            "n1",
            Arc::new(NodeSnapshot::new(nodes)),
            local.clone(),
            fwd,
            metrics.clone(),
        );
        assert!(router.buffer("t", &user, Bytes::from_static(b"f1"), Duration::ZERO).await);
        assert_eq!(local.user_usage("t", &user), Some((1, 2)));
        assert_eq!(
            metrics.counter_value(
                "courier_offline_buffered_total",
                &[("tenant", "t"), ("via", "local_fallback")]
            ),
            1
        );
        // The remote drain is short-circuited too; the local copy still comes back.
        assert_eq!(router.drain("t", &user).await, vec![Bytes::from_static(b"f1")]);
        assert_eq!(metrics.counter_total("courier_offline_drain_failed_total"), 1);
    }

    #[tokio::test]
    async fn self_home_buffers_locally() {
        let clock = ManualClock::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let local = Arc::new(OfflineBufferStore::new(
            OfflineLimits::default(),
            clock.clone(),
            metrics.clone(),
        ));
        let router = OfflineRouter::new(
            "n1",
            Arc::new(NodeSnapshot::new(vec![NodeInfo::new("n1", "self")])),
            local,
            forwarder(clock, metrics.clone()),
            metrics.clone(),
        );
        assert!(router.buffer("t", "u", Bytes::from_static(b"a"), Duration::ZERO).await);
        assert!(router.buffer("t", "u", Bytes::from_static(b"b"), Duration::ZERO).await);
        assert_eq!(
            router.drain("t", "u").await,
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
        assert!(router.drain("t", "u").await.is_empty());
    }
}
