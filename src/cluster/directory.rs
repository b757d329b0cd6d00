//! Node liveness registration and the locally cached live-node view.

use super::rendezvous::NodeInfo;
use super::store::{KvStore, StoreError};
use crate::ops::metrics::MetricsRegistry;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const NODE_PREFIX: &str = "node/";

fn node_key(node_id: &str) -> String {
    format!("{NODE_PREFIX}{node_id}")
}

/// Cluster membership as TTL leases in the store.
#[derive(Clone)]
pub struct NodeDirectory {
    store: Arc<dyn KvStore>,
}

impl NodeDirectory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn register_self(&self, node: &NodeInfo, ttl: Duration) -> Result<(), StoreError> {
        let key = node_key(&node.node_id);
        let value = serde_json::to_string(node).map_err(|err| StoreError::Codec {
            key: key.clone(),
            message: err.to_string(),
        })?;
        self.store.register(&key, &value, ttl).await
    }

    pub async fn unregister_self(&self, node_id: &str) -> Result<bool, StoreError> {
        self.store.delete(&node_key(node_id)).await
    }

    /// Live nodes ordered by node id.
    pub async fn live_nodes(&self) -> Result<Vec<NodeInfo>, StoreError> {
        let entries = self.store.list(NODE_PREFIX).await?;
        let mut nodes: Vec<NodeInfo> = entries
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_str::<NodeInfo>(&value).ok())
            .filter(|node| !node.node_id.is_empty())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }
}

/// Point-in-time copy of the live node set used for rendezvous decisions.
#[derive(Default)]
pub struct NodeSnapshot {
    current: RwLock<Arc<Vec<NodeInfo>>>,
}

impl NodeSnapshot {
    pub fn new(initial: Vec<NodeInfo>) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn current(&self) -> Arc<Vec<NodeInfo>> {
        self.current.read().clone()
    }

    pub fn replace(&self, nodes: Vec<NodeInfo>) {
        *self.current.write() = Arc::new(nodes);
    }

    pub fn find(&self, node_id: &str) -> Option<NodeInfo> {
        self.current
            .read()
            .iter()
            .find(|n| n.node_id == node_id)
            .cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.current.read().iter().any(|n| n.node_id == node_id)
    }
}

/// Keeps this node registered and the snapshot fresh until shutdown.
pub struct NodeSnapshotService {
    directory: NodeDirectory,
    snapshot: Arc<NodeSnapshot>,
    local: NodeInfo,
    ttl: Duration,
    refresh: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl NodeSnapshotService {
    pub fn new(
        directory: NodeDirectory,
        snapshot: Arc<NodeSnapshot>,
        local: NodeInfo,
        ttl: Duration,
        refresh: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            directory,
            snapshot,
            local,
            ttl,
            refresh,
            metrics,
        }
    }

    /// Register once and load the initial view so routing works before the loop starts.
    pub async fn prime(&self) -> Result<(), StoreError> {
        self.directory.register_self(&self.local, self.ttl).await?;
        self.refresh_once().await
    }

    pub async fn refresh_once(&self) -> Result<(), StoreError> {
        let nodes = self.directory.live_nodes().await?;
        self.metrics
            .gauge_set("courier_cluster_live_nodes", nodes.len() as i64, &[]);
        self.snapshot.replace(nodes);
        Ok(())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let reregister_every = (self.ttl / 3).max(Duration::from_secs(1));
        let mut reregister = tokio::time::interval(reregister_every);
        let mut refresh = tokio::time::interval(self.refresh.max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = reregister.tick() => {
                    if let Err(err) = self.directory.register_self(&self.local, self.ttl).await {
                        self.metrics.counter_inc("courier_node_register_failed_total", 1, &[]);
                        tracing::warn!(node = %self.local.node_id, "node re-register failed: {err}");
                    }
                }
                _ = refresh.tick() => {
                    if let Err(err) = self.refresh_once().await {
                        tracing::warn!("node snapshot refresh failed: {err}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(err) = self.directory.unregister_self(&self.local.node_id).await {
            tracing::debug!("node unregister on shutdown failed: {err}");
        }
    }
}
