use super::directory::NodeSnapshot;
use super::route_cache::RouteCache;
use super::routes::RouteStore;
use super::store::StoreError;
use crate::ops::metrics::MetricsRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Removes routes left behind by nodes that stopped renewing their liveness lease.
pub struct DeadNodeCleaner {
    routes: RouteStore,
    cache: Arc<dyn RouteCache>,
    snapshot: Arc<NodeSnapshot>,
    local_node_id: String,
    metrics: Arc<MetricsRegistry>,
}

impl DeadNodeCleaner {
    pub fn new(
        routes: RouteStore,
        cache: Arc<dyn RouteCache>,
        snapshot: Arc<NodeSnapshot>,
        local_node_id: impl Into<String>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            routes,
            cache,
            snapshot,
            local_node_id: local_node_id.into(),
            metrics,
        }
    }

    /// One pass over the route table. Returns the number of routes reaped.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let live = self.snapshot.current();
        if live.is_empty() {
            // An empty view usually means the directory read failed; keep routes.
            return Ok(0);
        }
        let mut reaped = 0usize;
        for record in self.routes.list_all().await? {
            let node = record.route.node_id.as_str();
            if node == self.local_node_id || live.iter().any(|n| n.node_id == node) {
                continue;
            }
            if self.routes.delete_record(&record).await? {
                self.cache.invalidate(&record.tenant_id, &record.user_id);
                self.metrics.counter_inc(
                    "courier_routes_reaped_total",
                    1,
                    &[("tenant", &record.tenant_id), ("node", node)],
                );
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "removed routes owned by dead nodes");
        }
        Ok(reaped)
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        tracing::warn!("dead node cleanup failed: {err}");
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
    use crate::cluster::rendezvous::NodeInfo;
    use crate::cluster::route_cache::NoopRouteCache;
    use crate::cluster::routes::OnlineDeviceRoute;
    use crate::cluster::store::InMemoryStore;
    use crate::time::ManualClock;

    fn route(node: &str) -> OnlineDeviceRoute {
        OnlineDeviceRoute {
            node_id: node.into(),
            endpoint: format!("http://{node}"),
            connection_id: format!("conn-{node}"),
            online_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn reaps_only_routes_of_missing_nodes() {
        let routes = RouteStore::new(Arc::new(InMemoryStore::new(ManualClock::new())));
        let ttl = Duration::ZERO;
        routes.upsert("t", "u1", "d", &route("self"), ttl).await.unwrap();
        routes.upsert("t", "u2", "d", &route("alive"), ttl).await.unwrap();
        routes.upsert("t", "u3", "d", &route("dead"), ttl).await.unwrap();
        let snapshot = Arc::new(NodeSnapshot::new(vec![NodeInfo::new("alive", "http://alive")]));
        let metrics = Arc::new(MetricsRegistry::new());
        let cleaner = DeadNodeCleaner::new(
            routes.clone(),
            Arc::new(NoopRouteCache),
            snapshot,
            "self",
            metrics.clone(),
        );
        assert_eq!(cleaner.sweep_once().await.unwrap(), 1);
        assert!(routes.get_user("t", "u3").await.unwrap().is_empty());
        assert_eq!(routes.get_user("t", "u1").await.unwrap().len(), 1);
        assert_eq!(metrics.counter_total("courier_routes_reaped_total"), 1);
    }

    #[tokio::test]
    async fn empty_live_view_keeps_everything() {
        let routes = RouteStore::new(Arc::new(InMemoryStore::new(ManualClock::new())));
        routes
            .upsert("t", "u", "d", &route("dead"), Duration::ZERO)
            .await
            .unwrap();
        let cleaner = DeadNodeCleaner::new(
            routes.clone(),
            Arc::new(NoopRouteCache),
            Arc::new(NodeSnapshot::default()),
            "self",
            Arc::new(MetricsRegistry::new()),
        );
        assert_eq!(cleaner.sweep_once().await.unwrap(), 0);
    }
}
