use super::store::{KvStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Devices of one user mapped to where each is connected.
pub type UserRoutes = BTreeMap<String, OnlineDeviceRoute>;

/// Distributed pointer from a device to the node holding its socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineDeviceRoute {
    pub node_id: String,
    pub endpoint: String,
    pub connection_id: String,
    pub online_at_ms: i64,
}

/// A route together with the key it was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    pub route: OnlineDeviceRoute,
}

pub fn route_key(tenant_id: &str, user_id: &str, device_id: &str) -> String {
    format!("route/{tenant_id}/{user_id}/{device_id}")
}

fn user_prefix(tenant_id: &str, user_id: &str) -> String {
    format!("route/{tenant_id}/{user_id}/")
}

/// Route table over the distributed store.
#[derive(Clone)]
pub struct RouteStore {
    store: Arc<dyn KvStore>,
}

impl RouteStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        route: &OnlineDeviceRoute,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = route_key(tenant_id, user_id, device_id);
        let value = serde_json::to_string(route).map_err(|err| StoreError::Codec {
            key: key.clone(),
            message: err.to_string(),
        })?;
        self.store.register(&key, &value, ttl).await
    }

    pub async fn renew(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .renew(&route_key(tenant_id, user_id, device_id), ttl)
            .await
    }

    /// Remove the route only while it still points at `connection_id`.
    pub async fn remove(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        connection_id: &str,
    ) -> Result<bool, StoreError> {
        let key = route_key(tenant_id, user_id, device_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(false);
        };
        match serde_json::from_str::<OnlineDeviceRoute>(&raw) {
            Ok(route) if route.connection_id != connection_id => Ok(false),
            _ => self.store.delete_if(&key, &raw).await,
        }
    }

    pub async fn get_user(&self, tenant_id: &str, user_id: &str) -> Result<UserRoutes, StoreError> {
        let prefix = user_prefix(tenant_id, user_id);
        let entries = self.store.list(&prefix).await?;
        let mut routes = UserRoutes::new();
        for (key, value) in entries {
            let device = &key[prefix.len()..];
            if device.is_empty() || device.contains('/') {
                continue;
            }
            match serde_json::from_str::<OnlineDeviceRoute>(&value) {
                Ok(route) => {
                    routes.insert(device.to_string(), route);
                }
                Err(err) => {
                    tracing::debug!("skipping undecodable route {key}: {err}");
                }
            }
        }
        Ok(routes)
    }

    /// Routes for many users; users with no live route are omitted.
    pub async fn get_users(
        &self,
        tenant_id: &str,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<OnlineDeviceRoute>>, StoreError> {
        let lookups = user_ids
            .iter()
            .map(|user| async move { (user, self.get_user(tenant_id, user).await) });
        let results = futures::future::join_all(lookups).await;
        let mut out = HashMap::with_capacity(results.len());
        for (user, result) in results {
            let routes = result?;
            if !routes.is_empty() {
                out.insert(user.clone(), routes.into_values().collect());
            }
        }
        Ok(out)
    }

    pub async fn list_all(&self) -> Result<Vec<RouteRecord>, StoreError> {
        let entries = self.store.list("route/").await?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let mut parts = key.splitn(4, '/').skip(1);
            let (Some(tenant), Some(user), Some(device)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if let Ok(route) = serde_json::from_str::<OnlineDeviceRoute>(&value) {
                out.push(RouteRecord {
                    tenant_id: tenant.to_string(),
                    user_id: user.to_string(),
                    device_id: device.to_string(),
                    route,
                });
            }
        }
        Ok(out)
    }

    pub async fn delete_record(&self, record: &RouteRecord) -> Result<bool, StoreError> {
        self.remove(
            &record.tenant_id,
            &record.user_id,
            &record.device_id,
            &record.route.connection_id,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::InMemoryStore;
    use crate::time::ManualClock;

    fn route(node: &str, conn: &str) -> OnlineDeviceRoute {
        OnlineDeviceRoute {
            node_id: node.into(),
            endpoint: format!("http://{node}:7100"),
            connection_id: conn.into(),
            online_at_ms: 1,
        }
    }

    fn routes() -> RouteStore {
        RouteStore::new(Arc::new(InMemoryStore::new(ManualClock::new())))
    }

    #[tokio::test]
    async fn user_routes_are_keyed_by_device() {
        let store = routes();
        let ttl = Duration::from_secs(60);
        store.upsert("t", "u", "phone", &route("a", "c1"), ttl).await.unwrap();
        store.upsert("t", "u", "web", &route("b", "c2"), ttl).await.unwrap();
        store.upsert("t", "u2", "web", &route("b", "c3"), ttl).await.unwrap();
        let user = store.get_user("t", "u").await.unwrap();
        assert_eq!(user.len(), 2);
        assert_eq!(user["phone"].node_id, "a");

        let many = store
            .get_users("t", &["u".into(), "u2".into(), "ghost".into()])
            .await
            .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many["u"].len(), 2);
        assert!(!many.contains_key("ghost"));
    }

    #[tokio::test]
    async fn remove_ignores_newer_connection() {
        let store = routes();
        let ttl = Duration::from_secs(60);
        store.upsert("t", "u", "d", &route("a", "new"), ttl).await.unwrap();
        assert!(!store.remove("t", "u", "d", "old").await.unwrap());
        assert_eq!(store.get_user("t", "u").await.unwrap().len(), 1);
        assert!(store.remove("t", "u", "d", "new").await.unwrap());
        assert!(store.get_user("t", "u").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_all_parses_keys() {
        let store = routes();
        store
            .upsert("t1", "u1", "d1", &route("a", "c"), Duration::ZERO)
            .await
            .unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tenant_id, "t1");
        assert_eq!(all[0].device_id, "d1");
    }
}
