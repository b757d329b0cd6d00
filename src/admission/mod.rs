//! Capacity-checked connection leases.
//!
//! A lease at `lease/{tenant}/{user}/{device}` records which node and
//! connection hold a device. Registering also publishes the device route so
//! the lease and the route share one lifetime.

pub mod rate_limit;
pub mod resilient;

pub use rate_limit::MessageRateLimiter;
pub use resilient::{AdmissionRetryWorker, ResilientAdmission, UnregisterRetryQueue, UnregisterWork};

use crate::cluster::{CapacityGuard, GuardedWrite, KvStore, OnlineDeviceRoute, RouteStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const LEASE_PREFIX: &str = "lease/";
const MIN_LEASE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn lease_key(tenant_id: &str, user_id: &str, device_id: &str) -> String {
    format!("{LEASE_PREFIX}{tenant_id}/{user_id}/{device_id}")
}

fn lease_value(node_id: &str, connection_id: &str) -> String {
    format!("{node_id}|{connection_id}")
}

/// Lease TTL: twice the heartbeat timeout, never under 30 s.
pub fn lease_ttl(heartbeat_timeout: Duration) -> Duration {
    let heartbeat = if heartbeat_timeout.is_zero() {
        DEFAULT_HEARTBEAT_TIMEOUT
    } else {
        heartbeat_timeout
    };
    (heartbeat * 2).max(MIN_LEASE_TTL)
}

fn guard_limit(cap: i64) -> u32 {
    if cap <= 0 {
        0
    } else {
        u32::try_from(cap).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Denied { reason: String },
    AllowedNew,
    /// The device already held a lease, e.g. a reconnect before the old one expired.
    AllowedReplace,
}

impl AdmissionOutcome {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, AdmissionOutcome::Denied { .. })
    }
}

#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    pub route: OnlineDeviceRoute,
    pub heartbeat_timeout: Duration,
    /// Zero or negative means unlimited.
    pub tenant_max_connections: i64,
    pub user_max_connections: i64,
}

/// Identifies a lease for removal. Removal only happens while the stored
/// lease still names this node and connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTarget {
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    pub node_id: String,
    pub connection_id: String,
}

#[async_trait]
pub trait ConnectionAdmission: Send + Sync {
    async fn register(&self, request: &LeaseRequest) -> Result<AdmissionOutcome, StoreError>;

    /// Extend the lease and route. Returns false when the lease is gone.
    async fn renew_lease(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        heartbeat_timeout: Duration,
    ) -> Result<bool, StoreError>;

    async fn unregister(&self, target: &LeaseTarget) -> Result<(), StoreError>;
}

/// Admission backed directly by the distributed store.
pub struct StoreAdmission {
    store: Arc<dyn KvStore>,
    routes: RouteStore,
}

impl StoreAdmission {
    pub fn new(store: Arc<dyn KvStore>, routes: RouteStore) -> Self {
        Self { store, routes }
    }
}

#[async_trait]
impl ConnectionAdmission for StoreAdmission {
    async fn register(&self, request: &LeaseRequest) -> Result<AdmissionOutcome, StoreError> {
        let ttl = lease_ttl(request.heartbeat_timeout);
        let key = lease_key(&request.tenant_id, &request.user_id, &request.device_id);
        let value = lease_value(&request.route.node_id, &request.route.connection_id);
        let guards = [
            CapacityGuard::new(
                format!("{LEASE_PREFIX}{}/{}/", request.tenant_id, request.user_id),
                guard_limit(request.user_max_connections),
            ),
            CapacityGuard::new(
                format!("{LEASE_PREFIX}{}/", request.tenant_id),
                guard_limit(request.tenant_max_connections),
            ),
        ];
        let replaced = match self
            .store
            .register_guarded(&key, &value, ttl, &guards)
            .await?
        {
            GuardedWrite::Rejected {
                prefix,
                live,
                limit,
            } => {
                tracing::debug!(
                    tenant = %request.tenant_id,
                    user = %request.user_id,
                    prefix = %prefix,
                    live,
                    limit,
                    "connection cap reached"
                );
                return Ok(AdmissionOutcome::Denied {
                    reason: "rate limited".to_string(),
                });
            }
            GuardedWrite::Written { replaced } => replaced,
        };
        if let Err(err) = self
            .routes
            .upsert(
                &request.tenant_id,
                &request.user_id,
                &request.device_id,
                &request.route,
                ttl,
            )
            .await
        {
            // Never leave a lease without its route.
            let _ = self.store.delete_if(&key, &value).await;
            return Err(err);
        }
        Ok(if replaced {
            AdmissionOutcome::AllowedReplace
        } else {
            AdmissionOutcome::AllowedNew
        })
    }

    async fn renew_lease(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        heartbeat_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let ttl = lease_ttl(heartbeat_timeout);
        let renewed = self
            .store
            .renew(&lease_key(tenant_id, user_id, device_id), ttl)
            .await?;
        if renewed {
            self.routes.renew(tenant_id, user_id, device_id, ttl).await?;
        }
        Ok(renewed)
    }

    async fn unregister(&self, target: &LeaseTarget) -> Result<(), StoreError> {
        let key = lease_key(&target.tenant_id, &target.user_id, &target.device_id);
        self.store
            .delete_if(&key, &lease_value(&target.node_id, &target.connection_id))
            .await?;
        self.routes
            .remove(
                &target.tenant_id,
                &target.user_id,
                &target.device_id,
                &target.connection_id,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryStore;
    use crate::time::ManualClock;

    fn admission() -> (StoreAdmission, Arc<dyn KvStore>, RouteStore) {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new(ManualClock::new()));
        let routes = RouteStore::new(store.clone());
        (StoreAdmission::new(store.clone(), routes.clone()), store, routes)
    }

    fn request(user: &str, device: &str, conn: &str, tenant_max: i64, user_max: i64) -> LeaseRequest {
        LeaseRequest {
            tenant_id: "t".into(),
            user_id: user.into(),
            device_id: device.into(),
            route: OnlineDeviceRoute {
                node_id: "n1".into(),
                endpoint: "http://n1".into(),
                connection_id: conn.into(),
                online_at_ms: 0,
            },
            heartbeat_timeout: Duration::from_secs(10),
            tenant_max_connections: tenant_max,
            user_max_connections: user_max,
        }
    }

    #[test]
    fn lease_ttl_has_floor() {
        assert_eq!(lease_ttl(Duration::from_secs(5)), Duration::from_secs(30));
        assert_eq!(lease_ttl(Duration::from_secs(40)), Duration::from_secs(80));
        assert_eq!(lease_ttl(Duration::ZERO), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn tenant_cap_denies_without_writing() {
        let (admission, store, routes) = admission();
        assert_eq!(
            admission.register(&request("a", "d", "c1", 2, 0)).await.unwrap(),
            AdmissionOutcome::AllowedNew
        );
        admission.register(&request("b", "d", "c2", 2, 0)).await.unwrap();
        let outcome = admission.register(&request("c", "d", "c3", 2, 0)).await.unwrap();
        assert!(!outcome.is_allowed());
        assert!(store.get(&lease_key("t", "c", "d")).await.unwrap().is_none());
        assert!(routes.get_user("t", "c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_device_replaces_under_user_cap() {
        let (admission, _, _) = admission();
        admission.register(&request("a", "d", "c1", 0, 1)).await.unwrap();
        assert_eq!(
            admission.register(&request("a", "d", "c2", 0, 1)).await.unwrap(),
            AdmissionOutcome::AllowedReplace
        );
        assert!(!admission
            .register(&request("a", "other", "c3", 0, 1))
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn unregister_requires_matching_connection() {
        let (admission, store, routes) = admission();
        admission.register(&request("a", "d", "c2", 0, 0)).await.unwrap();
        let stale = LeaseTarget {
            tenant_id: "t".into(),
            user_id: "a".into(),
            device_id: "d".into(),
            node_id: "n1".into(),
            connection_id: "c1".into(),
        };
        admission.unregister(&stale).await.unwrap();
        assert!(store.get(&lease_key("t", "a", "d")).await.unwrap().is_some());
        let current = LeaseTarget {
            connection_id: "c2".into(),
            ..stale
        };
        admission.unregister(&current).await.unwrap();
        assert!(store.get(&lease_key("t", "a", "d")).await.unwrap().is_none());
        assert!(routes.get_user("t", "a").await.unwrap().is_empty());
    }
}
