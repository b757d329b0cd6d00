//! Local TTL cache in front of the distributed route table.
//!
//! Bounded by estimated byte cost rather than entry count. Empty route sets
//! are never cached so a lookup racing a connect cannot pin a negative
//! answer for a full TTL.

use super::routes::UserRoutes;
use crate::config::RouteCacheConfig;
use crate::time::Clock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Estimated bytes per cached device route.
const ROUTE_COST_BYTES: usize = 256;

pub trait RouteCache: Send + Sync {
    fn get(&self, tenant_id: &str, user_id: &str) -> Option<Arc<UserRoutes>>;
    fn set(&self, tenant_id: &str, user_id: &str, routes: Arc<UserRoutes>);
    fn invalidate(&self, tenant_id: &str, user_id: &str);
}

fn cache_key(tenant_id: &str, user_id: &str) -> String {
    format!("{tenant_id}:{user_id}")
}

/// Cache used when local caching is disabled.
#[derive(Debug, Default)]
pub struct NoopRouteCache;

impl RouteCache for NoopRouteCache {
    fn get(&self, _tenant_id: &str, _user_id: &str) -> Option<Arc<UserRoutes>> {
        None
    }

    fn set(&self, _tenant_id: &str, _user_id: &str, _routes: Arc<UserRoutes>) {}

    fn invalidate(&self, _tenant_id: &str, _user_id: &str) {}
}

struct CachedRoutes {
    routes: Arc<UserRoutes>,
    expires_at_ms: i64,
    cost: usize,
}

pub struct LocalRouteCache<C: Clock> {
    clock: C,
    ttl: Duration,
    max_bytes: usize,
    entries: DashMap<String, CachedRoutes>,
    bytes: AtomicUsize,
}

impl<C: Clock> LocalRouteCache<C> {
    pub fn new(clock: C, ttl: Duration, max_bytes: usize) -> Self {
        Self {
            clock,
            ttl,
            max_bytes,
            entries: DashMap::new(),
            bytes: AtomicUsize::new(0),
        }
    }

    pub fn estimated_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_key(&self, key: &str) {
        if let Some((_, old)) = self.entries.remove(key) {
            self.bytes.fetch_sub(old.cost, Ordering::Relaxed);
        }
    }

    /// Drop expired entries, then the soonest-to-expire ones, until `incoming` fits.
    fn make_room(&self, incoming: usize) {
        if self.bytes.load(Ordering::Relaxed) + incoming <= self.max_bytes {
            return;
        }
        let now = self.clock.unix_millis();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at_ms <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.remove_key(&key);
        }
        if self.bytes.load(Ordering::Relaxed) + incoming <= self.max_bytes {
            return;
        }
        let mut by_age: Vec<(i64, String)> = self
            .entries
            .iter()
            .map(|e| (e.expires_at_ms, e.key().clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age {
            if self.bytes.load(Ordering::Relaxed) + incoming <= self.max_bytes {
                break;
            }
            self.remove_key(&key);
        }
    }
}

impl<C: Clock> RouteCache for LocalRouteCache<C> {
    fn get(&self, tenant_id: &str, user_id: &str) -> Option<Arc<UserRoutes>> {
        let key = cache_key(tenant_id, user_id);
        let now = self.clock.unix_millis();
        let hit = self.entries.get(&key).map(|e| {
            if e.expires_at_ms > now {
                Some(e.routes.clone())
            } else {
                None
            }
        })?;
        if hit.is_none() {
            self.remove_key(&key);
        }
        hit
    }

    fn set(&self, tenant_id: &str, user_id: &str, routes: Arc<UserRoutes>) {
        if routes.is_empty() {
            return;
        }
        let key = cache_key(tenant_id, user_id);
        let cost = routes.len() * ROUTE_COST_BYTES + key.len();
        if cost > self.max_bytes {
            return;
        }
        self.remove_key(&key);
        self.make_room(cost);
        let entry = CachedRoutes {
            routes,
            expires_at_ms: self.clock.unix_millis() + self.ttl.as_millis() as i64,
            cost,
        };
        self.bytes.fetch_add(cost, Ordering::Relaxed);
        if let Some(old) = self.entries.insert(key, entry) {
            self.bytes.fetch_sub(old.cost, Ordering::Relaxed);
        }
    }

    fn invalidate(&self, tenant_id: &str, user_id: &str) {
        self.remove_key(&cache_key(tenant_id, user_id));
    }
}

/// Build the configured cache; a zero TTL or size yields the no-op cache.
pub fn build_route_cache<C: Clock>(cfg: &RouteCacheConfig, clock: C) -> Arc<dyn RouteCache> {
    if cfg.ttl_ms == 0 || cfg.max_bytes == 0 {
        return Arc::new(NoopRouteCache);
    }
    Arc::new(LocalRouteCache::new(
        clock,
        Duration::from_millis(cfg.ttl_ms),
        cfg.max_bytes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::routes::OnlineDeviceRoute;
    use crate::time::ManualClock;

    fn routes(devices: &[&str]) -> Arc<UserRoutes> {
        let mut map = UserRoutes::new();
        for device in devices {
            map.insert(
                (*device).to_string(),
                OnlineDeviceRoute {
                    node_id: "a".into(),
                    endpoint: "http://a".into(),
                    connection_id: format!("c-{device}"),
                    online_at_ms: 0,
                },
            );
        }
        Arc::new(map)
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = ManualClock::new();
        let cache = LocalRouteCache::new(clock.clone(), Duration::from_millis(500), 1 << 20);
        cache.set("t", "u", routes(&["d1"]));
        assert!(cache.get("t", "u").is_some());
        clock.advance(Duration::from_millis(501));
        assert!(cache.get("t", "u").is_none());
        assert_eq!(cache.estimated_bytes(), 0);
    }

    #[test]
    fn empty_route_sets_are_not_cached() {
        let cache = LocalRouteCache::new(ManualClock::new(), Duration::from_secs(1), 1 << 20);
        cache.set("t", "u", routes(&[]));
        assert!(cache.is_empty());
    }

    #[test]
    fn byte_budget_evicts_oldest() {
        let clock = ManualClock::new();
        let budget = 2 * (ROUTE_COST_BYTES + 4);
        let cache = LocalRouteCache::new(clock.clone(), Duration::from_secs(10), budget);
        cache.set("t", "u1", routes(&["d"]));
        clock.advance(Duration::from_millis(1));
        cache.set("t", "u2", routes(&["d"]));
        clock.advance(Duration::from_millis(1));
        cache.set("t", "u3", routes(&["d"]));
        assert!(cache.get("t", "u1").is_none());
        assert!(cache.get("t", "u2").is_some());
        assert!(cache.get("t", "u3").is_some());
        assert!(cache.estimated_bytes() <= budget);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = LocalRouteCache::new(ManualClock::new(), Duration::from_secs(1), 1 << 20);
        cache.set("t", "u", routes(&["d"]));
        cache.invalidate("t", "u");
        assert!(cache.get("t", "u").is_none());
    }

    #[test]
    fn zero_ttl_builds_noop_cache() {
        let cfg = RouteCacheConfig {
            ttl_ms: 0,
            max_bytes: 1024,
        };
        let cache = build_route_cache(&cfg, ManualClock::new());
        cache.set("t", "u", routes(&["d"]));
        assert!(cache.get("t", "u").is_none());
    }
}
