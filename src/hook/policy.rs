use super::wire::TenantRuntimeConfig;
use crate::config::Config;
use crate::forwarding::BreakerPolicy;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;

const MAX_CONCURRENCY_CAP: i64 = 1024;
const MAX_QUEUE_TIMEOUT_MS: i64 = 10_000;
const MAX_BREAKER_THRESHOLD: i64 = 100;
const MAX_BREAKER_OPEN_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquirePolicy {
    pub max_concurrency: u32,
    pub queue_timeout: Duration,
}

/// Effective hook behaviour for one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookPolicy {
    pub acquire: AcquirePolicy,
    pub breaker: BreakerPolicy,
    pub sign_required: bool,
}

/// Node-level defaults, before any tenant override from the auth hook.
#[derive(Debug, Clone)]
pub struct HookPolicyDefaults {
    pub max_concurrency: u32,
    pub tenant_max_concurrency: HashMap<String, u32>,
    pub queue_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_open: Duration,
    pub sign_required: bool,
}

impl HookPolicyDefaults {
    pub fn from_config(config: &Config) -> Self {
        let hook = &config.hook;
        Self {
            max_concurrency: hook.max_concurrency,
            tenant_max_concurrency: config
                .tenants
                .iter()
                .filter_map(|(tenant, cfg)| {
                    cfg.hook_max_concurrency
                        .filter(|v| *v > 0)
                        .map(|v| (tenant.clone(), v))
                })
                .collect(),
            queue_timeout: Duration::from_millis(hook.queue_timeout_ms),
            breaker_failure_threshold: hook.breaker_failure_threshold,
            breaker_open: Duration::from_millis(hook.breaker_open_ms),
            sign_required: hook.sign_required,
        }
    }
}

impl Default for HookPolicyDefaults {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            tenant_max_concurrency: HashMap::new(),
            queue_timeout: Duration::from_millis(10),
            breaker_failure_threshold: 5,
            breaker_open: Duration::from_secs(5),
            sign_required: false,
        }
    }
}

impl HookPolicy {
    pub fn resolve(
        tenant_id: &str,
        tenant: Option<&TenantRuntimeConfig>,
        defaults: &HookPolicyDefaults,
    ) -> Self {
        let mut max_concurrency = defaults
            .tenant_max_concurrency
            .get(tenant_id)
            .copied()
            .unwrap_or(defaults.max_concurrency);
        let mut queue_timeout = defaults.queue_timeout;
        let mut threshold = defaults.breaker_failure_threshold;
        let mut open = defaults.breaker_open;
        let mut sign_required = defaults.sign_required;

        if let Some(cfg) = tenant {
            if let Some(v) = cfg.hook_max_concurrency.filter(|v| *v > 0) {
                max_concurrency = v.min(MAX_CONCURRENCY_CAP) as u32;
            }
            if let Some(v) = cfg.hook_queue_timeout_ms.filter(|v| *v >= 0) {
                queue_timeout = Duration::from_millis(v.min(MAX_QUEUE_TIMEOUT_MS) as u64);
            }
            if let Some(v) = cfg.hook_breaker_failure_threshold.filter(|v| *v > 0) {
                threshold = v.min(MAX_BREAKER_THRESHOLD) as u32;
            }
            if let Some(v) = cfg.hook_breaker_open_ms.filter(|v| *v >= 0) {
                open = Duration::from_millis(v.min(MAX_BREAKER_OPEN_MS) as u64);
            }
            if let Some(v) = cfg.hook_sign_required {
                sign_required = v;
            }
        }

        Self {
            acquire: AcquirePolicy {
                max_concurrency: max_concurrency.max(1),
                queue_timeout,
            },
            breaker: BreakerPolicy::new(threshold, open),
            sign_required,
        }
    }
}

/// Last policy each tenant's auth hook handed out.
pub struct TenantHookPolicyCache {
    defaults: HookPolicyDefaults,
    cache: DashMap<String, HookPolicy>,
}

impl TenantHookPolicyCache {
    pub fn new(defaults: HookPolicyDefaults) -> Self {
        Self {
            defaults,
            cache: DashMap::new(),
        }
    }

    pub fn get(&self, tenant_id: &str) -> HookPolicy {
        self.cache
            .get(tenant_id)
            .map(|p| *p)
            .unwrap_or_else(|| HookPolicy::resolve(tenant_id, None, &self.defaults))
    }

    pub fn resolve(&self, tenant_id: &str, tenant: &TenantRuntimeConfig) -> HookPolicy {
        HookPolicy::resolve(tenant_id, Some(tenant), &self.defaults)
    }

    pub fn update(&self, tenant_id: &str, tenant: &TenantRuntimeConfig) {
        self.cache
            .insert(tenant_id.to_string(), self.resolve(tenant_id, tenant));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_clamped() {
        let cfg = TenantRuntimeConfig {
            hook_max_concurrency: Some(5_000),
            hook_queue_timeout_ms: Some(99_999),
            hook_breaker_failure_threshold: Some(1_000),
            hook_breaker_open_ms: Some(600_000),
            hook_sign_required: Some(true),
            ..TenantRuntimeConfig::default()
        };
        let policy = HookPolicy::resolve("t", Some(&cfg), &HookPolicyDefaults::default());
        assert_eq!(policy.acquire.max_concurrency, 1024);
        assert_eq!(policy.acquire.queue_timeout, Duration::from_secs(10));
        assert_eq!(policy.breaker.failure_threshold, 100);
        assert_eq!(policy.breaker.open_duration, Duration::from_secs(60));
        assert!(policy.sign_required);
    }

    #[test]
    fn non_positive_overrides_keep_defaults() {
        let mut defaults = HookPolicyDefaults::default();
        defaults.tenant_max_concurrency.insert("t".into(), 7);
        let cfg = TenantRuntimeConfig {
            hook_max_concurrency: Some(0),
            hook_queue_timeout_ms: Some(-1),
            hook_breaker_failure_threshold: Some(-3),
            ..TenantRuntimeConfig::default()
        };
        let policy = HookPolicy::resolve("t", Some(&cfg), &defaults);
        assert_eq!(policy.acquire.max_concurrency, 7);
        assert_eq!(policy.acquire.queue_timeout, Duration::from_millis(10));
        assert_eq!(policy.breaker.failure_threshold, 5);
        assert!(!policy.sign_required);
    }

    #[test]
    fn cache_serves_updated_policy() {
        let cache = TenantHookPolicyCache::new(HookPolicyDefaults::default());
        assert_eq!(cache.get("t").acquire.max_concurrency, 32);
        cache.update(
            "t",
            &TenantRuntimeConfig {
                hook_max_concurrency: Some(3),
                ..TenantRuntimeConfig::default()
            },
        );
        assert_eq!(cache.get("t").acquire.max_concurrency, 3);
        assert_eq!(cache.get("other").acquire.max_concurrency, 32);
    }
}
