use crate::config::OfflineConfig;
use crate::ops::metrics::MetricsRegistry;
use crate::time::Clock;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Caps applied to every user's pending queue. Zero disables a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineLimits {
    pub max_messages_per_user: usize,
    pub max_bytes_per_user: usize,
    pub max_users_per_tenant: usize,
    pub default_ttl: Duration,
}

impl OfflineLimits {
    pub fn from_config(cfg: &OfflineConfig) -> Self {
        Self {
            max_messages_per_user: cfg.max_messages_per_user,
            max_bytes_per_user: cfg.max_bytes_per_user,
            max_users_per_tenant: cfg.max_users_per_tenant,
            default_ttl: Duration::from_secs(cfg.default_ttl_seconds.max(1)),
        }
    }
}

impl Default for OfflineLimits {
    fn default() -> Self {
        Self::from_config(&OfflineConfig::default())
    }
}

#[derive(Debug, Clone)]
struct OfflineEntry {
    frame: Bytes,
    expires_at_ms: i64,
}

/// FIFO of pending frames for one user.
#[derive(Debug, Default)]
struct UserQueue {
    entries: VecDeque<OfflineEntry>,
    bytes: usize,
    /// Set once the queue has been drained or evicted; writers must re-resolve.
    detached: bool,
}

impl UserQueue {
    fn prune_expired(&mut self, now_ms: i64) {
        while let Some(front) = self.entries.front() {
            if front.expires_at_ms > now_ms {
                break;
            }
            self.bytes -= front.frame.len();
            self.entries.pop_front();
        }
    }
}

/// Per-tenant bookkeeping: user queues plus recency order for eviction.
#[derive(Debug, Default)]
struct TenantBuffers {
    users: HashMap<String, (u64, Arc<Mutex<UserQueue>>)>,
    recency: BTreeMap<u64, String>,
    next_stamp: u64,
}

impl TenantBuffers {
    fn touch(&mut self, user_id: &str) -> Option<Arc<Mutex<UserQueue>>> {
        let stamp = self.next_stamp;
        let (old, queue) = {
            let entry = self.users.get_mut(user_id)?;
            let old = entry.0;
            entry.0 = stamp;
            (old, entry.1.clone())
        };
        self.next_stamp += 1;
        self.recency.remove(&old);
        self.recency.insert(stamp, user_id.to_string());
        Some(queue)
    }

    fn insert(&mut self, user_id: &str) -> Arc<Mutex<UserQueue>> {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        let queue = Arc::new(Mutex::new(UserQueue::default()));
        self.users
            .insert(user_id.to_string(), (stamp, queue.clone()));
        self.recency.insert(stamp, user_id.to_string());
        queue
    }

    fn remove(&mut self, user_id: &str) -> Option<Arc<Mutex<UserQueue>>> {
        let (stamp, queue) = self.users.remove(user_id)?;
        self.recency.remove(&stamp);
        Some(queue)
    }

    fn pop_least_recent(&mut self) -> Option<(String, Arc<Mutex<UserQueue>>)> {
        let (_, user) = self.recency.pop_first()?;
        let (_, queue) = self.users.remove(&user)?;
        Some((user, queue))
    }
}

/// Why a frame was not buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReject {
    FrameTooLarge,
    MessageCap,
    ByteCap,
}

impl OfflineReject {
    fn label(&self) -> &'static str {
        match self {
            OfflineReject::FrameTooLarge => "frame_too_large",
            OfflineReject::MessageCap => "message_cap",
            OfflineReject::ByteCap => "byte_cap",
        }
    }
}

/// Bounded per-user pending-message buffers with lazy TTL pruning and
/// least-recently-touched eviction of whole users within a tenant.
///
/// The tenant lock only guards bookkeeping; each user queue has its own lock
/// so unrelated users never contend on frame writes.
pub struct OfflineBufferStore<C: Clock> {
    limits: OfflineLimits,
    clock: C,
    metrics: Arc<MetricsRegistry>,
    tenants: Mutex<HashMap<String, Arc<Mutex<TenantBuffers>>>>,
}

impl<C: Clock> OfflineBufferStore<C> {
    pub fn new(limits: OfflineLimits, clock: C, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            limits,
            clock,
            metrics,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> OfflineLimits {
        self.limits
    }

    fn tenant(&self, tenant_id: &str) -> Arc<Mutex<TenantBuffers>> {
        self.tenants
            .lock()
            .entry(tenant_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_tenant(&self, tenant_id: &str) -> Option<Arc<Mutex<TenantBuffers>>> {
        self.tenants.lock().get(tenant_id).cloned()
    }

    /// Resolve (or create) the user's queue, evicting the least recently
    /// touched users when the tenant is at its user cap.
    fn resolve_queue(&self, tenant_id: &str, user_id: &str) -> Arc<Mutex<UserQueue>> {
        let tenant = self.tenant(tenant_id);
        let mut evicted = Vec::new();
        let queue = {
            let mut buffers = tenant.lock();
            match buffers.touch(user_id) {
                Some(queue) => queue,
                None => {
                    let cap = self.limits.max_users_per_tenant;
                    while cap > 0 && buffers.users.len() >= cap {
                        match buffers.pop_least_recent() {
                            Some(victim) => evicted.push(victim),
                            None => break,
                        }
                    }
                    buffers.insert(user_id)
                }
            }
        };
        for (victim, queue) in evicted {
            let mut q = queue.lock();
            q.detached = true;
            let dropped = q.entries.len();
            q.entries.clear();
            q.bytes = 0;
            drop(q);
            self.metrics.counter_inc(
                "courier_offline_evicted_users_total",
                1,
                &[("tenant", tenant_id)],
            );
            tracing::debug!(
                tenant = tenant_id,
                user = %victim,
                dropped,
                "evicted offline buffer under tenant user cap"
            );
        }
        queue
    }

    /// Buffer one frame. Rejects without mutating the queue when a cap would be exceeded.
    pub fn try_add(&self, tenant_id: &str, user_id: &str, frame: Bytes, ttl: Duration) -> bool {
        match self.add(tenant_id, user_id, frame, ttl) {
            Ok(()) => true,
            Err(reason) => {
                self.metrics.counter_inc(
                    "courier_offline_rejected_total",
                    1,
                    &[("tenant", tenant_id), ("reason", reason.label())],
                );
                false
            }
        }
    }

    pub fn add(
        &self,
        tenant_id: &str,
        user_id: &str,
        frame: Bytes,
        ttl: Duration,
    ) -> Result<(), OfflineReject> {
        let byte_cap = self.limits.max_bytes_per_user;
        let message_cap = self.limits.max_messages_per_user;
        if byte_cap > 0 && frame.len() > byte_cap {
            return Err(OfflineReject::FrameTooLarge);
        }
        let ttl = if ttl.is_zero() {
            self.limits.default_ttl
        } else {
            ttl
        };
        loop {
            let queue = self.resolve_queue(tenant_id, user_id);
            let mut q = queue.lock();
            if q.detached {
                continue;
            }
            let now = self.clock.unix_millis();
            q.prune_expired(now);
            if message_cap > 0 && q.entries.len() + 1 > message_cap {
                return Err(OfflineReject::MessageCap);
            }
            if byte_cap > 0 && q.bytes + frame.len() > byte_cap {
                return Err(OfflineReject::ByteCap);
            }
            q.bytes += frame.len();
            q.entries.push_back(OfflineEntry {
                frame,
                expires_at_ms: now + ttl.as_millis() as i64,
            });
            return Ok(());
        }
    }

    /// Remove and return the user's unexpired frames in insertion order.
    /// The user's bookkeeping is always removed.
    pub fn drain(&self, tenant_id: &str, user_id: &str) -> Vec<Bytes> {
        let Some(tenant) = self.existing_tenant(tenant_id) else {
            return Vec::new();
        };
        let queue = tenant.lock().remove(user_id);
        let Some(queue) = queue else {
            return Vec::new();
        };
        let mut q = queue.lock();
        q.detached = true;
        q.prune_expired(self.clock.unix_millis());
        q.bytes = 0;
        q.entries.drain(..).map(|e| e.frame).collect()
    }

    /// (messages, bytes) currently held for a user, for diagnostics and tests.
    pub fn user_usage(&self, tenant_id: &str, user_id: &str) -> Option<(usize, usize)> {
        let tenant = self.existing_tenant(tenant_id)?;
        let queue = tenant.lock().users.get(user_id).map(|(_, q)| q.clone())?;
        let q = queue.lock();
        Some((q.entries.len(), q.bytes))
    }

    pub fn users_in_tenant(&self, tenant_id: &str) -> usize {
        self.existing_tenant(tenant_id)
            .map(|t| t.lock().users.len())
            .unwrap_or(0)
    }
}
