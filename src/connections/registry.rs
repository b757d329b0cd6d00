//! Authoritative map of live sessions on this node.
//!
//! Every mutation goes through one registry-wide lock. Snapshots are copied
//! into pooled buffers so heartbeat sweeps and fanout do not allocate per call.

use super::session::ConnectionSession;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Buffers larger than this are dropped instead of returned to the pool.
const MAX_RETAINED_CAPACITY: usize = 64;
const MAX_POOLED_BUFFERS: usize = 256;

type DeviceMap = HashMap<String, Arc<ConnectionSession>>;

#[derive(Default)]
struct RegistryInner {
    // tenant -> user -> device -> session
    tenants: HashMap<String, HashMap<String, DeviceMap>>,
    len: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    pool: Mutex<Vec<Vec<Arc<ConnectionSession>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a session already exists for the (tenant, user, device) key.
    pub fn try_add(&self, session: Arc<ConnectionSession>) -> bool {
        let mut inner = self.inner.lock();
        let devices = inner
            .tenants
            .entry(session.tenant_id.clone())
            .or_default()
            .entry(session.user_id.clone())
            .or_default();
        if devices.contains_key(&session.device_id) {
            return false;
        }
        devices.insert(session.device_id.clone(), session);
        inner.len += 1;
        true
    }

    pub fn try_get(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Option<Arc<ConnectionSession>> {
        self.inner
            .lock()
            .tenants
            .get(tenant_id)?
            .get(user_id)?
            .get(device_id)
            .cloned()
    }

    pub fn try_remove(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Option<Arc<ConnectionSession>> {
        let mut inner = self.inner.lock();
        let removed = Self::remove_locked(&mut inner, tenant_id, user_id, device_id, None);
        if removed.is_some() {
            inner.len -= 1;
        }
        removed
    }

    /// Remove only if the registered session is this exact connection, so a
    /// late disconnect cannot evict a newer session for the same device.
    pub fn try_remove_session(&self, session: &ConnectionSession) -> bool {
        let mut inner = self.inner.lock();
        let removed = Self::remove_locked(
            &mut inner,
            &session.tenant_id,
            &session.user_id,
            &session.device_id,
            Some(&session.connection_id),
        );
        if removed.is_some() {
            inner.len -= 1;
            true
        } else {
            false
        }
    }

    fn remove_locked(
        inner: &mut RegistryInner,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        connection_id: Option<&str>,
    ) -> Option<Arc<ConnectionSession>> {
        let users = inner.tenants.get_mut(tenant_id)?;
        let devices = users.get_mut(user_id)?;
        if let Some(expected) = connection_id {
            if devices.get(device_id)?.connection_id != expected {
                return None;
            }
        }
        let removed = devices.remove(device_id);
        if devices.is_empty() {
            users.remove(user_id);
            if users.is_empty() {
                inner.tenants.remove(tenant_id);
            }
        }
        removed
    }

    pub fn copy_all_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        out: &mut Vec<Arc<ConnectionSession>>,
    ) {
        out.clear();
        let inner = self.inner.lock();
        if let Some(devices) = inner
            .tenants
            .get(tenant_id)
            .and_then(|users| users.get(user_id))
        {
            out.extend(devices.values().cloned());
        }
    }

    pub fn copy_all_sessions(&self, out: &mut Vec<Arc<ConnectionSession>>) {
        out.clear();
        let inner = self.inner.lock();
        out.reserve(inner.len);
        for users in inner.tenants.values() {
            for devices in users.values() {
                out.extend(devices.values().cloned());
            }
        }
    }

    /// Write a pre-serialized frame to every open socket of a user. Returns
    /// how many sockets accepted it.
    pub fn send_to_user(&self, tenant_id: &str, user_id: &str, frame: &Bytes) -> usize {
        let mut sessions = self.rent();
        self.copy_all_for_user(tenant_id, user_id, &mut sessions);
        sessions
            .iter()
            .filter(|s| s.socket.try_send_frame(frame.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tenant_len(&self, tenant_id: &str) -> usize {
        self.inner
            .lock()
            .tenants
            .get(tenant_id)
            .map(|users| users.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    /// Borrow a cleared buffer from the pool; it is returned on drop.
    pub fn rent(&self) -> SessionBuffer<'_> {
        let buf = self.pool.lock().pop().unwrap_or_else(|| Vec::with_capacity(8));
        SessionBuffer {
            buf,
            registry: self,
        }
    }

    fn give_back(&self, mut buf: Vec<Arc<ConnectionSession>>) {
        buf.clear();
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut pool = self.pool.lock();
        if pool.len() < MAX_POOLED_BUFFERS {
            pool.push(buf);
        }
    }
}

pub struct SessionBuffer<'a> {
    buf: Vec<Arc<ConnectionSession>>,
    registry: &'a ConnectionRegistry,
}

impl Deref for SessionBuffer<'_> {
    type Target = Vec<Arc<ConnectionSession>>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for SessionBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for SessionBuffer<'_> {
    fn drop(&mut self) {
        self.registry.give_back(std::mem::take(&mut self.buf));
    }
}
