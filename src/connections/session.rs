use crate::hook::TenantRuntimeConfig;
use crate::messaging::CloseCode;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Outbound writes for a client socket. The connection task owns the
/// receiving half and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Bytes),
    Close { code: u16, reason: String },
}

/// Sending handle to a client socket, shared by the registry and the
/// delivery paths.
#[derive(Debug, Clone)]
pub struct SessionSocket {
    tx: mpsc::Sender<Outbound>,
    open: Arc<AtomicBool>,
    /// Set when the close frame could not be queued; the connection task
    /// will never see it, so the heartbeat sweeper reaps the session.
    close_lost: Arc<AtomicBool>,
}

impl SessionSocket {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                open: Arc::new(AtomicBool::new(true)),
                close_lost: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue a frame without waiting. A full or closed socket drops the frame.
    pub fn try_send_frame(&self, frame: Bytes) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Mark the socket closed and ask the connection task to close it.
    /// Returns false if it was already closed.
    pub fn close(&self, code: CloseCode, reason: &str) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        let queued = self.tx.try_send(Outbound::Close {
            code: code.code(),
            reason: reason.to_string(),
        });
        if queued.is_err() {
            self.close_lost.store(true, Ordering::Release);
        }
        true
    }

    /// Closed, but nobody on the connection side will act on it.
    pub fn close_lost(&self) -> bool {
        self.close_lost.load(Ordering::Acquire)
    }
}

/// One live client connection on this node.
#[derive(Debug)]
pub struct ConnectionSession {
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    pub connection_id: String,
    pub trace_id: String,
    pub socket: SessionSocket,
    pub tenant_config: Arc<TenantRuntimeConfig>,
    last_seen_ms: AtomicI64,
    last_lease_renew_ms: AtomicI64,
}

impl ConnectionSession {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        socket: SessionSocket,
        tenant_config: Arc<TenantRuntimeConfig>,
        now_ms: i64,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            device_id: device_id.into(),
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            socket,
            tenant_config,
            last_seen_ms: AtomicI64::new(now_ms),
            last_lease_renew_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        let trace_id = trace_id.into();
        if !trace_id.is_empty() {
            self.trace_id = trace_id;
        }
        self
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Acquire)
    }

    pub fn last_lease_renew_ms(&self) -> i64 {
        self.last_lease_renew_ms.load(Ordering::Acquire)
    }

    /// Record inbound activity.
    pub fn touch(&self, now_ms: i64) {
        self.last_seen_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    pub fn mark_lease_renewed(&self, now_ms: i64) {
        self.last_lease_renew_ms.store(now_ms, Ordering::Release);
    }

    pub fn heartbeat_timeout(&self, default: Duration) -> Duration {
        self.tenant_config.heartbeat_timeout(default)
    }

    pub fn same_connection(&self, other: &ConnectionSession) -> bool {
        self.connection_id == other.connection_id
    }
}
