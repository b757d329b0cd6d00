use super::registry::ConnectionRegistry;
use crate::admission::{ConnectionAdmission, LeaseTarget};
use crate::core::ShutdownState;
use crate::messaging::CloseCode;
use crate::ops::metrics::MetricsRegistry;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Sessions torn down concurrently while draining.
const DRAIN_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub sessions: usize,
    pub completed: bool,
}

/// Evicts every local session on shutdown so clients reconnect elsewhere.
pub struct ShutdownDrainService {
    node_id: String,
    timeout: Duration,
    state: Arc<ShutdownState>,
    registry: Arc<ConnectionRegistry>,
    admission: Arc<dyn ConnectionAdmission>,
    metrics: Arc<MetricsRegistry>,
}

impl ShutdownDrainService {
    pub fn new(
        node_id: impl Into<String>,
        timeout: Duration,
        state: Arc<ShutdownState>,
        registry: Arc<ConnectionRegistry>,
        admission: Arc<dyn ConnectionAdmission>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            timeout,
            state,
            registry,
            admission,
            metrics,
        }
    }

    /// Flip the drain flag, then unregister and close every session within
    /// one shared deadline. Sessions left when it expires are abandoned.
    pub async fn drain(&self) -> DrainReport {
        self.state.begin_drain();
        let mut sessions = self.registry.rent();
        self.registry.copy_all_sessions(&mut sessions);
        if sessions.is_empty() {
            return DrainReport {
                sessions: 0,
                completed: true,
            };
        }
        let total = sessions.len();
        tracing::warn!(node = %self.node_id, sessions = total, "shutdown drain begin");

        let teardown = stream::iter(sessions.iter()).for_each_concurrent(
            DRAIN_CONCURRENCY,
            |session| async move {
                let target = LeaseTarget {
                    tenant_id: session.tenant_id.clone(),
                    user_id: session.user_id.clone(),
                    device_id: session.device_id.clone(),
                    node_id: self.node_id.clone(),
                    connection_id: session.connection_id.clone(),
                };
                // Unregister first so peers stop forwarding here.
                if let Err(err) = self.admission.unregister(&target).await {
                    tracing::debug!(tenant = %session.tenant_id, "drain unregister failed: {err}");
                }
                session
                    .socket
                    .close(CloseCode::ServerDraining, "server draining");
            },
        );
        let completed = if self.timeout.is_zero() {
            teardown.await;
            true
        } else {
            tokio::time::timeout(self.timeout, teardown).await.is_ok()
        };
        if !completed {
            tracing::warn!(node = %self.node_id, "shutdown drain deadline reached");
        }
        self.metrics
            .counter_inc("courier_shutdown_drain_total", 1, &[("node", &self.node_id)]);
        tracing::warn!(node = %self.node_id, completed, "shutdown drain done");
        DrainReport {
            sessions: total,
            completed,
        }
    }
}
