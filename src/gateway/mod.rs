//! Connection lifecycle and message entry points.
//!
//! `Gateway` ties the per-node components together: hook auth and admission
//! on connect, lease and route cleanup on disconnect, and validation,
//! policy check and delivery for every inbound message.

mod delivery;

pub use delivery::Delivery;

use crate::admission::{
    AdmissionOutcome, ConnectionAdmission, LeaseRequest, LeaseTarget, MessageRateLimiter,
};
use crate::cluster::{NodeInfo, OnlineDeviceRoute, RouteCache, RouteStore, StoreError};
use crate::config::{LimitsConfig, TenantConfig};
use crate::connections::{ConnectionRegistry, ConnectionSession, SessionSocket};
use crate::core::ShutdownState;
use crate::events::{EventDispatcher, EventFactory};
use crate::forwarding::{NodeForwarder, OfflineRouter};
use crate::hook::{HookClient, TenantRuntimeConfig};
use crate::messaging::{
    encode_frame, CloseCode, ConnectAck, MessageAck, MessageDeduplicator, MessageRequest,
    MessageType, ServerFrame,
};
use crate::ops::metrics::MetricsRegistry;
use crate::time::Clock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const CONNECT_ACK_OK: u16 = 1000;

/// Client handshake parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub tenant_id: String,
    pub token: String,
    pub device_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("server draining")]
    Draining,
    #[error("invalid tenant")]
    UnknownTenant,
    #[error("auth failed: {0}")]
    AuthDenied(String),
    #[error("duplicate device")]
    DuplicateDevice,
    #[error("admission denied: {0}")]
    AdmissionDenied(String),
    #[error("admission unavailable: {0}")]
    Store(#[from] StoreError),
}

impl ConnectError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            ConnectError::Draining => CloseCode::ServerDraining,
            ConnectError::UnknownTenant => CloseCode::TenantInvalid,
            ConnectError::AuthDenied(_) => CloseCode::AuthFailed,
            ConnectError::DuplicateDevice
            | ConnectError::AdmissionDenied(_)
            | ConnectError::Store(_) => CloseCode::RateLimited,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ConnectError::Draining => "draining",
            ConnectError::UnknownTenant => "tenant_invalid",
            ConnectError::AuthDenied(_) => "auth_failed",
            ConnectError::DuplicateDevice => "duplicate_device",
            ConnectError::AdmissionDenied(_) => "connection_limit",
            ConnectError::Store(_) => "store_error",
        }
    }
}

/// Everything a gateway needs, built by the runtime.
pub struct GatewayParts<C: Clock> {
    pub node: NodeInfo,
    pub limits: LimitsConfig,
    pub default_heartbeat_timeout: Duration,
    pub tenants: HashMap<String, TenantConfig>,
    pub clock: C,
    pub state: Arc<ShutdownState>,
    pub registry: Arc<ConnectionRegistry>,
    pub admission: Arc<dyn ConnectionAdmission>,
    pub routes: RouteStore,
    pub route_cache: Arc<dyn RouteCache>,
    pub hooks: Arc<HookClient<C>>,
    pub forwarder: Arc<NodeForwarder<C>>,
    pub offline: Arc<OfflineRouter<C>>,
    pub rate_limiter: Arc<MessageRateLimiter<C>>,
    pub events: EventDispatcher,
    pub metrics: Arc<MetricsRegistry>,
}

pub struct Gateway<C: Clock> {
    node: NodeInfo,
    limits: LimitsConfig,
    default_heartbeat_timeout: Duration,
    tenants: HashMap<String, TenantConfig>,
    clock: C,
    state: Arc<ShutdownState>,
    registry: Arc<ConnectionRegistry>,
    admission: Arc<dyn ConnectionAdmission>,
    routes: RouteStore,
    route_cache: Arc<dyn RouteCache>,
    hooks: Arc<HookClient<C>>,
    forwarder: Arc<NodeForwarder<C>>,
    offline: Arc<OfflineRouter<C>>,
    rate_limiter: Arc<MessageRateLimiter<C>>,
    events: EventDispatcher,
    factory: EventFactory,
    dedupe: MessageDeduplicator<C>,
    metrics: Arc<MetricsRegistry>,
}

impl<C: Clock> Gateway<C> {
    pub fn new(parts: GatewayParts<C>) -> Self {
        let dedupe = MessageDeduplicator::new(
            parts.clock.clone(),
            Duration::from_secs(parts.limits.dedup_ttl_seconds),
        );
        Self {
            factory: EventFactory::new(parts.node.node_id.clone()),
            dedupe,
            node: parts.node,
            limits: parts.limits,
            default_heartbeat_timeout: parts.default_heartbeat_timeout,
            tenants: parts.tenants,
            clock: parts.clock,
            state: parts.state,
            registry: parts.registry,
            admission: parts.admission,
            routes: parts.routes,
            route_cache: parts.route_cache,
            hooks: parts.hooks,
            forwarder: parts.forwarder,
            offline: parts.offline,
            rate_limiter: parts.rate_limiter,
            events: parts.events,
            metrics: parts.metrics,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Authenticate, admit and register a client. On rejection the socket is
    /// closed with the matching close code before the error is returned.
    pub async fn connect(
        &self,
        request: ConnectRequest,
        socket: SessionSocket,
    ) -> Result<Arc<ConnectionSession>, ConnectError> {
        let result = self.try_connect(&request, socket.clone()).await;
        let tenant = request.tenant_id.as_str();
        match &result {
            Ok(session) => {
                self.metrics
                    .counter_inc("courier_connects_total", 1, &[("tenant", tenant), ("result", "ok")]);
                tracing::info!(
                    tenant,
                    user = %session.user_id,
                    device = %session.device_id,
                    trace = %session.trace_id,
                    "client connected"
                );
            }
            Err(err) => {
                self.metrics.counter_inc(
                    "courier_connects_total",
                    1,
                    &[("tenant", tenant), ("result", err.label())],
                );
                tracing::info!(tenant, device = %request.device_id, "connect rejected: {err}");
                socket.close(err.close_code(), &err.to_string());
            }
        }
        result
    }

    async fn try_connect(
        &self,
        request: &ConnectRequest,
        socket: SessionSocket,
    ) -> Result<Arc<ConnectionSession>, ConnectError> {
        if self.state.is_draining() {
            return Err(ConnectError::Draining);
        }
        let tenant_id = request.tenant_id.as_str();
        let tenant = self
            .tenants
            .get(tenant_id)
            .filter(|_| !tenant_id.trim().is_empty())
            .ok_or(ConnectError::UnknownTenant)?;

        let trace_id = uuid::Uuid::new_v4().simple().to_string();
        let auth = self
            .hooks
            .auth(&tenant.auth_url, tenant_id, &request.token, &request.device_id, &trace_id)
            .await;
        let config = match auth.config {
            Some(config) if auth.ok && !auth.user_id.trim().is_empty() => config,
            _ => return Err(ConnectError::AuthDenied(auth.reason)),
        };
        let config = Arc::new(self.complete_tenant_config(tenant, config));

        let now = self.clock.unix_millis();
        let session = Arc::new(
            ConnectionSession::new(
                tenant_id,
                auth.user_id.clone(),
                request.device_id.clone(),
                socket,
                config.clone(),
                now,
            )
            .with_trace_id(trace_id),
        );
        if !self.registry.try_add(session.clone()) {
            return Err(ConnectError::DuplicateDevice);
        }

        let lease = LeaseRequest {
            tenant_id: tenant_id.to_string(),
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            route: OnlineDeviceRoute {
                node_id: self.node.node_id.clone(),
                endpoint: self.node.endpoint.clone(),
                connection_id: session.connection_id.clone(),
                online_at_ms: now,
            },
            heartbeat_timeout: session.heartbeat_timeout(self.default_heartbeat_timeout),
            tenant_max_connections: config.tenant_max_connections,
            user_max_connections: config.user_max_connections,
        };
        let admitted = match self.admission.register(&lease).await {
            Ok(AdmissionOutcome::Denied { reason }) => {
                self.metrics.counter_inc(
                    "courier_rate_limited_total",
                    1,
                    &[("tenant", tenant_id), ("kind", "connection_limit")],
                );
                Err(ConnectError::AdmissionDenied(reason))
            }
            Ok(_) => Ok(()),
            Err(err) => Err(ConnectError::Store(err)),
        };
        if let Err(err) = admitted {
            self.registry.try_remove_session(&session);
            return Err(err);
        }
        self.route_cache.invalidate(tenant_id, &session.user_id);
        self.update_connection_gauges(tenant_id);

        let ack = ServerFrame::ConnectAck(ConnectAck {
            code: CONNECT_ACK_OK,
            tenant_id: tenant_id.to_string(),
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            node_id: self.node.node_id.clone(),
            trace_id: session.trace_id.clone(),
        });
        self.write_frame(&session, &ack);

        self.events.try_enqueue(self.factory.connect_online(
            tenant_id,
            &session.user_id,
            &session.device_id,
            &session.trace_id,
            now,
            config.tenant_secret(),
        ));
        self.drain_offline_to(&session).await;
        Ok(session)
    }

    /// Fill gaps in the auth-provided config from static tenant settings.
    fn complete_tenant_config(
        &self,
        tenant: &TenantConfig,
        mut config: TenantRuntimeConfig,
    ) -> TenantRuntimeConfig {
        if config.hook_base_url.trim().is_empty() {
            config.hook_base_url = tenant.auth_url.clone();
        }
        if config.tenant_secret().is_none() {
            if let Some(secret) = tenant.hook_secret.as_deref().filter(|s| !s.trim().is_empty()) {
                config.tenant_secret = secret.to_string();
            }
        }
        config
    }

    /// Tear down a session after its socket closed. Safe to call more than
    /// once; a newer session for the same device is left untouched.
    pub async fn disconnect(&self, session: &ConnectionSession) {
        let removed = self.registry.try_remove_session(session);
        let target = LeaseTarget {
            tenant_id: session.tenant_id.clone(),
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            node_id: self.node.node_id.clone(),
            connection_id: session.connection_id.clone(),
        };
        if let Err(err) = self.admission.unregister(&target).await {
            tracing::warn!(tenant = %session.tenant_id, user = %session.user_id, "unregister failed: {err}");
        }
        self.route_cache.invalidate(&session.tenant_id, &session.user_id);
        if !removed {
            return;
        }
        self.update_connection_gauges(&session.tenant_id);
        self.events.try_enqueue(self.factory.connect_offline(
            &session.tenant_id,
            &session.user_id,
            &session.device_id,
            &session.trace_id,
            self.clock.unix_millis(),
            session.tenant_config.tenant_secret(),
        ));
        self.metrics.counter_inc(
            "courier_disconnects_total",
            1,
            &[("tenant", &session.tenant_id), ("node", &self.node.node_id)],
        );
        tracing::info!(
            tenant = %session.tenant_id,
            user = %session.user_id,
            device = %session.device_id,
            "client disconnected"
        );
    }

    /// Record inbound activity (any frame, including heartbeats).
    pub fn touch(&self, session: &ConnectionSession) {
        session.touch(self.clock.unix_millis());
    }

    /// Handle one inbound message and write the ack back to the sender.
    pub async fn send(&self, session: &ConnectionSession, message: MessageRequest) -> MessageAck {
        self.touch(session);
        let message = self.normalize(session, message);
        let ack = self.process(session, &message).await;
        self.write_frame(session, &ServerFrame::Ack(ack.clone()));
        ack
    }

    fn normalize(&self, session: &ConnectionSession, mut message: MessageRequest) -> MessageRequest {
        message.tenant_id = session.tenant_id.clone();
        message.user_id = session.user_id.clone();
        message.device_id = session.device_id.clone();
        if message.msg_id.trim().is_empty() {
            message.msg_id = uuid::Uuid::new_v4().simple().to_string();
        }
        if message.timestamp_ms == 0 {
            message.timestamp_ms = self.clock.unix_millis();
        }
        message
    }

    async fn process(&self, session: &ConnectionSession, message: &MessageRequest) -> MessageAck {
        let tenant = session.tenant_id.as_str();
        if let Err(reason) = self.validate(message) {
            self.metrics.counter_inc(
                "courier_messages_rejected_total",
                1,
                &[("tenant", tenant), ("reason", reason)],
            );
            return failed_ack(message, reason);
        }
        self.metrics.counter_inc(
            "courier_messages_in_total",
            1,
            &[("tenant", tenant), ("type", message.msg_type.label())],
        );
        if !self.dedupe.try_mark(tenant, &message.msg_id) {
            self.metrics
                .counter_inc("courier_dedup_hits_total", 1, &[("tenant", tenant)]);
            // Already accepted once; the sender most likely lost the first ack.
            return sent_ack(message, "duplicate");
        }
        if !self.within_message_rate(session).await {
            self.dedupe.forget(tenant, &message.msg_id);
            self.metrics.counter_inc(
                "courier_rate_limited_total",
                1,
                &[("tenant", tenant), ("kind", "message_qps")],
            );
            return failed_ack(message, "tenant qps limited");
        }

        let delivery = match message.msg_type {
            MessageType::SingleChat => self.deliver_single(session, message).await,
            MessageType::GroupChat => self.deliver_group(session, message).await,
        };
        if delivery.attempted {
            self.events.try_enqueue(self.factory.for_message(
                message,
                &session.trace_id,
                self.clock.unix_millis(),
                session.tenant_config.tenant_secret(),
            ));
        }
        if delivery.ok {
            sent_ack(message, "")
        } else {
            self.dedupe.forget(tenant, &message.msg_id);
            self.metrics
                .counter_inc("courier_messages_failed_total", 1, &[("tenant", tenant)]);
            failed_ack(message, &delivery.reason)
        }
    }

    /// A store outage lets the message through rather than stalling the tenant.
    async fn within_message_rate(&self, session: &ConnectionSession) -> bool {
        let tenant = session.tenant_id.as_str();
        match self
            .rate_limiter
            .try_consume(tenant, session.tenant_config.tenant_max_message_qps)
            .await
        {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(tenant, "message rate check failed: {err}");
                self.metrics.counter_inc(
                    "courier_rate_limit_errors_total",
                    1,
                    &[("tenant", tenant)],
                );
                true
            }
        }
    }

    fn validate(&self, message: &MessageRequest) -> Result<(), &'static str> {
        if self.limits.max_message_bytes > 0 && message.msg_body.len() > self.limits.max_message_bytes {
            return Err("msg_body_too_large");
        }
        match message.msg_type {
            MessageType::SingleChat if message.to_user_id.trim().is_empty() => {
                Err("missing to_user_id")
            }
            MessageType::GroupChat if message.group_id.trim().is_empty() => Err("missing group_id"),
            _ => Ok(()),
        }
    }

    fn write_frame(&self, session: &ConnectionSession, frame: &ServerFrame) {
        match encode_frame(frame) {
            Ok(bytes) => {
                if !session.socket.try_send_frame(bytes) {
                    self.metrics.counter_inc(
                        "courier_frames_dropped_total",
                        1,
                        &[("tenant", &session.tenant_id)],
                    );
                }
            }
            Err(err) => tracing::warn!(tenant = %session.tenant_id, "frame encode failed: {err}"),
        }
    }

    fn update_connection_gauges(&self, tenant_id: &str) {
        self.metrics.gauge_set(
            "courier_connections",
            self.registry.len() as i64,
            &[("node", &self.node.node_id)],
        );
        self.metrics.gauge_set(
            "courier_tenant_connections",
            self.registry.tenant_len(tenant_id) as i64,
            &[("tenant", tenant_id)],
        );
    }
}

fn sent_ack(message: &MessageRequest, reason: &str) -> MessageAck {
    MessageAck {
        msg_id: message.msg_id.clone(),
        ok: true,
        reason: reason.to_string(),
    }
}

fn failed_ack(message: &MessageRequest, reason: &str) -> MessageAck {
    MessageAck {
        msg_id: message.msg_id.clone(),
        ok: false,
        reason: reason.to_string(),
    }
}
