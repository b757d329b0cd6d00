//! Receiving side of node RPC.

use super::rpc::{
    decode_body, encode_body, BufferOfflineRequest, DrainOfflineRequest, DrainOfflineResponse,
    ForwardAck, ForwardBatchRequest, ForwardSingleRequest, NODE_TOKEN_HEADER,
    PATH_BUFFER_OFFLINE, PATH_DRAIN_OFFLINE, PATH_FORWARD_BATCH, PATH_FORWARD_SINGLE,
    RPC_CONTENT_TYPE,
};
use crate::connections::ConnectionRegistry;
use crate::messaging::{encode_delivery, MessageRequest, OfflineBufferStore};
use crate::ops::metrics::MetricsRegistry;
use crate::time::Clock;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct NodeGatewayService<C: Clock> {
    registry: Arc<ConnectionRegistry>,
    offline: Arc<OfflineBufferStore<C>>,
    metrics: Arc<MetricsRegistry>,
    cluster_token: Option<String>,
}

impl<C: Clock> NodeGatewayService<C> {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        offline: Arc<OfflineBufferStore<C>>,
        metrics: Arc<MetricsRegistry>,
        cluster_token: Option<String>,
    ) -> Self {
        Self {
            registry,
            offline,
            metrics,
            cluster_token: cluster_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.cluster_token else {
            return true;
        };
        let presented = headers
            .get(NODE_TOKEN_HEADER)
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        bool::from(presented.ct_eq(expected.as_bytes()))
    }

    fn delivery_frame(tenant_id: &str, message: &MessageRequest) -> Option<Bytes> {
        let mut message = message.clone();
        message.tenant_id = tenant_id.to_string();
        match encode_delivery(&message) {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::warn!(tenant = tenant_id, msg = %message.msg_id, "delivery encode failed: {err}");
                None
            }
        }
    }

    pub fn forward_single(&self, request: &ForwardSingleRequest) -> ForwardAck {
        let Some(frame) = Self::delivery_frame(&request.tenant_id, &request.message) else {
            return ForwardAck::rejected("encode failed");
        };
        let delivered = self
            .registry
            .send_to_user(&request.tenant_id, &request.to_user_id, &frame);
        self.metrics.counter_inc(
            "courier_deliveries_total",
            delivered as u64,
            &[("tenant", &request.tenant_id), ("via", "rpc_in_single")],
        );
        ForwardAck::accepted(delivered)
    }

    /// The frame is serialized once and shared by every recipient socket.
    pub fn forward_batch(&self, request: &ForwardBatchRequest) -> ForwardAck {
        let Some(frame) = Self::delivery_frame(&request.tenant_id, &request.message) else {
            return ForwardAck::rejected("encode failed");
        };
        let delivered: usize = request
            .to_user_ids
            .iter()
            .map(|user| self.registry.send_to_user(&request.tenant_id, user, &frame))
            .sum();
        self.metrics.counter_inc(
            "courier_deliveries_total",
            delivered as u64,
            &[("tenant", &request.tenant_id), ("via", "rpc_in_batch")],
        );
        ForwardAck::accepted(delivered)
    }

    pub fn buffer_offline(&self, request: &BufferOfflineRequest) -> ForwardAck {
        let ttl = Duration::from_secs(request.ttl_seconds);
        let tenant = request.tenant_id.as_str();
        if self
            .offline
            .try_add(tenant, &request.to_user_id, request.frame.clone(), ttl)
        {
            self.metrics.counter_inc(
                "courier_offline_buffered_total",
                1,
                &[("tenant", tenant), ("via", "rpc_in")],
            );
            ForwardAck::accepted(0)
        } else {
            self.metrics.counter_inc(
                "courier_offline_buffer_skipped_total",
                1,
                &[("tenant", tenant), ("via", "rpc_in")],
            );
            ForwardAck::rejected("offline buffer full")
        }
    }

    pub fn drain_offline(&self, request: &DrainOfflineRequest) -> DrainOfflineResponse {
        let frames = self.offline.drain(&request.tenant_id, &request.user_id);
        if !frames.is_empty() {
            self.metrics.counter_inc(
                "courier_offline_drained_total",
                frames.len() as u64,
                &[("tenant", &request.tenant_id), ("node", "home")],
            );
        }
        DrainOfflineResponse { frames }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(PATH_FORWARD_SINGLE, post(forward_single_handler::<C>))
            .route(PATH_FORWARD_BATCH, post(forward_batch_handler::<C>))
            .route(PATH_BUFFER_OFFLINE, post(buffer_offline_handler::<C>))
            .route(PATH_DRAIN_OFFLINE, post(drain_offline_handler::<C>))
            .with_state(self)
    }

    /// Serve node RPC until shutdown flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    }

    fn handle<Req, Resp>(&self, headers: &HeaderMap, body: &[u8], op: impl FnOnce(&Self, &Req) -> Resp) -> Response
    where
        Req: DeserializeOwned,
        Resp: Serialize,
    {
        if !self.authorize(headers) {
            self.metrics.counter_inc("courier_node_rpc_unauthorized_total", 1, &[]);
            tracing::warn!("node rpc rejected: bad cluster token");
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
        let request: Req = match decode_body(body) {
            Ok(request) => request,
            Err(err) => {
                return (StatusCode::BAD_REQUEST, format!("decode failed: {err}")).into_response();
            }
        };
        match encode_body(&op(self, &request)) {
            Ok(bytes) => ([(header::CONTENT_TYPE, RPC_CONTENT_TYPE)], bytes).into_response(),
            Err(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("encode failed: {err}")).into_response()
            }
        }
    }
}

async fn forward_single_handler<C: Clock>(
    State(service): State<Arc<NodeGatewayService<C>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    service.handle(&headers, &body, NodeGatewayService::forward_single)
}

async fn forward_batch_handler<C: Clock>(
    State(service): State<Arc<NodeGatewayService<C>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    service.handle(&headers, &body, NodeGatewayService::forward_batch)
}

async fn buffer_offline_handler<C: Clock>(
    State(service): State<Arc<NodeGatewayService<C>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    service.handle(&headers, &body, NodeGatewayService::buffer_offline)
}

async fn drain_offline_handler<C: Clock>(
    State(service): State<Arc<NodeGatewayService<C>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    service.handle(&headers, &body, NodeGatewayService::drain_offline)
}
