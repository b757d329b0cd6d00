//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Allocating ephemeral ports
//! - Running a scripted tenant hook over HTTP
//! - Building node configurations and multi-node clusters on one store
//! - Connecting in-process client sockets and reading their frames

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use axum::body::Bytes as Body;
use axum::extract::State;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use courier::cluster::{InMemoryStore, KvStore, NodeDirectory};
use courier::config::Config;
use courier::connections::{ConnectionSession, Outbound, SessionSocket};
use courier::gateway::{ConnectRequest, Gateway};
use courier::hook::wire::{
    AuthRequest, AuthResponse, CheckMessageRequest, CheckMessageResponse, GetGroupMembersRequest,
    GetGroupMembersResponse, GetOfflineMessagesRequest, GetOfflineMessagesResponse,
};
use courier::hook::TenantRuntimeConfig;
use courier::messaging::{decode_frame, MessageRequest, MessageType, ServerFrame};
use courier::runtime::Runtime;
use courier::time::SystemClock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const TENANT: &str = "acme";
pub const HOOK_SECRET: &str = "s3cret";

/// Allocate an ephemeral loopback port. Returns the address with assigned port.
pub fn ephemeral_port() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("ephemeral addr")
}

/// Behaviour of the scripted hook. Tokens are `tok:<user>`.
#[derive(Default)]
pub struct HookScript {
    pub runtime: TenantRuntimeConfig,
    pub groups: HashMap<String, Vec<String>>,
    /// Message bodies the check-message hook rejects.
    pub blocked_bodies: Vec<Bytes>,
    /// Messages served by the offline-pull hook, keyed by user.
    pub offline: HashMap<String, Vec<MessageRequest>>,
}

#[derive(Clone, Default)]
pub struct MockHook {
    pub script: Arc<Mutex<HookScript>>,
    pub checks: Arc<AtomicUsize>,
    pub base_url: String,
}

impl MockHook {
    pub async fn spawn(script: HookScript) -> Self {
        let mut hook = MockHook {
            script: Arc::new(Mutex::new(script)),
            checks: Arc::new(AtomicUsize::new(0)),
            base_url: String::new(),
        };
        let router = Router::new()
            .route("/auth", post(auth))
            .route("/check-message", post(check_message))
            .route("/get-group-members", post(group_members))
            .route("/get-offline-messages", post(offline_messages))
            .with_state(hook.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind hook");
        let addr = listener.local_addr().expect("hook addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("hook server");
        });
        hook.base_url = format!("http://{addr}");
        hook
    }

    pub fn check_calls(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

async fn auth(State(hook): State<MockHook>, body: Body) -> Vec<u8> {
    let request: AuthRequest = bincode::deserialize(&body).expect("auth request");
    let response = match request.token.strip_prefix("tok:") {
        Some(user) if !user.is_empty() => AuthResponse {
            ok: true,
            user_id: user.to_string(),
            device_id: request.device_id,
            config: Some(hook.script.lock().runtime.clone()),
            reason: String::new(),
        },
        _ => AuthResponse {
            ok: false,
            reason: "bad token".into(),
            ..AuthResponse::default()
        },
    };
    bincode::serialize(&response).expect("auth response")
}

async fn check_message(State(hook): State<MockHook>, body: Body) -> Vec<u8> {
    hook.checks.fetch_add(1, Ordering::SeqCst);
    let request: CheckMessageRequest = bincode::deserialize(&body).expect("check request");
    let blocked = hook
        .script
        .lock()
        .blocked_bodies
        .contains(&request.message.msg_body);
    let response = CheckMessageResponse {
        allow: !blocked,
        reason: if blocked { "blocked word".into() } else { String::new() },
    };
    bincode::serialize(&response).expect("check response")
}

async fn group_members(State(hook): State<MockHook>, body: Body) -> Vec<u8> {
    let request: GetGroupMembersRequest = bincode::deserialize(&body).expect("group request");
    let user_ids = hook
        .script
        .lock()
        .groups
        .get(&request.group_id)
        .cloned()
        .unwrap_or_default();
    bincode::serialize(&GetGroupMembersResponse { user_ids }).expect("group response")
}

async fn offline_messages(State(hook): State<MockHook>, body: Body) -> Vec<u8> {
    let request: GetOfflineMessagesRequest = bincode::deserialize(&body).expect("offline request");
    let messages = hook
        .script
        .lock()
        .offline
        .remove(&request.user_id)
        .unwrap_or_default();
    let response = GetOfflineMessagesResponse {
        messages,
        has_more: false,
        next_cursor: String::new(),
    };
    bincode::serialize(&response).expect("offline response")
}

/// Node config bound to loopback with the tenant pointed at `hook_url`.
pub fn node_config(node_id: &str, hook_url: &str) -> Config {
    let rpc = ephemeral_port();
    let doc = format!(
        r#"
[node]
node_id = "{node_id}"
public_endpoint = "http://{rpc}"
rpc_bind = "{rpc}"
snapshot_refresh_ms = 100

[store]
connection_string = "memory://"

[telemetry]
log_level = "warn"

[route_cache]
ttl_ms = 0

[drain]
timeout_seconds = 2

[tenants.{TENANT}]
auth_url = "{hook_url}"
hook_secret = "{HOOK_SECRET}"
"#
    );
    toml::from_str(&doc).expect("test config")
}

/// Started nodes sharing one store, each aware of the others.
pub struct Cluster {
    pub store: Arc<dyn KvStore>,
    pub nodes: Vec<Runtime<SystemClock>>,
}

impl Cluster {
    pub async fn start(ids: &[&str], hook: &MockHook) -> Self {
        Self::start_with(ids, hook, |_| {}).await
    }

    pub async fn start_with(ids: &[&str], hook: &MockHook, tweak: impl Fn(&mut Config)) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new(SystemClock));
        let mut nodes = Vec::new();
        for id in ids {
            let mut config = node_config(id, &hook.base_url);
            tweak(&mut config);
            let mut runtime = Runtime::with_store(config, SystemClock, store.clone(), None)
                .expect("build runtime");
            runtime.start().await.expect("start runtime");
            nodes.push(runtime);
        }
        let cluster = Cluster { store, nodes };
        cluster.refresh_snapshots().await;
        cluster
    }

    /// Make every node see the current directory without waiting a refresh tick.
    pub async fn refresh_snapshots(&self) {
        let live = NodeDirectory::new(self.store.clone())
            .live_nodes()
            .await
            .expect("live nodes");
        for node in &self.nodes {
            node.snapshot().replace(live.clone());
        }
    }

    pub fn gateway(&self, index: usize) -> Arc<Gateway<SystemClock>> {
        self.nodes[index].gateway()
    }

    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            let _ = node.shutdown().await;
        }
    }
}

/// An in-process client: the registered session plus its outbound queue.
pub struct TestClient {
    pub session: Arc<ConnectionSession>,
    pub rx: mpsc::Receiver<Outbound>,
}

impl TestClient {
    /// Next frame, skipping nothing; panics after a short wait.
    pub async fn next_frame(&mut self) -> ServerFrame {
        match tokio::time::timeout(Duration::from_secs(3), self.rx.recv()).await {
            Ok(Some(Outbound::Frame(bytes))) => decode_frame(&bytes).expect("decode frame"),
            Ok(Some(Outbound::Close { code, reason })) => {
                panic!("unexpected close {code}: {reason}")
            }
            Ok(None) => panic!("socket closed"),
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }

    pub async fn next_delivery(&mut self) -> MessageRequest {
        match self.next_frame().await {
            ServerFrame::Delivery(message) => message,
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    /// Frames already queued, without waiting.
    pub fn queued(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            out.push(item);
        }
        out
    }

    pub async fn expect_close(&mut self) -> (u16, String) {
        expect_close(&mut self.rx).await
    }
}

/// Wait for a close on a raw socket receiver, skipping frames.
pub async fn expect_close(rx: &mut mpsc::Receiver<Outbound>) -> (u16, String) {
    loop {
        match tokio::time::timeout(Duration::from_secs(3), rx.recv()).await {
            Ok(Some(Outbound::Close { code, reason })) => return (code, reason),
            Ok(Some(Outbound::Frame(_))) => continue,
            Ok(None) => panic!("socket dropped without close"),
            Err(_) => panic!("timed out waiting for close"),
        }
    }
}

pub fn request(user: &str, device: &str) -> ConnectRequest {
    ConnectRequest {
        tenant_id: TENANT.to_string(),
        token: format!("tok:{user}"),
        device_id: device.to_string(),
    }
}

/// Connect and consume the connect ack.
pub async fn connect(gateway: &Gateway<SystemClock>, user: &str, device: &str) -> TestClient {
    let (socket, rx) = SessionSocket::channel(64);
    let session = gateway
        .connect(request(user, device), socket)
        .await
        .unwrap_or_else(|err| panic!("connect {user}/{device}: {err}"));
    let mut client = TestClient { session, rx };
    match client.next_frame().await {
        ServerFrame::ConnectAck(ack) => assert_eq!(ack.user_id, user),
        other => panic!("expected connect ack, got {other:?}"),
    }
    client
}

pub fn single(to: &str, msg_id: &str, body: &'static [u8]) -> MessageRequest {
    MessageRequest {
        tenant_id: String::new(),
        user_id: String::new(),
        device_id: String::new(),
        msg_id: msg_id.to_string(),
        msg_type: MessageType::SingleChat,
        to_user_id: to.to_string(),
        group_id: String::new(),
        msg_body: Bytes::from_static(body),
        timestamp_ms: 0,
    }
}

pub fn group(group_id: &str, msg_id: &str, body: &'static [u8]) -> MessageRequest {
    MessageRequest {
        msg_type: MessageType::GroupChat,
        to_user_id: String::new(),
        group_id: group_id.to_string(),
        ..single("", msg_id, body)
    }
}
