//! Hook request and response bodies. Encoded with bincode on the wire.

use crate::messaging::MessageRequest;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tenant policy handed out by the auth hook and pinned to each session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRuntimeConfig {
    /// Base URL for check-message, group-members and offline-pull calls.
    #[serde(default)]
    pub hook_base_url: String,
    /// Zero means the node default.
    #[serde(default)]
    pub heartbeat_timeout_seconds: u64,
    /// Zero or negative means unlimited.
    #[serde(default)]
    pub tenant_max_connections: i64,
    #[serde(default)]
    pub user_max_connections: i64,
    /// Messages per second across the cluster. Zero or negative is unlimited.
    #[serde(default)]
    pub tenant_max_message_qps: i64,
    #[serde(default)]
    pub offline_buffer_ttl_seconds: u64,
    /// Announce offline messages to the hook instead of buffering them here.
    #[serde(default)]
    pub offline_use_hook_pull: bool,
    #[serde(default)]
    pub tenant_secret: String,
    #[serde(default)]
    pub hook_max_concurrency: Option<i64>,
    #[serde(default)]
    pub hook_queue_timeout_ms: Option<i64>,
    #[serde(default)]
    pub hook_breaker_failure_threshold: Option<i64>,
    #[serde(default)]
    pub hook_breaker_open_ms: Option<i64>,
    #[serde(default)]
    pub hook_sign_required: Option<bool>,
}

impl TenantRuntimeConfig {
    pub fn heartbeat_timeout(&self, default: Duration) -> Duration {
        if self.heartbeat_timeout_seconds == 0 {
            default
        } else {
            Duration::from_secs(self.heartbeat_timeout_seconds)
        }
    }

    /// Zero lets the offline store apply its own default.
    pub fn offline_ttl(&self) -> Duration {
        Duration::from_secs(self.offline_buffer_ttl_seconds)
    }

    pub fn tenant_secret(&self) -> Option<&str> {
        Some(self.tenant_secret.as_str()).filter(|s| !s.trim().is_empty())
    }
}

/// Envelope carried by every hook request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookMeta {
    pub tenant_id: String,
    pub request_id: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub sign: String,
    #[serde(default)]
    pub trace_id: String,
}

impl HookMeta {
    pub fn new(tenant_id: &str, timestamp_ms: i64, trace_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp_ms,
            sign: String::new(),
            trace_id: trace_id.to_string(),
        }
    }
}

/// A request body that carries a signable meta envelope.
pub trait HookRequest: Serialize + Clone {
    fn meta(&self) -> &HookMeta;
    fn meta_mut(&mut self) -> &mut HookMeta;
}

macro_rules! hook_request {
    ($($ty:ty),+ $(,)?) => {
        $(impl HookRequest for $ty {
            fn meta(&self) -> &HookMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut HookMeta {
                &mut self.meta
            }
        })+
    };
}

hook_request!(
    AuthRequest,
    CheckMessageRequest,
    GetGroupMembersRequest,
    GetOfflineMessagesRequest,
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub meta: HookMeta,
    pub token: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub ok: bool,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub config: Option<TenantRuntimeConfig>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckMessageRequest {
    pub meta: HookMeta,
    pub message: MessageRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckMessageResponse {
    pub allow: bool,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetGroupMembersRequest {
    pub meta: HookMeta,
    pub group_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetGroupMembersResponse {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOfflineMessagesRequest {
    pub meta: HookMeta,
    pub user_id: String,
    pub device_id: String,
    pub max_messages: u32,
    #[serde(default)]
    pub cursor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOfflineMessagesResponse {
    pub messages: Vec<MessageRequest>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: String,
}
