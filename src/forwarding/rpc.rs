//! Node-to-node RPC envelopes. Bodies are bincode over HTTP POST.

use crate::messaging::MessageRequest;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const NODE_TOKEN_HEADER: &str = "x-courier-node-token";
pub const RPC_CONTENT_TYPE: &str = "application/octet-stream";

pub const PATH_FORWARD_SINGLE: &str = "/rpc/forward-single";
pub const PATH_FORWARD_BATCH: &str = "/rpc/forward-batch";
pub const PATH_BUFFER_OFFLINE: &str = "/rpc/buffer-offline";
pub const PATH_DRAIN_OFFLINE: &str = "/rpc/drain-offline";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSingleRequest {
    pub tenant_id: String,
    pub to_user_id: String,
    pub message: MessageRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardBatchRequest {
    pub tenant_id: String,
    pub to_user_ids: Vec<String>,
    pub message: MessageRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferOfflineRequest {
    pub tenant_id: String,
    pub to_user_id: String,
    /// Pre-serialized delivery frame.
    pub frame: Bytes,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainOfflineRequest {
    pub tenant_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardAck {
    pub ok: bool,
    #[serde(default)]
    pub reason: String,
    /// Sockets the frame was written to on the receiving node.
    #[serde(default)]
    pub delivered: u32,
}

impl ForwardAck {
    pub fn accepted(delivered: usize) -> Self {
        Self {
            ok: true,
            reason: String::new(),
            delivered: u32::try_from(delivered).unwrap_or(u32::MAX),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            delivered: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainOfflineResponse {
    pub frames: Vec<Bytes>,
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
