//! Chat frames exchanged with clients and forwarded between nodes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SingleChat,
    GroupChat,
}

impl MessageType {
    pub fn label(&self) -> &'static str {
        match self {
            MessageType::SingleChat => "single",
            MessageType::GroupChat => "group",
        }
    }
}

/// A chat message as submitted by a sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    pub msg_id: String,
    pub msg_type: MessageType,
    #[serde(default)]
    pub to_user_id: String,
    #[serde(default)]
    pub group_id: String,
    pub msg_body: Bytes,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAck {
    pub code: u16,
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    pub node_id: String,
    pub trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub msg_id: String,
    pub ok: bool,
    pub reason: String,
}

/// Frames written to a client socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    ConnectAck(ConnectAck),
    Delivery(MessageRequest),
    Ack(MessageAck),
    Error { code: u16, message: String },
}

#[derive(Debug, thiserror::Error)]
#[error("frame codec error: {0}")]
pub struct FrameError(String);

pub fn encode_frame(frame: &ServerFrame) -> Result<Bytes, FrameError> {
    bincode::serialize(frame)
        .map(Bytes::from)
        .map_err(|err| FrameError(err.to_string()))
}

pub fn decode_frame(bytes: &[u8]) -> Result<ServerFrame, FrameError> {
    bincode::deserialize(bytes).map_err(|err| FrameError(err.to_string()))
}

/// Serialize a delivery frame once so it can be shared across recipients.
pub fn encode_delivery(message: &MessageRequest) -> Result<Bytes, FrameError> {
    encode_frame(&ServerFrame::Delivery(message.clone()))
}

/// Protocol-level close codes; distinct so clients can pick a reconnect strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    AuthFailed,
    TenantInvalid,
    HeartbeatTimeout,
    ServerDraining,
    InvalidFrame,
    RateLimited,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::AuthFailed => 4001,
            CloseCode::TenantInvalid => 4002,
            CloseCode::HeartbeatTimeout => 4100,
            CloseCode::ServerDraining => 4200,
            CloseCode::InvalidFrame => 4400,
            CloseCode::RateLimited => 4429,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4001 => Some(CloseCode::AuthFailed),
            4002 => Some(CloseCode::TenantInvalid),
            4100 => Some(CloseCode::HeartbeatTimeout),
            4200 => Some(CloseCode::ServerDraining),
            4400 => Some(CloseCode::InvalidFrame),
            4429 => Some(CloseCode::RateLimited),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_frame_decodes_back_to_message() {
        let msg = MessageRequest {
            tenant_id: "t".into(),
            user_id: "alice".into(),
            device_id: "phone".into(),
            msg_id: "m1".into(),
            msg_type: MessageType::SingleChat,
            to_user_id: "bob".into(),
            group_id: String::new(),
            msg_body: Bytes::from_static(b"hi"),
            timestamp_ms: 42,
        };
        let bytes = encode_delivery(&msg).unwrap();
        assert_eq!(decode_frame(&bytes).unwrap(), ServerFrame::Delivery(msg));
    }

    #[test]
    fn close_codes_are_distinct() {
        let all = [
            CloseCode::AuthFailed,
            CloseCode::TenantInvalid,
            CloseCode::HeartbeatTimeout,
            CloseCode::ServerDraining,
            CloseCode::InvalidFrame,
            CloseCode::RateLimited,
        ];
        for code in all {
            assert_eq!(CloseCode::from_code(code.code()), Some(code));
        }
        assert_eq!(CloseCode::ServerDraining.code(), 4200);
        assert_eq!(CloseCode::from_code(1000), None);
    }
}
