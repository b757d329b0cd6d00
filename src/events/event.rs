use crate::hook::compute_payload_signature;
use crate::messaging::{ConnectAck, MessageRequest, MessageType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ConnectOnline,
    ConnectOffline,
    SingleChatMsg,
    GroupChatMsg,
    OfflineMessage,
}

impl EventType {
    pub fn label(&self) -> &'static str {
        match self {
            EventType::ConnectOnline => "connect_online",
            EventType::ConnectOffline => "connect_offline",
            EventType::SingleChatMsg => "single_chat_msg",
            EventType::GroupChatMsg => "group_chat_msg",
            EventType::OfflineMessage => "offline_message",
        }
    }
}

/// A record bound for the tenant's event topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub tenant_id: String,
    pub event_type: EventType,
    pub msg_id: String,
    pub user_id: String,
    pub device_id: String,
    pub to_user_id: String,
    pub group_id: String,
    /// bincode `ConnectAck` for connect events, bincode `MessageRequest` otherwise.
    pub event_data: Bytes,
    pub timestamp_ms: i64,
    pub node_id: String,
    pub trace_id: String,
    pub sign: String,
    /// Publish attempts made so far; not part of the payload.
    #[serde(skip)]
    pub attempt: u32,
    /// Set once main-topic attempts are exhausted.
    #[serde(skip)]
    pub to_dlq: bool,
}

impl DispatchEvent {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Bytes covered by `sign`.
    pub fn payload_for_sign(&self) -> Result<Vec<u8>, bincode::Error> {
        let mut unsigned = self.clone();
        unsigned.sign.clear();
        unsigned.encode()
    }
}

pub fn event_topic(tenant_id: &str) -> String {
    format!("courier-{tenant_id}-event")
}

pub fn dlq_topic(tenant_id: &str) -> String {
    format!("courier-{tenant_id}-event-dlq")
}

/// Builds events stamped with this node's id and signs them with the tenant
/// secret when one is known.
#[derive(Debug, Clone)]
pub struct EventFactory {
    node_id: String,
}

impl EventFactory {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_event(
        &self,
        event_type: EventType,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        trace_id: &str,
        timestamp_ms: i64,
        secret: Option<&str>,
    ) -> DispatchEvent {
        let ack = ConnectAck {
            code: 1000,
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            node_id: self.node_id.clone(),
            trace_id: trace_id.to_string(),
        };
        let event = DispatchEvent {
            tenant_id: tenant_id.to_string(),
            event_type,
            msg_id: String::new(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            to_user_id: String::new(),
            group_id: String::new(),
            event_data: bincode::serialize(&ack).map(Bytes::from).unwrap_or_default(),
            timestamp_ms,
            node_id: self.node_id.clone(),
            trace_id: trace_id.to_string(),
            sign: String::new(),
            attempt: 0,
            to_dlq: false,
        };
        sign_if_possible(event, secret)
    }

    pub fn connect_online(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        trace_id: &str,
        timestamp_ms: i64,
        secret: Option<&str>,
    ) -> DispatchEvent {
        self.connect_event(
            EventType::ConnectOnline,
            tenant_id,
            user_id,
            device_id,
            trace_id,
            timestamp_ms,
            secret,
        )
    }

    pub fn connect_offline(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        trace_id: &str,
        timestamp_ms: i64,
        secret: Option<&str>,
    ) -> DispatchEvent {
        self.connect_event(
            EventType::ConnectOffline,
            tenant_id,
            user_id,
            device_id,
            trace_id,
            timestamp_ms,
            secret,
        )
    }

    fn message_event(
        &self,
        event_type: EventType,
        message: &MessageRequest,
        to_user_id: &str,
        trace_id: &str,
        timestamp_ms: i64,
        secret: Option<&str>,
    ) -> DispatchEvent {
        let event = DispatchEvent {
            tenant_id: message.tenant_id.clone(),
            event_type,
            msg_id: message.msg_id.clone(),
            user_id: message.user_id.clone(),
            device_id: message.device_id.clone(),
            to_user_id: to_user_id.to_string(),
            group_id: message.group_id.clone(),
            event_data: bincode::serialize(message).map(Bytes::from).unwrap_or_default(),
            timestamp_ms,
            node_id: self.node_id.clone(),
            trace_id: trace_id.to_string(),
            sign: String::new(),
            attempt: 0,
            to_dlq: false,
        };
        sign_if_possible(event, secret)
    }

    /// SingleChatMsg or GroupChatMsg, by message type.
    pub fn for_message(
        &self,
        message: &MessageRequest,
        trace_id: &str,
        timestamp_ms: i64,
        secret: Option<&str>,
    ) -> DispatchEvent {
        let event_type = match message.msg_type {
            MessageType::SingleChat => EventType::SingleChatMsg,
            MessageType::GroupChat => EventType::GroupChatMsg,
        };
        self.message_event(event_type, message, &message.to_user_id, trace_id, timestamp_ms, secret)
    }

    /// Tells the hook that `to_user_id` has a message to pull later.
    pub fn offline_message_for(
        &self,
        message: &MessageRequest,
        to_user_id: &str,
        trace_id: &str,
        timestamp_ms: i64,
        secret: Option<&str>,
    ) -> DispatchEvent {
        self.message_event(
            EventType::OfflineMessage,
            message,
            to_user_id,
            trace_id,
            timestamp_ms,
            secret,
        )
    }
}

fn sign_if_possible(mut event: DispatchEvent, secret: Option<&str>) -> DispatchEvent {
    let Some(secret) = secret.filter(|s| !s.trim().is_empty()) else {
        return event;
    };
    let signed = event
        .payload_for_sign()
        .map_err(|err| err.to_string())
        .and_then(|payload| {
            compute_payload_signature(secret, &payload).map_err(|err| err.to_string())
        });
    match signed {
        Ok(sign) => event.sign = sign,
        Err(err) => {
            tracing::warn!(tenant = %event.tenant_id, "event sign failed: {err}");
        }
    }
    event
}
