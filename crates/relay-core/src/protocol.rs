//! Wire types for the realtime WebSocket protocol.
//!
//! Inbound frames are `{ "action", "receiver_id", "content"? }`. Outbound
//! frames are either an [`Ack`] addressed to the originating connection or a
//! [`RelayEvent`] fanned out to channel subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RelayError;
use crate::ids::{ChannelId, UserId};

/// Raw inbound frame before validation.
#[derive(Debug, Default, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    receiver_id: Option<Value>,
    #[serde(default)]
    content: Option<String>,
}

/// A validated client action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Subscribe { channel_id: ChannelId },
    Unsubscribe { channel_id: ChannelId },
    Message { channel_id: ChannelId, content: String },
}

impl Action {
    /// Decode one text frame. Blank frames yield `Ok(None)` and are skipped.
    pub fn parse(raw: &str) -> Result<Option<Self>, RelayError> {
        if raw.trim().is_empty() {
            return Ok(None);
        }

        let frame: InboundFrame =
            serde_json::from_str(raw).map_err(|_| RelayError::protocol("Invalid JSON"))?;

        let action = frame.action.filter(|a| !a.trim().is_empty());
        let channel_id = frame.receiver_id.as_ref().and_then(channel_from_value);
        let (Some(action), Some(channel_id)) = (action, channel_id) else {
            return Err(RelayError::protocol("Missing action or channel_id"));
        };

        match action.as_str() {
            "subscribe" => Ok(Some(Self::Subscribe { channel_id })),
            "unsubscribe" => Ok(Some(Self::Unsubscribe { channel_id })),
            "message" => {
                let content = frame
                    .content
                    .ok_or_else(|| RelayError::protocol("Missing content"))?;
                Ok(Some(Self::Message { channel_id, content }))
            }
            other => Err(RelayError::protocol(format!("Unknown action: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Message { .. } => "message",
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Self::Subscribe { channel_id }
            | Self::Unsubscribe { channel_id }
            | Self::Message { channel_id, .. } => channel_id,
        }
    }
}

/// Clients send numeric ids for one-to-one chats and strings for groups.
fn channel_from_value(value: &Value) -> Option<ChannelId> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(ChannelId::from_raw(s.clone())),
        Value::Number(n) => Some(ChannelId::from_raw(n.to_string())),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Acknowledgment sent to the connection that issued an action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
    pub detail: String,
}

impl Ack {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Success,
            detail: detail.into(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            detail: detail.into(),
        }
    }

    pub fn subscribed(channel_id: &ChannelId) -> Self {
        Self::success(format!(
            "Subscribed to {channel_id}. Ready for real-time updates."
        ))
    }

    pub fn unsubscribed(channel_id: &ChannelId) -> Self {
        Self::success(format!("Unsubscribed from {channel_id}."))
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }
}

impl From<&RelayError> for Ack {
    fn from(err: &RelayError) -> Self {
        Self::error(err.to_string())
    }
}

/// Event published on the broker and delivered to channel subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayEvent {
    #[serde(rename = "new_message")]
    NewMessage {
        sender_id: UserId,
        content: String,
        receiver_id: ChannelId,
        /// ISO 8601, assigned by the server when the message was stored.
        created_at: String,
    },
}

impl RelayEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Self::NewMessage { receiver_id, .. } => receiver_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
        }
    }
}
