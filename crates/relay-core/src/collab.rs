//! Seams to the services the realtime layer consumes but does not own:
//! identity decoding, message persistence and channel membership.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RelayError;
use crate::ids::{ChannelId, UserId};

/// Decodes the bearer credential presented at handshake into a user id.
pub trait IdentityDecoder: Send + Sync {
    fn decode_identity(&self, token: &str) -> Result<UserId, RelayError>;
}

/// A stored chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: i64,
    pub sender_id: UserId,
    pub receiver_id: ChannelId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only chat message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist_message(
        &self,
        sender_id: &UserId,
        receiver_id: &ChannelId,
        content: &str,
    ) -> Result<MessageRecord, RelayError>;

    /// Page of a channel's history, oldest first.
    /// `before_id` restricts to messages with a smaller id.
    async fn history(
        &self,
        receiver_id: &ChannelId,
        before_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, RelayError>;
}

/// Channel membership lookup, consulted before a subscription is recorded.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    async fn is_member(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<bool, RelayError>;
}

/// Lets every authenticated user subscribe to any channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllChannels;

#[async_trait]
impl ChannelAuthorizer for AllowAllChannels {
    async fn is_member(&self, _user_id: &UserId, _channel_id: &ChannelId) -> Result<bool, RelayError> {
        Ok(true)
    }
}
