use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use relay_core::ids::{ChannelId, UserId};
use relay_core::RelayError;
use tracing::debug;

use crate::redis_conn::broker_error;

/// Shared channel → user-id membership. Every process sees every change.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Add `user_id` to the channel. Idempotent.
    async fn subscribe(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<(), RelayError>;

    /// Remove `user_id` from the channel. Returns whether it was a member.
    async fn unsubscribe(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<bool, RelayError>;

    /// Current members; empty when nobody subscribed.
    async fn members(&self, channel_id: &ChannelId) -> Result<HashSet<UserId>, RelayError>;
}

pub fn subscribers_key(channel_id: &ChannelId) -> String {
    format!("subscribers:channel:{channel_id}")
}

/// One Redis SET per channel.
#[derive(Clone)]
pub struct RedisSubscriptionStore {
    conn: ConnectionManager,
}

impl RedisSubscriptionStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SubscriptionStore for RedisSubscriptionStore {
    async fn subscribe(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .sadd(subscribers_key(channel_id), user_id.as_str())
            .await
            .map_err(broker_error)?;
        debug!(user_id = %user_id, channel_id = %channel_id, added, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<bool, RelayError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .srem(subscribers_key(channel_id), user_id.as_str())
            .await
            .map_err(broker_error)?;
        Ok(removed > 0)
    }

    async fn members(&self, channel_id: &ChannelId) -> Result<HashSet<UserId>, RelayError> {
        let mut conn = self.conn.clone();
        let members: HashSet<String> = conn
            .smembers(subscribers_key(channel_id))
            .await
            .map_err(broker_error)?;
        Ok(members.into_iter().map(UserId::from).collect())
    }
}

/// Process-local store for tests and single-instance runs. Can be switched
/// offline to exercise connectivity failures.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    channels: Mutex<HashMap<ChannelId, HashSet<UserId>>>,
    offline: AtomicBool,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of channels with at least one member.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    fn check_online(&self) -> Result<(), RelayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RelayError::BrokerUnavailable("subscription store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn subscribe(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<(), RelayError> {
        self.check_online()?;
        self.channels
            .lock()
            .entry(channel_id.clone())
            .or_default()
            .insert(user_id.clone());
        Ok(())
    }

    async fn unsubscribe(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<bool, RelayError> {
        self.check_online()?;
        let mut channels = self.channels.lock();
        let Some(members) = channels.get_mut(channel_id) else {
            return Ok(false);
        };
        let removed = members.remove(user_id);
        if members.is_empty() {
            channels.remove(channel_id);
        }
        Ok(removed)
    }

    async fn members(&self, channel_id: &ChannelId) -> Result<HashSet<UserId>, RelayError> {
        self.check_online()?;
        Ok(self
            .channels
            .lock()
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(id: &str) -> UserId {
        UserId::from(id)
    }

    fn c(id: &str) -> ChannelId {
        ChannelId::from(id)
    }

    #[test]
    fn key_layout() {
        assert_eq!(subscribers_key(&c("42")), "subscribers:channel:42");
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let store = MemorySubscriptionStore::new();
        store.subscribe(&u("1"), &c("42")).await.unwrap();
        store.subscribe(&u("1"), &c("42")).await.unwrap();
        let members = store.members(&c("42")).await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains(&u("1")));
    }

    #[tokio::test]
    async fn unsubscribe_absent_is_not_an_error() {
        let store = MemorySubscriptionStore::new();
        assert!(!store.unsubscribe(&u("1"), &c("42")).await.unwrap());
        store.subscribe(&u("1"), &c("42")).await.unwrap();
        assert!(store.unsubscribe(&u("1"), &c("42")).await.unwrap());
        assert!(!store.unsubscribe(&u("1"), &c("42")).await.unwrap());
    }

    #[tokio::test]
    async fn members_of_unknown_channel_is_empty() {
        let store = MemorySubscriptionStore::new();
        assert!(store.members(&c("nobody")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn final_membership_follows_last_call() {
        // Arbitrary interleavings; only the last call decides membership.
        let sequences: [&[bool]; 5] = [
            &[true],
            &[true, false],
            &[false, false, true],
            &[true, true, false, true],
            &[true, false, true, false, false],
        ];
        for seq in sequences {
            let store = MemorySubscriptionStore::new();
            for &sub in seq {
                if sub {
                    store.subscribe(&u("1"), &c("42")).await.unwrap();
                } else {
                    store.unsubscribe(&u("1"), &c("42")).await.unwrap();
                }
            }
            let expected = *seq.last().unwrap();
            let is_member = store.members(&c("42")).await.unwrap().contains(&u("1"));
            assert_eq!(is_member, expected, "sequence {seq:?}");
        }
    }

    #[tokio::test]
    async fn empty_channels_are_dropped() {
        let store = MemorySubscriptionStore::new();
        store.subscribe(&u("1"), &c("42")).await.unwrap();
        assert_eq!(store.channel_count(), 1);
        store.unsubscribe(&u("1"), &c("42")).await.unwrap();
        assert_eq!(store.channel_count(), 0);
    }

    #[tokio::test]
    async fn offline_store_reports_broker_unavailable() {
        let store = MemorySubscriptionStore::new();
        store.set_offline(true);
        let err = store.subscribe(&u("1"), &c("42")).await.unwrap_err();
        assert_eq!(err.error_kind(), "broker_unavailable");
        assert!(store.members(&c("42")).await.is_err());

        store.set_offline(false);
        store.subscribe(&u("1"), &c("42")).await.unwrap();
    }
}
