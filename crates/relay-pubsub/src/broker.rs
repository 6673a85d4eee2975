use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use relay_core::RelayError;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::redis_conn::{broker_error, REDIS_TIMEOUT};
use crate::topic::pattern_matches;

/// One message received on a pattern subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Messages from a pattern subscription. Ends when the subscription is lost.
pub type MessageStream = Pin<Box<dyn Stream<Item = BrokerMessage> + Send>>;

/// Topic-based publish/subscribe transport shared by all instances.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `topic`. Returns how many subscribers received it.
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, RelayError>;

    /// Subscribe to every topic matching `pattern`.
    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, RelayError>;
}

/// Redis PUBLISH / PSUBSCRIBE.
///
/// Publishing goes through the shared [`ConnectionManager`]; each
/// subscription gets its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    pub fn new(client: Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, RelayError> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(topic, payload).await.map_err(broker_error)?;
        debug!(topic, receivers, "published");
        Ok(receivers)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, RelayError> {
        let mut pubsub = timeout(REDIS_TIMEOUT, self.client.get_async_pubsub())
            .await
            .map_err(|_| RelayError::BrokerUnavailable("timed out opening pub/sub connection".into()))?
            .map_err(broker_error)?;
        pubsub.psubscribe(pattern).await.map_err(broker_error)?;
        info!(pattern, "pattern subscription established");

        let stream = pubsub.into_on_message().map(|msg| BrokerMessage {
            topic: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(Box::pin(stream))
    }
}

struct PatternSubscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

/// In-process broker. Several relays sharing one instance behave like
/// several processes sharing one Redis.
#[derive(Default)]
pub struct MemoryBroker {
    subscribers: Mutex<Vec<PatternSubscriber>>,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live subscription, as if the broker connection was lost.
    pub fn sever(&self) {
        self.subscribers.lock().clear();
    }

    /// While unavailable, publish and psubscribe fail.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock();
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }

    fn check_available(&self) -> Result<(), RelayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayError::BrokerUnavailable("broker offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, RelayError> {
        self.check_available()?;
        let mut subs = self.subscribers.lock();
        subs.retain(|s| !s.tx.is_closed());

        let mut receivers = 0;
        for sub in subs.iter().filter(|s| pattern_matches(&s.pattern, topic)) {
            let msg = BrokerMessage {
                topic: topic.to_string(),
                payload: payload.as_bytes().to_vec(),
            };
            if sub.tx.send(msg).is_ok() {
                receivers += 1;
            }
        }
        Ok(receivers)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream, RelayError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(PatternSubscriber {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_matching_patterns_only() {
        let broker = MemoryBroker::new();
        let mut all = broker.psubscribe("channel:*").await.unwrap();
        let mut other = broker.psubscribe("presence:*").await.unwrap();

        let receivers = broker.publish("channel:42", "{}").await.unwrap();
        assert_eq!(receivers, 1);

        let msg = all.next().await.unwrap();
        assert_eq!(msg.topic, "channel:42");
        assert_eq!(msg.payload, b"{}");

        broker.publish("presence:1", "x").await.unwrap();
        assert_eq!(other.next().await.unwrap().topic, "presence:1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_counts_zero() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("channel:1", "{}").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sever_ends_streams() {
        let broker = MemoryBroker::new();
        let mut stream = broker.psubscribe("channel:*").await.unwrap();
        assert_eq!(broker.subscriber_count(), 1);
        broker.sever();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_streams_are_pruned() {
        let broker = MemoryBroker::new();
        let stream = broker.psubscribe("channel:*").await.unwrap();
        drop(stream);
        assert_eq!(broker.publish("channel:1", "{}").await.unwrap(), 0);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_broker_rejects_calls() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let err = broker.publish("channel:1", "{}").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(broker.psubscribe("channel:*").await.is_err());

        broker.set_available(true);
        assert!(broker.psubscribe("channel:*").await.is_ok());
    }
}
