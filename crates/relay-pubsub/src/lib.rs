//! Cross-process fan-out: who listens to which channel, how events travel
//! between instances, and the background relay that delivers them locally.

pub mod broker;
pub mod redis_conn;
pub mod relay;
pub mod subscriptions;
pub mod topic;

pub use broker::{Broker, BrokerMessage, MemoryBroker, MessageStream, RedisBroker};
pub use relay::{ListenerConfig, LocalDelivery, Relay, RelayHandle, RelayState};
pub use redis_conn::connect as connect_redis;
pub use subscriptions::{MemorySubscriptionStore, RedisSubscriptionStore, SubscriptionStore};
