use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use relay_core::ids::{ChannelId, UserId};
use relay_core::observer::{RelayIncident, RelayObserver};
use relay_core::protocol::RelayEvent;
use relay_core::RelayError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerMessage};
use crate::subscriptions::SubscriptionStore;
use crate::topic::{channel_from_topic, topic_for, TOPIC_PATTERN};

/// The local connection registry as seen by the relay.
pub trait LocalDelivery: Send + Sync {
    /// Whether this process holds at least one connection for `user_id`.
    fn is_local(&self, user_id: &UserId) -> bool;

    /// Write `payload` to every local connection of `user_id`.
    /// Returns the number of connections written to.
    fn send_to_user(&self, user_id: &UserId, payload: &str) -> usize;

    /// Every user with at least one local connection.
    fn local_users(&self) -> Vec<UserId>;
}

/// Above this many subscribers, dispatch walks the local users instead of
/// probing the registry once per member.
const MEMBER_SCAN_LIMIT: usize = 64;

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Pattern subscribed on the broker.
    pub pattern: String,
    /// Pause between losing the subscription and retrying it.
    pub reconnect_delay: Duration,
    /// How long `RelayHandle::shutdown` waits for the listener to exit.
    pub shutdown_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            pattern: TOPIC_PATTERN.to_string(),
            reconnect_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Stopped,
    Starting,
    Listening,
}

/// Publishes channel events and delivers broker traffic to local
/// subscribers. One per process.
pub struct Relay {
    broker: Arc<dyn Broker>,
    subscriptions: Arc<dyn SubscriptionStore>,
    local: Arc<dyn LocalDelivery>,
    observer: Arc<dyn RelayObserver>,
    config: ListenerConfig,
    state_tx: watch::Sender<RelayState>,
}

impl Relay {
    pub fn new(
        broker: Arc<dyn Broker>,
        subscriptions: Arc<dyn SubscriptionStore>,
        local: Arc<dyn LocalDelivery>,
        observer: Arc<dyn RelayObserver>,
        config: ListenerConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(RelayState::Stopped);
        Self {
            broker,
            subscriptions,
            local,
            observer,
            config,
            state_tx,
        }
    }

    pub fn state(&self) -> RelayState {
        *self.state_tx.borrow()
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    /// Send an event to every instance. Delivery to subscribers happens
    /// through each instance's listener, including this one.
    pub async fn publish(&self, channel_id: &ChannelId, event: &RelayEvent) -> Result<usize, RelayError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| RelayError::protocol(format!("encode event: {e}")))?;
        match self.broker.publish(&topic_for(channel_id), &payload).await {
            Ok(receivers) => {
                debug!(channel_id = %channel_id, receivers, event = event.event_type(), "event published");
                Ok(receivers)
            }
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "publish failed");
                self.observer.observe(&RelayIncident::PublishFailed {
                    channel_id: channel_id.clone(),
                });
                Err(e)
            }
        }
    }

    /// Spawn the listener. It keeps re-subscribing until shut down.
    pub fn start(self: &Arc<Self>) -> RelayHandle {
        let cancel = CancellationToken::new();
        let state_rx = self.state_tx.subscribe();
        self.set_state(RelayState::Starting);
        let relay = Arc::clone(self);
        let task = tokio::spawn(relay.run(cancel.clone()));
        RelayHandle {
            cancel,
            task,
            state_rx,
            shutdown_timeout: self.config.shutdown_timeout,
        }
    }

    fn set_state(&self, state: RelayState) {
        self.state_tx.send_replace(state);
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.set_state(RelayState::Starting);
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.broker.psubscribe(&self.config.pattern) => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    info!(pattern = %self.config.pattern, "relay listening");
                    self.observer.observe(&RelayIncident::BrokerConnected);
                    self.set_state(RelayState::Listening);

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                self.set_state(RelayState::Stopped);
                                info!("relay stopped");
                                return;
                            }
                            next = stream.next() => match next {
                                Some(msg) => self.dispatch(msg).await,
                                None => break,
                            },
                        }
                    }

                    warn!(
                        retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                        "broker subscription lost"
                    );
                    self.observer.observe(&RelayIncident::BrokerDisconnected);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                        "broker subscribe failed"
                    );
                }
            }

            self.set_state(RelayState::Starting);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        self.set_state(RelayState::Stopped);
        info!("relay stopped");
    }

    /// Deliver one broker message to the local connections of the
    /// channel's subscribers. Undecodable messages are counted and skipped.
    async fn dispatch(&self, msg: BrokerMessage) {
        let Some(channel_id) = channel_from_topic(&msg.topic) else {
            self.decode_failed(&msg.topic, "topic is not a channel topic");
            return;
        };
        let payload = match String::from_utf8(msg.payload) {
            Ok(payload) => payload,
            Err(_) => {
                self.decode_failed(&msg.topic, "payload is not UTF-8");
                return;
            }
        };
        if let Err(e) = serde_json::from_str::<RelayEvent>(&payload) {
            self.decode_failed(&msg.topic, &e.to_string());
            return;
        }

        let members = match self.subscriptions.members(&channel_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "subscriber lookup failed, event dropped");
                self.observer.observe(&RelayIncident::LookupFailed {
                    channel_id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let targets: Vec<UserId> = if members.len() > MEMBER_SCAN_LIMIT {
            self.local
                .local_users()
                .into_iter()
                .filter(|user_id| members.contains(user_id))
                .collect()
        } else {
            members
                .iter()
                .filter(|user_id| self.local.is_local(user_id))
                .cloned()
                .collect()
        };
        let connections: usize = targets
            .iter()
            .map(|user_id| self.local.send_to_user(user_id, &payload))
            .sum();

        debug!(channel_id = %channel_id, members = members.len(), connections, "event delivered");
        self.observer.observe(&RelayIncident::EventDelivered {
            channel_id,
            connections,
        });
    }

    fn decode_failed(&self, topic: &str, reason: &str) {
        warn!(topic, reason, "skipping undecodable broker message");
        self.observer.observe(&RelayIncident::DecodeFailed {
            topic: topic.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Controls a running listener.
pub struct RelayHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state_rx: watch::Receiver<RelayState>,
    shutdown_timeout: Duration,
}

impl RelayHandle {
    /// Wait until the broker subscription is live. Returns false if the
    /// listener stopped before getting there.
    pub async fn ready(&self) -> bool {
        let mut rx = self.state_rx.clone();
        let settled = match rx.wait_for(|s| *s != RelayState::Starting).await {
            Ok(state) => *state,
            Err(_) => RelayState::Stopped,
        };
        settled == RelayState::Listening
    }

    pub fn state(&self) -> RelayState {
        *self.state_rx.borrow()
    }

    /// Stop the listener, aborting it if it does not exit in time.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(self.shutdown_timeout, &mut task).await.is_err() {
            warn!("relay listener did not stop in time, aborting");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;
    use relay_telemetry::{names, MetricsRecorder};

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::subscriptions::MemorySubscriptionStore;

    /// Records what would have been written to sockets.
    #[derive(Default)]
    struct FakeLocal {
        connections: Mutex<HashMap<UserId, usize>>,
        sent: Mutex<Vec<(UserId, String)>>,
    }

    impl FakeLocal {
        fn connect(&self, user_id: &str, devices: usize) {
            self.connections.lock().insert(UserId::from(user_id), devices);
        }

        fn sent_to(&self, user_id: &str) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter(|(u, _)| u.as_str() == user_id)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    impl LocalDelivery for FakeLocal {
        fn is_local(&self, user_id: &UserId) -> bool {
            self.connections.lock().contains_key(user_id)
        }

        fn send_to_user(&self, user_id: &UserId, payload: &str) -> usize {
            let devices = self.connections.lock().get(user_id).copied().unwrap_or(0);
            for _ in 0..devices {
                self.sent.lock().push((user_id.clone(), payload.to_string()));
            }
            devices
        }

        fn local_users(&self) -> Vec<UserId> {
            self.connections.lock().keys().cloned().collect()
        }
    }

    struct Fixture {
        broker: Arc<MemoryBroker>,
        subs: Arc<MemorySubscriptionStore>,
        local: Arc<FakeLocal>,
        metrics: Arc<MetricsRecorder>,
        relay: Arc<Relay>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let subs = Arc::new(MemorySubscriptionStore::new());
        let local = Arc::new(FakeLocal::default());
        let metrics = Arc::new(MetricsRecorder::new());
        let relay = Arc::new(Relay::new(
            broker.clone(),
            subs.clone(),
            local.clone(),
            metrics.clone(),
            ListenerConfig {
                reconnect_delay: Duration::from_millis(20),
                shutdown_timeout: Duration::from_secs(1),
                ..ListenerConfig::default()
            },
        ));
        Fixture {
            broker,
            subs,
            local,
            metrics,
            relay,
        }
    }

    fn new_message(channel: &str, content: &str) -> RelayEvent {
        RelayEvent::NewMessage {
            sender_id: UserId::from("7"),
            content: content.into(),
            receiver_id: ChannelId::from(channel),
            created_at: "2026-02-14T12:00:00+00:00".into(),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn delivers_only_to_local_subscribers() {
        let f = fixture();
        f.local.connect("1", 2);
        f.local.connect("3", 1);
        f.subs.subscribe(&"1".into(), &"42".into()).await.unwrap();
        f.subs.subscribe(&"2".into(), &"42".into()).await.unwrap();

        let handle = f.relay.start();
        assert!(handle.ready().await);

        f.relay.publish(&"42".into(), &new_message("42", "hi")).await.unwrap();

        assert!(eventually(|| f.local.sent_to("1").len() == 2).await);
        assert!(f.local.sent_to("3").is_empty());
        assert!(f.local.sent_to("2").is_empty());

        let payload: serde_json::Value = serde_json::from_str(&f.local.sent_to("1")[0]).unwrap();
        assert_eq!(payload["type"], "new_message");
        assert_eq!(payload["content"], "hi");
        assert_eq!(f.metrics.counter_total(names::EVENTS_DELIVERED), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn undecodable_messages_are_skipped() {
        let f = fixture();
        f.local.connect("1", 1);
        f.subs.subscribe(&"1".into(), &"42".into()).await.unwrap();

        let handle = f.relay.start();
        assert!(handle.ready().await);

        f.broker.publish("channel:42", "{not json").await.unwrap();
        f.broker.publish("channel:42", r#"{"type":"mystery"}"#).await.unwrap();
        f.relay.publish(&"42".into(), &new_message("42", "after")).await.unwrap();

        assert!(eventually(|| f.local.sent_to("1").len() == 1).await);
        assert!(f.local.sent_to("1")[0].contains("after"));
        assert_eq!(f.metrics.counter_total(names::DECODE_ERRORS), 2);
        assert_eq!(f.relay.state(), RelayState::Listening);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn events_on_one_channel_arrive_in_publish_order() {
        let f = fixture();
        f.local.connect("1", 1);
        f.subs.subscribe(&"1".into(), &"42".into()).await.unwrap();

        let handle = f.relay.start();
        assert!(handle.ready().await);

        for i in 0..10 {
            f.relay
                .publish(&"42".into(), &new_message("42", &format!("m{i}")))
                .await
                .unwrap();
        }

        assert!(eventually(|| f.local.sent_to("1").len() == 10).await);
        let contents: Vec<String> = f
            .local
            .sent_to("1")
            .iter()
            .map(|p| serde_json::from_str::<serde_json::Value>(p).unwrap()["content"].as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn resubscribes_after_losing_the_broker() {
        let f = fixture();
        f.local.connect("1", 1);
        f.subs.subscribe(&"1".into(), &"42".into()).await.unwrap();

        let handle = f.relay.start();
        assert!(handle.ready().await);

        f.broker.sever();
        assert!(eventually(|| f.metrics.counter_total(names::BROKER_DISCONNECTS) == 1).await);
        assert!(eventually(|| f.broker.subscriber_count() == 1).await);
        assert!(handle.ready().await);

        f.relay.publish(&"42".into(), &new_message("42", "back")).await.unwrap();
        assert!(eventually(|| f.local.sent_to("1").len() == 1).await);
        assert_eq!(f.metrics.counter_total(names::BROKER_CONNECTS), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn keeps_retrying_while_broker_is_down() {
        let f = fixture();
        f.broker.set_available(false);

        let handle = f.relay.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.state(), RelayState::Starting);

        f.broker.set_available(true);
        assert!(handle.ready().await);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn publish_while_broker_down_fails() {
        let f = fixture();
        f.broker.set_available(false);
        let err = f
            .relay
            .publish(&"42".into(), &new_message("42", "lost"))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "broker_unavailable");
        assert_eq!(f.metrics.counter_total(names::PUBLISH_FAILURES), 1);
    }

    #[tokio::test]
    async fn large_channels_scan_local_users() {
        let f = fixture();
        f.local.connect("member-3", 1);
        f.local.connect("outsider", 1);
        for i in 0..(MEMBER_SCAN_LIMIT + 10) {
            f.subs
                .subscribe(&UserId::from(format!("member-{i}")), &"big".into())
                .await
                .unwrap();
        }

        let handle = f.relay.start();
        assert!(handle.ready().await);
        f.relay.publish(&"big".into(), &new_message("big", "all")).await.unwrap();

        assert!(eventually(|| f.local.sent_to("member-3").len() == 1).await);
        assert!(f.local.sent_to("outsider").is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn subscriber_lookup_outage_is_reported_and_listener_survives() {
        let f = fixture();
        f.local.connect("1", 1);
        f.subs.subscribe(&"1".into(), &"42".into()).await.unwrap();

        let handle = f.relay.start();
        assert!(handle.ready().await);

        f.subs.set_offline(true);
        f.relay.publish(&"42".into(), &new_message("42", "dropped")).await.unwrap();
        assert!(eventually(|| f.metrics.counter_total(names::LOOKUP_FAILURES) == 1).await);
        assert!(f.local.sent_to("1").is_empty());
        assert_eq!(f.relay.state(), RelayState::Listening);

        f.subs.set_offline(false);
        f.relay.publish(&"42".into(), &new_message("42", "delivered")).await.unwrap();
        assert!(eventually(|| f.local.sent_to("1").len() == 1).await);
        assert!(f.local.sent_to("1")[0].contains("delivered"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn ready_is_false_when_listener_stops_first() {
        let f = fixture();
        f.broker.set_available(false);

        let handle = f.relay.start();
        assert_eq!(handle.state(), RelayState::Starting);
        handle.cancel.cancel();

        let ready = tokio::time::timeout(Duration::from_secs(1), handle.ready()).await;
        assert_eq!(ready, Ok(false));
        assert_eq!(f.relay.state(), RelayState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_stops_listener() {
        let f = fixture();
        let handle = f.relay.start();
        assert!(handle.ready().await);
        handle.shutdown().await;
        assert_eq!(f.relay.state(), RelayState::Stopped);
        assert!(eventually(|| f.broker.subscriber_count() == 0).await);
    }
}
