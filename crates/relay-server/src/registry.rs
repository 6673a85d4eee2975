use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_core::ids::{ConnectionId, UserId};
use relay_core::observer::{NoopObserver, RelayIncident, RelayObserver};
use relay_core::RelayError;
use relay_pubsub::LocalDelivery;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// One open WebSocket of a user. Frames written here are drained to the
/// socket by the connection's writer task.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    tx: mpsc::Sender<String>,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(user_id: UserId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id,
            tx,
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    fn try_send(&self, payload: &str) -> Result<(), TrySendError<String>> {
        self.tx.try_send(payload.to_string())
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Process-local map of user id → open connections.
///
/// Sharded by user id, so operations on different users never contend.
/// A user entry exists only while it holds at least one connection.
pub struct ConnectionRegistry {
    users: DashMap<UserId, Vec<Arc<Connection>>>,
    max_send_queue: usize,
    client_timeout: Duration,
    observer: Arc<dyn RelayObserver>,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self::with_observer(max_send_queue, DEFAULT_CLIENT_TIMEOUT, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        max_send_queue: usize,
        client_timeout: Duration,
        observer: Arc<dyn RelayObserver>,
    ) -> Self {
        Self {
            users: DashMap::new(),
            max_send_queue,
            client_timeout,
            observer,
        }
    }

    /// Open a connection for `user_id` and return it with the receiving end
    /// of its send queue.
    pub fn register(&self, user_id: UserId) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let connection = Arc::new(Connection::new(user_id, tx));
        self.add(Arc::clone(&connection));
        (connection, rx)
    }

    pub fn add(&self, connection: Arc<Connection>) {
        tracing::debug!(user_id = %connection.user_id, connection_id = %connection.id, "connection added");
        self.users
            .entry(connection.user_id.clone())
            .or_default()
            .push(connection);
    }

    /// Remove one connection. Returns false if it was not registered.
    pub fn remove(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        let mut removed = false;
        if let Entry::Occupied(mut entry) = self.users.entry(user_id.clone()) {
            let connections = entry.get_mut();
            let before = connections.len();
            connections.retain(|c| &c.id != connection_id);
            removed = connections.len() != before;
            if connections.is_empty() {
                entry.remove();
            }
        }
        if removed {
            tracing::debug!(user_id = %user_id, connection_id = %connection_id, "connection removed");
        }
        removed
    }

    fn connections_of(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        self.users
            .get(user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Write `payload` to every connection of the user. A connection whose
    /// queue is closed is removed; a full queue loses this frame only.
    pub fn send_to_user(&self, user_id: &UserId, payload: &str) -> usize {
        let mut delivered = 0;
        for connection in self.connections_of(user_id) {
            if self.deliver(&connection, payload).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Write to one connection, e.g. an ack for the frame it sent.
    pub fn send_to_connection(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
        payload: &str,
    ) -> Result<(), RelayError> {
        let connection = self
            .connections_of(user_id)
            .into_iter()
            .find(|c| &c.id == connection_id)
            .ok_or_else(|| RelayError::DeliveryFailure {
                connection_id: connection_id.clone(),
                reason: "not registered".into(),
            })?;
        self.deliver(&connection, payload)
    }

    fn deliver(&self, connection: &Connection, payload: &str) -> Result<(), RelayError> {
        match connection.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                tracing::warn!(
                    user_id = %connection.user_id,
                    connection_id = %connection.id,
                    msg_len = msg.len(),
                    "send queue full, dropping frame"
                );
                self.observer.observe(&RelayIncident::SendQueueFull {
                    connection_id: connection.id.clone(),
                });
                Err(RelayError::DeliveryFailure {
                    connection_id: connection.id.clone(),
                    reason: "send queue full".into(),
                })
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(
                    user_id = %connection.user_id,
                    connection_id = %connection.id,
                    "connection closed, removing"
                );
                self.remove(&connection.user_id, &connection.id);
                self.observer.observe(&RelayIncident::DeliveryFailed {
                    user_id: connection.user_id.clone(),
                    connection_id: connection.id.clone(),
                });
                Err(RelayError::DeliveryFailure {
                    connection_id: connection.id.clone(),
                    reason: "connection closed".into(),
                })
            }
        }
    }

    pub fn is_local(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn local_users(&self) -> Vec<UserId> {
        self.users.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Remove connections that haven't answered a ping within the timeout.
    pub fn cleanup_dead_connections(&self) -> usize {
        let dead: Vec<(UserId, ConnectionId)> = self
            .users
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|c| !c.is_alive(self.client_timeout))
                    .map(|c| (c.user_id.clone(), c.id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut removed = 0;
        for (user_id, connection_id) in dead {
            if self.remove(&user_id, &connection_id) {
                removed += 1;
                tracing::info!(user_id = %user_id, connection_id = %connection_id, "cleaned up dead connection");
            }
        }
        removed
    }
}

impl LocalDelivery for ConnectionRegistry {
    fn is_local(&self, user_id: &UserId) -> bool {
        ConnectionRegistry::is_local(self, user_id)
    }

    fn send_to_user(&self, user_id: &UserId, payload: &str) -> usize {
        ConnectionRegistry::send_to_user(self, user_id, payload)
    }

    fn local_users(&self) -> Vec<UserId> {
        ConnectionRegistry::local_users(self)
    }
}

/// Periodically sweep connections that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_connections();
            if removed > 0 {
                tracing::info!(removed, "dead connection cleanup");
            }
        }
    })
}
