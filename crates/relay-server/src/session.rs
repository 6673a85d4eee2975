use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use relay_core::collab::{ChannelAuthorizer, MessageRecord, MessageStore};
use relay_core::ids::{ChannelId, ConnectionId, UserId};
use relay_core::observer::{RelayIncident, RelayObserver};
use relay_core::protocol::{Ack, Action, RelayEvent};
use relay_core::RelayError;
use relay_pubsub::Relay;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::{Connection, ConnectionRegistry};

/// Services a session acts on. Shared by every connection of the process
/// and by the HTTP message routes.
pub struct SessionContext {
    pub relay: Arc<Relay>,
    pub store: Arc<dyn MessageStore>,
    pub authorizer: Arc<dyn ChannelAuthorizer>,
    pub observer: Arc<dyn RelayObserver>,
}

/// Result of the persist-then-publish path.
#[derive(Debug)]
pub struct Posted {
    pub record: MessageRecord,
    /// Broker receivers, or why the stored message was not fanned out.
    pub published: Result<usize, RelayError>,
}

impl SessionContext {
    /// Store a message, then announce it on the channel.
    /// Blank content is rejected; nothing is published when the store
    /// rejects the message.
    pub async fn post_message(
        &self,
        sender_id: &UserId,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<Posted, RelayError> {
        if content.trim().is_empty() {
            return Err(RelayError::protocol("Missing content"));
        }
        let record = self.store.persist_message(sender_id, channel_id, content).await?;
        let event = RelayEvent::NewMessage {
            sender_id: record.sender_id.clone(),
            content: record.content.clone(),
            receiver_id: record.receiver_id.clone(),
            created_at: record.created_at.to_rfc3339(),
        };
        let published = self.relay.publish(channel_id, &event).await;
        Ok(Posted { record, published })
    }

    pub async fn ensure_member(&self, user_id: &UserId, channel_id: &ChannelId) -> Result<(), RelayError> {
        if self.authorizer.is_member(user_id, channel_id).await? {
            Ok(())
        } else {
            Err(RelayError::protocol(format!("Forbidden: Not a member of {channel_id}")))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

/// Protocol state of one authenticated connection.
pub struct Session {
    ctx: Arc<SessionContext>,
    user_id: UserId,
    connection_id: ConnectionId,
    state: SessionState,
}

impl Session {
    /// Sessions start Open: the handshake already decoded the identity.
    pub fn new(ctx: Arc<SessionContext>, user_id: UserId, connection_id: ConnectionId) -> Self {
        Self {
            ctx,
            user_id,
            connection_id,
            state: SessionState::Open,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Handle one inbound text frame. Returns the ack for the originating
    /// connection, if the action produces one.
    pub async fn handle_frame(&self, raw: &str) -> Option<Ack> {
        if self.state != SessionState::Open {
            return None;
        }
        let action = match Action::parse(raw) {
            Ok(Some(action)) => action,
            Ok(None) => return None,
            Err(e) => return Some(self.reject(&e)),
        };
        debug!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            action = action.name(),
            channel_id = %action.channel_id(),
            "frame"
        );

        match self.apply(action).await {
            Ok(ack) => ack,
            Err(e) => Some(self.reject(&e)),
        }
    }

    async fn apply(&self, action: Action) -> Result<Option<Ack>, RelayError> {
        let subscriptions = self.ctx.relay.subscriptions();
        match action {
            Action::Subscribe { channel_id } => {
                self.ctx.ensure_member(&self.user_id, &channel_id).await?;
                subscriptions.subscribe(&self.user_id, &channel_id).await?;
                info!(user_id = %self.user_id, channel_id = %channel_id, "subscribed");
                Ok(Some(Ack::subscribed(&channel_id)))
            }
            Action::Unsubscribe { channel_id } => {
                subscriptions.unsubscribe(&self.user_id, &channel_id).await?;
                info!(user_id = %self.user_id, channel_id = %channel_id, "unsubscribed");
                Ok(Some(Ack::unsubscribed(&channel_id)))
            }
            Action::Message { channel_id, content } => {
                let posted = self.ctx.post_message(&self.user_id, &channel_id, &content).await?;
                match posted.published {
                    Ok(_) => Ok(None),
                    Err(e) => {
                        self.ctx.observer.observe(&RelayIncident::FrameRejected {
                            kind: e.error_kind(),
                        });
                        Ok(Some(Ack::error(format!(
                            "Message saved but not delivered: {e}"
                        ))))
                    }
                }
            }
        }
    }

    fn reject(&self, err: &RelayError) -> Ack {
        warn!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            kind = err.error_kind(),
            error = %err,
            "frame rejected"
        );
        self.ctx.observer.observe(&RelayIncident::FrameRejected {
            kind: err.error_kind(),
        });
        Ack::from(err)
    }
}

/// Ping cadence and liveness limit for one socket.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// Drive one WebSocket until it closes: a writer task drains the send
/// queue and pings, the reader handles frames strictly in arrival order.
pub async fn run_socket(
    socket: WebSocket,
    mut session: Session,
    connection: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    heartbeat: Heartbeat,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = Arc::clone(&connection);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if !writer_conn.is_alive(heartbeat.timeout) {
                        info!(connection_id = %writer_conn.id, "connection missed heartbeats, closing");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_conn.id, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_conn = Arc::clone(&connection);
    let reader_registry = Arc::clone(&registry);
    let reader = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if let Some(ack) = session.handle_frame(text.as_str()).await {
                        match serde_json::to_string(&ack) {
                            Ok(json) => {
                                if let Err(e) =
                                    reader_registry.send_to_connection(&reader_conn.user_id, &reader_conn.id, &json)
                                {
                                    debug!(error = %e, "ack not delivered");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode ack"),
                        }
                    }
                }
                WsMessage::Pong(_) => reader_conn.record_pong(),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        session.close();
    };

    tokio::select! {
        _ = &mut writer => {},
        _ = reader => {},
    }
    writer.abort();

    registry.remove(&connection.user_id, &connection.id);
    info!(user_id = %connection.user_id, connection_id = %connection.id, "connection closed");
}
