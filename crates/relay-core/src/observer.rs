use crate::ids::{ChannelId, ConnectionId, UserId};

/// Something worth counting that happened inside the relay or a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayIncident {
    /// A broker message could not be turned into an event and was skipped.
    DecodeFailed { topic: String, reason: String },
    /// The subscriber set of a channel could not be read; the event was dropped.
    LookupFailed { channel_id: ChannelId, reason: String },
    /// An event reached this many local connections.
    EventDelivered { channel_id: ChannelId, connections: usize },
    /// A write to one connection failed and the connection was dropped.
    DeliveryFailed { user_id: UserId, connection_id: ConnectionId },
    /// A write was dropped because the connection's queue was full.
    SendQueueFull { connection_id: ConnectionId },
    /// A publish did not reach the broker.
    PublishFailed { channel_id: ChannelId },
    /// The relay lost its broker subscription.
    BrokerDisconnected,
    /// The relay (re)established its broker subscription.
    BrokerConnected,
    /// An inbound frame was answered with an error ack.
    FrameRejected { kind: &'static str },
}

impl RelayIncident {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DecodeFailed { .. } => "decode_failed",
            Self::LookupFailed { .. } => "lookup_failed",
            Self::EventDelivered { .. } => "event_delivered",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::SendQueueFull { .. } => "send_queue_full",
            Self::PublishFailed { .. } => "publish_failed",
            Self::BrokerDisconnected => "broker_disconnected",
            Self::BrokerConnected => "broker_connected",
            Self::FrameRejected { .. } => "frame_rejected",
        }
    }
}

/// Sink for relay incidents (metrics, test probes).
pub trait RelayObserver: Send + Sync {
    fn observe(&self, incident: &RelayIncident);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl RelayObserver for NoopObserver {
    fn observe(&self, _incident: &RelayIncident) {}
}
