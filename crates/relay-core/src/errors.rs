use crate::ids::ConnectionId;

/// Error taxonomy of the realtime layer.
/// Auth ends one handshake, everything else is recoverable.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    // Fatal to the connection attempt
    #[error("authentication failed: {0}")]
    Auth(String),

    // Reported in-band to the originating connection
    #[error("{0}")]
    Protocol(String),

    // Infrastructure, retried by the relay
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    // One connection during fan-out
    #[error("delivery to {connection_id} failed: {reason}")]
    DeliveryFailure {
        connection_id: ConnectionId,
        reason: String,
    },

    // Message store collaborator
    #[error("message store error: {0}")]
    Store(String),
}

impl RelayError {
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Protocol(_) => "protocol",
            Self::BrokerUnavailable(_) => "broker_unavailable",
            Self::DeliveryFailure { .. } => "delivery_failure",
            Self::Store(_) => "store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_broker_errors_are_retryable() {
        assert!(RelayError::BrokerUnavailable("connection refused".into()).is_retryable());
        assert!(!RelayError::Auth("expired".into()).is_retryable());
        assert!(!RelayError::protocol("Invalid JSON").is_retryable());
        assert!(!RelayError::Store("locked".into()).is_retryable());
    }

    #[test]
    fn delivery_failure_names_the_connection() {
        let connection_id = ConnectionId::new();
        let err = RelayError::DeliveryFailure {
            connection_id: connection_id.clone(),
            reason: "connection closed".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.error_kind(), "delivery_failure");
        assert_eq!(
            err.to_string(),
            format!("delivery to {connection_id} failed: connection closed")
        );
    }

    #[test]
    fn protocol_error_displays_detail_only() {
        assert_eq!(RelayError::protocol("Unknown action: dance").to_string(), "Unknown action: dance");
    }

    #[test]
    fn error_kinds() {
        assert_eq!(RelayError::Auth(String::new()).error_kind(), "auth");
        assert_eq!(RelayError::BrokerUnavailable(String::new()).error_kind(), "broker_unavailable");
        assert_eq!(RelayError::Store(String::new()).error_kind(), "store");
    }
}
