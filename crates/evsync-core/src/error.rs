//! Error types for the synchronization core.
//!
//! [`ConnectionError`] describes why a link could not be established or was
//! lost. It never escapes to subscribers: the connection state machine
//! records it as the last error and the status observers see only the
//! resulting transition.

use std::time::Duration;

use thiserror::Error;

/// Why a hub link failed or ended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The hub endpoint does not exist (HTTP 404 on upgrade).
    #[error("hub endpoint not found: {endpoint}")]
    NotFound {
        /// Endpoint that was dialed.
        endpoint: String,
    },

    /// The hub refused the credential.
    #[error("unauthorized")]
    Unauthorized,

    /// The hub rejected the protocol handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Dial or handshake did not complete in time.
    #[error("timed out after {elapsed:?}")]
    Timeout {
        /// How long we waited.
        elapsed: Duration,
    },

    /// The hub sent a close frame.
    #[error("closed by hub: {}", reason.as_deref().unwrap_or("no reason"))]
    ClosedByServer {
        /// Reason reported by the hub.
        reason: Option<String>,
        /// Whether the hub permits reconnecting.
        allow_reconnect: bool,
    },

    /// Frame-level protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying transport error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Returns true if a later attempt may succeed.
    ///
    /// Missing endpoints, handshake rejections and closes that forbid
    /// reconnecting are permanent; everything else is treated as a network
    /// hiccup.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::HandshakeRejected(_) => false,
            Self::ClosedByServer { allow_reconnect, .. } => *allow_reconnect,
            Self::Unauthorized | Self::Timeout { .. } | Self::Protocol(_) | Self::Transport(_) => {
                true
            },
        }
    }

    /// Returns true if the endpoint is missing, which puts the connection in
    /// permanent degraded mode.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<evsync_proto::ProtocolError> for ConnectionError {
    fn from(err: evsync_proto::ProtocolError) -> Self {
        match err {
            evsync_proto::ProtocolError::HandshakeRejected(reason) => {
                Self::HandshakeRejected(reason)
            },
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_retryable() {
        assert!(ConnectionError::Transport("reset".to_string()).is_retryable());
        assert!(ConnectionError::Timeout { elapsed: Duration::from_secs(10) }.is_retryable());
        assert!(ConnectionError::Unauthorized.is_retryable());
        assert!(
            ConnectionError::ClosedByServer { reason: None, allow_reconnect: true }.is_retryable()
        );
    }

    #[test]
    fn permanent_failures_are_not_retryable() {
        let missing = ConnectionError::NotFound { endpoint: "wss://hub/chat".to_string() };
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());

        assert!(!ConnectionError::HandshakeRejected("version".to_string()).is_retryable());
        let banned = ConnectionError::ClosedByServer {
            reason: Some("banned".into()),
            allow_reconnect: false,
        };
        assert!(!banned.is_retryable());
    }

    #[test]
    fn handshake_rejection_keeps_its_kind() {
        let err: ConnectionError =
            evsync_proto::ProtocolError::HandshakeRejected("bad protocol".into()).into();
        assert_eq!(err, ConnectionError::HandshakeRejected("bad protocol".into()));
    }
}
