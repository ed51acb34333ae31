//! Error types for routing and transport

use thiserror::Error;

use crate::wire::WireError;

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Result type for transport collaborators
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors reported by a [`Transport`](super::transport::Transport) implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Not subscribed to channel {0}")]
    NotSubscribed(String),

    #[error("Transport failure: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// The local channel is not joined or the transport is down
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Malformed event name: {0}")]
    Wire(#[from] WireError),

    /// Payload lacks the fields the fingerprint is built from
    #[error("Malformed inbound payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for RouterError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => {
                RouterError::NotConnected("transport reported disconnect".to_string())
            }
            other => RouterError::Transport(other),
        }
    }
}
