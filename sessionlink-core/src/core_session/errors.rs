//! Top-level session error

use thiserror::Error;

use crate::core_codec::CodecError;
use crate::core_handshake::HandshakeError;
use crate::core_lifecycle::{LifecycleError, StoreError};
use crate::core_router::RouterError;
use crate::types::{SessionId, SessionIdError};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Encrypted traffic requires a completed phase-1 exchange
    #[error("Keys with {peer} are not established")]
    KeysNotEstablished { peer: SessionId },

    /// Envelope addressed to another session
    #[error("Envelope from {sender} addressed to {addressed_to}")]
    Misaddressed {
        sender: SessionId,
        addressed_to: SessionId,
    },

    #[error("Session task has stopped")]
    ActorClosed,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    InvalidSessionId(#[from] SessionIdError),
}

impl SessionError {
    /// The inbound copy itself was damaged or invalid; another copy may be fine
    pub fn is_unusable_payload(&self) -> bool {
        match self {
            SessionError::Misaddressed { .. } => true,
            SessionError::Codec(e) => matches!(
                e,
                CodecError::IntegrityFailure { .. }
                    | CodecError::DecryptionFailure(_)
                    | CodecError::InvalidPublicKey(_)
                    | CodecError::MalformedPayload(_)
            ),
            SessionError::Handshake(e) => e.is_malformed(),
            _ => false,
        }
    }
}
