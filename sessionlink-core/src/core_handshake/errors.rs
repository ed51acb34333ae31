//! Error types for the key exchange handshake

use thiserror::Error;

use super::request::{RequestId, RequestStatus};
use super::state::HandshakeState;
use crate::core_codec::CodecError;
use crate::types::SessionId;

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Errors raised by the handshake state machine; none of them mutate state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Phase-1 request for a pair that is already past NoExchange
    #[error("Duplicate handshake from {peer} while in {state:?}")]
    DuplicateHandshake { peer: SessionId, state: HandshakeState },

    /// An outgoing request to this peer is still pending
    #[error("Request to {peer} is still outstanding")]
    OutstandingRequest { peer: SessionId },

    /// The peer asked first; answer their request instead
    #[error("Unanswered request from {peer} must be answered first")]
    IncomingRequestPending { peer: SessionId },

    #[error("Keys with {peer} are already established")]
    AlreadyEstablished { peer: SessionId },

    #[error("No pending request with {peer}")]
    NoPendingRequest { peer: SessionId },

    #[error("Unexpected {what} from {peer} for request {request_id}")]
    UnexpectedResponse {
        peer: SessionId,
        request_id: String,
        what: &'static str,
    },

    #[error("Keys with {peer} are not established")]
    KeysNotEstablished { peer: SessionId },

    #[error("A session cannot exchange keys with itself")]
    SelfHandshake,

    #[error("Malformed request id: {0}")]
    MalformedRequestId(String),

    #[error("Malformed key exchange payload: {0}")]
    MalformedPayload(String),

    #[error("Request {request_id} is terminal ({status:?})")]
    TerminalRequest {
        request_id: RequestId,
        status: RequestStatus,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl HandshakeError {
    /// The payload itself was unusable, as opposed to arriving at the wrong time
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            HandshakeError::MalformedPayload(_)
                | HandshakeError::MalformedRequestId(_)
                | HandshakeError::SelfHandshake
                | HandshakeError::Codec(_)
        )
    }
}
