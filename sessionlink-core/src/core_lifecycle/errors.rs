//! Error types for message tracking and record storage

use thiserror::Error;

use super::message::{MessageStatus, StatusEvent};

pub type LifecycleResult<T> = Result<T, LifecycleError>;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from a [`RecordStore`](super::store::RecordStore) backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Record store failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The transition table rejected the event; the message is unchanged
    #[error("Invalid transition for {id}: {event:?} while {from:?}")]
    InvalidTransition {
        id: String,
        from: MessageStatus,
        event: StatusEvent,
    },

    #[error("Unknown message {0}")]
    UnknownMessage(String),

    #[error("Malformed message id: {0}")]
    MalformedId(String),

    #[error("Message {id} does not belong to {session}")]
    ForeignMessage { id: String, session: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
