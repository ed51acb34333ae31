//! Key exchange request records

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::errors::{HandshakeError, HandshakeResult};
use crate::types::{SessionId, Timestamp};

const REQUEST_ID_PREFIX: &str = "ker_";

/// Identifier of a key exchange request, `ker_<uuid-v4>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        RequestId(format!("{}{}", REQUEST_ID_PREFIX, Uuid::new_v4()))
    }

    /// Parse a request id received from the wire
    pub fn parse(raw: &str) -> HandshakeResult<Self> {
        let uuid_part = raw
            .strip_prefix(REQUEST_ID_PREFIX)
            .ok_or_else(|| HandshakeError::MalformedRequestId(raw.to_string()))?;
        Uuid::parse_str(uuid_part).map_err(|_| HandshakeError::MalformedRequestId(raw.to_string()))?;
        Ok(RequestId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Created locally, not yet accepted by the router
    Pending,
    /// Handed to the transport
    Sent,
    /// Incoming request waiting for the local user
    Received,
    Accepted,
    Declined,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Accepted | RequestStatus::Declined | RequestStatus::Expired
        )
    }

    /// Still waiting on one side of the pair
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending | RequestStatus::Sent | RequestStatus::Received
        )
    }
}

/// Why a request ended as Declined or Expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeReason {
    DeclinedByPeer,
    DeclinedLocally,
    TimedOut,
    Cancelled,
    /// Lost a simultaneous-open race against the peer's request
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A key exchange request between two sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeRequest {
    pub id: RequestId,
    pub from_session: SessionId,
    pub to_session: SessionId,
    pub request_phrase: String,
    /// Peer's public key (base64), known once phase 1 delivered it
    pub public_key: Option<String>,
    pub status: RequestStatus,
    pub reason: Option<ExchangeReason>,
    pub timestamp: Timestamp,
}

impl KeyExchangeRequest {
    pub fn new_outgoing(from: SessionId, to: SessionId, phrase: String) -> Self {
        Self {
            id: RequestId::generate(),
            from_session: from,
            to_session: to,
            request_phrase: phrase,
            public_key: None,
            status: RequestStatus::Pending,
            reason: None,
            timestamp: Timestamp::now(),
        }
    }

    pub fn new_incoming(
        id: RequestId,
        from: SessionId,
        to: SessionId,
        phrase: String,
        public_key: String,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            from_session: from,
            to_session: to,
            request_phrase: phrase,
            public_key: Some(public_key),
            status: RequestStatus::Received,
            reason: None,
            timestamp,
        }
    }

    pub fn direction(&self, local: &SessionId) -> Direction {
        if &self.from_session == local {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }

    /// The other party of this request as seen from `local`
    pub fn peer(&self, local: &SessionId) -> &SessionId {
        if &self.from_session == local {
            &self.to_session
        } else {
            &self.from_session
        }
    }

    /// Move to `status`; terminal requests never change again
    pub fn transition(
        &mut self,
        status: RequestStatus,
        reason: Option<ExchangeReason>,
    ) -> HandshakeResult<()> {
        if self.status.is_terminal() {
            return Err(HandshakeError::TerminalRequest {
                request_id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = status;
        self.reason = reason;
        Ok(())
    }

    /// Whether `self` was opened before `other` (earlier timestamp, then smaller sender)
    pub fn opened_before(&self, other: &KeyExchangeRequest) -> bool {
        (self.timestamp, &self.from_session) < (other.timestamp, &other.from_session)
    }
}
