/*
    types.rs - Common types shared by every component

    Defines:
    - Wall-clock timestamps (unix milliseconds)
    - Session identifiers and their derived channel names
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Prefix of every session channel name
pub const CHANNEL_PREFIX: &str = "session_";

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp representing the current time
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Timestamp(millis)
    }

    /// Create a timestamp from milliseconds since epoch
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Get milliseconds since epoch
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rejected session identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionIdError {
    #[error("Session id is empty")]
    Empty,

    #[error("Session id contains forbidden character {0:?}: {1}")]
    ForbiddenChar(char, String),
}

/// Stable identity of one party, also used as the conversation routing key
///
/// Session ids end up inside event names (`action:sessionId:actionType`), so
/// they may not contain `:` or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate and wrap a session id
    pub fn new(id: impl Into<String>) -> Result<Self, SessionIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if let Some(c) = id.chars().find(|c| *c == ':' || c.is_whitespace()) {
            return Err(SessionIdError::ForbiddenChar(c, id));
        }
        Ok(SessionId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the transport channel this session listens on
    pub fn channel(&self) -> String {
        format!("{}{}", CHANNEL_PREFIX, self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionId::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::str::FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionId::new(s)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name() {
        let id = SessionId::new("05abcdef").unwrap();
        assert_eq!(id.channel(), "session_05abcdef");
    }

    #[test]
    fn test_session_id_rejects_separator() {
        assert_eq!(SessionId::new(""), Err(SessionIdError::Empty));
        assert!(matches!(
            SessionId::new("a:b"),
            Err(SessionIdError::ForbiddenChar(':', _))
        ));
        assert!(SessionId::new("has space").is_err());
    }

    #[test]
    fn test_session_id_serde_validates() {
        let ok: SessionId = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(ok.as_str(), "alice");

        let bad = serde_json::from_str::<SessionId>("\"ali:ce\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::from_millis(1);
        let b = Timestamp::from_millis(2);
        assert!(a < b);
        assert_eq!(b.as_millis(), 2);
    }
}
