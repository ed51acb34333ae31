/*
    wire.rs - Event naming contract on the transport

    Every event travelling over the transport is named

        action:sessionId:actionType

    where `action` selects the handler family, `sessionId` is always the SENDER's
    session and `actionType` picks the sub-event (start/stop, request/response...).

    Only the key_exchange family travels in plaintext. Everything else carries an
    encrypted envelope.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::{SessionId, SessionIdError};

/// Separator between the three event name segments
pub const NAME_SEPARATOR: char = ':';

/// Errors raised while parsing event names
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("Malformed event name: {0}")]
    MalformedName(String),

    #[error("Unknown event family: {0}")]
    UnknownFamily(String),

    #[error("Unknown action type {action_type} for family {family}")]
    UnknownActionType { family: String, action_type: String },

    #[error("Invalid sender session in event name: {0}")]
    InvalidSession(#[from] SessionIdError),
}

/// Handler family, the `action` segment of an event name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFamily {
    KeyExchange,
    UserDataExchange,
    ConversationCreated,
    Typing,
    Presence,
    Chat,
    Message,
    Receipt,
}

impl EventFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFamily::KeyExchange => "key_exchange",
            EventFamily::UserDataExchange => "user_data_exchange",
            EventFamily::ConversationCreated => "conversation_created",
            EventFamily::Typing => "typing",
            EventFamily::Presence => "presence",
            EventFamily::Chat => "chat",
            EventFamily::Message => "message",
            EventFamily::Receipt => "receipt",
        }
    }
}

impl FromStr for EventFamily {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "key_exchange" => Ok(EventFamily::KeyExchange),
            "user_data_exchange" => Ok(EventFamily::UserDataExchange),
            "conversation_created" => Ok(EventFamily::ConversationCreated),
            "typing" => Ok(EventFamily::Typing),
            "presence" => Ok(EventFamily::Presence),
            "chat" => Ok(EventFamily::Chat),
            "message" => Ok(EventFamily::Message),
            "receipt" => Ok(EventFamily::Receipt),
            other => Err(WireError::UnknownFamily(other.to_string())),
        }
    }
}

impl fmt::Display for EventFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete (family, actionType) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    KeyExchangeRequest,
    KeyExchangeResponse,
    KeyExchangeDecline,
    /// Initiator withdrew a request the peer has not answered yet
    KeyExchangeCancel,
    UserData,
    ConversationCreated,
    TypingStart,
    TypingStop,
    PresenceOnline,
    PresenceOffline,
    NewMessage,
    MessageAcked,
    ReceiptDelivered,
    ReceiptRead,
}

impl EventKind {
    pub fn family(&self) -> EventFamily {
        match self {
            EventKind::KeyExchangeRequest
            | EventKind::KeyExchangeResponse
            | EventKind::KeyExchangeDecline
            | EventKind::KeyExchangeCancel => EventFamily::KeyExchange,
            EventKind::UserData => EventFamily::UserDataExchange,
            EventKind::ConversationCreated => EventFamily::ConversationCreated,
            EventKind::TypingStart | EventKind::TypingStop => EventFamily::Typing,
            EventKind::PresenceOnline | EventKind::PresenceOffline => EventFamily::Presence,
            EventKind::NewMessage => EventFamily::Chat,
            EventKind::MessageAcked => EventFamily::Message,
            EventKind::ReceiptDelivered | EventKind::ReceiptRead => EventFamily::Receipt,
        }
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            EventKind::KeyExchangeRequest => "request",
            EventKind::KeyExchangeResponse => "response",
            EventKind::KeyExchangeDecline => "decline",
            EventKind::KeyExchangeCancel => "cancel",
            EventKind::UserData | EventKind::ConversationCreated => "data",
            EventKind::TypingStart => "start",
            EventKind::TypingStop => "stop",
            EventKind::PresenceOnline => "online",
            EventKind::PresenceOffline => "offline",
            EventKind::NewMessage => "new_message",
            EventKind::MessageAcked => "acked",
            EventKind::ReceiptDelivered => "delivered",
            EventKind::ReceiptRead => "read",
        }
    }

    pub fn from_parts(family: EventFamily, action_type: &str) -> Result<Self, WireError> {
        let kind = match (family, action_type) {
            (EventFamily::KeyExchange, "request") => EventKind::KeyExchangeRequest,
            (EventFamily::KeyExchange, "response") => EventKind::KeyExchangeResponse,
            (EventFamily::KeyExchange, "decline") => EventKind::KeyExchangeDecline,
            (EventFamily::KeyExchange, "cancel") => EventKind::KeyExchangeCancel,
            (EventFamily::UserDataExchange, "data") => EventKind::UserData,
            (EventFamily::ConversationCreated, "data") => EventKind::ConversationCreated,
            (EventFamily::Typing, "start") => EventKind::TypingStart,
            (EventFamily::Typing, "stop") => EventKind::TypingStop,
            (EventFamily::Presence, "online") => EventKind::PresenceOnline,
            (EventFamily::Presence, "offline") => EventKind::PresenceOffline,
            (EventFamily::Chat, "new_message") => EventKind::NewMessage,
            (EventFamily::Message, "acked") => EventKind::MessageAcked,
            (EventFamily::Receipt, "delivered") => EventKind::ReceiptDelivered,
            (EventFamily::Receipt, "read") => EventKind::ReceiptRead,
            (family, other) => {
                return Err(WireError::UnknownActionType {
                    family: family.to_string(),
                    action_type: other.to_string(),
                })
            }
        };
        Ok(kind)
    }

    /// Phase-1 key exchange events are the only plaintext events
    pub fn is_plaintext(&self) -> bool {
        self.family() == EventFamily::KeyExchange
    }
}

/// Parsed `action:sessionId:actionType` event name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventName {
    pub kind: EventKind,
    /// Session of the party that emitted the event
    pub sender: SessionId,
}

impl EventName {
    pub fn new(kind: EventKind, sender: SessionId) -> Self {
        Self { kind, sender }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.kind.family(),
            self.sender,
            self.kind.action_type(),
            sep = NAME_SEPARATOR
        )
    }
}

impl FromStr for EventName {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(NAME_SEPARATOR);
        let (Some(action), Some(session), Some(action_type), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(WireError::MalformedName(s.to_string()));
        };

        let family = action.parse::<EventFamily>()?;
        let kind = EventKind::from_parts(family, action_type)?;
        let sender = SessionId::new(session)?;
        Ok(EventName { kind, sender })
    }
}

/// Event as delivered by the transport: a name plus an opaque JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub name: String,
    pub payload: serde_json::Value,
}

impl RawEvent {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}
