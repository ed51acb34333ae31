//! Message records, identifiers and the status transition table

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::errors::{LifecycleError, LifecycleResult};
use crate::types::{SessionId, Timestamp};

const MESSAGE_ID_PREFIX: &str = "msg_";

/// Last time token handed out in this process
static LAST_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Next strictly increasing millisecond token
fn next_token() -> u64 {
    let now = Timestamp::now().as_millis();
    let mut current = LAST_TOKEN.load(Ordering::Relaxed);
    loop {
        let next = now.max(current + 1);
        match LAST_TOKEN.compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}

/// Message identifier, `msg_<token>_<senderSession>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId {
    raw: String,
    token: u64,
    sender: SessionId,
}

impl MessageId {
    pub fn generate(sender: &SessionId) -> Self {
        let token = next_token();
        Self {
            raw: format!("{}{}_{}", MESSAGE_ID_PREFIX, token, sender),
            token,
            sender: sender.clone(),
        }
    }

    pub fn parse(raw: &str) -> LifecycleResult<Self> {
        let malformed = || LifecycleError::MalformedId(raw.to_string());
        let rest = raw.strip_prefix(MESSAGE_ID_PREFIX).ok_or_else(malformed)?;
        let (token, sender) = rest.split_once('_').ok_or_else(malformed)?;
        let token = token.parse::<u64>().map_err(|_| malformed())?;
        let sender = SessionId::new(sender).map_err(|_| malformed())?;
        Ok(Self {
            raw: raw.to_string(),
            token,
            sender,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Creation-order token
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn sender(&self) -> &SessionId {
        &self.sender
    }
}

impl TryFrom<String> for MessageId {
    type Error = LifecycleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MessageId::parse(&value)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.raw
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Deleted,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Deleted)
    }
}

/// Inputs that move a message through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    /// Router accepted the outbound envelope
    Ack,
    Delivered,
    Read,
    Fail,
    Delete,
}

/// Outcome of applying a [`StatusEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(MessageStatus),
    NoOp,
    Invalid,
}

/// Total transition table
pub fn transition(from: MessageStatus, event: StatusEvent) -> Transition {
    use MessageStatus::*;
    use StatusEvent as E;

    match (from, event) {
        (Sending, E::Ack) => Transition::To(Sent),
        (Sending | Sent, E::Delivered) => Transition::To(Delivered),
        (Sending | Sent | Delivered, E::Read) => Transition::To(Read),
        (Sending | Sent, E::Fail) => Transition::To(Failed),
        (Sending | Sent | Delivered | Read, E::Delete) => Transition::To(Deleted),

        (Sent | Delivered | Read, E::Ack) => Transition::NoOp,
        (Delivered | Read, E::Delivered) => Transition::NoOp,
        (Read, E::Read) => Transition::NoOp,
        (Failed, E::Fail) => Transition::NoOp,
        (Deleted, E::Delete) => Transition::NoOp,

        (Delivered | Read, E::Fail) => Transition::Invalid,
        (Failed, _) => Transition::Invalid,
        (Deleted, _) => Transition::Invalid,
    }
}

/// A chat message as tracked by one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Recipient session, as carried by the envelope
    pub conversation_id: SessionId,
    pub sender_session: SessionId,
    pub recipient_session: SessionId,
    pub content: String,
    pub status: MessageStatus,
    pub timestamp: Timestamp,
}

impl Message {
    pub fn new_outbound(sender: &SessionId, recipient: &SessionId, content: String) -> Self {
        Self {
            id: MessageId::generate(sender),
            conversation_id: recipient.clone(),
            sender_session: sender.clone(),
            recipient_session: recipient.clone(),
            content,
            status: MessageStatus::Sending,
            timestamp: Timestamp::now(),
        }
    }

    /// The other party of this message as seen from `local`
    pub fn peer(&self, local: &SessionId) -> &SessionId {
        if &self.sender_session == local {
            &self.recipient_session
        } else {
            &self.sender_session
        }
    }
}

/// Status change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: MessageId,
    pub from: MessageStatus,
    pub to: MessageStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[test]
    fn test_ids_are_strictly_increasing() {
        let alice = sid("alice");
        let ids: Vec<_> = (0..100).map(|_| MessageId::generate(&alice)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0].token() < pair[1].token());
        }
        assert!(ids[0].as_str().starts_with("msg_"));
        assert!(ids[0].as_str().ends_with("_alice"));
    }

    #[test]
    fn test_parse_message_id() {
        let id = MessageId::parse("msg_1700000000000_user_42").unwrap();
        assert_eq!(id.token(), 1_700_000_000_000);
        assert_eq!(id.sender(), &sid("user_42"));

        assert!(MessageId::parse("msg_abc_alice").is_err());
        assert!(MessageId::parse("1700_alice").is_err());
        assert!(MessageId::parse("msg_1700").is_err());
        assert!(MessageId::parse("msg_1700_").is_err());
    }

    #[test]
    fn test_message_id_serde_as_string() {
        let id = MessageId::parse("msg_5_bob").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"msg_5_bob\"");
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<MessageId>("\"nope\"").is_err());
    }

    #[test]
    fn test_transition_table_is_monotonic() {
        use MessageStatus::*;
        let all_status = [Sending, Sent, Delivered, Read, Failed, Deleted];
        let all_events = [
            StatusEvent::Ack,
            StatusEvent::Delivered,
            StatusEvent::Read,
            StatusEvent::Fail,
            StatusEvent::Delete,
        ];
        let rank = |s: MessageStatus| match s {
            Sending => 0,
            Sent => 1,
            Delivered => 2,
            Read => 3,
            Failed | Deleted => 4,
        };

        for from in all_status {
            for event in all_events {
                if let Transition::To(to) = transition(from, event) {
                    assert!(rank(to) > rank(from), "{from:?} --{event:?}--> {to:?}");
                }
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        use MessageStatus::*;
        assert_eq!(transition(Delivered, StatusEvent::Fail), Transition::Invalid);
        assert_eq!(transition(Failed, StatusEvent::Delete), Transition::Invalid);
        assert_eq!(transition(Failed, StatusEvent::Read), Transition::Invalid);
        assert_eq!(transition(Deleted, StatusEvent::Ack), Transition::Invalid);
        assert_eq!(transition(Read, StatusEvent::Delete), Transition::To(Deleted));
        assert_eq!(transition(Sent, StatusEvent::Ack), Transition::NoOp);
    }
}
