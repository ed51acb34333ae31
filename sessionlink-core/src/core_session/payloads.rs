//! Plaintext bodies carried inside encrypted envelopes

use serde::{Deserialize, Serialize};

use crate::core_lifecycle::MessageId;
use crate::types::{SessionId, Timestamp};

/// `user_data_exchange:<sid>:data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDataBody {
    pub session_id: SessionId,
    pub display_name: String,
}

/// `conversation_created:<sid>:data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCreatedBody {
    pub session_id: SessionId,
}

/// `chat:<sid>:new_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBody {
    pub id: MessageId,
    pub content: String,
    pub timestamp: Timestamp,
}

/// `message:<sid>:acked` and both `receipt` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRefBody {
    pub id: MessageId,
}

/// Body of typing and presence events; the action type carries the state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBody {}
