//! Typing indicators with idle expiry

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::SessionId;

/// A typing indicator change to hand to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUpdate {
    /// Peer whose conversation the indicator belongs to
    pub conversation: SessionId,
    /// Session that is typing
    pub from: SessionId,
    pub is_typing: bool,
}

/// Per (conversation, typer) typing flags; a flag is set while its deadline
/// lies in the future
pub struct TypingTracker {
    idle_timeout: Duration,
    deadlines: HashMap<(SessionId, SessionId), Instant>,
}

impl TypingTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            deadlines: HashMap::new(),
        }
    }

    /// Apply an inbound start/stop; a start refreshes the deadline
    ///
    /// Returns whether the visible flag changed.
    pub fn update(
        &mut self,
        conversation: &SessionId,
        from: &SessionId,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        let key = (conversation.clone(), from.clone());
        if is_typing {
            self.deadlines
                .insert(key, now + self.idle_timeout)
                .is_none()
        } else {
            self.deadlines.remove(&key).is_some()
        }
    }

    pub fn is_typing(&self, conversation: &SessionId, from: &SessionId) -> bool {
        self.deadlines
            .contains_key(&(conversation.clone(), from.clone()))
    }

    /// Clear every indicator whose deadline passed
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<TypingUpdate> {
        let expired: Vec<(SessionId, SessionId)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .map(|key| {
                self.deadlines.remove(&key);
                TypingUpdate {
                    conversation: key.0,
                    from: key.1,
                    is_typing: false,
                }
            })
            .collect()
    }

    /// Forget every indicator in `conversation`
    pub fn clear_conversation(&mut self, conversation: &SessionId) {
        self.deadlines.retain(|(c, _), _| c != conversation);
    }
}
