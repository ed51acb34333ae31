//! Online/offline state, last write wins

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{SessionId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub online: bool,
    pub timestamp: Timestamp,
}

/// Presence change to hand to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// Conversation the event arrived in
    pub conversation: SessionId,
    /// Session whose presence changed
    pub peer: SessionId,
    pub online: bool,
    pub timestamp: Timestamp,
}

#[derive(Debug, Default)]
pub struct PresenceBook {
    entries: HashMap<SessionId, PresenceState>,
}

impl PresenceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `online` for `peer` unless a newer or equal timestamp is known
    pub fn apply(&mut self, peer: &SessionId, online: bool, timestamp: Timestamp) -> bool {
        match self.entries.get(peer) {
            Some(current) if current.timestamp >= timestamp => false,
            _ => {
                self.entries
                    .insert(peer.clone(), PresenceState { online, timestamp });
                true
            }
        }
    }

    pub fn get(&self, peer: &SessionId) -> Option<PresenceState> {
        self.entries.get(peer).copied()
    }

    pub fn online_peers(&self) -> Vec<SessionId> {
        self.entries
            .iter()
            .filter(|(_, state)| state.online)
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut book = PresenceBook::new();
        let bob = SessionId::new("bob").unwrap();

        assert!(book.apply(&bob, true, Timestamp::from_millis(10)));
        assert!(!book.apply(&bob, false, Timestamp::from_millis(5)));
        assert!(!book.apply(&bob, false, Timestamp::from_millis(10)));
        assert!(book.get(&bob).unwrap().online);

        assert!(book.apply(&bob, false, Timestamp::from_millis(11)));
        assert!(!book.get(&bob).unwrap().online);
        assert!(book.online_peers().is_empty());
    }
}
