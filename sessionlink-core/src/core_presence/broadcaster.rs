//! Typing and presence propagation
//!
//! Outbound indicators go to one peer at a time and never touch the local
//! tracker. Inbound ones are forwarded only while the conversation context
//! with the peer exists, i.e. while keys with that peer are established.

use tokio::time::Instant;
use tracing::debug;

use super::presence::{PresenceBook, PresenceState, PresenceUpdate};
use super::typing::{TypingTracker, TypingUpdate};
use crate::config::PresenceConfig;
use crate::types::{SessionId, Timestamp};
use crate::wire::EventKind;

pub struct PresenceTypingBroadcaster {
    local: SessionId,
    typing: TypingTracker,
    presence: PresenceBook,
    local_online: bool,
}

impl PresenceTypingBroadcaster {
    pub fn new(local: SessionId, config: &PresenceConfig) -> Self {
        Self {
            local,
            typing: TypingTracker::new(config.typing_idle_timeout),
            presence: PresenceBook::new(),
            local_online: false,
        }
    }

    pub fn typing_kind(is_typing: bool) -> EventKind {
        if is_typing {
            EventKind::TypingStart
        } else {
            EventKind::TypingStop
        }
    }

    pub fn presence_kind(online: bool) -> EventKind {
        if online {
            EventKind::PresenceOnline
        } else {
            EventKind::PresenceOffline
        }
    }

    pub fn local_online(&self) -> bool {
        self.local_online
    }

    /// Record the local presence flag; returns whether it changed
    pub fn set_local_presence(&mut self, online: bool) -> bool {
        let changed = self.local_online != online;
        self.local_online = online;
        changed
    }

    /// Inbound typing event in the conversation with `conversation`
    ///
    /// `from` is the typer; it equals the local session for replayed events.
    pub fn on_typing(
        &mut self,
        conversation: &SessionId,
        from: &SessionId,
        is_typing: bool,
        has_context: bool,
        now: Instant,
    ) -> Option<TypingUpdate> {
        if !has_context {
            debug!(peer = %conversation, "No conversation context, discarding typing event");
            return None;
        }
        self.typing.update(conversation, from, is_typing, now);
        Some(TypingUpdate {
            conversation: conversation.clone(),
            from: from.clone(),
            is_typing,
        })
    }

    /// Inbound presence event in the conversation with `conversation`
    ///
    /// `from` is whose presence changed. Replays of our own broadcast are
    /// forwarded as-is and never enter the peer presence book.
    pub fn on_presence(
        &mut self,
        conversation: &SessionId,
        from: &SessionId,
        online: bool,
        timestamp: Timestamp,
        has_context: bool,
    ) -> Option<PresenceUpdate> {
        if !has_context {
            debug!(peer = %conversation, "No conversation context, discarding presence event");
            return None;
        }
        if from != &self.local && !self.presence.apply(from, online, timestamp) {
            debug!(peer = %from, %timestamp, "Stale presence event ignored");
            return None;
        }
        Some(PresenceUpdate {
            conversation: conversation.clone(),
            peer: from.clone(),
            online,
            timestamp,
        })
    }

    /// Typing indicators that went idle
    pub fn sweep(&mut self, now: Instant) -> Vec<TypingUpdate> {
        self.typing.sweep_expired(now)
    }

    pub fn is_typing(&self, conversation: &SessionId, from: &SessionId) -> bool {
        self.typing.is_typing(conversation, from)
    }

    pub fn presence(&self, peer: &SessionId) -> Option<PresenceState> {
        self.presence.get(peer)
    }

    pub fn online_peers(&self) -> Vec<SessionId> {
        let mut peers = self.presence.online_peers();
        peers.sort();
        peers
    }

    pub fn forget_conversation(&mut self, peer: &SessionId) {
        self.typing.clear_conversation(peer);
    }
}
