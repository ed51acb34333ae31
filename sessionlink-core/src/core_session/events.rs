//! Session event bus
//!
//! Typed change notifications fanned out over a tokio broadcast channel.
//! Subscribers register explicitly and unregister by dropping their
//! receiver or [`Subscription`].

use tokio::sync::broadcast;
use tracing::warn;

use crate::core_handshake::{HandshakeState, KeyExchangeRequest};
use crate::core_lifecycle::{Message, StatusChange};
use crate::core_presence::{PresenceUpdate, TypingUpdate};
use crate::types::SessionId;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A new chat message from a peer
    MessageReceived(Message),

    MessageStatusChanged(StatusChange),

    Typing(TypingUpdate),

    Presence(PresenceUpdate),

    /// The handshake with `peer` moved to `state`
    HandshakeChanged {
        peer: SessionId,
        state: HandshakeState,
    },

    /// A key exchange request was created or changed status
    RequestChanged(KeyExchangeRequest),

    /// Phase 2 finished with `peer`
    ConversationReady {
        peer: SessionId,
        display_name: Option<String>,
    },
}

/// Coarse event filter for [`Subscription`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Messages,
    Status,
    Typing,
    Presence,
    Handshake,
}

impl SessionEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            SessionEvent::MessageReceived(_) => EventCategory::Messages,
            SessionEvent::MessageStatusChanged(_) => EventCategory::Status,
            SessionEvent::Typing(_) => EventCategory::Typing,
            SessionEvent::Presence(_) => EventCategory::Presence,
            SessionEvent::HandshakeChanged { .. }
            | SessionEvent::RequestChanged(_)
            | SessionEvent::ConversationReady { .. } => EventCategory::Handshake,
        }
    }
}

/// Event broadcaster for session events
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event; returns the number of subscribers that received it
    pub fn emit(&self, event: SessionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn emit_many(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the events of the given categories only
    pub fn subscribe_to(&self, categories: &[EventCategory]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            categories: categories.to_vec(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Filtered event receiver
pub struct Subscription {
    rx: broadcast::Receiver<SessionEvent>,
    categories: Vec<EventCategory>,
}

impl Subscription {
    /// Next matching event, or `None` once the session is gone
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.categories.contains(&event.category()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.categories.contains(&event.category()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_presence::TypingUpdate;

    fn typing() -> SessionEvent {
        let bob = SessionId::new("bob").unwrap();
        SessionEvent::Typing(TypingUpdate {
            conversation: bob.clone(),
            from: bob,
            is_typing: true,
        })
    }

    fn handshake() -> SessionEvent {
        SessionEvent::HandshakeChanged {
            peer: SessionId::new("bob").unwrap(),
            state: HandshakeState::RequestSent,
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let broadcaster = EventBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert_eq!(broadcaster.emit(typing()), 1);
        assert_eq!(rx.recv().await.unwrap(), typing());
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let broadcaster = EventBroadcaster::new(10);
        assert_eq!(broadcaster.emit(typing()), 0);
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let broadcaster = EventBroadcaster::new(10);
        let mut sub = broadcaster.subscribe_to(&[EventCategory::Handshake]);

        broadcaster.emit_many(vec![typing(), handshake(), typing()]);
        assert_eq!(sub.recv().await, Some(handshake()));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_closed_subscription() {
        let broadcaster = EventBroadcaster::new(10);
        let mut sub = broadcaster.subscribe_to(&[EventCategory::Typing]);
        drop(broadcaster);
        assert_eq!(sub.recv().await, None);
    }
}
