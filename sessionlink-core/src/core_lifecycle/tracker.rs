//! Per-message status tracking
//!
//! Holds the in-memory view of every message the session sent or received
//! and writes each change through to the [`RecordStore`]. All transitions go
//! through [`transition`]; a rejected event leaves the message untouched.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::errors::{LifecycleError, LifecycleResult};
use super::message::{transition, Message, MessageId, MessageStatus, StatusChange, StatusEvent, Transition};
use super::store::RecordStore;
use crate::types::SessionId;

pub struct MessageLifecycle {
    local: SessionId,
    store: Arc<dyn RecordStore>,
    messages: HashMap<MessageId, Message>,
}

impl MessageLifecycle {
    pub fn new(local: SessionId, store: Arc<dyn RecordStore>) -> Self {
        Self {
            local,
            store,
            messages: HashMap::new(),
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn status(&self, id: &MessageId) -> Option<MessageStatus> {
        self.messages.get(id).map(|m| m.status)
    }

    /// Messages exchanged with `peer`, oldest first
    pub fn conversation(&self, peer: &SessionId) -> Vec<&Message> {
        let mut found: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.peer(&self.local) == peer)
            .collect();
        found.sort_by_key(|m| m.id.token());
        found
    }

    /// Create and persist a new outbound message in Sending
    pub async fn record_outbound(
        &mut self,
        recipient: &SessionId,
        content: String,
    ) -> LifecycleResult<Message> {
        let message = Message::new_outbound(&self.local, recipient, content);
        self.store.save_message(&message).await?;
        self.messages.insert(message.id.clone(), message.clone());
        debug!(id = %message.id, recipient = %recipient, "Recorded outbound message");
        Ok(message)
    }

    /// Store a message received from a peer as Delivered
    ///
    /// Returns false for a message id already known.
    pub async fn record_inbound(&mut self, mut message: Message) -> LifecycleResult<bool> {
        if self.messages.contains_key(&message.id) {
            debug!(id = %message.id, "Ignoring repeated inbound message");
            return Ok(false);
        }
        if message.recipient_session != self.local || message.id.sender() != &message.sender_session {
            return Err(LifecycleError::ForeignMessage {
                id: message.id.to_string(),
                session: self.local.to_string(),
            });
        }

        message.status = MessageStatus::Delivered;
        self.store.save_message(&message).await?;
        self.messages.insert(message.id.clone(), message);
        Ok(true)
    }

    /// Router accepted the envelope
    pub async fn on_ack(&mut self, id: &MessageId) -> LifecycleResult<Option<StatusChange>> {
        self.apply(id, StatusEvent::Ack).await
    }

    /// Peer confirmed delivery of one of our messages
    ///
    /// Unknown ids are logged and ignored.
    pub async fn on_delivery_receipt(
        &mut self,
        id: &MessageId,
        from: &SessionId,
    ) -> LifecycleResult<Option<StatusChange>> {
        let addressed_to_sender = self
            .messages
            .get(id)
            .map(|m| &m.recipient_session == from && m.sender_session == self.local);
        match addressed_to_sender {
            None => {
                debug!(id = %id, from = %from, "Delivery receipt for unknown message");
                Ok(None)
            }
            Some(false) => {
                warn!(id = %id, from = %from, "Delivery receipt from a session that did not receive the message");
                Ok(None)
            }
            Some(true) => self.apply(id, StatusEvent::Delivered).await,
        }
    }

    /// Peer read `id`; everything we sent them up to it is read too
    ///
    /// Never fails on unknown ids: the cascade uses the id's time token.
    pub async fn on_read_receipt(
        &mut self,
        id: &MessageId,
        from: &SessionId,
    ) -> LifecycleResult<Vec<StatusChange>> {
        if id.sender() != &self.local {
            warn!(id = %id, from = %from, "Read receipt for a message we did not send");
            return Ok(Vec::new());
        }
        let local = self.local.clone();
        self.cascade_read(id.token(), &local, from).await
    }

    /// Local user read `id` from `peer`, plus every earlier message from them
    pub async fn mark_read_inbound(
        &mut self,
        id: &MessageId,
        peer: &SessionId,
    ) -> LifecycleResult<Vec<StatusChange>> {
        if id.sender() != peer {
            return Err(LifecycleError::ForeignMessage {
                id: id.to_string(),
                session: peer.to_string(),
            });
        }
        let local = self.local.clone();
        self.cascade_read(id.token(), peer, &local).await
    }

    pub async fn mark_failed(&mut self, id: &MessageId) -> LifecycleResult<StatusChange> {
        self.apply(id, StatusEvent::Fail)
            .await?
            .ok_or_else(|| LifecycleError::InvalidTransition {
                id: id.to_string(),
                from: MessageStatus::Failed,
                event: StatusEvent::Fail,
            })
    }

    pub async fn delete(&mut self, id: &MessageId) -> LifecycleResult<Option<StatusChange>> {
        self.apply(id, StatusEvent::Delete).await
    }

    async fn cascade_read(
        &mut self,
        up_to: u64,
        sender: &SessionId,
        recipient: &SessionId,
    ) -> LifecycleResult<Vec<StatusChange>> {
        let mut targets: Vec<(u64, MessageId)> = self
            .messages
            .values()
            .filter(|m| &m.sender_session == sender && &m.recipient_session == recipient)
            .filter(|m| m.id.token() <= up_to)
            .filter(|m| {
                matches!(
                    transition(m.status, StatusEvent::Read),
                    Transition::To(MessageStatus::Read)
                )
            })
            .map(|m| (m.id.token(), m.id.clone()))
            .collect();
        targets.sort_by_key(|(token, _)| *token);

        let mut changes = Vec::with_capacity(targets.len());
        for (_, id) in targets {
            match self.apply(&id, StatusEvent::Read).await {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => {}
                Err(e) => warn!(id = %id, error = %e, "Read cascade skipped message"),
            }
        }
        Ok(changes)
    }

    async fn apply(
        &mut self,
        id: &MessageId,
        event: StatusEvent,
    ) -> LifecycleResult<Option<StatusChange>> {
        let message = self
            .messages
            .get(id)
            .ok_or_else(|| LifecycleError::UnknownMessage(id.to_string()))?;
        let from = message.status;

        let to = match transition(from, event) {
            Transition::To(to) => to,
            Transition::NoOp => return Ok(None),
            Transition::Invalid => {
                return Err(LifecycleError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    event,
                })
            }
        };

        let mut updated = message.clone();
        updated.status = to;
        self.store.save_message(&updated).await?;
        self.messages.insert(id.clone(), updated);

        debug!(id = %id, ?from, ?to, "Message status changed");
        Ok(Some(StatusChange {
            id: id.clone(),
            from,
            to,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_lifecycle::store::MemoryRecordStore;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn tracker() -> (MessageLifecycle, MemoryRecordStore) {
        let store = MemoryRecordStore::new();
        (
            MessageLifecycle::new(sid("alice"), Arc::new(store.clone())),
            store,
        )
    }

    #[tokio::test]
    async fn test_outbound_happy_path() {
        let (mut lc, store) = tracker();
        let msg = lc.record_outbound(&sid("bob"), "hi".to_string()).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Sending);

        let change = lc.on_ack(&msg.id).await.unwrap().unwrap();
        assert_eq!((change.from, change.to), (MessageStatus::Sending, MessageStatus::Sent));
        assert_eq!(lc.on_ack(&msg.id).await.unwrap(), None);

        lc.on_delivery_receipt(&msg.id, &sid("bob")).await.unwrap();
        assert_eq!(lc.status(&msg.id), Some(MessageStatus::Delivered));

        let persisted = store.load_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_unknown_delivery_receipt_is_ignored() {
        let (mut lc, _) = tracker();
        let id = MessageId::parse("msg_1_alice").unwrap();
        assert_eq!(lc.on_delivery_receipt(&id, &sid("bob")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_cascade() {
        let (mut lc, _) = tracker();
        let m1 = lc.record_outbound(&sid("bob"), "1".to_string()).await.unwrap();
        let m2 = lc.record_outbound(&sid("bob"), "2".to_string()).await.unwrap();
        let m3 = lc.record_outbound(&sid("bob"), "3".to_string()).await.unwrap();
        let to_carol = lc.record_outbound(&sid("carol"), "c".to_string()).await.unwrap();
        for m in [&m1, &m2, &m3, &to_carol] {
            lc.on_ack(&m.id).await.unwrap();
        }
        lc.on_delivery_receipt(&m1.id, &sid("bob")).await.unwrap();

        let changes = lc.on_read_receipt(&m2.id, &sid("bob")).await.unwrap();
        let ids: Vec<_> = changes.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![m1.id.clone(), m2.id.clone()]);

        assert_eq!(lc.status(&m1.id), Some(MessageStatus::Read));
        assert_eq!(lc.status(&m2.id), Some(MessageStatus::Read));
        assert_eq!(lc.status(&m3.id), Some(MessageStatus::Sent));
        assert_eq!(lc.status(&to_carol.id), Some(MessageStatus::Sent));
    }

    #[tokio::test]
    async fn test_read_cascade_skips_terminal_and_unknown_target() {
        let (mut lc, _) = tracker();
        let m1 = lc.record_outbound(&sid("bob"), "1".to_string()).await.unwrap();
        let m2 = lc.record_outbound(&sid("bob"), "2".to_string()).await.unwrap();
        lc.mark_failed(&m1.id).await.unwrap();
        lc.on_ack(&m2.id).await.unwrap();

        let later = MessageId::parse(&format!("msg_{}_alice", m2.id.token() + 1000)).unwrap();
        let changes = lc.on_read_receipt(&later, &sid("bob")).await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(lc.status(&m1.id), Some(MessageStatus::Failed));
        assert_eq!(lc.status(&m2.id), Some(MessageStatus::Read));
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state() {
        let (mut lc, _) = tracker();
        let msg = lc.record_outbound(&sid("bob"), "x".to_string()).await.unwrap();
        lc.on_ack(&msg.id).await.unwrap();
        lc.on_delivery_receipt(&msg.id, &sid("bob")).await.unwrap();

        let err = lc.mark_failed(&msg.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert_eq!(lc.status(&msg.id), Some(MessageStatus::Delivered));

        lc.delete(&msg.id).await.unwrap();
        assert_eq!(lc.status(&msg.id), Some(MessageStatus::Deleted));
        assert!(lc.on_ack(&msg.id).await.is_err());
    }

    #[tokio::test]
    async fn test_inbound_messages() {
        let (mut lc, _) = tracker();
        let incoming = Message::new_outbound(&sid("bob"), &sid("alice"), "hey".to_string());

        assert!(lc.record_inbound(incoming.clone()).await.unwrap());
        assert!(!lc.record_inbound(incoming.clone()).await.unwrap());
        assert_eq!(lc.status(&incoming.id), Some(MessageStatus::Delivered));

        let changes = lc.mark_read_inbound(&incoming.id, &sid("bob")).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(lc.conversation(&sid("bob")).len(), 1);

        let misaddressed = Message::new_outbound(&sid("bob"), &sid("carol"), "x".to_string());
        assert!(lc.record_inbound(misaddressed).await.is_err());
    }
}
