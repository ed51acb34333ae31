//! Record store collaborator
//!
//! Persisted copies of messages and key exchange requests. The session keeps
//! its own in-memory view and writes through on every change.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::errors::StoreResult;
use super::message::{Message, MessageId};
use crate::core_handshake::{KeyExchangeRequest, RequestId};
use crate::types::SessionId;

/// Persistence interface for messages and key exchange requests
///
/// Writes replace any previous record with the same id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_message(&self, message: &Message) -> StoreResult<()>;

    async fn load_message(&self, id: &MessageId) -> StoreResult<Option<Message>>;

    /// Messages exchanged between `a` and `b`, oldest first
    async fn messages_between(&self, a: &SessionId, b: &SessionId) -> StoreResult<Vec<Message>>;

    async fn save_request(&self, request: &KeyExchangeRequest) -> StoreResult<()>;

    async fn load_request(&self, id: &RequestId) -> StoreResult<Option<KeyExchangeRequest>>;

    /// Every stored request, in no particular order
    async fn list_requests(&self) -> StoreResult<Vec<KeyExchangeRequest>> {
        Ok(Vec::new())
    }
}

/// In-memory record store
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    messages: Arc<RwLock<HashMap<MessageId, Message>>>,
    requests: Arc<RwLock<HashMap<RequestId, KeyExchangeRequest>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save_message(&self, message: &Message) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn load_message(&self, id: &MessageId) -> StoreResult<Option<Message>> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn messages_between(&self, a: &SessionId, b: &SessionId) -> StoreResult<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut found: Vec<Message> = messages
            .values()
            .filter(|m| {
                (&m.sender_session == a && &m.recipient_session == b)
                    || (&m.sender_session == b && &m.recipient_session == a)
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| m.id.token());
        Ok(found)
    }

    async fn save_request(&self, request: &KeyExchangeRequest) -> StoreResult<()> {
        let mut requests = self.requests.write().await;
        requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn load_request(&self, id: &RequestId) -> StoreResult<Option<KeyExchangeRequest>> {
        Ok(self.requests.read().await.get(id).cloned())
    }

    async fn list_requests(&self) -> StoreResult<Vec<KeyExchangeRequest>> {
        Ok(self.requests.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_messages_round_trip() {
        let store = MemoryRecordStore::new();
        let first = Message::new_outbound(&sid("alice"), &sid("bob"), "one".to_string());
        let second = Message::new_outbound(&sid("bob"), &sid("alice"), "two".to_string());
        let other = Message::new_outbound(&sid("alice"), &sid("carol"), "x".to_string());

        store.save_message(&second).await.unwrap();
        store.save_message(&first).await.unwrap();
        store.save_message(&other).await.unwrap();

        assert_eq!(store.load_message(&first.id).await.unwrap(), Some(first.clone()));
        let between = store
            .messages_between(&sid("bob"), &sid("alice"))
            .await
            .unwrap();
        assert_eq!(between, vec![first, second]);
    }

    #[tokio::test]
    async fn test_requests_round_trip() {
        let store = MemoryRecordStore::new();
        let request = KeyExchangeRequest::new_outgoing(sid("alice"), sid("bob"), "hi".to_string());

        assert_eq!(store.load_request(&request.id).await.unwrap(), None);
        store.save_request(&request).await.unwrap();
        assert_eq!(
            store.load_request(&request.id).await.unwrap(),
            Some(request.clone())
        );
        assert_eq!(store.list_requests().await.unwrap().len(), 1);
    }
}
