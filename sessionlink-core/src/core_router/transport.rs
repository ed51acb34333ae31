//! Transport collaborator
//!
//! The router only needs channel-addressed publish/subscribe with a
//! connection flag. [`MemoryHub`] provides that in-process: every
//! [`MemoryTransport`] attached to a hub sees the events emitted on the
//! channels it subscribed to.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::errors::{TransportError, TransportResult};
use crate::wire::RawEvent;

/// Channel-addressed event transport
///
/// Implementations deliver each emitted event at least once to every
/// subscriber of the channel and never interpret the payload.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver events published on `channel` into `sink`
    async fn subscribe(&self, channel: &str, sink: mpsc::Sender<RawEvent>) -> TransportResult<()>;

    async fn unsubscribe(&self, channel: &str) -> TransportResult<()>;

    /// Publish `event` on `channel`
    async fn emit(&self, channel: &str, event: RawEvent) -> TransportResult<()>;

    fn is_connected(&self) -> bool;
}

type Subscribers = HashMap<String, HashMap<u64, mpsc::Sender<RawEvent>>>;

#[derive(Default)]
struct HubInner {
    subscribers: Mutex<Subscribers>,
    history: Mutex<Vec<(String, RawEvent)>>,
    next_id: AtomicU64,
}

/// Shared in-memory broker
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new connected transport to this hub
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Fan `event` out to the subscribers of `channel`
    ///
    /// Delivery into a full sink is dropped with a warning.
    pub async fn publish(&self, channel: &str, event: RawEvent) {
        self.inner
            .history
            .lock()
            .await
            .push((channel.to_string(), event.clone()));

        let sinks: Vec<(u64, mpsc::Sender<RawEvent>)> = {
            let subscribers = self.inner.subscribers.lock().await;
            subscribers
                .get(channel)
                .map(|subs| subs.iter().map(|(id, tx)| (*id, tx.clone())).collect())
                .unwrap_or_default()
        };

        if sinks.is_empty() {
            debug!(channel, event = %event.name, "No subscribers, event dropped");
            return;
        }

        // Never block on a full sink
        let mut closed = Vec::new();
        for (id, tx) in sinks {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    warn!(channel, event = %dropped.name, "Subscriber sink full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.inner.subscribers.lock().await;
            if let Some(subs) = subscribers.get_mut(channel) {
                subs.retain(|id, _| !closed.contains(id));
            }
        }
    }

    /// Every event published so far, in order
    pub async fn history(&self) -> Vec<(String, RawEvent)> {
        self.inner.history.lock().await.clone()
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .await
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

/// One participant's connection to a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    id: u64,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Simulate the connection dropping or coming back
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, channel: &str, sink: mpsc::Sender<RawEvent>) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.hub
            .inner
            .subscribers
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(self.id, sink);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> TransportResult<()> {
        let mut subscribers = self.hub.inner.subscribers.lock().await;
        let removed = subscribers
            .get_mut(channel)
            .and_then(|subs| subs.remove(&self.id));
        match removed {
            Some(_) => Ok(()),
            None => Err(TransportError::NotSubscribed(channel.to_string())),
        }
    }

    async fn emit(&self, channel: &str, event: RawEvent) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.hub.publish(channel, event).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_reaches_channel_subscribers_only() {
        let hub = MemoryHub::new();
        let alice = hub.transport();
        let bob = hub.transport();

        let (bob_tx, mut bob_rx) = mpsc::channel(8);
        let (alice_tx, mut alice_rx) = mpsc::channel(8);
        bob.subscribe("session_bob", bob_tx).await.unwrap();
        alice.subscribe("session_alice", alice_tx).await.unwrap();

        alice
            .emit("session_bob", RawEvent::new("chat:alice:new_message", json!({})))
            .await
            .unwrap();

        let got = bob_rx.recv().await.unwrap();
        assert_eq!(got.name, "chat:alice:new_message");
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(hub.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_transport_refuses() {
        let hub = MemoryHub::new();
        let alice = hub.transport();
        alice.set_connected(false);

        assert_eq!(
            alice.emit("session_bob", RawEvent::new("x", json!(null))).await,
            Err(TransportError::Disconnected)
        );
        let (tx, _rx) = mpsc::channel(1);
        assert!(alice.subscribe("session_alice", tx).await.is_err());
    }

    #[tokio::test]
    async fn test_full_sink_does_not_block_publisher() {
        let hub = MemoryHub::new();
        let alice = hub.transport();
        let bob = hub.transport();
        let (bob_tx, mut bob_rx) = mpsc::channel(1);
        bob.subscribe("session_bob", bob_tx).await.unwrap();

        for n in 0..3 {
            let event = RawEvent::new("typing:alice:start", json!({ "n": n }));
            alice.emit("session_bob", event).await.unwrap();
        }

        assert_eq!(bob_rx.recv().await.unwrap().payload["n"], 0);
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(hub.history().await.len(), 3);
        assert_eq!(hub.subscriber_count("session_bob").await, 1);
    }

    #[tokio::test]
    async fn test_closed_sink_is_unsubscribed() {
        let hub = MemoryHub::new();
        let bob = hub.transport();
        let (tx, rx) = mpsc::channel(1);
        bob.subscribe("session_bob", tx).await.unwrap();
        drop(rx);

        hub.publish("session_bob", RawEvent::new("x", json!(null))).await;
        assert_eq!(hub.subscriber_count("session_bob").await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = MemoryHub::new();
        let bob = hub.transport();
        let (tx, _rx) = mpsc::channel(1);
        bob.subscribe("session_bob", tx).await.unwrap();
        assert_eq!(hub.subscriber_count("session_bob").await, 1);

        bob.unsubscribe("session_bob").await.unwrap();
        assert_eq!(hub.subscriber_count("session_bob").await, 0);
        assert!(bob.unsubscribe("session_bob").await.is_err());
    }
}
