/*
   SessionHandle

   Single entry point for the application. The facade is moved into a
   spawned task that owns it exclusively; the handle talks to that task
   through a command channel and awaits each reply on a oneshot.

   The task multiplexes three sources in one loop:

     ┌──────────────┐   commands    ┌─────────────────────────────┐
     │ SessionHandle│──────────────►│                             │
     └──────────────┘               │     Session event loop      │
     ┌──────────────┐   RawEvent    │  (owns the facade, select!) │
     │  Transport   │──────────────►│                             │
     └──────────────┘               │                             │
     ┌──────────────┐   tick        │                             │
     │   interval   │──────────────►│                             │
     └──────────────┘               └──────────────┬──────────────┘
                                                   │ SessionEvent
                                                   ▼
                                          broadcast subscribers

   E.G: send_message(peer, "hi") -> SessionCommand::SendMessage { .., reply }
*/

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::errors::{SessionError, SessionResult};
use super::events::{EventBroadcaster, EventCategory, Subscription};
use super::facade::SessionMessagingFacade;
use crate::config::Config;
use crate::core_codec::LocalKeyPair;
use crate::core_handshake::{HandshakeState, KeyExchangeRequest, RequestId};
use crate::core_lifecycle::{Message, MessageId, RecordStore, StatusChange};
use crate::core_router::Transport;
use crate::types::SessionId;
use crate::wire::RawEvent;

type Reply<T> = oneshot::Sender<SessionResult<T>>;

/// Commands sent to the session task
#[derive(Debug)]
pub enum SessionCommand {
    SendMessage {
        peer: SessionId,
        content: String,
        reply: Reply<Message>,
    },
    SendKeyExchangeRequest {
        peer: SessionId,
        phrase: String,
        reply: Reply<RequestId>,
    },
    RespondToKeyExchangeRequest {
        peer: SessionId,
        accept: bool,
        reply: Reply<()>,
    },
    CancelKeyExchangeRequest {
        peer: SessionId,
        reply: Reply<RequestId>,
    },
    SetTyping {
        peer: SessionId,
        is_typing: bool,
        reply: Reply<()>,
    },
    SetPresence {
        online: bool,
        reply: Reply<usize>,
    },
    SendReadReceipt {
        peer: SessionId,
        id: MessageId,
        reply: Reply<Vec<StatusChange>>,
    },
    DeleteMessage {
        id: MessageId,
        reply: Reply<Option<StatusChange>>,
    },
    HandshakeState {
        peer: SessionId,
        reply: Reply<HandshakeState>,
    },
    Conversation {
        peer: SessionId,
        reply: Reply<Vec<Message>>,
    },
    PendingRequests {
        reply: Reply<Vec<KeyExchangeRequest>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    local: SessionId,
    command_tx: mpsc::Sender<SessionCommand>,
    events: EventBroadcaster,
}

impl SessionHandle {
    /// Build the session, join its channel and spawn its event loop
    pub async fn spawn(
        local: SessionId,
        keys: LocalKeyPair,
        config: &Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn RecordStore>,
    ) -> SessionResult<(Self, JoinHandle<()>)> {
        let mut facade =
            SessionMessagingFacade::new(local.clone(), keys, config, transport, store);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.session.inbound_buffer.max(1));
        facade.start(inbound_tx).await?;

        let (command_tx, command_rx) = mpsc::channel(config.session.command_buffer.max(1));
        let events = facade.events().clone();

        let session = Session {
            facade,
            command_rx,
            inbound_rx,
            tick_interval: config.session.tick_interval,
        };
        let task = tokio::spawn(session.run());

        Ok((
            SessionHandle {
                local,
                command_tx,
                events,
            },
            task,
        ))
    }

    pub fn local(&self) -> &SessionId {
        &self.local
    }

    /// Subscribe to every session event
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<super::events::SessionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe(&self, categories: &[EventCategory]) -> Subscription {
        self.events.subscribe_to(categories)
    }

    pub async fn send_message(&self, peer: &SessionId, content: &str) -> SessionResult<Message> {
        self.request(|reply| SessionCommand::SendMessage {
            peer: peer.clone(),
            content: content.to_string(),
            reply,
        })
        .await
    }

    pub async fn send_key_exchange_request(
        &self,
        peer: &SessionId,
        phrase: &str,
    ) -> SessionResult<RequestId> {
        self.request(|reply| SessionCommand::SendKeyExchangeRequest {
            peer: peer.clone(),
            phrase: phrase.to_string(),
            reply,
        })
        .await
    }

    pub async fn respond_to_key_exchange_request(
        &self,
        peer: &SessionId,
        accept: bool,
    ) -> SessionResult<()> {
        self.request(|reply| SessionCommand::RespondToKeyExchangeRequest {
            peer: peer.clone(),
            accept,
            reply,
        })
        .await
    }

    pub async fn cancel_key_exchange_request(&self, peer: &SessionId) -> SessionResult<RequestId> {
        self.request(|reply| SessionCommand::CancelKeyExchangeRequest {
            peer: peer.clone(),
            reply,
        })
        .await
    }

    pub async fn set_typing_state(&self, peer: &SessionId, is_typing: bool) -> SessionResult<()> {
        self.request(|reply| SessionCommand::SetTyping {
            peer: peer.clone(),
            is_typing,
            reply,
        })
        .await
    }

    pub async fn set_presence_state(&self, online: bool) -> SessionResult<usize> {
        self.request(|reply| SessionCommand::SetPresence { online, reply })
            .await
    }

    pub async fn send_read_receipt(
        &self,
        peer: &SessionId,
        id: &MessageId,
    ) -> SessionResult<Vec<StatusChange>> {
        self.request(|reply| SessionCommand::SendReadReceipt {
            peer: peer.clone(),
            id: id.clone(),
            reply,
        })
        .await
    }

    pub async fn delete_message(&self, id: &MessageId) -> SessionResult<Option<StatusChange>> {
        self.request(|reply| SessionCommand::DeleteMessage {
            id: id.clone(),
            reply,
        })
        .await
    }

    pub async fn handshake_state(&self, peer: &SessionId) -> SessionResult<HandshakeState> {
        self.request(|reply| SessionCommand::HandshakeState {
            peer: peer.clone(),
            reply,
        })
        .await
    }

    pub async fn conversation(&self, peer: &SessionId) -> SessionResult<Vec<Message>> {
        self.request(|reply| SessionCommand::Conversation {
            peer: peer.clone(),
            reply,
        })
        .await
    }

    pub async fn pending_requests(&self) -> SessionResult<Vec<KeyExchangeRequest>> {
        self.request(|reply| SessionCommand::PendingRequests { reply })
            .await
    }

    /// Leave the channel and stop the event loop
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> SessionResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::ActorClosed)?;
        reply_rx.await.map_err(|_| SessionError::ActorClosed)?
    }
}

/// Task-side state owning the facade
struct Session {
    facade: SessionMessagingFacade,
    command_rx: mpsc::Receiver<SessionCommand>,
    inbound_rx: mpsc::Receiver<RawEvent>,
    tick_interval: std::time::Duration,
}

impl Session {
    async fn run(mut self) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        debug!(session = %self.facade.local(), "All handles dropped");
                        if let Err(e) = self.facade.stop().await {
                            warn!(error = %e, "Leaving channel failed");
                        }
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(raw) = self.inbound_rx.recv() => {
                    let name = raw.name.clone();
                    if let Err(e) = self.facade.on_inbound_transport_event(raw).await {
                        debug!(event = %name, error = %e, "Inbound event not applied");
                    }
                }
                _ = ticker.tick() => {
                    self.facade.tick(Instant::now()).await;
                }
            }
        }

        info!(session = %self.facade.local(), "Session event loop stopped");
    }

    /// Returns false once the loop should stop
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        let facade = &mut self.facade;
        match command {
            SessionCommand::SendMessage {
                peer,
                content,
                reply,
            } => {
                let _ = reply.send(facade.send_message(&peer, &content).await);
            }
            SessionCommand::SendKeyExchangeRequest {
                peer,
                phrase,
                reply,
            } => {
                let _ = reply.send(facade.send_key_exchange_request(&peer, &phrase).await);
            }
            SessionCommand::RespondToKeyExchangeRequest {
                peer,
                accept,
                reply,
            } => {
                let _ = reply.send(facade.respond_to_key_exchange_request(&peer, accept).await);
            }
            SessionCommand::CancelKeyExchangeRequest { peer, reply } => {
                let _ = reply.send(facade.cancel_key_exchange_request(&peer).await);
            }
            SessionCommand::SetTyping {
                peer,
                is_typing,
                reply,
            } => {
                let _ = reply.send(facade.set_typing_state(&peer, is_typing).await);
            }
            SessionCommand::SetPresence { online, reply } => {
                let _ = reply.send(facade.set_presence_state(online).await);
            }
            SessionCommand::SendReadReceipt { peer, id, reply } => {
                let _ = reply.send(facade.send_read_receipt(&peer, &id).await);
            }
            SessionCommand::DeleteMessage { id, reply } => {
                let _ = reply.send(facade.delete_message(&id).await);
            }
            SessionCommand::HandshakeState { peer, reply } => {
                let _ = reply.send(Ok(facade.handshake_state(&peer)));
            }
            SessionCommand::Conversation { peer, reply } => {
                let _ = reply.send(Ok(facade.conversation(&peer)));
            }
            SessionCommand::PendingRequests { reply } => {
                let _ = reply.send(Ok(facade.pending_requests()));
            }
            SessionCommand::Shutdown { reply } => {
                let result = facade.stop().await;
                let _ = reply.send(result);
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_lifecycle::MemoryRecordStore;
    use crate::core_router::MemoryHub;
    use crate::core_session::SessionEvent;
    use std::time::Duration;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    async fn spawn(hub: &MemoryHub, name: &str) -> (SessionHandle, JoinHandle<()>) {
        SessionHandle::spawn(
            sid(name),
            LocalKeyPair::generate(),
            &Config::default(),
            Arc::new(hub.transport()),
            Arc::new(MemoryRecordStore::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let hub = MemoryHub::new();
        let (alice, task) = spawn(&hub, "alice").await;
        assert_eq!(hub.subscriber_count(&sid("alice").channel()).await, 1);

        alice.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(hub.subscriber_count(&sid("alice").channel()).await, 0);
        assert_eq!(
            alice.handshake_state(&sid("bob")).await,
            Err(SessionError::ActorClosed)
        );
    }

    #[tokio::test]
    async fn test_conversation_over_handles() {
        let hub = MemoryHub::new();
        let (alice, _alice_task) = spawn(&hub, "alice").await;
        let (bob, _bob_task) = spawn(&hub, "bob").await;
        let mut bob_events = bob.subscribe(&[EventCategory::Handshake, EventCategory::Messages]);

        alice
            .send_key_exchange_request(bob.local(), "hello")
            .await
            .unwrap();

        let wait = async {
            loop {
                if let Some(SessionEvent::HandshakeChanged {
                    state: HandshakeState::RequestReceived,
                    ..
                }) = bob_events.recv().await
                {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();
        assert_eq!(bob.pending_requests().await.unwrap().len(), 1);

        bob.respond_to_key_exchange_request(alice.local(), true)
            .await
            .unwrap();
        let ready = async {
            loop {
                if let Some(SessionEvent::ConversationReady { .. }) = bob_events.recv().await {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), ready).await.unwrap();

        alice.send_message(bob.local(), "hi").await.unwrap();
        let received = async {
            loop {
                if let Some(SessionEvent::MessageReceived(message)) = bob_events.recv().await {
                    return message;
                }
            }
        };
        let message = tokio::time::timeout(Duration::from_secs(5), received)
            .await
            .unwrap();
        assert_eq!(message.content, "hi");
        assert_eq!(bob.conversation(alice.local()).await.unwrap().len(), 1);
    }
}
