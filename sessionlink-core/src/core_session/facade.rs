/*
    SessionMessagingFacade - the only entry point callers use

    Owns every per-session component and runs each operation to completion
    on the caller's task. [`SessionHandle`](super::handle::SessionHandle)
    wraps it in a single-owner event loop.

    Outbound:
      user action ─► handshake gate ─► EnvelopeCodec::seal ─► ChannelRouter::send_to_recipient
                                                                     │
                                              MessageLifecycle ◄─────┘ ack / failed

    Inbound:
      RawEvent ─► ChannelRouter::on_inbound (dedup) ─┬─ key_exchange ─► KeyExchangeHandshake
                                                     │
                                                     └─ encrypted ─► EnvelopeCodec::open ─┬─► handshake phase 2
                                                                                          ├─► MessageLifecycle
                                                                                          └─► PresenceTypingBroadcaster
*/

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::errors::{SessionError, SessionResult};
use super::events::{EventBroadcaster, EventCategory, SessionEvent, Subscription};
use super::payloads::{ChatBody, ConversationCreatedBody, MessageRefBody, SignalBody, UserDataBody};
use crate::config::Config;
use crate::core_codec::{decode_envelope, CodecError, EncryptedEnvelope, EnvelopeCodec, LocalKeyPair};
use crate::core_handshake::{
    HandshakeError, HandshakeState, KeyExchangeHandshake, KeyExchangeRequest, OutgoingKer,
    Phase2Action, RequestId,
};
use crate::core_lifecycle::{
    LifecycleError, Message, MessageId, MessageLifecycle, MessageStatus, RecordStore, StatusChange,
};
use crate::core_presence::{PresenceState, PresenceTypingBroadcaster};
use crate::core_router::{metrics, ChannelRouter, RoutedEvent, Transport};
use crate::types::SessionId;
use crate::wire::{EventKind, RawEvent};

/// Encrypted events held per peer until keys exist
const MAX_BUFFERED_PER_PEER: usize = 64;

pub struct SessionMessagingFacade {
    local: SessionId,
    display_name: String,
    codec: EnvelopeCodec,
    handshake: KeyExchangeHandshake,
    router: ChannelRouter,
    lifecycle: MessageLifecycle,
    presence: PresenceTypingBroadcaster,
    store: Arc<dyn RecordStore>,
    events: EventBroadcaster,
    /// Encrypted events that arrived while phase 1 was still open
    early_events: HashMap<SessionId, Vec<RoutedEvent>>,
    reported_states: HashMap<SessionId, HandshakeState>,
}

impl SessionMessagingFacade {
    pub fn new(
        local: SessionId,
        keys: LocalKeyPair,
        config: &Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            display_name: config.session.display_name.clone(),
            codec: EnvelopeCodec::new(local.clone()),
            handshake: KeyExchangeHandshake::new(local.clone(), keys, &config.handshake),
            router: ChannelRouter::new(local.clone(), transport, &config.router),
            lifecycle: MessageLifecycle::new(local.clone(), store.clone()),
            presence: PresenceTypingBroadcaster::new(local.clone(), &config.presence),
            store,
            events: EventBroadcaster::new(config.session.event_buffer),
            early_events: HashMap::new(),
            reported_states: HashMap::new(),
            local,
        }
    }

    /// Join the local channel; inbound events are delivered into `inbound`
    pub async fn start(&mut self, inbound: mpsc::Sender<RawEvent>) -> SessionResult<()> {
        self.router.join(inbound).await?;
        info!(session = %self.local, "Session started");
        Ok(())
    }

    /// Leave the local channel
    pub async fn stop(&mut self) -> SessionResult<()> {
        self.router.leave().await?;
        info!(session = %self.local, "Session stopped");
        Ok(())
    }

    pub fn local(&self) -> &SessionId {
        &self.local
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn subscribe(&self, categories: &[EventCategory]) -> Subscription {
        self.events.subscribe_to(categories)
    }

    pub fn handshake_state(&self, peer: &SessionId) -> HandshakeState {
        self.handshake.state(peer)
    }

    pub fn pending_requests(&self) -> Vec<KeyExchangeRequest> {
        self.handshake
            .pending_incoming()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn peer_display_name(&self, peer: &SessionId) -> Option<&str> {
        self.handshake.peer_display_name(peer)
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.lifecycle.get(id)
    }

    pub fn conversation(&self, peer: &SessionId) -> Vec<Message> {
        self.lifecycle
            .conversation(peer)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn is_typing(&self, peer: &SessionId) -> bool {
        self.presence.is_typing(peer, peer)
    }

    /// Last presence reported by `peer`
    pub fn peer_presence(&self, peer: &SessionId) -> Option<PresenceState> {
        self.presence.presence(peer)
    }

    /// Peers whose latest presence is online
    pub fn online_peers(&self) -> Vec<SessionId> {
        self.presence.online_peers()
    }

    /// Presence we last announced
    pub fn local_online(&self) -> bool {
        self.presence.local_online()
    }

    // ------------------------------------------------------------------
    // Key exchange
    // ------------------------------------------------------------------

    pub async fn send_key_exchange_request(
        &mut self,
        peer: &SessionId,
        phrase: &str,
    ) -> SessionResult<RequestId> {
        let outgoing = self.handshake.send_request(peer, phrase)?;
        let id = RequestId::parse(&outgoing.envelope.request_id)?;

        match self.emit_ker(&outgoing).await {
            Ok(()) => self.handshake.mark_sent(&id)?,
            Err(e) => {
                warn!(peer = %peer, request_id = %id, error = %e, "Key exchange request not sent");
                self.handshake.abandon_request(&id);
                self.sync_handshake(peer).await;
                return Err(e);
            }
        }

        self.sync_handshake(peer).await;
        Ok(id)
    }

    /// Accept or decline the pending request from `peer`
    pub async fn respond_to_key_exchange_request(
        &mut self,
        peer: &SessionId,
        accept: bool,
    ) -> SessionResult<()> {
        if !accept {
            let notice = self.handshake.decline_request(peer)?;
            self.sync_handshake(peer).await;
            if let Err(e) = self.emit_ker(&notice).await {
                warn!(peer = %peer, error = %e, "Decline notice not delivered");
            }
            return Ok(());
        }

        let response = self.handshake.accept_request(peer)?;
        self.emit_ker(&response).await?;
        let key = self.handshake.complete_accept(peer)?;
        self.codec.bind_peer(peer.clone(), key);
        self.sync_handshake(peer).await;
        self.on_keys_established(peer).await;
        Ok(())
    }

    /// Withdraw our outstanding request and tell the peer
    ///
    /// The notice is best effort; the local cancel stands either way.
    pub async fn cancel_key_exchange_request(&mut self, peer: &SessionId) -> SessionResult<RequestId> {
        let notice = self.handshake.cancel_request(peer)?;
        let id = RequestId::parse(&notice.envelope.request_id)?;
        self.early_events.remove(peer);
        self.sync_handshake(peer).await;
        if let Err(e) = self.emit_ker(&notice).await {
            warn!(peer = %peer, request_id = %id, error = %e, "Cancel notice not delivered");
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send a chat message; the returned copy reflects the final status
    pub async fn send_message(&mut self, peer: &SessionId, content: &str) -> SessionResult<Message> {
        self.require_keys(peer)?;

        let message = self
            .lifecycle
            .record_outbound(peer, content.to_string())
            .await?;
        let body = ChatBody {
            id: message.id.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
        };

        if let Err(e) = self.send_sealed(EventKind::NewMessage, &body, peer).await {
            warn!(id = %message.id, peer = %peer, error = %e, "Message send failed");
            match self.lifecycle.mark_failed(&message.id).await {
                Ok(change) => self.emit_status(change),
                Err(fail_err) => warn!(id = %message.id, error = %fail_err, "Could not mark message failed"),
            }
            return Err(e);
        }

        if let Some(change) = self.lifecycle.on_ack(&message.id).await? {
            self.emit_status(change);
        }
        let sent = self
            .lifecycle
            .get(&message.id)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownMessage(message.id.to_string()))?;
        Ok(sent)
    }

    /// Mark `id` (and everything before it from `peer`) read and tell the peer
    pub async fn send_read_receipt(
        &mut self,
        peer: &SessionId,
        id: &MessageId,
    ) -> SessionResult<Vec<StatusChange>> {
        self.require_keys(peer)?;
        let changes = self.lifecycle.mark_read_inbound(id, peer).await?;
        for change in &changes {
            self.emit_status(change.clone());
        }

        let body = MessageRefBody { id: id.clone() };
        self.send_sealed(EventKind::ReceiptRead, &body, peer).await?;
        Ok(changes)
    }

    pub async fn delete_message(&mut self, id: &MessageId) -> SessionResult<Option<StatusChange>> {
        let change = self.lifecycle.delete(id).await?;
        if let Some(change) = &change {
            self.emit_status(change.clone());
        }
        Ok(change)
    }

    // ------------------------------------------------------------------
    // Typing and presence
    // ------------------------------------------------------------------

    pub async fn set_typing_state(&mut self, peer: &SessionId, is_typing: bool) -> SessionResult<()> {
        self.require_keys(peer)?;
        let kind = PresenceTypingBroadcaster::typing_kind(is_typing);
        self.send_sealed(kind, &SignalBody::default(), peer).await
    }

    /// Broadcast presence to every peer with an active conversation
    ///
    /// Returns how many peers were notified; the first failure is returned
    /// after every peer was tried.
    pub async fn set_presence_state(&mut self, online: bool) -> SessionResult<usize> {
        self.presence.set_local_presence(online);
        let kind = PresenceTypingBroadcaster::presence_kind(online);
        let mut peers: Vec<SessionId> = self.handshake.established_peers().cloned().collect();
        peers.sort();

        let mut notified = 0;
        let mut first_error = None;
        for peer in &peers {
            match self.send_sealed(kind, &SignalBody::default(), peer).await {
                Ok(()) => notified += 1,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Presence not delivered");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(notified),
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Expire stale requests, sweep idle typing, prune dedup state and retry
    /// unfinished phase-2 sends
    pub async fn tick(&mut self, now: Instant) {
        for peer in self.handshake.expire_stale(now) {
            self.early_events.remove(&peer);
            self.sync_handshake(&peer).await;
        }

        let idle = self.presence.sweep(now);
        self.events
            .emit_many(idle.into_iter().map(SessionEvent::Typing));

        self.router.housekeeping(now);

        let unfinished: Vec<SessionId> = self
            .handshake
            .established_peers()
            .filter(|peer| self.handshake.next_phase2_action(peer).is_some())
            .cloned()
            .collect();
        for peer in unfinished {
            self.drive_phase2(&peer).await;
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process one event delivered by the transport
    ///
    /// Redeliveries return `Ok(())` without side effects.
    pub async fn on_inbound_transport_event(&mut self, raw: RawEvent) -> SessionResult<()> {
        let routed = match self.router.on_inbound(raw) {
            Ok(Some(routed)) => routed,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "Rejected inbound event");
                return Err(e.into());
            }
        };

        let fingerprint = routed.fingerprint.clone();
        let result = if routed.name.kind.is_plaintext() {
            self.handle_key_exchange(routed).await
        } else {
            self.handle_encrypted(routed).await
        };
        if let Err(e) = &result {
            if e.is_unusable_payload() {
                self.router.forget(&fingerprint);
            }
        }
        result
    }

    async fn handle_key_exchange(&mut self, routed: RoutedEvent) -> SessionResult<()> {
        let kind = routed.name.kind;
        let sender = routed.name.sender;
        let ker = self.codec.decode_ker(kind, &routed.payload)?;

        let outcome = match kind {
            EventKind::KeyExchangeRequest => self
                .handshake
                .receive_request(&sender, &ker)
                .map(|_| None),
            EventKind::KeyExchangeResponse => self.handshake.receive_response(&sender, &ker).map(Some),
            EventKind::KeyExchangeDecline => self
                .handshake
                .receive_decline(&sender, &ker)
                .map(|_| None),
            EventKind::KeyExchangeCancel => self
                .handshake
                .receive_cancel(&sender, &ker)
                .map(|_| {
                    self.early_events.remove(&sender);
                    None
                }),
            other => Err(HandshakeError::MalformedPayload(format!(
                "{} is not a key exchange event",
                other.family()
            ))),
        };

        let key = match outcome {
            Ok(key) => key,
            Err(e) => {
                warn!(peer = %sender, request_id = %ker.request_id, error = %e, "Key exchange event rejected");
                self.sync_handshake(&sender).await;
                return Err(e.into());
            }
        };

        if let Some(key) = key {
            self.codec.bind_peer(sender.clone(), key);
            self.sync_handshake(&sender).await;
            self.on_keys_established(&sender).await;
        } else {
            self.sync_handshake(&sender).await;
        }
        Ok(())
    }

    async fn handle_encrypted(&mut self, routed: RoutedEvent) -> SessionResult<()> {
        let envelope = decode_envelope(&routed.payload)?;
        let sender = routed.name.sender.clone();

        // Replays of our own events are addressed to the peer
        let peer = if sender == self.local {
            envelope.conversation_id.clone()
        } else if envelope.conversation_id != self.local {
            warn!(sender = %sender, addressed_to = %envelope.conversation_id, "Misaddressed envelope");
            return Err(SessionError::Misaddressed {
                sender,
                addressed_to: envelope.conversation_id,
            });
        } else {
            sender.clone()
        };

        if !self.codec.has_key(&peer) {
            if self.handshake.state(&peer).is_awaiting() && envelope.checksum_matches() {
                let buffered = self.early_events.entry(peer.clone()).or_default();
                if buffered.len() < MAX_BUFFERED_PER_PEER {
                    debug!(peer = %peer, event = %routed.name, "Buffering event until keys exist");
                    buffered.push(routed);
                    return Ok(());
                }
                warn!(peer = %peer, "Early event buffer full, dropping event");
            }
        }

        self.dispatch_encrypted(&routed.name.kind, &sender, &peer, &envelope)
            .await
    }

    async fn dispatch_encrypted(
        &mut self,
        kind: &EventKind,
        sender: &SessionId,
        peer: &SessionId,
        envelope: &EncryptedEnvelope,
    ) -> SessionResult<()> {
        let kind = *kind;
        match kind {
            EventKind::UserData => {
                let body: UserDataBody = self.open(kind, peer, envelope)?;
                if sender == &self.local {
                    return Ok(());
                }
                if body.session_id != *sender {
                    warn!(peer = %peer, claimed = %body.session_id, "User data names another session");
                }
                self.handshake
                    .receive_user_data(peer, &body.display_name)?;
                self.drive_phase2(peer).await;
                self.sync_handshake(peer).await;
            }
            EventKind::ConversationCreated => {
                let _body: ConversationCreatedBody = self.open(kind, peer, envelope)?;
                if sender == &self.local {
                    return Ok(());
                }
                self.handshake.receive_confirmation(peer)?;
                self.drive_phase2(peer).await;
                self.sync_handshake(peer).await;
            }
            EventKind::TypingStart | EventKind::TypingStop => {
                let _body: SignalBody = self.open(kind, peer, envelope)?;
                let has_context = self.handshake.has_keys(peer);
                let is_typing = kind == EventKind::TypingStart;
                if let Some(update) =
                    self.presence
                        .on_typing(peer, sender, is_typing, has_context, Instant::now())
                {
                    self.events.emit(SessionEvent::Typing(update));
                }
            }
            EventKind::PresenceOnline | EventKind::PresenceOffline => {
                let _body: SignalBody = self.open(kind, peer, envelope)?;
                let has_context = self.handshake.has_keys(peer);
                let online = kind == EventKind::PresenceOnline;
                if let Some(update) =
                    self.presence
                        .on_presence(peer, sender, online, envelope.timestamp, has_context)
                {
                    self.events.emit(SessionEvent::Presence(update));
                }
            }
            EventKind::NewMessage => {
                let body: ChatBody = self.open(kind, peer, envelope)?;
                if sender == &self.local {
                    debug!(id = %body.id, "Ignoring replay of our own message");
                    return Ok(());
                }
                self.receive_chat(sender, envelope, body).await?;
            }
            EventKind::MessageAcked | EventKind::ReceiptDelivered | EventKind::ReceiptRead
                if sender == &self.local =>
            {
                // Our own acknowledgements carry nothing for us
                let _body: MessageRefBody = self.open(kind, peer, envelope)?;
            }
            EventKind::MessageAcked => {
                let body: MessageRefBody = self.open(kind, peer, envelope)?;
                if body.id.sender() == &self.local {
                    if let Some(change) = self.lifecycle.on_ack(&body.id).await? {
                        self.emit_status(change);
                    }
                }
            }
            EventKind::ReceiptDelivered => {
                let body: MessageRefBody = self.open(kind, peer, envelope)?;
                if let Some(change) = self.lifecycle.on_delivery_receipt(&body.id, sender).await? {
                    self.emit_status(change);
                }
            }
            EventKind::ReceiptRead => {
                let body: MessageRefBody = self.open(kind, peer, envelope)?;
                let changes = self.lifecycle.on_read_receipt(&body.id, sender).await?;
                self.events
                    .emit_many(changes.into_iter().map(SessionEvent::MessageStatusChanged));
            }
            EventKind::KeyExchangeRequest
            | EventKind::KeyExchangeResponse
            | EventKind::KeyExchangeDecline
            | EventKind::KeyExchangeCancel => {
                return Err(CodecError::PlaintextOnly(kind).into());
            }
        }
        Ok(())
    }

    async fn receive_chat(
        &mut self,
        sender: &SessionId,
        envelope: &EncryptedEnvelope,
        body: ChatBody,
    ) -> SessionResult<()> {
        let message = Message {
            id: body.id,
            conversation_id: envelope.conversation_id.clone(),
            sender_session: sender.clone(),
            recipient_session: self.local.clone(),
            content: body.content,
            status: MessageStatus::Delivered,
            timestamp: body.timestamp,
        };
        let id = message.id.clone();

        if !self.lifecycle.record_inbound(message).await? {
            return Ok(());
        }
        if let Some(stored) = self.lifecycle.get(&id).cloned() {
            self.events.emit(SessionEvent::MessageReceived(stored));
        }

        let receipt = MessageRefBody { id: id.clone() };
        if let Err(e) = self
            .send_sealed(EventKind::ReceiptDelivered, &receipt, sender)
            .await
        {
            warn!(id = %id, peer = %sender, error = %e, "Delivery receipt not sent");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Keys with `peer` just became available
    async fn on_keys_established(&mut self, peer: &SessionId) {
        self.drive_phase2(peer).await;

        let buffered = self.early_events.remove(peer).unwrap_or_default();
        if !buffered.is_empty() {
            debug!(peer = %peer, count = buffered.len(), "Replaying buffered events");
        }
        for routed in buffered {
            let result = match decode_envelope(&routed.payload) {
                Ok(envelope) => {
                    self.dispatch_encrypted(&routed.name.kind, &routed.name.sender, peer, &envelope)
                        .await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(peer = %peer, event = %routed.name, error = %e, "Buffered event rejected");
                if e.is_unusable_payload() {
                    self.router.forget(&routed.fingerprint);
                }
            }
        }
        self.sync_handshake(peer).await;
    }

    /// Send whatever phase-2 events the pair still owes the peer
    async fn drive_phase2(&mut self, peer: &SessionId) {
        while let Some(action) = self.handshake.next_phase2_action(peer) {
            let sent = match action {
                Phase2Action::SendUserData => {
                    let body = UserDataBody {
                        session_id: self.local.clone(),
                        display_name: self.display_name.clone(),
                    };
                    self.send_sealed(EventKind::UserData, &body, peer).await
                }
                Phase2Action::SendConfirmation => {
                    let body = ConversationCreatedBody {
                        session_id: self.local.clone(),
                    };
                    self.send_sealed(EventKind::ConversationCreated, &body, peer)
                        .await
                }
            };

            if let Err(e) = sent {
                warn!(peer = %peer, ?action, error = %e, "Phase-2 send failed, will retry");
                return;
            }
            if let Err(e) = self.handshake.record_phase2_sent(peer, action) {
                warn!(peer = %peer, error = %e, "Could not record phase-2 progress");
                return;
            }
        }
    }

    /// Persist changed requests and report state changes
    async fn sync_handshake(&mut self, peer: &SessionId) {
        for request in self.handshake.take_changes() {
            if let Err(e) = self.store.save_request(&request).await {
                warn!(request_id = %request.id, error = %e, "Could not persist key exchange request");
            }
            self.events.emit(SessionEvent::RequestChanged(request));
        }

        let state = self.handshake.state(peer);
        if self.reported_states.insert(peer.clone(), state) == Some(state) {
            return;
        }
        self.events.emit(SessionEvent::HandshakeChanged {
            peer: peer.clone(),
            state,
        });
        if state == HandshakeState::DataExchanged {
            info!(peer = %peer, "Conversation ready");
            self.events.emit(SessionEvent::ConversationReady {
                peer: peer.clone(),
                display_name: self.handshake.peer_display_name(peer).map(str::to_string),
            });
        }
        if !state.keys_established() {
            self.presence.forget_conversation(peer);
        }
    }

    async fn emit_ker(&self, outgoing: &OutgoingKer) -> SessionResult<()> {
        let payload = self.codec.encode_ker(outgoing.kind, &outgoing.envelope)?;
        self.router
            .send_to_recipient(outgoing.kind, &outgoing.recipient, payload)
            .await?;
        Ok(())
    }

    async fn send_sealed<T: Serialize>(
        &self,
        kind: EventKind,
        body: &T,
        peer: &SessionId,
    ) -> SessionResult<()> {
        let payload = self.codec.seal(kind, body, peer)?;
        self.router.send_to_recipient(kind, peer, payload).await?;
        Ok(())
    }

    fn open<T: DeserializeOwned>(
        &self,
        kind: EventKind,
        peer: &SessionId,
        envelope: &EncryptedEnvelope,
    ) -> SessionResult<T> {
        self.codec.open(kind, peer, envelope).map_err(|e| {
            match &e {
                CodecError::IntegrityFailure { .. } => metrics::integrity_failure(),
                CodecError::DecryptionFailure(_) => {
                    metrics::decryption_failure();
                    warn!(peer = %peer, event = %kind.family(), error = %e, "Discarding undecryptable envelope");
                }
                _ => debug!(peer = %peer, error = %e, "Could not open envelope"),
            }
            e.into()
        })
    }

    fn require_keys(&self, peer: &SessionId) -> SessionResult<()> {
        if self.handshake.has_keys(peer) && self.codec.has_key(peer) {
            Ok(())
        } else {
            Err(SessionError::KeysNotEstablished { peer: peer.clone() })
        }
    }

    fn emit_status(&self, change: StatusChange) {
        self.events.emit(SessionEvent::MessageStatusChanged(change));
    }
}
