//! Two-phase key exchange state machine
//!
//! Phase 1 swaps X25519 public keys in plaintext `key_exchange` events.
//! Phase 2 runs over the encrypted channel: each side sends its user data,
//! then a `conversation_created` confirmation once it holds both halves.
//!
//! ```text
//! NoExchange ──send──► RequestSent ──response──► KeysEstablishedLocalInitiator ─┐
//!     │                                                                          ├─► DataExchanged
//!     └─request──► RequestReceived ──accept──► KeysEstablishedRemoteInitiator ──┘
//!
//! RequestSent / RequestReceived ──decline / ttl──► Declined / Expired
//! ```
//!
//! The manager never talks to the transport. Operations that produce wire
//! traffic hand back an [`OutgoingKer`]; the caller reports whether the
//! router took it.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

use super::errors::{HandshakeError, HandshakeResult};
use super::request::{ExchangeReason, KeyExchangeRequest, RequestId, RequestStatus};
use super::state::{HandshakeState, PairSession, Phase2Action};
use crate::config::HandshakeConfig;
use crate::core_codec::{decode_public_key, ConversationKey, LocalKeyPair, PlaintextKerEnvelope};
use crate::core_router::metrics;
use crate::types::{SessionId, Timestamp};
use crate::wire::EventKind;

/// A phase-1 payload waiting to be emitted
#[derive(Debug, Clone)]
pub struct OutgoingKer {
    pub kind: EventKind,
    pub recipient: SessionId,
    pub envelope: PlaintextKerEnvelope,
}

/// Boundary-checked phase-1 payload
struct ValidatedKer {
    request_id: RequestId,
    public_key: Option<(PublicKey, String)>,
    phrase: String,
    timestamp: Timestamp,
}

/// Per-session handshake manager
pub struct KeyExchangeHandshake {
    local: SessionId,
    keys: LocalKeyPair,
    request_ttl: Duration,
    protocol_version: u32,
    pairs: HashMap<SessionId, PairSession>,
    requests: HashMap<RequestId, KeyExchangeRequest>,
    /// Requests touched since the last `take_changes`
    changed: Vec<RequestId>,
}

impl KeyExchangeHandshake {
    pub fn new(local: SessionId, keys: LocalKeyPair, config: &HandshakeConfig) -> Self {
        Self {
            local,
            keys,
            request_ttl: config.request_ttl,
            protocol_version: config.protocol_version,
            pairs: HashMap::new(),
            requests: HashMap::new(),
            changed: Vec::new(),
        }
    }

    pub fn local(&self) -> &SessionId {
        &self.local
    }

    pub fn state(&self, peer: &SessionId) -> HandshakeState {
        self.pairs
            .get(peer)
            .map(|p| p.state)
            .unwrap_or(HandshakeState::NoExchange)
    }

    pub fn has_keys(&self, peer: &SessionId) -> bool {
        self.state(peer).keys_established()
    }

    /// Peers with an established conversation key
    pub fn established_peers(&self) -> impl Iterator<Item = &SessionId> + '_ {
        self.pairs
            .iter()
            .filter(|(_, p)| p.state.keys_established())
            .map(|(peer, _)| peer)
    }

    pub fn request(&self, id: &RequestId) -> Option<&KeyExchangeRequest> {
        self.requests.get(id)
    }

    pub fn outgoing_request(&self, peer: &SessionId) -> Option<&KeyExchangeRequest> {
        self.pairs
            .get(peer)
            .and_then(|p| p.outgoing.as_ref())
            .and_then(|id| self.requests.get(id))
    }

    pub fn incoming_request(&self, peer: &SessionId) -> Option<&KeyExchangeRequest> {
        self.pairs
            .get(peer)
            .and_then(|p| p.incoming.as_ref())
            .and_then(|id| self.requests.get(id))
    }

    /// Incoming requests still waiting for a local answer
    pub fn pending_incoming(&self) -> Vec<&KeyExchangeRequest> {
        let mut pending: Vec<_> = self
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Received)
            .collect();
        pending.sort_by_key(|r| r.timestamp);
        pending
    }

    pub fn peer_display_name(&self, peer: &SessionId) -> Option<&str> {
        self.pairs
            .get(peer)
            .and_then(|p| p.phase2.peer_display_name.as_deref())
    }

    /// Drain the requests modified since the previous call
    ///
    /// Settled requests no pair refers to any more are dropped afterwards;
    /// the record store keeps their history.
    pub fn take_changes(&mut self) -> Vec<KeyExchangeRequest> {
        let mut seen = Vec::new();
        for id in self.changed.drain(..) {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        let changes = seen
            .iter()
            .filter_map(|id| self.requests.get(id).cloned())
            .collect();
        self.prune_settled();
        changes
    }

    pub fn tracked_requests(&self) -> usize {
        self.requests.len()
    }

    fn prune_settled(&mut self) {
        let pairs = &self.pairs;
        let before = self.requests.len();
        self.requests.retain(|id, request| {
            !request.status.is_terminal()
                || pairs.values().any(|p| {
                    p.outgoing.as_ref() == Some(id) || p.incoming.as_ref() == Some(id)
                })
        });
        let pruned = before - self.requests.len();
        if pruned > 0 {
            debug!(pruned, "Dropped settled key exchange requests");
        }
    }

    /// Open a phase-1 exchange with `peer`
    ///
    /// The request starts Pending; call [`mark_sent`](Self::mark_sent) once the
    /// router accepted the payload, or [`abandon_request`](Self::abandon_request)
    /// if it did not.
    pub fn send_request(&mut self, peer: &SessionId, phrase: &str) -> HandshakeResult<OutgoingKer> {
        if peer == &self.local {
            return Err(HandshakeError::SelfHandshake);
        }

        let state = self.state(peer);
        match state {
            HandshakeState::RequestSent => {
                return Err(HandshakeError::OutstandingRequest { peer: peer.clone() })
            }
            HandshakeState::RequestReceived => {
                return Err(HandshakeError::IncomingRequestPending { peer: peer.clone() })
            }
            s if s.keys_established() => {
                return Err(HandshakeError::AlreadyEstablished { peer: peer.clone() })
            }
            _ => {}
        }

        let request =
            KeyExchangeRequest::new_outgoing(self.local.clone(), peer.clone(), phrase.to_string());
        let envelope = self.ker_envelope(peer, &request.id, phrase, true, request.timestamp);
        let id = request.id.clone();

        let pair = self.pairs.entry(peer.clone()).or_default();
        pair.reset();
        pair.state = HandshakeState::RequestSent;
        pair.outgoing = Some(id.clone());
        pair.opened_at = Some(Instant::now());

        self.insert_request(request);
        info!(peer = %peer, request_id = %id, "Opening key exchange");

        Ok(OutgoingKer {
            kind: EventKind::KeyExchangeRequest,
            recipient: peer.clone(),
            envelope,
        })
    }

    /// The router accepted the outgoing request
    pub fn mark_sent(&mut self, id: &RequestId) -> HandshakeResult<()> {
        self.transition_request(id, RequestStatus::Sent, None)
    }

    /// The router refused the outgoing request; free the pair again
    pub fn abandon_request(&mut self, id: &RequestId) {
        let Some(peer) = self.requests.get(id).map(|r| r.to_session.clone()) else {
            return;
        };
        if let Err(e) =
            self.transition_request(id, RequestStatus::Expired, Some(ExchangeReason::Cancelled))
        {
            debug!(request_id = %id, error = %e, "Request already settled");
        }
        if let Some(pair) = self.pairs.get_mut(&peer) {
            if pair.outgoing.as_ref() == Some(id) {
                pair.reset();
            }
        }
    }

    /// Handle a phase-1 request from `sender`
    pub fn receive_request(
        &mut self,
        sender: &SessionId,
        ker: &PlaintextKerEnvelope,
    ) -> HandshakeResult<RequestId> {
        let validated = self.validate(sender, ker, true)?;
        let state = self.state(sender);

        if state == HandshakeState::RequestSent {
            let ours = self
                .outgoing_request(sender)
                .cloned()
                .ok_or_else(|| HandshakeError::DuplicateHandshake {
                    peer: sender.clone(),
                    state,
                })?;
            let theirs_first = (validated.timestamp, sender) < (ours.timestamp, &self.local);
            if !theirs_first {
                warn!(
                    peer = %sender,
                    request_id = %validated.request_id,
                    "Rejecting simultaneous key exchange request, ours was first"
                );
                metrics::handshake_outcome("rejected");
                return Err(HandshakeError::DuplicateHandshake {
                    peer: sender.clone(),
                    state,
                });
            }
            info!(
                peer = %sender,
                request_id = %ours.id,
                "Peer opened first, superseding our request"
            );
            self.transition_request(
                &ours.id,
                RequestStatus::Expired,
                Some(ExchangeReason::Superseded),
            )?;
            metrics::handshake_outcome("superseded");
        } else if !state.is_free() {
            warn!(
                peer = %sender,
                request_id = %validated.request_id,
                state = ?state,
                "Rejecting duplicate key exchange request"
            );
            metrics::handshake_outcome("rejected");
            return Err(HandshakeError::DuplicateHandshake {
                peer: sender.clone(),
                state,
            });
        }

        let (peer_key, peer_key_b64) =
            validated
                .public_key
                .ok_or_else(|| HandshakeError::MalformedPayload("missing publicKey".to_string()))?;
        let request = KeyExchangeRequest::new_incoming(
            validated.request_id.clone(),
            sender.clone(),
            self.local.clone(),
            validated.phrase,
            peer_key_b64,
            validated.timestamp,
        );

        let pair = self.pairs.entry(sender.clone()).or_default();
        pair.reset();
        pair.state = HandshakeState::RequestReceived;
        pair.incoming = Some(validated.request_id.clone());
        pair.peer_public_key = Some(peer_key);
        pair.opened_at = Some(Instant::now());

        self.insert_request(request);
        info!(peer = %sender, request_id = %validated.request_id, "Key exchange request received");
        Ok(validated.request_id)
    }

    /// Build the phase-1 response for the pending request from `peer`
    ///
    /// Nothing changes until [`complete_accept`](Self::complete_accept) runs.
    pub fn accept_request(&self, peer: &SessionId) -> HandshakeResult<OutgoingKer> {
        let request = self.pending_incoming_from(peer)?;
        let envelope =
            self.ker_envelope(peer, &request.id, &request.request_phrase, true, Timestamp::now());
        Ok(OutgoingKer {
            kind: EventKind::KeyExchangeResponse,
            recipient: peer.clone(),
            envelope,
        })
    }

    /// The response reached the router: derive the conversation key
    pub fn complete_accept(&mut self, peer: &SessionId) -> HandshakeResult<ConversationKey> {
        let id = self.pending_incoming_from(peer)?.id.clone();
        let peer_public = self
            .pairs
            .get(peer)
            .and_then(|p| p.peer_public_key)
            .ok_or_else(|| HandshakeError::MalformedPayload("peer public key missing".to_string()))?;

        let key = self
            .keys
            .derive_conversation_key(&self.local, peer, &peer_public)?;

        self.transition_request(&id, RequestStatus::Accepted, None)?;
        if let Some(pair) = self.pairs.get_mut(peer) {
            pair.state = HandshakeState::KeysEstablishedRemoteInitiator;
            pair.opened_at = None;
        }
        metrics::handshake_outcome("established");
        info!(peer = %peer, request_id = %id, "Keys established (remote initiator)");
        Ok(key)
    }

    /// Decline the pending request from `peer`; returns the decline notice
    pub fn decline_request(&mut self, peer: &SessionId) -> HandshakeResult<OutgoingKer> {
        let request = self.pending_incoming_from(peer)?;
        let id = request.id.clone();
        let envelope =
            self.ker_envelope(peer, &id, &request.request_phrase, false, Timestamp::now());

        self.transition_request(
            &id,
            RequestStatus::Declined,
            Some(ExchangeReason::DeclinedLocally),
        )?;
        if let Some(pair) = self.pairs.get_mut(peer) {
            pair.state = HandshakeState::Declined;
            pair.opened_at = None;
            pair.peer_public_key = None;
        }
        metrics::handshake_outcome("declined");
        info!(peer = %peer, request_id = %id, "Key exchange declined locally");

        Ok(OutgoingKer {
            kind: EventKind::KeyExchangeDecline,
            recipient: peer.clone(),
            envelope,
        })
    }

    /// Handle the phase-1 response to our outstanding request
    pub fn receive_response(
        &mut self,
        sender: &SessionId,
        ker: &PlaintextKerEnvelope,
    ) -> HandshakeResult<ConversationKey> {
        let validated = self.validate(sender, ker, true)?;
        let id = self.expect_outstanding(sender, &validated.request_id, "response")?;
        let (peer_key, peer_key_b64) =
            validated
                .public_key
                .ok_or_else(|| HandshakeError::MalformedPayload("missing publicKey".to_string()))?;

        let key = self
            .keys
            .derive_conversation_key(&self.local, sender, &peer_key)?;

        self.transition_request(&id, RequestStatus::Accepted, None)?;
        if let Some(request) = self.requests.get_mut(&id) {
            request.public_key = Some(peer_key_b64);
        }
        if let Some(pair) = self.pairs.get_mut(sender) {
            pair.state = HandshakeState::KeysEstablishedLocalInitiator;
            pair.peer_public_key = Some(peer_key);
            pair.opened_at = None;
        }
        metrics::handshake_outcome("established");
        info!(peer = %sender, request_id = %id, "Keys established (local initiator)");
        Ok(key)
    }

    /// Handle the peer declining our outstanding request
    pub fn receive_decline(
        &mut self,
        sender: &SessionId,
        ker: &PlaintextKerEnvelope,
    ) -> HandshakeResult<RequestId> {
        let validated = self.validate(sender, ker, false)?;
        let id = self.expect_outstanding(sender, &validated.request_id, "decline")?;

        self.transition_request(
            &id,
            RequestStatus::Declined,
            Some(ExchangeReason::DeclinedByPeer),
        )?;
        if let Some(pair) = self.pairs.get_mut(sender) {
            pair.state = HandshakeState::Declined;
            pair.opened_at = None;
        }
        metrics::handshake_outcome("declined");
        info!(peer = %sender, request_id = %id, "Key exchange declined by peer");
        Ok(id)
    }

    /// Withdraw our outstanding request to `peer`; returns the cancel notice
    pub fn cancel_request(&mut self, peer: &SessionId) -> HandshakeResult<OutgoingKer> {
        if self.state(peer) != HandshakeState::RequestSent {
            return Err(HandshakeError::NoPendingRequest { peer: peer.clone() });
        }
        let request = self
            .outgoing_request(peer)
            .ok_or_else(|| HandshakeError::NoPendingRequest { peer: peer.clone() })?;
        let id = request.id.clone();
        let envelope =
            self.ker_envelope(peer, &id, &request.request_phrase, false, Timestamp::now());

        self.transition_request(&id, RequestStatus::Expired, Some(ExchangeReason::Cancelled))?;
        if let Some(pair) = self.pairs.get_mut(peer) {
            pair.reset();
        }
        metrics::handshake_outcome("cancelled");
        info!(peer = %peer, request_id = %id, "Key exchange cancelled");

        Ok(OutgoingKer {
            kind: EventKind::KeyExchangeCancel,
            recipient: peer.clone(),
            envelope,
        })
    }

    /// Handle the peer withdrawing the request we have not answered yet
    pub fn receive_cancel(
        &mut self,
        sender: &SessionId,
        ker: &PlaintextKerEnvelope,
    ) -> HandshakeResult<RequestId> {
        let validated = self.validate(sender, ker, false)?;
        let id = self
            .pending_incoming_from(sender)
            .ok()
            .filter(|r| r.id == validated.request_id)
            .map(|r| r.id.clone())
            .ok_or_else(|| HandshakeError::UnexpectedResponse {
                peer: sender.clone(),
                request_id: validated.request_id.to_string(),
                what: "cancel",
            })?;

        self.transition_request(&id, RequestStatus::Expired, Some(ExchangeReason::Cancelled))?;
        if let Some(pair) = self.pairs.get_mut(sender) {
            pair.reset();
        }
        metrics::handshake_outcome("cancelled");
        info!(peer = %sender, request_id = %id, "Key exchange cancelled by peer");
        Ok(id)
    }

    /// Expire phase-1 exchanges older than the request TTL
    pub fn expire_stale(&mut self, now: Instant) -> Vec<SessionId> {
        let ttl = self.request_ttl;
        let stale: Vec<(SessionId, Option<RequestId>)> = self
            .pairs
            .iter()
            .filter(|(_, p)| p.state.is_awaiting())
            .filter(|(_, p)| p.opened_at.is_some_and(|at| now.duration_since(at) >= ttl))
            .map(|(peer, p)| {
                let id = match p.state {
                    HandshakeState::RequestSent => p.outgoing.clone(),
                    _ => p.incoming.clone(),
                };
                (peer.clone(), id)
            })
            .collect();

        for (peer, id) in &stale {
            if let Some(id) = id {
                if let Err(e) = self.transition_request(
                    id,
                    RequestStatus::Expired,
                    Some(ExchangeReason::TimedOut),
                ) {
                    debug!(request_id = %id, error = %e, "Request already settled");
                }
            }
            if let Some(pair) = self.pairs.get_mut(peer) {
                pair.state = HandshakeState::Expired;
                pair.opened_at = None;
            }
            metrics::handshake_outcome("expired");
            info!(peer = %peer, "Key exchange timed out");
        }

        stale.into_iter().map(|(peer, _)| peer).collect()
    }

    pub fn next_phase2_action(&self, peer: &SessionId) -> Option<Phase2Action> {
        self.pairs.get(peer).and_then(|p| p.next_phase2_action())
    }

    /// A phase-2 event reached the router
    pub fn record_phase2_sent(
        &mut self,
        peer: &SessionId,
        action: Phase2Action,
    ) -> HandshakeResult<()> {
        let pair = self.established_pair(peer)?;
        match action {
            Phase2Action::SendUserData => pair.phase2.user_data_sent = true,
            Phase2Action::SendConfirmation => pair.phase2.confirmation_sent = true,
        }
        pair.settle_phase2();
        Ok(())
    }

    /// Store the peer's user data; returns false when it was already known
    pub fn receive_user_data(
        &mut self,
        peer: &SessionId,
        display_name: &str,
    ) -> HandshakeResult<bool> {
        let pair = self.established_pair(peer)?;
        if pair.phase2.user_data_received() {
            debug!(peer = %peer, "Ignoring repeated user data");
            return Ok(false);
        }
        pair.phase2.peer_display_name = Some(display_name.to_string());
        pair.settle_phase2();
        Ok(true)
    }

    /// Record the peer's confirmation; returns false when already recorded
    pub fn receive_confirmation(&mut self, peer: &SessionId) -> HandshakeResult<bool> {
        let pair = self.established_pair(peer)?;
        if pair.phase2.confirmation_received {
            return Ok(false);
        }
        pair.phase2.confirmation_received = true;
        Ok(true)
    }

    fn established_pair(&mut self, peer: &SessionId) -> HandshakeResult<&mut PairSession> {
        self.pairs
            .get_mut(peer)
            .filter(|p| p.state.keys_established())
            .ok_or_else(|| HandshakeError::KeysNotEstablished { peer: peer.clone() })
    }

    fn pending_incoming_from(&self, peer: &SessionId) -> HandshakeResult<&KeyExchangeRequest> {
        if self.state(peer) != HandshakeState::RequestReceived {
            return Err(HandshakeError::NoPendingRequest { peer: peer.clone() });
        }
        self.incoming_request(peer)
            .filter(|r| r.status == RequestStatus::Received)
            .ok_or_else(|| HandshakeError::NoPendingRequest { peer: peer.clone() })
    }

    /// Our outstanding request to `peer`, which `request_id` must answer
    fn expect_outstanding(
        &self,
        peer: &SessionId,
        request_id: &RequestId,
        what: &'static str,
    ) -> HandshakeResult<RequestId> {
        let unexpected = || HandshakeError::UnexpectedResponse {
            peer: peer.clone(),
            request_id: request_id.to_string(),
            what,
        };
        if self.state(peer) != HandshakeState::RequestSent {
            return Err(unexpected());
        }
        match self.outgoing_request(peer) {
            Some(r) if &r.id == request_id && r.status.is_outstanding() => Ok(r.id.clone()),
            _ => Err(unexpected()),
        }
    }

    fn validate(
        &self,
        sender: &SessionId,
        ker: &PlaintextKerEnvelope,
        needs_key: bool,
    ) -> HandshakeResult<ValidatedKer> {
        if &ker.sender_id != sender {
            return Err(HandshakeError::MalformedPayload(format!(
                "sender_id {} does not match event sender {}",
                ker.sender_id, sender
            )));
        }
        if ker.conversation_id != self.local {
            return Err(HandshakeError::MalformedPayload(format!(
                "addressed to {}, not {}",
                ker.conversation_id, self.local
            )));
        }
        if sender == &self.local {
            return Err(HandshakeError::SelfHandshake);
        }
        if ker.version == 0 || ker.version > self.protocol_version {
            return Err(HandshakeError::MalformedPayload(format!(
                "unsupported protocol version {}",
                ker.version
            )));
        }

        let request_id = RequestId::parse(&ker.request_id)?;
        let public_key = match (&ker.public_key, needs_key) {
            (Some(encoded), _) => Some((decode_public_key(encoded)?, encoded.clone())),
            (None, true) => {
                return Err(HandshakeError::MalformedPayload("missing publicKey".to_string()))
            }
            (None, false) => None,
        };

        Ok(ValidatedKer {
            request_id,
            public_key,
            phrase: ker.request_phrase.clone(),
            timestamp: ker.timestamp,
        })
    }

    fn ker_envelope(
        &self,
        peer: &SessionId,
        id: &RequestId,
        phrase: &str,
        with_key: bool,
        timestamp: Timestamp,
    ) -> PlaintextKerEnvelope {
        PlaintextKerEnvelope {
            conversation_id: peer.clone(),
            sender_id: self.local.clone(),
            public_key: with_key.then(|| self.keys.public_key_base64()),
            request_id: id.to_string(),
            request_phrase: phrase.to_string(),
            version: self.protocol_version,
            timestamp,
        }
    }

    fn insert_request(&mut self, request: KeyExchangeRequest) {
        self.changed.push(request.id.clone());
        self.requests.insert(request.id.clone(), request);
    }

    fn transition_request(
        &mut self,
        id: &RequestId,
        status: RequestStatus,
        reason: Option<ExchangeReason>,
    ) -> HandshakeResult<()> {
        let request = self
            .requests
            .get_mut(id)
            .ok_or_else(|| HandshakeError::MalformedRequestId(id.to_string()))?;
        request.transition(status, reason)?;
        self.changed.push(id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn manager(name: &str) -> KeyExchangeHandshake {
        KeyExchangeHandshake::new(sid(name), LocalKeyPair::generate(), &HandshakeConfig::default())
    }

    #[tokio::test]
    async fn test_full_phase1_exchange() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let req = alice.send_request(&sid("bob"), "hello").unwrap();
        let id = RequestId::parse(&req.envelope.request_id).unwrap();
        assert_eq!(alice.request(&id).unwrap().status, RequestStatus::Pending);
        alice.mark_sent(&id).unwrap();
        assert_eq!(alice.state(&sid("bob")), HandshakeState::RequestSent);

        bob.receive_request(&sid("alice"), &req.envelope).unwrap();
        assert_eq!(bob.state(&sid("alice")), HandshakeState::RequestReceived);
        assert_eq!(bob.pending_incoming().len(), 1);

        let resp = bob.accept_request(&sid("alice")).unwrap();
        assert_eq!(resp.kind, EventKind::KeyExchangeResponse);
        // Building the response alone does not commit anything
        assert_eq!(bob.state(&sid("alice")), HandshakeState::RequestReceived);
        let bob_key = bob.complete_accept(&sid("alice")).unwrap();
        assert_eq!(
            bob.state(&sid("alice")),
            HandshakeState::KeysEstablishedRemoteInitiator
        );

        let alice_key = alice.receive_response(&sid("bob"), &resp.envelope).unwrap();
        assert_eq!(
            alice.state(&sid("bob")),
            HandshakeState::KeysEstablishedLocalInitiator
        );
        assert_eq!(alice_key.as_bytes(), bob_key.as_bytes());
        assert_eq!(alice.request(&id).unwrap().status, RequestStatus::Accepted);
        assert!(alice.request(&id).unwrap().public_key.is_some());
    }

    #[tokio::test]
    async fn test_second_request_rejected() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let req = alice.send_request(&sid("bob"), "hi").unwrap();
        bob.receive_request(&sid("alice"), &req.envelope).unwrap();

        let again = alice.send_request(&sid("bob"), "hi again");
        assert_eq!(
            again.unwrap_err(),
            HandshakeError::OutstandingRequest { peer: sid("bob") }
        );

        // Bob holds alice's request: first mover wins
        assert_eq!(
            bob.send_request(&sid("alice"), "").unwrap_err(),
            HandshakeError::IncomingRequestPending { peer: sid("alice") }
        );

        // Redelivered phase-1 request does not change state
        let err = bob.receive_request(&sid("alice"), &req.envelope).unwrap_err();
        assert!(matches!(err, HandshakeError::DuplicateHandshake { .. }));
        assert_eq!(bob.state(&sid("alice")), HandshakeState::RequestReceived);
    }

    #[tokio::test]
    async fn test_simultaneous_open_tie_break() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let mut from_alice = alice.send_request(&sid("bob"), "").unwrap();
        let mut from_bob = bob.send_request(&sid("alice"), "").unwrap();
        from_alice.envelope.timestamp = Timestamp::from_millis(100);
        from_bob.envelope.timestamp = Timestamp::from_millis(100);
        let alice_id = RequestId::parse(&from_alice.envelope.request_id).unwrap();
        let bob_id = RequestId::parse(&from_bob.envelope.request_id).unwrap();
        alice.requests.get_mut(&alice_id).unwrap().timestamp = Timestamp::from_millis(100);
        bob.requests.get_mut(&bob_id).unwrap().timestamp = Timestamp::from_millis(100);

        // Equal timestamps: "alice" < "bob", so alice's request wins
        let err = alice
            .receive_request(&sid("bob"), &from_bob.envelope)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::DuplicateHandshake { .. }));
        assert_eq!(alice.state(&sid("bob")), HandshakeState::RequestSent);

        bob.receive_request(&sid("alice"), &from_alice.envelope)
            .unwrap();
        assert_eq!(bob.state(&sid("alice")), HandshakeState::RequestReceived);
        let superseded = bob.request(&bob_id).unwrap();
        assert_eq!(superseded.status, RequestStatus::Expired);
        assert_eq!(superseded.reason, Some(ExchangeReason::Superseded));
    }

    #[tokio::test]
    async fn test_decline_round_trip() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let req = alice.send_request(&sid("bob"), "").unwrap();
        bob.receive_request(&sid("alice"), &req.envelope).unwrap();
        let notice = bob.decline_request(&sid("alice")).unwrap();
        assert!(notice.envelope.public_key.is_none());
        assert_eq!(bob.state(&sid("alice")), HandshakeState::Declined);

        let id = alice.receive_decline(&sid("bob"), &notice.envelope).unwrap();
        let request = alice.request(&id).unwrap();
        assert_eq!(request.status, RequestStatus::Declined);
        assert_eq!(request.reason, Some(ExchangeReason::DeclinedByPeer));

        // Declined frees the pair
        assert!(alice.send_request(&sid("bob"), "again").is_ok());
    }

    #[tokio::test]
    async fn test_cancel_reverts_to_no_exchange() {
        let mut alice = manager("alice");
        let req = alice.send_request(&sid("bob"), "").unwrap();
        let notice = alice.cancel_request(&sid("bob")).unwrap();
        let id = RequestId::parse(&notice.envelope.request_id).unwrap();

        assert_eq!(notice.kind, EventKind::KeyExchangeCancel);
        assert!(notice.envelope.public_key.is_none());
        assert_eq!(id.as_str(), req.envelope.request_id);
        assert_eq!(alice.state(&sid("bob")), HandshakeState::NoExchange);
        assert_eq!(
            alice.request(&id).unwrap().reason,
            Some(ExchangeReason::Cancelled)
        );
        assert!(alice.cancel_request(&sid("bob")).is_err());
    }

    #[tokio::test]
    async fn test_cancel_notice_frees_the_peer() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");

        let req = alice.send_request(&sid("bob"), "").unwrap();
        bob.receive_request(&sid("alice"), &req.envelope).unwrap();
        let notice = alice.cancel_request(&sid("bob")).unwrap();

        let id = bob.receive_cancel(&sid("alice"), &notice.envelope).unwrap();
        assert_eq!(bob.state(&sid("alice")), HandshakeState::NoExchange);
        assert!(bob.pending_incoming().is_empty());
        let request = bob.request(&id).unwrap();
        assert_eq!(request.status, RequestStatus::Expired);
        assert_eq!(request.reason, Some(ExchangeReason::Cancelled));
        assert!(matches!(
            bob.accept_request(&sid("alice")),
            Err(HandshakeError::NoPendingRequest { .. })
        ));

        // A second notice finds nothing to cancel
        assert!(matches!(
            bob.receive_cancel(&sid("alice"), &notice.envelope),
            Err(HandshakeError::UnexpectedResponse { what: "cancel", .. })
        ));
    }

    #[tokio::test]
    async fn test_settled_requests_are_pruned() {
        let mut alice = manager("alice");
        alice.send_request(&sid("bob"), "").unwrap();
        alice.cancel_request(&sid("bob")).unwrap();
        alice.send_request(&sid("carol"), "").unwrap();

        let changes = alice.take_changes();
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .any(|r| r.status == RequestStatus::Expired));
        // Only carol's open request is still tracked
        assert_eq!(alice.tracked_requests(), 1);

        // A settled request the pair still points at is kept
        let mut bob = manager("bob");
        let req = alice.send_request(&sid("dave"), "").unwrap();
        bob.receive_request(&sid("dave"), &{
            let mut env = req.envelope.clone();
            env.sender_id = sid("dave");
            env.conversation_id = sid("bob");
            env
        })
        .unwrap();
        bob.decline_request(&sid("dave")).unwrap();
        bob.take_changes();
        assert_eq!(bob.tracked_requests(), 1);
        assert_eq!(bob.state(&sid("dave")), HandshakeState::Declined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_expire_after_ttl() {
        let mut alice = manager("alice");
        let req = alice.send_request(&sid("bob"), "").unwrap();
        let id = RequestId::parse(&req.envelope.request_id).unwrap();

        assert!(alice.expire_stale(Instant::now()).is_empty());

        tokio::time::advance(HandshakeConfig::default().request_ttl).await;
        let expired = alice.expire_stale(Instant::now());
        assert_eq!(expired, vec![sid("bob")]);
        assert_eq!(alice.state(&sid("bob")), HandshakeState::Expired);
        assert_eq!(
            alice.request(&id).unwrap().reason,
            Some(ExchangeReason::TimedOut)
        );
    }

    #[tokio::test]
    async fn test_boundary_validation() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        let req = alice.send_request(&sid("bob"), "").unwrap();

        let mut bad = req.envelope.clone();
        bad.public_key = None;
        assert!(matches!(
            bob.receive_request(&sid("alice"), &bad),
            Err(HandshakeError::MalformedPayload(_))
        ));

        let mut bad = req.envelope.clone();
        bad.public_key = Some("not base64!".to_string());
        assert!(matches!(
            bob.receive_request(&sid("alice"), &bad),
            Err(HandshakeError::Codec(_))
        ));

        let mut bad = req.envelope.clone();
        bad.request_id = "nope".to_string();
        assert!(matches!(
            bob.receive_request(&sid("alice"), &bad),
            Err(HandshakeError::MalformedRequestId(_))
        ));

        assert!(matches!(
            bob.receive_request(&sid("mallory"), &req.envelope),
            Err(HandshakeError::MalformedPayload(_))
        ));

        assert_eq!(bob.state(&sid("alice")), HandshakeState::NoExchange);
    }

    #[tokio::test]
    async fn test_unexpected_response_is_rejected() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        let mut carol = manager("carol");

        let req = carol.send_request(&sid("bob"), "").unwrap();
        bob.receive_request(&sid("carol"), &req.envelope).unwrap();
        let mut resp = bob.accept_request(&sid("carol")).unwrap();
        resp.envelope.conversation_id = sid("alice");

        assert!(matches!(
            alice.receive_response(&sid("bob"), &resp.envelope),
            Err(HandshakeError::UnexpectedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_phase2_progress() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        let req = alice.send_request(&sid("bob"), "").unwrap();
        bob.receive_request(&sid("alice"), &req.envelope).unwrap();
        let resp = bob.accept_request(&sid("alice")).unwrap();
        bob.complete_accept(&sid("alice")).unwrap();
        alice.receive_response(&sid("bob"), &resp.envelope).unwrap();

        assert_eq!(
            alice.next_phase2_action(&sid("bob")),
            Some(Phase2Action::SendUserData)
        );
        alice
            .record_phase2_sent(&sid("bob"), Phase2Action::SendUserData)
            .unwrap();
        assert!(alice.receive_user_data(&sid("bob"), "Bob").unwrap());
        assert!(!alice.receive_user_data(&sid("bob"), "Bob").unwrap());
        assert_eq!(alice.peer_display_name(&sid("bob")), Some("Bob"));

        assert_eq!(
            alice.next_phase2_action(&sid("bob")),
            Some(Phase2Action::SendConfirmation)
        );
        alice
            .record_phase2_sent(&sid("bob"), Phase2Action::SendConfirmation)
            .unwrap();
        assert_eq!(alice.state(&sid("bob")), HandshakeState::DataExchanged);
        assert!(alice.has_keys(&sid("bob")));

        assert!(matches!(
            alice.receive_user_data(&sid("carol"), "Carol"),
            Err(HandshakeError::KeysNotEstablished { .. })
        ));
    }

    #[tokio::test]
    async fn test_take_changes_deduplicates() {
        let mut alice = manager("alice");
        let req = alice.send_request(&sid("bob"), "").unwrap();
        let id = RequestId::parse(&req.envelope.request_id).unwrap();
        alice.mark_sent(&id).unwrap();

        let changes = alice.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, RequestStatus::Sent);
        assert!(alice.take_changes().is_empty());
    }
}
