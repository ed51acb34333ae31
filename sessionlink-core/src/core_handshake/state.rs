//! Per-peer handshake state

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use x25519_dalek::PublicKey;

use super::request::RequestId;

/// Where a pair of sessions stands in the two-phase handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeState {
    NoExchange,
    RequestSent,
    RequestReceived,
    /// Local side sent the request, peer accepted
    KeysEstablishedLocalInitiator,
    /// Peer sent the request, local side accepted
    KeysEstablishedRemoteInitiator,
    DataExchanged,
    Expired,
    Declined,
}

impl HandshakeState {
    pub fn keys_established(&self) -> bool {
        matches!(
            self,
            HandshakeState::KeysEstablishedLocalInitiator
                | HandshakeState::KeysEstablishedRemoteInitiator
                | HandshakeState::DataExchanged
        )
    }

    /// A new phase-1 exchange may start from this state
    pub fn is_free(&self) -> bool {
        matches!(
            self,
            HandshakeState::NoExchange | HandshakeState::Expired | HandshakeState::Declined
        )
    }

    /// Waiting on phase 1 and subject to the request TTL
    pub fn is_awaiting(&self) -> bool {
        matches!(
            self,
            HandshakeState::RequestSent | HandshakeState::RequestReceived
        )
    }
}

/// Phase-2 bookkeeping for one peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Phase2Progress {
    pub user_data_sent: bool,
    pub peer_display_name: Option<String>,
    pub confirmation_sent: bool,
    pub confirmation_received: bool,
}

impl Phase2Progress {
    pub fn user_data_received(&self) -> bool {
        self.peer_display_name.is_some()
    }
}

/// Next phase-2 event the local side owes its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase2Action {
    SendUserData,
    SendConfirmation,
}

/// Everything the local session tracks about one peer
#[derive(Debug, Clone)]
pub struct PairSession {
    pub state: HandshakeState,
    pub outgoing: Option<RequestId>,
    pub incoming: Option<RequestId>,
    pub peer_public_key: Option<PublicKey>,
    pub phase2: Phase2Progress,
    /// When the current phase-1 exchange opened, for TTL checks
    pub opened_at: Option<Instant>,
}

impl PairSession {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::NoExchange,
            outgoing: None,
            incoming: None,
            peer_public_key: None,
            phase2: Phase2Progress::default(),
            opened_at: None,
        }
    }

    /// Drop everything from a previous, finished exchange
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn next_phase2_action(&self) -> Option<Phase2Action> {
        if !self.state.keys_established() {
            return None;
        }
        if !self.phase2.user_data_sent {
            return Some(Phase2Action::SendUserData);
        }
        if self.phase2.user_data_received() && !self.phase2.confirmation_sent {
            return Some(Phase2Action::SendConfirmation);
        }
        None
    }

    /// Promote to DataExchanged once sent, received and confirmed
    pub fn settle_phase2(&mut self) {
        if self.state.keys_established()
            && self.phase2.user_data_sent
            && self.phase2.user_data_received()
            && self.phase2.confirmation_sent
        {
            self.state = HandshakeState::DataExchanged;
        }
    }
}

impl Default for PairSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(HandshakeState::NoExchange.is_free());
        assert!(HandshakeState::Declined.is_free());
        assert!(!HandshakeState::RequestSent.is_free());
        assert!(HandshakeState::RequestReceived.is_awaiting());
        assert!(HandshakeState::DataExchanged.keys_established());
        assert!(!HandshakeState::Expired.keys_established());
    }

    #[test]
    fn test_phase2_sequence() {
        let mut pair = PairSession::new();
        assert_eq!(pair.next_phase2_action(), None);

        pair.state = HandshakeState::KeysEstablishedLocalInitiator;
        assert_eq!(pair.next_phase2_action(), Some(Phase2Action::SendUserData));

        pair.phase2.user_data_sent = true;
        assert_eq!(pair.next_phase2_action(), None);

        pair.phase2.peer_display_name = Some("Bob".to_string());
        assert_eq!(
            pair.next_phase2_action(),
            Some(Phase2Action::SendConfirmation)
        );

        pair.phase2.confirmation_sent = true;
        pair.settle_phase2();
        assert_eq!(pair.state, HandshakeState::DataExchanged);
        assert_eq!(pair.next_phase2_action(), None);
    }
}
