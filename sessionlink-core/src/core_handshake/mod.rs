//! Key exchange handshake
//!
//! Per-peer two-phase handshake: plaintext public key exchange, then the
//! encrypted user data / confirmation round.

pub mod errors;
pub mod manager;
pub mod request;
pub mod state;

pub use errors::{HandshakeError, HandshakeResult};
pub use manager::{KeyExchangeHandshake, OutgoingKer};
pub use request::{Direction, ExchangeReason, KeyExchangeRequest, RequestId, RequestStatus};
pub use state::{HandshakeState, PairSession, Phase2Action, Phase2Progress};
