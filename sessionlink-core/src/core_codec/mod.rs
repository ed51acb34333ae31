//! Envelope codec: wire payload encoding, pairwise encryption and integrity
//!
//! ```text
//! body ──serde_json──► plaintext ──AES-256-GCM──► nonce||ciphertext
//!                                                      │
//!                                     SHA-256 ◄────────┘ checksum
//! ```

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod keys;

pub use codec::{decode_envelope, EnvelopeCodec};
pub use envelope::{checksum, verify_checksum, EncryptedEnvelope, PlaintextKerEnvelope};
pub use errors::{CodecError, CodecResult};
pub use keys::{decode_public_key, encode_public_key, ConversationKey, LocalKeyPair};
