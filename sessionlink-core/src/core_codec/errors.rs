//! Error types for envelope encoding and decoding

use thiserror::Error;

use crate::wire::EventKind;

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while sealing or opening envelopes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// No key material bound for the recipient, or the cipher refused to seal
    #[error("Encryption failure: {0}")]
    EncryptionFailure(String),

    /// Checksum over the ciphertext did not match; nothing was decrypted
    #[error("Integrity failure: checksum {received} does not match computed digest")]
    IntegrityFailure { received: String },

    /// Cipher rejected the ciphertext/key combination
    #[error("Decryption failure: {0}")]
    DecryptionFailure(String),

    /// Plaintext pass-through attempted on an event outside the key exchange family
    #[error("Plaintext pass-through refused for {0:?}")]
    PassThroughRefused(EventKind),

    /// Key exchange events are never encrypted
    #[error("Event {0:?} travels in plaintext and cannot be sealed")]
    PlaintextOnly(EventKind),

    /// Public key is not a base64 encoded 32-byte X25519 point
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Payload JSON does not have the expected shape
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::MalformedPayload(e.to_string())
    }
}
