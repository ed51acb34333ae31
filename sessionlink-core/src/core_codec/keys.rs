//! Key material for the pairwise conversation cipher
//!
//! Every session owns one static X25519 key pair whose public half travels in
//! the phase-1 key exchange payload. Once both halves are known, each side
//! derives the same 32-byte conversation key:
//!
//! ```text
//! key = HKDF-SHA256(ikm = X25519(local_secret, peer_public),
//!                   salt = min(a, b) || "|" || max(a, b),
//!                   info = CONVERSATION_KEY_LABEL)
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::errors::{CodecError, CodecResult};
use crate::types::SessionId;

/// Size of the derived conversation key (AES-256)
pub const KEY_SIZE: usize = 32;

/// HKDF info label for conversation keys
const CONVERSATION_KEY_LABEL: &[u8] = b"SessionLink 1.0 Conversation Key";

/// Local static key pair
pub struct LocalKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl LocalKeyPair {
    /// Generate a fresh key pair from the thread RNG
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut secret_bytes);
        let pair = Self::from_secret_bytes(secret_bytes);
        secret_bytes.zeroize();
        pair
    }

    /// Restore a key pair from its secret scalar
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Public key in the wire encoding used by phase-1 payloads
    pub fn public_key_base64(&self) -> String {
        encode_public_key(&self.public)
    }

    /// Derive the conversation key shared with `peer`
    pub fn derive_conversation_key(
        &self,
        local: &SessionId,
        peer: &SessionId,
        peer_public: &PublicKey,
    ) -> CodecResult<ConversationKey> {
        let shared = self.secret.diffie_hellman(peer_public);
        if !shared.was_contributory() {
            return Err(CodecError::InvalidPublicKey(
                "peer key is a low-order point".to_string(),
            ));
        }

        let (first, second) = if local <= peer { (local, peer) } else { (peer, local) };
        let salt = format!("{}|{}", first, second);

        let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), shared.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hk.expand(CONVERSATION_KEY_LABEL, &mut key)
            .map_err(|e| CodecError::EncryptionFailure(format!("HKDF expand failed: {}", e)))?;

        Ok(ConversationKey(key))
    }
}

impl std::fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("public", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// Symmetric key shared by exactly two sessions
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey([u8; KEY_SIZE]);

impl ConversationKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        ConversationKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

pub fn encode_public_key(key: &PublicKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Parse a base64 encoded X25519 public key
pub fn decode_public_key(encoded: &str) -> CodecResult<PublicKey> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CodecError::InvalidPublicKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| CodecError::InvalidPublicKey(format!("expected 32 bytes, got {}", b.len())))?;
    Ok(PublicKey::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let alice = LocalKeyPair::generate();
        let bob = LocalKeyPair::generate();

        let k_alice = alice
            .derive_conversation_key(&sid("alice"), &sid("bob"), bob.public_key())
            .unwrap();
        let k_bob = bob
            .derive_conversation_key(&sid("bob"), &sid("alice"), alice.public_key())
            .unwrap();

        assert_eq!(k_alice.as_bytes(), k_bob.as_bytes());
    }

    #[test]
    fn test_key_bound_to_session_pair() {
        let alice = LocalKeyPair::generate();
        let bob = LocalKeyPair::generate();

        let k1 = alice
            .derive_conversation_key(&sid("alice"), &sid("bob"), bob.public_key())
            .unwrap();
        let k2 = alice
            .derive_conversation_key(&sid("alice"), &sid("mallory"), bob.public_key())
            .unwrap();

        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = LocalKeyPair::generate();
        let zero = PublicKey::from([0u8; 32]);
        let result = alice.derive_conversation_key(&sid("alice"), &sid("bob"), &zero);
        assert!(matches!(result, Err(CodecError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_public_key_encoding() {
        let pair = LocalKeyPair::generate();
        let decoded = decode_public_key(&pair.public_key_base64()).unwrap();
        assert_eq!(decoded.as_bytes(), pair.public_key().as_bytes());

        assert!(decode_public_key("not base64!").is_err());
        assert!(decode_public_key(&STANDARD.encode([1u8; 16])).is_err());
    }
}
