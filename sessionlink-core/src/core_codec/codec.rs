//! Envelope codec
//!
//! Seals event bodies into [`EncryptedEnvelope`]s and opens them again. The
//! checksum of the ciphertext is always verified before the cipher is touched,
//! so a tampered payload never reaches decryption.
//!
//! Phase-1 key exchange payloads skip encryption entirely; that path is only
//! open to the key exchange family.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::envelope::{checksum, EncryptedEnvelope, PlaintextKerEnvelope};
use super::errors::{CodecError, CodecResult};
use super::keys::ConversationKey;
use crate::types::{SessionId, Timestamp};
use crate::wire::EventKind;

/// Size of the AES-GCM nonce prefixed to every ciphertext
const NONCE_SIZE: usize = 12;

/// Per-peer envelope codec
pub struct EnvelopeCodec {
    local: SessionId,
    keys: HashMap<SessionId, ConversationKey>,
}

impl EnvelopeCodec {
    pub fn new(local: SessionId) -> Self {
        Self {
            local,
            keys: HashMap::new(),
        }
    }

    pub fn local(&self) -> &SessionId {
        &self.local
    }

    /// Bind the conversation key used for `peer`, replacing any previous one
    pub fn bind_peer(&mut self, peer: SessionId, key: ConversationKey) {
        debug!(peer = %peer, "Binding conversation key");
        self.keys.insert(peer, key);
    }

    /// Forget the key for `peer`; returns whether one was bound
    pub fn unbind_peer(&mut self, peer: &SessionId) -> bool {
        self.keys.remove(peer).is_some()
    }

    pub fn has_key(&self, peer: &SessionId) -> bool {
        self.keys.contains_key(peer)
    }

    /// Encrypt `plaintext` for `recipient`
    pub fn encrypt(&self, plaintext: &[u8], recipient: &SessionId) -> CodecResult<EncryptedEnvelope> {
        let key = self.keys.get(recipient).ok_or_else(|| {
            CodecError::EncryptionFailure(format!("no key material bound for {}", recipient))
        })?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CodecError::EncryptionFailure(format!("AEAD encryption failed: {}", e)))?;

        let mut encrypted_data = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        encrypted_data.extend_from_slice(&nonce_bytes);
        encrypted_data.extend_from_slice(&ciphertext);

        Ok(EncryptedEnvelope {
            conversation_id: recipient.clone(),
            checksum: checksum(&encrypted_data),
            encrypted_data,
            timestamp: Timestamp::now(),
        })
    }

    /// Verify and decrypt an envelope sent by (or, on replay, to) `peer`
    pub fn decrypt(&self, peer: &SessionId, envelope: &EncryptedEnvelope) -> CodecResult<Vec<u8>> {
        if !envelope.checksum_matches() {
            warn!(
                peer = %peer,
                checksum = %envelope.checksum,
                "Envelope failed integrity check, discarding"
            );
            return Err(CodecError::IntegrityFailure {
                received: envelope.checksum.clone(),
            });
        }

        let key = self.keys.get(peer).ok_or_else(|| {
            CodecError::DecryptionFailure(format!("no key material bound for {}", peer))
        })?;

        if envelope.encrypted_data.len() < NONCE_SIZE {
            return Err(CodecError::DecryptionFailure("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = envelope.encrypted_data.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::DecryptionFailure(format!("cipher rejected payload from {}", peer)))
    }

    /// Serialize `body`, encrypt it for `recipient` and produce the wire payload
    pub fn seal<T: Serialize>(
        &self,
        kind: EventKind,
        body: &T,
        recipient: &SessionId,
    ) -> CodecResult<serde_json::Value> {
        if kind.is_plaintext() {
            return Err(CodecError::PlaintextOnly(kind));
        }
        let plaintext = serde_json::to_vec(body)?;
        let envelope = self.encrypt(&plaintext, recipient)?;
        Ok(serde_json::to_value(&envelope)?)
    }

    /// Parse the wire payload, verify, decrypt and deserialize the body
    pub fn open<T: DeserializeOwned>(
        &self,
        kind: EventKind,
        peer: &SessionId,
        envelope: &EncryptedEnvelope,
    ) -> CodecResult<T> {
        if kind.is_plaintext() {
            return Err(CodecError::PlaintextOnly(kind));
        }
        let plaintext = self.decrypt(peer, envelope)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Encode a phase-1 payload without encryption
    pub fn encode_ker(
        &self,
        kind: EventKind,
        envelope: &PlaintextKerEnvelope,
    ) -> CodecResult<serde_json::Value> {
        if !kind.is_plaintext() {
            return Err(CodecError::PassThroughRefused(kind));
        }
        Ok(serde_json::to_value(envelope)?)
    }

    /// Decode a phase-1 payload without decryption
    pub fn decode_ker(
        &self,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> CodecResult<PlaintextKerEnvelope> {
        if !kind.is_plaintext() {
            return Err(CodecError::PassThroughRefused(kind));
        }
        Ok(PlaintextKerEnvelope::deserialize(payload)?)
    }
}

/// Parse an encrypted envelope from its wire payload
pub fn decode_envelope(payload: &serde_json::Value) -> CodecResult<EncryptedEnvelope> {
    Ok(EncryptedEnvelope::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_codec::keys::LocalKeyPair;
    use serde_json::json;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    /// Two codecs holding the same conversation key
    fn paired() -> (EnvelopeCodec, EnvelopeCodec) {
        let alice_keys = LocalKeyPair::generate();
        let bob_keys = LocalKeyPair::generate();

        let mut alice = EnvelopeCodec::new(sid("alice"));
        let mut bob = EnvelopeCodec::new(sid("bob"));

        alice.bind_peer(
            sid("bob"),
            alice_keys
                .derive_conversation_key(&sid("alice"), &sid("bob"), bob_keys.public_key())
                .unwrap(),
        );
        bob.bind_peer(
            sid("alice"),
            bob_keys
                .derive_conversation_key(&sid("bob"), &sid("alice"), alice_keys.public_key())
                .unwrap(),
        );
        (alice, bob)
    }

    #[test]
    fn test_round_trip() {
        let (alice, bob) = paired();
        let envelope = alice.encrypt(b"hello bob", &sid("bob")).unwrap();

        assert_eq!(envelope.conversation_id, sid("bob"));
        assert!(envelope.checksum_matches());
        assert_eq!(bob.decrypt(&sid("alice"), &envelope).unwrap(), b"hello bob");
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        let codec = EnvelopeCodec::new(sid("alice"));
        assert!(matches!(
            codec.encrypt(b"hi", &sid("bob")),
            Err(CodecError::EncryptionFailure(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch_is_integrity_failure() {
        let (alice, bob) = paired();
        let mut envelope = alice.encrypt(b"hello", &sid("bob")).unwrap();
        envelope.checksum = "deadbeef".to_string();

        assert_eq!(
            bob.decrypt(&sid("alice"), &envelope),
            Err(CodecError::IntegrityFailure {
                received: "deadbeef".to_string()
            })
        );
    }

    #[test]
    fn test_integrity_checked_before_key_lookup() {
        // No key bound at all: a bad checksum must still report integrity first
        let (alice, _) = paired();
        let stranger = EnvelopeCodec::new(sid("bob"));
        let mut envelope = alice.encrypt(b"hello", &sid("bob")).unwrap();
        envelope.encrypted_data[NONCE_SIZE] ^= 0xff;

        assert!(matches!(
            stranger.decrypt(&sid("alice"), &envelope),
            Err(CodecError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn test_wrong_key_is_decryption_failure() {
        let (alice, _) = paired();
        let (_, other_bob) = paired();
        let envelope = alice.encrypt(b"secret", &sid("bob")).unwrap();

        assert!(matches!(
            other_bob.decrypt(&sid("alice"), &envelope),
            Err(CodecError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_with_recomputed_checksum() {
        let (alice, bob) = paired();
        let mut envelope = alice.encrypt(b"secret", &sid("bob")).unwrap();
        let last = envelope.encrypted_data.len() - 1;
        envelope.encrypted_data[last] ^= 0x01;
        envelope.checksum = checksum(&envelope.encrypted_data);

        assert!(matches!(
            bob.decrypt(&sid("alice"), &envelope),
            Err(CodecError::DecryptionFailure(_))
        ));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Body {
        text: String,
    }

    #[test]
    fn test_seal_and_open() {
        let (alice, bob) = paired();
        let body = Body {
            text: "typed body".to_string(),
        };

        let payload = alice.seal(EventKind::NewMessage, &body, &sid("bob")).unwrap();
        let envelope = decode_envelope(&payload).unwrap();
        let opened: Body = bob.open(EventKind::NewMessage, &sid("alice"), &envelope).unwrap();
        assert_eq!(opened, body);
    }

    #[test]
    fn test_family_separation() {
        let (alice, _) = paired();
        let body = json!({});

        assert_eq!(
            alice.seal(EventKind::KeyExchangeRequest, &body, &sid("bob")),
            Err(CodecError::PlaintextOnly(EventKind::KeyExchangeRequest))
        );

        let ker = PlaintextKerEnvelope {
            conversation_id: sid("bob"),
            sender_id: sid("alice"),
            public_key: None,
            request_id: "ker_x".to_string(),
            request_phrase: String::new(),
            version: 1,
            timestamp: Timestamp::from_millis(1),
        };
        assert_eq!(
            alice.encode_ker(EventKind::NewMessage, &ker),
            Err(CodecError::PassThroughRefused(EventKind::NewMessage))
        );
        assert!(alice.decode_ker(EventKind::TypingStart, &json!({})).is_err());

        let encoded = alice.encode_ker(EventKind::KeyExchangeDecline, &ker).unwrap();
        let decoded = alice.decode_ker(EventKind::KeyExchangeDecline, &encoded).unwrap();
        assert_eq!(decoded, ker);
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            decode_envelope(&json!({"conversation_id": "bob"})),
            Err(CodecError::MalformedPayload(_))
        ));
    }
}
