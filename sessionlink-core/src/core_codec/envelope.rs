//! Wire envelopes
//!
//! Encrypted payload shape:
//! ```json
//! { "conversation_id": "<recipient>", "encrypted_data": "<base64>",
//!   "checksum": "<hex sha256 of encrypted_data bytes>", "timestamp": 1700000000000 }
//! ```
//!
//! Phase-1 key exchange payload shape:
//! ```json
//! { "conversation_id": "<recipient>", "sender_id": "<sender>", "publicKey": "<base64>",
//!   "requestId": "ker_<uuid>", "requestPhrase": "hello", "version": 1,
//!   "timestamp": 1700000000000 }
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{SessionId, Timestamp};

/// Encrypted envelope carried by every non key-exchange event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Always the recipient's session id
    pub conversation_id: SessionId,
    /// Nonce followed by AEAD ciphertext
    #[serde(with = "base64_bytes")]
    pub encrypted_data: Vec<u8>,
    /// Lowercase hex SHA-256 of `encrypted_data`
    pub checksum: String,
    pub timestamp: Timestamp,
}

impl EncryptedEnvelope {
    /// Whether the carried checksum matches the ciphertext
    pub fn checksum_matches(&self) -> bool {
        verify_checksum(&self.encrypted_data, &self.checksum)
    }
}

/// Plaintext phase-1 key exchange payload; never carries user content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextKerEnvelope {
    pub conversation_id: SessionId,
    pub sender_id: SessionId,
    /// Absent only on decline and cancel notices
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "requestPhrase", default)]
    pub request_phrase: String,
    pub version: u32,
    pub timestamp: Timestamp,
}

/// Compute the integrity digest over ciphertext bytes
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compare the digest of `bytes` against `expected` without early exit
pub fn verify_checksum(bytes: &[u8], expected: &str) -> bool {
    let computed = Sha256::digest(bytes);
    let Ok(received) = hex::decode(expected.trim()) else {
        return false;
    };
    if received.len() != computed.len() {
        return false;
    }
    computed
        .iter()
        .zip(received.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(verify_checksum(b"", &checksum(b"")));
        assert!(!verify_checksum(b"", "deadbeef"));
        assert!(!verify_checksum(b"", "not hex"));
    }

    #[test]
    fn test_encrypted_envelope_wire_shape() {
        let envelope = EncryptedEnvelope {
            conversation_id: SessionId::new("bob").unwrap(),
            encrypted_data: vec![1, 2, 3],
            checksum: checksum(&[1, 2, 3]),
            timestamp: Timestamp::from_millis(42),
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["conversation_id"], "bob");
        assert_eq!(value["encrypted_data"], "AQID");
        assert_eq!(value["timestamp"], 42);

        let back: EncryptedEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
        assert!(back.checksum_matches());
    }

    #[test]
    fn test_ker_envelope_field_names() {
        let value = json!({
            "conversation_id": "bob",
            "sender_id": "alice",
            "publicKey": "AAAA",
            "requestId": "ker_1",
            "requestPhrase": "hello",
            "version": 1,
            "timestamp": 7
        });

        let ker: PlaintextKerEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(ker.sender_id.as_str(), "alice");
        assert_eq!(ker.public_key.as_deref(), Some("AAAA"));
        assert_eq!(ker.request_phrase, "hello");
    }
}
