//! NIP-01 events.
//!
//! The event id is the sha256 of `[0, pubkey, created_at, kind, tags, content]`
//! serialized as compact JSON; the signature is a BIP-340 Schnorr signature
//! over that id.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;

/// Errors from building, signing or verifying events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    Invalid(String),

    #[error("invalid hex in {field}: {source}")]
    Hex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("invalid key: {0}")]
    Key(String),

    #[error("event id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// Lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Lowercase hex Schnorr signature over `id`
    pub sig: String,
}

/// An event with its author fixed but not yet signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Event content before an author is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl EventTemplate {
    /// A template stamped with the current time and no tags.
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }
}

impl UnsignedEvent {
    /// Canonical serialization used for hashing.
    pub fn canonical_json(&self) -> Result<String, EventError> {
        if !is_lower_hex(&self.pubkey, 64) {
            return Err(EventError::Invalid(
                "pubkey must be 64 lowercase hex characters".to_string(),
            ));
        }

        Ok(serde_json::to_string(&(
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))?)
    }

    /// Hex-encoded event id.
    pub fn id(&self) -> Result<String, EventError> {
        Ok(hex::encode(self.digest()?))
    }

    pub(crate) fn digest(&self) -> Result<[u8; 32], EventError> {
        let serialized = self.canonical_json()?;
        Ok(sha256::Hash::hash(serialized.as_bytes()).to_byte_array())
    }
}

impl Event {
    /// The unsigned part of this event.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Shape checks only: id, pubkey and sig are lowercase hex of the right length.
    pub fn is_well_formed(&self) -> bool {
        is_lower_hex(&self.id, 64) && is_lower_hex(&self.pubkey, 64) && is_lower_hex(&self.sig, 128)
    }

    /// Recompute the id and check the Schnorr signature.
    pub fn verify(&self) -> Result<(), EventError> {
        if !self.is_well_formed() {
            return Err(EventError::Invalid("malformed id, pubkey or sig".to_string()));
        }

        let digest = self.unsigned().digest()?;
        let computed = hex::encode(digest);
        if computed != self.id {
            return Err(EventError::IdMismatch {
                expected: computed,
                actual: self.id.clone(),
            });
        }

        let sig_bytes = hex::decode(&self.sig).map_err(|source| EventError::Hex {
            field: "sig",
            source,
        })?;
        let sig = schnorr::Signature::from_slice(&sig_bytes)
            .map_err(|e| EventError::Signature(e.to_string()))?;

        let pubkey_bytes = hex::decode(&self.pubkey).map_err(|source| EventError::Hex {
            field: "pubkey",
            source,
        })?;
        let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|e| EventError::Key(e.to_string()))?;

        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
            .map_err(|e| EventError::Signature(e.to_string()))
    }
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn unsigned() -> UnsignedEvent {
        UnsignedEvent {
            pubkey: "a".repeat(64),
            created_at: 1617932115,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: "Hello, world!".to_string(),
        }
    }

    #[test]
    fn test_canonical_json_layout() {
        let json = unsigned().canonical_json().unwrap();
        let expected = format!("[0,\"{}\",1617932115,1,[],\"Hello, world!\"]", "a".repeat(64));
        assert_eq!(json, expected);
    }

    #[test]
    fn test_canonical_json_rejects_bad_pubkey() {
        let mut event = unsigned();
        event.pubkey = "ABC".to_string();
        assert!(matches!(event.canonical_json(), Err(EventError::Invalid(_))));
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = unsigned().id().unwrap();
        let b = unsigned().id().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event {
            id: "1".repeat(64),
            pubkey: "2".repeat(64),
            created_at: 1,
            kind: 1,
            tags: vec![vec!["p".to_string(), "x".to_string()]],
            content: "hi".to_string(),
            sig: "3".repeat(128),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], 1);
        assert_eq!(value["tags"][0][0], "p");

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert!(back.is_well_formed());
    }

    #[test]
    fn test_template_builder() {
        let template = EventTemplate::new(KIND_METADATA, "{}")
            .created_at(42)
            .tag(vec!["t".to_string(), "nostr".to_string()]);
        assert_eq!(template.created_at, 42);
        assert_eq!(template.tags.len(), 1);
    }
}
