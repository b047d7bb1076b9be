//! Signing keys.

use crate::event::{Event, EventError, EventTemplate, UnsignedEvent};
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use rand::RngCore;
use std::fmt;

/// A secp256k1 keypair used to author events.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_key: String,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        loop {
            rand::rng().fill_bytes(&mut bytes);
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(keys) = Self::from_secret_bytes(&bytes) {
                return keys;
            }
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, EventError> {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(bytes).map_err(|e| EventError::Key(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (xonly, _parity) = keypair.x_only_public_key();
        Ok(Self {
            keypair,
            public_key: hex::encode(xonly.serialize()),
        })
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self, EventError> {
        let decoded = hex::decode(secret).map_err(|source| EventError::Hex {
            field: "secret key",
            source,
        })?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| EventError::Key("secret key must be 32 bytes".to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Lowercase hex x-only public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Sign a template, producing a complete event authored by these keys.
    pub fn sign(&self, template: &EventTemplate) -> Result<Event, EventError> {
        let unsigned = UnsignedEvent {
            pubkey: self.public_key.clone(),
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags.clone(),
            content: template.content.clone(),
        };
        self.sign_unsigned(unsigned)
    }

    /// Sign an unsigned event. Its pubkey must match these keys.
    pub fn sign_unsigned(&self, unsigned: UnsignedEvent) -> Result<Event, EventError> {
        if unsigned.pubkey != self.public_key {
            return Err(EventError::Key(format!(
                "event pubkey {} does not match signing key {}",
                unsigned.pubkey, self.public_key
            )));
        }

        let digest = unsigned.digest()?;
        let secp = Secp256k1::signing_only();
        let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &self.keypair);

        Ok(Event {
            id: hex::encode(digest),
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.serialize()),
        })
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
