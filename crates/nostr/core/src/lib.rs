//! Nostr event type and signing.
//!
//! This crate provides the pieces the relay client treats as collaborators:
//! - `Event`: the signed NIP-01 event as it travels over the wire
//! - `EventTemplate` / `UnsignedEvent`: events before signing
//! - `Keys`: a secp256k1 keypair that signs templates into events
//!
//! # Example
//!
//! ```
//! use nostr::{EventTemplate, Keys, KIND_SHORT_TEXT_NOTE};
//!
//! let keys = Keys::generate();
//! let template = EventTemplate::new(KIND_SHORT_TEXT_NOTE, "hello");
//! let event = keys.sign(&template).unwrap();
//!
//! assert_eq!(event.id.len(), 64);
//! assert!(event.verify().is_ok());
//! ```

mod event;
mod keys;

pub use event::{
    Event, EventError, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_SHORT_TEXT_NOTE,
    UnsignedEvent, unix_now,
};
pub use keys::Keys;
