//! Multi-relay Nostr client.
//!
//! This crate provides:
//! - One actor task per relay connection (handshake, framing, ping/pong, close)
//! - A supervisor that names connections by relay identity and waits for readiness
//! - A relay ↔ subscription index kept consistent with connection lifecycles
//! - Topic-based delivery of inbound EVENT, EOSE, CLOSED, NOTICE and OK messages
//! - Fan-out publish and subscribe with per-relay failure reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr::{EventTemplate, KIND_SHORT_TEXT_NOTE, Keys};
//! use nostr_client::{Client, Delivery, Filter, Listener, RelaySet};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new();
//!     client.connect("wss://relay.damus.io").await?;
//!     client.connect("wss://nos.lol").await?;
//!
//!     let keys = Keys::generate();
//!     let event = keys.sign(&EventTemplate::new(KIND_SHORT_TEXT_NOTE, "hello"))?;
//!     let published = client.publish(&event, RelaySet::All).await?;
//!     println!("published {} ({} relays failed)", published.event_id, published.failures.len());
//!
//!     let (listener, mut deliveries) = Listener::new();
//!     let filter = Filter::new().kinds(vec![1]).limit(10);
//!     let sub = client.subscribe(vec![filter], RelaySet::All, &listener).await?;
//!
//!     while let Some(delivery) = deliveries.recv().await {
//!         match delivery {
//!             Delivery::Event { event, .. } => println!("event {}", event.id),
//!             Delivery::Eose { host, .. } => println!("stored events done on {host}"),
//!             _ => {}
//!         }
//!     }
//!
//!     client.close_sub(&sub.subscription_id).await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod connection;
mod dispatch;
mod error;
mod index;
mod manager;
mod message;
mod relay_url;
mod subscription;

pub use client::{
    Client, ClosedSubscription, ConfirmedPublish, PublishConfirmation, Published, RelaySet,
    Subscribed,
};
pub use config::ClientConfig;
pub use connection::{ConnectionHandle, ConnectionState, ConnectionStatus};
pub use dispatch::{Delivery, Dispatcher, Listener, Topic};
pub use error::{ClientError, RelayFailure, Result, TransportErrorKind};
pub use index::SubscriptionIndex;
pub use manager::RelayManager;
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use relay_url::{RelayId, RelayUrl};
pub use subscription::{SUBSCRIPTION_ID_LEN, Subscription, SubscriptionBuilder, generate_subscription_id};
