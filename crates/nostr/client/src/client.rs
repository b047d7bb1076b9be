//! Multi-relay client.
//!
//! [`Client`] is the public entry point. It resolves which relays an
//! operation targets, sends to all of them concurrently, keeps the
//! subscription index in step with what was sent, and folds the per-relay
//! outcomes into one result. An operation succeeds if at least one relay
//! accepted it; the relays that did not are reported alongside.

use crate::config::ClientConfig;
use crate::connection::{ConnectionHandle, ConnectionStatus};
use crate::dispatch::{Delivery, Dispatcher, Listener, Topic};
use crate::error::{ClientError, RelayFailure, Result};
use crate::index::SubscriptionIndex;
use crate::manager::RelayManager;
use crate::message::{ClientMessage, Filter};
use crate::relay_url::{RelayId, RelayUrl};
use crate::subscription::Subscription;
use futures::future::join_all;
use nostr::Event;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which relays an operation targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RelaySet {
    /// Every registered relay
    #[default]
    All,
    /// Relay identities or relay URLs
    Only(Vec<String>),
}

impl RelaySet {
    pub fn only<I, S>(relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RelaySet::Only(relays.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<String>> for RelaySet {
    fn from(relays: Vec<String>) -> Self {
        RelaySet::Only(relays)
    }
}

/// Outcome of a successful publish.
#[derive(Debug)]
pub struct Published {
    pub event_id: String,
    /// Relays the event was sent to
    pub relays: Vec<RelayId>,
    pub failures: Vec<RelayFailure>,
}

#[derive(Debug)]
pub struct Subscribed {
    pub subscription_id: String,
    /// Relays the subscription is open on
    pub relays: Vec<RelayId>,
    pub failures: Vec<RelayFailure>,
}

#[derive(Debug)]
pub struct ClosedSubscription {
    pub relays: Vec<RelayId>,
    pub failures: Vec<RelayFailure>,
}

/// A relay's OK reply to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub relay: RelayId,
    pub event_id: String,
    pub accepted: bool,
    /// Relay-provided reason, often empty on success
    pub message: String,
}

#[derive(Debug)]
pub struct ConfirmedPublish {
    pub event_id: String,
    pub confirmations: Vec<PublishConfirmation>,
    /// Relays the event was sent to that did not answer in time
    pub unconfirmed: Vec<RelayId>,
    pub failures: Vec<RelayFailure>,
}

pub struct Client {
    relays: RelayManager,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            relays: RelayManager::new(config),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn relay_manager(&self) -> &RelayManager {
        &self.relays
    }

    fn index(&self) -> &Arc<SubscriptionIndex> {
        self.relays.index()
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.relays.dispatcher()
    }

    /// Connect to a relay and return its identity.
    pub async fn connect(&self, url: &str) -> Result<RelayId> {
        self.relays.connect(url).await
    }

    pub async fn connect_many<S: AsRef<str>>(&self, urls: &[S]) -> Vec<(String, Result<RelayId>)> {
        self.relays.connect_many(urls).await
    }

    /// Disconnect one relay. Its subscriptions are dropped from the index by
    /// the connection itself as it terminates.
    pub async fn close_conn(&self, relay: &str) -> Result<()> {
        info!("Closing connection to {}", relay);
        self.relays.disconnect(relay).await
    }

    pub async fn disconnect_all(&self) {
        self.relays.disconnect_all().await;
    }

    /// Send `event` to every relay in `relays`.
    pub async fn publish(&self, event: &Event, relays: RelaySet) -> Result<Published> {
        let (handles, unresolved) = self.resolve(&relays)?;
        let text = ClientMessage::Event(event.clone()).to_json()?;
        debug!("Publishing event {} to {} relays", event.id, handles.len());

        let outcomes = handles
            .iter()
            .map(|h| h.relay().clone())
            .zip(fan_out(&handles, &text).await)
            .collect();
        let (relays, failures) = aggregate(outcomes, unresolved)?;
        Ok(Published {
            event_id: event.id.clone(),
            relays,
            failures,
        })
    }

    /// Publish, then wait up to `timeout` for each relay's OK reply.
    pub async fn publish_confirmed(
        &self,
        event: &Event,
        relays: RelaySet,
        timeout: Duration,
    ) -> Result<ConfirmedPublish> {
        let (listener, mut rx) = Listener::new();
        self.dispatcher().register(Topic::Ok, &listener);

        let published = match self.publish(event, relays).await {
            Ok(published) => published,
            Err(e) => {
                self.dispatcher().unregister(&Topic::Ok, &listener);
                return Err(e);
            }
        };

        let mut pending: BTreeSet<RelayId> = published.relays.iter().cloned().collect();
        let mut confirmations = Vec::with_capacity(pending.len());
        let deadline = tokio::time::Instant::now() + timeout;

        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Delivery::Ok {
                    relay,
                    event_id,
                    accepted,
                    message,
                    ..
                })) if event_id == published.event_id => {
                    if pending.remove(&relay) {
                        confirmations.push(PublishConfirmation {
                            relay,
                            event_id,
                            accepted,
                            message,
                        });
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        self.dispatcher().unregister(&Topic::Ok, &listener);

        if !pending.is_empty() {
            warn!("No OK for event {} from {} relays", published.event_id, pending.len());
        }

        Ok(ConfirmedPublish {
            event_id: published.event_id,
            confirmations,
            unconfirmed: pending.into_iter().collect(),
            failures: published.failures,
        })
    }

    /// Open a subscription on every relay in `relays`. `listener` receives
    /// its events, EOSE and CLOSED messages.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        relays: RelaySet,
        listener: &Listener,
    ) -> Result<Subscribed> {
        let (handles, unresolved) = self.resolve(&relays)?;
        let subscription = Subscription::new(filters);
        let sub_id = subscription.id.clone();
        let text = ClientMessage::req(sub_id.as_str(), subscription.filters.clone()).to_json()?;

        // Registered before the REQ goes out so an early EOSE is not lost.
        let topic = Topic::subscription(sub_id.as_str());
        self.dispatcher().register(topic.clone(), listener);

        // Indexed before the REQ goes out, so a CLOSED reply always finds
        // the pair to remove.
        for handle in &handles {
            self.index().update(handle.relay(), &sub_id);
        }
        let results = fan_out(&handles, &text).await;
        for (handle, result) in handles.iter().zip(&results) {
            if result.is_err() {
                self.index().delete_one(handle.relay(), &sub_id);
            }
        }
        let outcomes = handles.iter().map(|h| h.relay().clone()).zip(results).collect();

        let (relays, failures) = match aggregate(outcomes, unresolved) {
            Ok(aggregated) => aggregated,
            Err(e) => {
                self.dispatcher().unregister(&topic, listener);
                return Err(e);
            }
        };

        info!("Opened subscription {} on {} relays", sub_id, relays.len());
        self.subscriptions.write().insert(sub_id.clone(), subscription);
        Ok(Subscribed {
            subscription_id: sub_id,
            relays,
            failures,
        })
    }

    /// Send CLOSE for `sub_id` to every relay holding it.
    pub async fn close_sub(&self, sub_id: &str) -> Result<ClosedSubscription> {
        let holders = self.index().relays_for(sub_id);
        if holders.is_empty() {
            return Err(ClientError::SubscriptionNotFound(sub_id.to_string()));
        }

        let mut handles = Vec::with_capacity(holders.len());
        let mut missing = Vec::new();
        for relay in holders {
            match self.relays.lookup(relay.as_str()) {
                Some(handle) => handles.push(handle),
                None => missing.push(RelayFailure::new(relay.as_str(), ClientError::RelayNotFound(relay.to_string()))),
            }
        }

        let text = ClientMessage::close(sub_id).to_json()?;
        let outcomes = fan_out(&handles, &text).await;
        for (handle, result) in handles.iter().zip(&outcomes) {
            if result.is_ok() {
                self.index().delete_one(handle.relay(), sub_id);
            }
        }
        let outcomes = handles.iter().map(|h| h.relay().clone()).zip(outcomes).collect();

        let closed = aggregate(outcomes, missing);
        if self.index().relays_for(sub_id).is_empty() {
            self.dispatcher().remove_topic(&Topic::subscription(sub_id));
            self.subscriptions.write().remove(sub_id);
        }

        let (relays, failures) = closed?;
        info!("Closed subscription {} on {} relays", sub_id, relays.len());
        Ok(ClosedSubscription { relays, failures })
    }

    /// Register `listener` for messages on an existing subscription id.
    pub fn listen(&self, sub_id: &str, listener: &Listener) {
        self.dispatcher().register(Topic::subscription(sub_id), listener);
    }

    pub fn listen_notices(&self, listener: &Listener) {
        self.dispatcher().register(Topic::Notice, listener);
    }

    pub fn listen_ok(&self, listener: &Listener) {
        self.dispatcher().register(Topic::Ok, listener);
    }

    pub fn list_relays(&self) -> Vec<RelayId> {
        self.relays.registered_identities()
    }

    pub fn relay_states(&self) -> BTreeMap<RelayId, ConnectionStatus> {
        self.relays.statuses()
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        self.index().all_unique_sub_ids()
    }

    pub fn relays_for_subscription(&self, sub_id: &str) -> Vec<RelayId> {
        self.index().relays_for(sub_id)
    }

    pub fn subscription(&self, sub_id: &str) -> Option<Subscription> {
        self.subscriptions.read().get(sub_id).cloned()
    }

    /// Turn a relay set into live connections. Entries that match neither a
    /// registered identity nor a registered relay URL become failures.
    fn resolve(&self, relays: &RelaySet) -> Result<(Vec<ConnectionHandle>, Vec<RelayFailure>)> {
        let requested = match relays {
            RelaySet::All => {
                let handles = self.relays.active_connections();
                if handles.is_empty() {
                    return Err(ClientError::NoValidRelays {
                        requested: Vec::new(),
                        failures: Vec::new(),
                    });
                }
                return Ok((handles, Vec::new()));
            }
            RelaySet::Only(requested) => requested,
        };

        let mut handles: Vec<ConnectionHandle> = Vec::with_capacity(requested.len());
        let mut failures = Vec::new();
        for entry in requested {
            let handle = self.relays.lookup(entry).or_else(|| {
                RelayUrl::parse(entry)
                    .ok()
                    .and_then(|url| self.relays.lookup(url.id().as_str()))
            });
            match handle {
                Some(handle) if handles.iter().any(|h| h.relay() == handle.relay()) => {}
                Some(handle) => handles.push(handle),
                None => failures.push(RelayFailure::new(entry.as_str(), ClientError::RelayNotFound(entry.clone()))),
            }
        }

        if handles.is_empty() {
            return Err(ClientError::NoValidRelays {
                requested: requested.clone(),
                failures,
            });
        }
        Ok((handles, failures))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

async fn fan_out(handles: &[ConnectionHandle], text: &str) -> Vec<Result<()>> {
    join_all(handles.iter().map(|handle| handle.send_text(text.to_string()))).await
}

/// Split per-relay outcomes into successes and failures. Fails with
/// `AllRelaysFailed` when nothing succeeded.
fn aggregate(
    outcomes: Vec<(RelayId, Result<()>)>,
    mut failures: Vec<RelayFailure>,
) -> Result<(Vec<RelayId>, Vec<RelayFailure>)> {
    let mut succeeded = Vec::with_capacity(outcomes.len());
    for (relay, result) in outcomes {
        match result {
            Ok(()) => succeeded.push(relay),
            Err(e) => failures.push(RelayFailure::new(relay, e)),
        }
    }
    if succeeded.is_empty() {
        return Err(ClientError::AllRelaysFailed(failures));
    }
    Ok((succeeded, failures))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(pattern: &[bool]) -> Vec<(RelayId, Result<()>)> {
        pattern
            .iter()
            .enumerate()
            .map(|(i, ok)| {
                let relay = RelayId::new(format!("relay{i}.test"));
                let result = if *ok { Ok(()) } else { Err(ClientError::NotReady(relay.clone())) };
                (relay, result)
            })
            .collect()
    }

    #[test]
    fn test_aggregation_law() {
        let patterns: &[&[bool]] = &[
            &[true],
            &[false],
            &[true, true, true],
            &[true, false, false],
            &[false, false, true],
            &[false, false, false],
        ];
        for pattern in patterns {
            let n = pattern.len();
            let k = pattern.iter().filter(|ok| **ok).count();
            match aggregate(outcomes(pattern), Vec::new()) {
                Ok((relays, failures)) => {
                    assert!(k >= 1, "{pattern:?}");
                    assert_eq!(relays.len(), k);
                    assert_eq!(failures.len(), n - k);
                }
                Err(ClientError::AllRelaysFailed(failures)) => {
                    assert_eq!(k, 0, "{pattern:?}");
                    assert_eq!(failures.len(), n);
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_aggregate_keeps_resolution_failures() {
        let unresolved = vec![RelayFailure::new(
            "ghost",
            ClientError::RelayNotFound("ghost".to_string()),
        )];
        let (relays, failures) = aggregate(outcomes(&[true, false]), unresolved).unwrap();
        assert_eq!(relays.len(), 1);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].relay, "ghost");
    }

    #[test]
    fn test_relay_set_only() {
        assert_eq!(
            RelaySet::only(["a.test", "b.test"]),
            RelaySet::Only(vec!["a.test".to_string(), "b.test".to_string()])
        );
        assert_eq!(RelaySet::default(), RelaySet::All);
    }

    #[tokio::test]
    async fn test_publish_without_relays() {
        let client = Client::new();
        let keys = nostr::Keys::generate();
        let event = keys
            .sign(&nostr::EventTemplate::new(nostr::KIND_SHORT_TEXT_NOTE, "hi"))
            .unwrap();

        match client.publish(&event, RelaySet::only(["nonexistent"])).await {
            Err(ClientError::NoValidRelays { requested, failures }) => {
                assert_eq!(requested, vec!["nonexistent".to_string()]);
                assert_eq!(failures.len(), 1);
            }
            other => panic!("expected NoValidRelays, got {:?}", other),
        }
        assert!(matches!(
            client.publish(&event, RelaySet::All).await,
            Err(ClientError::NoValidRelays { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_unknown_subscription() {
        let client = Client::new();
        assert!(matches!(
            client.close_sub("missing").await,
            Err(ClientError::SubscriptionNotFound(_))
        ));
        assert!(matches!(
            client.close_conn("missing.test").await,
            Err(ClientError::RelayNotFound(_))
        ));
    }
}
