//! Relay ↔ subscription index.
//!
//! The forward map (relay → subscription ids) is the single source of truth
//! for which subscriptions are open where. Every operation takes the one lock
//! for its whole duration, so concurrent callers never observe a partial
//! update. Entries for a relay only exist while its connection is live; the
//! connection's termination path removes them with
//! [`SubscriptionIndex::delete_all_for_relay`].

use crate::relay_url::RelayId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    relays: Mutex<HashMap<RelayId, BTreeSet<String>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscription ids open on `relay`, sorted.
    pub fn get(&self, relay: &RelayId) -> Vec<String> {
        self.relays
            .lock()
            .get(relay)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record `sub_id` as open on `relay`. Returns `false` if it already was.
    pub fn update(&self, relay: &RelayId, sub_id: &str) -> bool {
        self.relays
            .lock()
            .entry(relay.clone())
            .or_default()
            .insert(sub_id.to_string())
    }

    /// Remove one pair. Returns `true` if it was present.
    pub fn delete_one(&self, relay: &RelayId, sub_id: &str) -> bool {
        let mut relays = self.relays.lock();
        let Some(subs) = relays.get_mut(relay) else {
            return false;
        };
        let removed = subs.remove(sub_id);
        if subs.is_empty() {
            relays.remove(relay);
        }
        removed
    }

    /// Remove every subscription held by `relay`, returning what was removed.
    /// Calling it again for the same relay is a no-op.
    pub fn delete_all_for_relay(&self, relay: &RelayId) -> Vec<String> {
        self.relays
            .lock()
            .remove(relay)
            .map(|subs| subs.into_iter().collect())
            .unwrap_or_default()
    }

    /// Relays on which `sub_id` is open, sorted.
    pub fn relays_for(&self, sub_id: &str) -> Vec<RelayId> {
        let relays = self.relays.lock();
        let mut found: Vec<RelayId> = relays
            .iter()
            .filter(|(_, subs)| subs.contains(sub_id))
            .map(|(relay, _)| relay.clone())
            .collect();
        found.sort();
        found
    }

    /// Distinct subscription ids across all relays, sorted.
    pub fn all_unique_sub_ids(&self) -> Vec<String> {
        let relays = self.relays.lock();
        let unique: BTreeSet<&String> = relays.values().flatten().collect();
        unique.into_iter().cloned().collect()
    }

    /// Subscription id → relays holding it.
    pub fn invert(&self) -> BTreeMap<String, Vec<RelayId>> {
        let relays = self.relays.lock();
        let mut inverted: BTreeMap<String, Vec<RelayId>> = BTreeMap::new();
        for (relay, subs) in relays.iter() {
            for sub_id in subs {
                inverted.entry(sub_id.clone()).or_default().push(relay.clone());
            }
        }
        for holders in inverted.values_mut() {
            holders.sort();
        }
        inverted
    }

    pub fn is_empty(&self) -> bool {
        self.relays.lock().is_empty()
    }
}
