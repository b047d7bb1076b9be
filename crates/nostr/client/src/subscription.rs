//! Subscription ids, records and filter building.

use crate::message::Filter;
use rand::RngCore;

/// Length in hex characters of a generated subscription id.
pub const SUBSCRIPTION_ID_LEN: usize = 64;

/// Generate a random 64-character hex subscription id.
pub fn generate_subscription_id() -> String {
    let mut bytes = [0u8; SUBSCRIPTION_ID_LEN / 2];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A subscription the client opened. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    /// Filters in the order they were sent in the REQ
    pub filters: Vec<Filter>,
    /// Unix timestamp (seconds)
    pub created_at: u64,
}

impl Subscription {
    /// Create a subscription with a fresh random id.
    pub fn new(filters: Vec<Filter>) -> Self {
        Self {
            id: generate_subscription_id(),
            filters,
            created_at: nostr::unix_now(),
        }
    }
}

/// Builder for creating subscription filters.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBuilder {
    filters: Vec<Filter>,
}

impl SubscriptionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a filter for specific event kinds.
    pub fn kinds(self, kinds: Vec<u16>) -> Self {
        self.filter(Filter::new().kinds(kinds))
    }

    /// Add a filter for events from specific authors.
    pub fn authors(self, authors: Vec<String>) -> Self {
        self.filter(Filter::new().authors(authors))
    }

    pub fn ids(self, ids: Vec<String>) -> Self {
        self.filter(Filter::new().ids(ids))
    }

    /// Text notes and reactions referencing an event (NIP-10 thread replies).
    pub fn replies_to(self, event_id: String) -> Self {
        self.filter(Filter::new().kinds(vec![1, 7]).event_refs(vec![event_id]))
    }

    /// Events mentioning a pubkey.
    pub fn mentions(self, pubkey: String) -> Self {
        self.filter(Filter::new().pubkey_refs(vec![pubkey]))
    }

    pub fn build(self) -> Vec<Filter> {
        self.filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_subscription_id_is_64_hex() {
        let id = generate_subscription_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generate_subscription_id_unique() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| generate_subscription_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_subscription_record() {
        let filters = SubscriptionBuilder::new().kinds(vec![1]).authors(vec!["pk".to_string()]).build();
        let sub = Subscription::new(filters.clone());
        assert_eq!(sub.id.len(), SUBSCRIPTION_ID_LEN);
        assert_eq!(sub.filters, filters);
        assert!(sub.created_at > 0);
    }

    #[test]
    fn test_subscription_builder() {
        let filters = SubscriptionBuilder::new()
            .kinds(vec![1])
            .replies_to("event123".to_string())
            .mentions("pk".to_string())
            .build();

        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0].kinds, Some(vec![1]));
        assert_eq!(filters[1].kinds, Some(vec![1, 7]));
        assert_eq!(filters[1].tags.get("#e"), Some(&vec!["event123".to_string()]));
        assert_eq!(filters[2].tags.get("#p"), Some(&vec!["pk".to_string()]));
    }
}
