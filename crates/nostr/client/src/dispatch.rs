//! Topic-based delivery of inbound relay messages.
//!
//! A topic is either a subscription id or one of the reserved topics for
//! NOTICE and OK messages. Listeners are unbounded channels; every listener
//! registered on a topic gets its own copy of each delivery. Messages from one
//! relay reach a listener in the order that relay sent them.

use crate::relay_url::RelayId;
use nostr::Event;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Messages for one subscription id
    Subscription(String),
    /// NOTICE from any relay
    Notice,
    /// OK replies to published events from any relay
    Ok,
}

impl Topic {
    pub fn subscription(sub_id: impl Into<String>) -> Self {
        Topic::Subscription(sub_id.into())
    }
}

/// One inbound message as handed to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event {
        relay: RelayId,
        subscription_id: String,
        event: Event,
    },
    /// End of stored events for a subscription on one relay
    Eose {
        relay: RelayId,
        host: String,
        subscription_id: String,
    },
    /// The relay closed the subscription on its side
    Closed {
        relay: RelayId,
        subscription_id: String,
        message: String,
    },
    Notice {
        relay: RelayId,
        message: String,
    },
    Ok {
        relay: RelayId,
        host: String,
        event_id: String,
        accepted: bool,
        message: String,
    },
}

impl Delivery {
    pub fn relay(&self) -> &RelayId {
        match self {
            Delivery::Event { relay, .. }
            | Delivery::Eose { relay, .. }
            | Delivery::Closed { relay, .. }
            | Delivery::Notice { relay, .. }
            | Delivery::Ok { relay, .. } => relay,
        }
    }
}

/// Sending half of a listener registration.
///
/// Cloning keeps the same identity, so registering a clone twice on one topic
/// is still a single registration.
#[derive(Debug, Clone)]
pub struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Listener {
    /// Create a listener and the receiver its deliveries arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    topics: RwLock<HashMap<Topic, Vec<Listener>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener` to `topic`. Registering the same listener again is a no-op.
    pub fn register(&self, topic: Topic, listener: &Listener) {
        let mut topics = self.topics.write();
        let listeners = topics.entry(topic).or_default();
        if !listeners.iter().any(|l| l.id == listener.id) {
            listeners.push(listener.clone());
        }
    }

    /// Remove one listener from `topic`. Returns `true` if it was registered.
    pub fn unregister(&self, topic: &Topic, listener: &Listener) -> bool {
        let mut topics = self.topics.write();
        let Some(listeners) = topics.get_mut(topic) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| l.id != listener.id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Drop every listener of `topic`.
    pub fn remove_topic(&self, topic: &Topic) {
        self.topics.write().remove(topic);
    }

    /// Send `delivery` to every listener of `topic` and return how many got it.
    /// Having no listeners is not an error.
    pub fn deliver(&self, topic: &Topic, delivery: Delivery) -> usize {
        let listeners = match self.topics.read().get(topic) {
            Some(listeners) => listeners.clone(),
            None => {
                trace!(?topic, "no listeners");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut stale = false;
        for listener in &listeners {
            if listener.tx.send(delivery.clone()).is_ok() {
                delivered += 1;
            } else {
                stale = true;
            }
        }

        if stale {
            let mut topics = self.topics.write();
            if let Some(listeners) = topics.get_mut(topic) {
                listeners.retain(|l| !l.is_closed());
                if listeners.is_empty() {
                    topics.remove(topic);
                }
            }
        }

        delivered
    }

    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(relay: &str, message: &str) -> Delivery {
        Delivery::Notice {
            relay: RelayId::new(relay),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let dispatcher = Dispatcher::new();
        let (listener, mut rx) = Listener::new();

        dispatcher.register(Topic::Notice, &listener);
        dispatcher.register(Topic::Notice, &listener.clone());
        assert_eq!(dispatcher.listener_count(&Topic::Notice), 1);

        assert_eq!(dispatcher.deliver(&Topic::Notice, notice("a.test", "hi")), 1);
        assert_eq!(rx.try_recv().unwrap(), notice("a.test", "hi"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_deliver_to_every_listener() {
        let dispatcher = Dispatcher::new();
        let (first, mut rx1) = Listener::new();
        let (second, mut rx2) = Listener::new();
        let topic = Topic::subscription("sub1");

        dispatcher.register(topic.clone(), &first);
        dispatcher.register(topic.clone(), &second);

        assert_eq!(dispatcher.deliver(&topic, notice("a.test", "x")), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_deliver_without_listeners() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.deliver(&Topic::Ok, notice("a.test", "x")), 0);
    }

    #[test]
    fn test_topics_are_isolated() {
        let dispatcher = Dispatcher::new();
        let (listener, mut rx) = Listener::new();
        dispatcher.register(Topic::subscription("a"), &listener);

        assert_eq!(dispatcher.deliver(&Topic::subscription("b"), notice("r.test", "x")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_per_relay_order_preserved() {
        let dispatcher = Dispatcher::new();
        let (listener, mut rx) = Listener::new();
        dispatcher.register(Topic::Notice, &listener);

        for n in 0..10 {
            dispatcher.deliver(&Topic::Notice, notice("a.test", &n.to_string()));
        }
        for n in 0..10 {
            assert_eq!(rx.try_recv().unwrap(), notice("a.test", &n.to_string()));
        }
    }

    #[test]
    fn test_closed_listeners_are_pruned() {
        let dispatcher = Dispatcher::new();
        let (dropped, rx) = Listener::new();
        let (kept, mut kept_rx) = Listener::new();
        dispatcher.register(Topic::Notice, &dropped);
        dispatcher.register(Topic::Notice, &kept);
        drop(rx);

        assert_eq!(dispatcher.deliver(&Topic::Notice, notice("a.test", "x")), 1);
        assert_eq!(dispatcher.listener_count(&Topic::Notice), 1);
        assert!(kept_rx.try_recv().is_ok());

        drop(kept_rx);
        assert_eq!(dispatcher.deliver(&Topic::Notice, notice("a.test", "y")), 0);
        assert_eq!(dispatcher.topic_count(), 0);
    }

    #[test]
    fn test_unregister_and_remove_topic() {
        let dispatcher = Dispatcher::new();
        let (a, _rx_a) = Listener::new();
        let (b, _rx_b) = Listener::new();
        let topic = Topic::subscription("sub1");
        dispatcher.register(topic.clone(), &a);
        dispatcher.register(topic.clone(), &b);

        assert!(dispatcher.unregister(&topic, &a));
        assert!(!dispatcher.unregister(&topic, &a));
        assert_eq!(dispatcher.listener_count(&topic), 1);

        dispatcher.remove_topic(&topic);
        assert_eq!(dispatcher.listener_count(&topic), 0);
        assert_eq!(dispatcher.topic_count(), 0);
    }
}
