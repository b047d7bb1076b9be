//! Connection supervisor.
//!
//! Creates one connection actor per relay identity, registers it, drives it
//! through connect and readiness, and finds it again by identity. Entries are
//! only ever removed by the actor's own termination path.

use crate::config::ClientConfig;
use crate::connection::{self, ConnectionContext, ConnectionHandle, ConnectionStatus, Registry};
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, Result};
use crate::index::SubscriptionIndex;
use crate::relay_url::{RelayId, RelayUrl};
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

pub struct RelayManager {
    ctx: ConnectionContext,
    next_generation: AtomicU64,
}

impl RelayManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            ctx: ConnectionContext {
                config,
                index: Arc::new(SubscriptionIndex::new()),
                dispatcher: Arc::new(Dispatcher::new()),
                registry: Arc::new(Registry::new()),
            },
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    /// Index shared with every connection this manager creates.
    pub fn index(&self) -> &Arc<SubscriptionIndex> {
        &self.ctx.index
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.ctx.dispatcher
    }

    /// Connect to `url` and wait until the connection is ready.
    ///
    /// Returns the relay identity. If a connection for that identity is
    /// already registered, waits for it to be ready and returns the same
    /// identity without opening a second one.
    pub async fn connect(&self, url: &str) -> Result<RelayId> {
        let url = RelayUrl::parse(url)?;
        let relay = url.id().clone();
        let ready_timeout = self.ctx.config.ready_timeout;

        let (handle, fresh) = match self.ctx.registry.entry(relay.clone()) {
            // A terminated actor may not have released its entry yet.
            Entry::Occupied(mut entry) if entry.get().is_terminated() => {
                let handle = self.spawn(url);
                entry.insert(handle.clone());
                (handle, true)
            }
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let handle = self.spawn(url);
                entry.insert(handle.clone());
                (handle, true)
            }
        };

        if !fresh {
            debug!("Relay {} already registered", relay);
            handle.wait_ready(ready_timeout).await?;
            return Ok(relay);
        }

        info!("Connecting to relay: {}", handle.url());
        handle.connect().await?;
        handle.wait_ready(ready_timeout).await?;
        Ok(relay)
    }

    fn spawn(&self, url: RelayUrl) -> ConnectionHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        connection::spawn(url, generation, self.ctx.clone())
    }

    /// Connect to several relays concurrently. Results are in input order.
    pub async fn connect_many<S: AsRef<str>>(&self, urls: &[S]) -> Vec<(String, Result<RelayId>)> {
        join_all(urls.iter().map(|url| async move {
            let url = url.as_ref();
            (url.to_string(), self.connect(url).await)
        }))
        .await
    }

    /// Disconnect the relay registered under `relay`.
    pub async fn disconnect(&self, relay: &str) -> Result<()> {
        let handle = self
            .lookup(relay)
            .ok_or_else(|| ClientError::RelayNotFound(relay.to_string()))?;
        handle.disconnect().await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let handles: Vec<ConnectionHandle> = self.ctx.registry.iter().map(|e| e.value().clone()).collect();
        join_all(handles.iter().map(|handle| handle.disconnect())).await;
    }

    /// Find the live connection for an identity.
    pub fn lookup(&self, relay: &str) -> Option<ConnectionHandle> {
        self.ctx
            .registry
            .get(&RelayId::new(relay))
            .map(|entry| entry.value().clone())
    }

    /// Handles for every connection that has not terminated, sorted by identity.
    pub fn active_connections(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> = self
            .ctx
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_terminated())
            .collect();
        handles.sort_by(|a, b| a.relay().cmp(b.relay()));
        handles
    }

    pub fn registered_identities(&self) -> Vec<RelayId> {
        let mut relays: Vec<RelayId> = self.ctx.registry.iter().map(|e| e.key().clone()).collect();
        relays.sort();
        relays
    }

    pub fn statuses(&self) -> BTreeMap<RelayId, ConnectionStatus> {
        self.ctx
            .registry
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ctx.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctx.registry.is_empty()
    }
}

impl Default for RelayManager {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Drop for RelayManager {
    fn drop(&mut self) {
        // Actors exit once the last handle to them is gone.
        self.ctx.registry.clear();
    }
}
