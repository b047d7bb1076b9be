//! Per-relay connection actor.
//!
//! Each relay connection is a tokio task that exclusively owns the websocket
//! stream. Callers talk to it through a [`ConnectionHandle`]: commands go over
//! an ordered mpsc inbox with oneshot replies, and the current
//! [`ConnectionStatus`] is published on a watch channel so status queries and
//! readiness waits never queue behind the inbox.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> HandshakePending -> Ready -> Closing -> Terminated
//! ```
//!
//! Any failure moves straight to `Terminated`. On termination the actor purges
//! its relay from the subscription index and removes itself from the
//! supervisor registry, once.

use crate::config::ClientConfig;
use crate::dispatch::{Delivery, Dispatcher, Topic};
use crate::error::{ClientError, Result, TransportErrorKind};
use crate::index::SubscriptionIndex;
use crate::message::{ClientMessage, RelayMessage};
use crate::relay_url::{RelayId, RelayUrl};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async_tls};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How many relay-closed subscription ids a connection remembers.
const CLOSED_SUBSCRIPTIONS_LIMIT: usize = 256;

/// Live connections keyed by relay identity.
pub(crate) type Registry = DashMap<RelayId, ConnectionHandle>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Actor spawned, no connect issued yet
    Disconnected,
    /// Resolving the host and opening TCP
    Connecting,
    /// TLS and the HTTP upgrade are in flight
    HandshakePending,
    /// Websocket open, sends accepted
    Ready,
    /// Close frame sent or received, draining
    Closing,
    Terminated,
}

/// Snapshot of one connection, as reported by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub url: String,
    pub relay: RelayId,
    pub state: ConnectionState,
    pub ready: bool,
    pub closing: bool,
}

impl ConnectionStatus {
    fn new(url: &RelayUrl) -> Self {
        Self {
            url: url.to_string(),
            relay: url.id().clone(),
            state: ConnectionState::Disconnected,
            ready: false,
            closing: false,
        }
    }
}

/// Shared state every connection actor reports into.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) config: ClientConfig,
    pub(crate) index: Arc<SubscriptionIndex>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) registry: Arc<Registry>,
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    url: RelayUrl,
    generation: u64,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect { .. } => f.write_str("Connect"),
            Command::Send { text, .. } => f.debug_struct("Send").field("len", &text.len()).finish(),
            Command::Disconnect { .. } => f.write_str("Disconnect"),
        }
    }
}

impl ConnectionHandle {
    pub fn relay(&self) -> &RelayId {
        self.url.id()
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().ready
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ConnectionState::Terminated
    }

    /// Run the handshake. Resolves once the actor is `Ready` or has terminated.
    pub(crate) async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Wait until the connection reports ready, or fail after `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut status = self.status.clone();
        let outcome = tokio::time::timeout(
            timeout,
            status.wait_for(|s| s.ready || s.state == ConnectionState::Terminated),
        )
        .await;
        let ready = match outcome {
            Ok(Ok(snapshot)) => snapshot.ready,
            Ok(Err(_)) => false,
            Err(_) => {
                return Err(ClientError::ReadyTimeout {
                    relay: self.relay().clone(),
                    timeout,
                });
            }
        };
        if ready { Ok(()) } else { Err(self.closed()) }
    }

    /// Send one text frame. Fails with `NotReady` immediately unless the
    /// connection is ready; never waits for readiness.
    pub async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_ready() {
            return Err(ClientError::NotReady(self.relay().clone()));
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { text, reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        self.send_text(message.to_json()?).await
    }

    /// Close the connection and wait for the actor to finish tearing down.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn closed(&self) -> ClientError {
        ClientError::ConnectionClosed(self.relay().clone())
    }
}

/// Spawn an actor for `url` in the `Disconnected` state.
pub(crate) fn spawn(url: RelayUrl, generation: u64, ctx: ConnectionContext) -> ConnectionHandle {
    let (commands_tx, commands) = mpsc::channel(ctx.config.command_buffer.max(1));
    let (status_tx, status) = watch::channel(ConnectionStatus::new(&url));

    let actor = ConnectionActor {
        url: url.clone(),
        generation,
        commands,
        status: status_tx,
        ctx,
        closed_subs: ClosedSubscriptions::new(CLOSED_SUBSCRIPTIONS_LIMIT),
    };
    tokio::spawn(actor.run());

    ConnectionHandle {
        url,
        generation,
        commands: commands_tx,
        status,
    }
}

struct ConnectionActor {
    url: RelayUrl,
    generation: u64,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    ctx: ConnectionContext,
    /// Subscriptions this relay has sent CLOSED for
    closed_subs: ClosedSubscriptions,
}

/// Recently closed subscription ids, oldest evicted first.
struct ClosedSubscriptions {
    limit: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl ClosedSubscriptions {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

impl ConnectionActor {
    fn relay(&self) -> &RelayId {
        self.url.id()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
            status.ready = state == ConnectionState::Ready;
            status.closing = state == ConnectionState::Closing;
        });
    }

    async fn run(mut self) {
        let mut stream = None;
        let mut failed_connect = None;
        let mut waiters = Vec::new();

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Connect { reply } => match self.handshake().await {
                    Ok(ws) => {
                        self.set_state(ConnectionState::Ready);
                        info!("Connected to relay: {}", self.url);
                        let _ = reply.send(Ok(()));
                        stream = Some(ws);
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to connect to {}: {}", self.url, e);
                        failed_connect = Some((reply, e));
                        break;
                    }
                },
                Command::Send { reply, .. } => {
                    let _ = reply.send(Err(ClientError::NotReady(self.relay().clone())));
                }
                Command::Disconnect { reply } => {
                    waiters.push(reply);
                    break;
                }
            }
        }

        if let Some(ws) = stream {
            waiters.extend(self.serve(ws).await);
        }

        // Callers are answered only after the registry entry is gone, so a
        // failed or disconnected relay can be connected again right away.
        self.terminate();
        for waiter in waiters {
            let _ = waiter.send(());
        }
        if let Some((reply, e)) = failed_connect {
            let _ = reply.send(Err(e));
        }
    }

    async fn handshake(&mut self) -> Result<WsStream> {
        let timeout = self.ctx.config.handshake_timeout;
        match tokio::time::timeout(timeout, self.open()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::HandshakeTimeout {
                relay: self.relay().clone(),
                timeout,
            }),
        }
    }

    async fn open(&mut self) -> Result<WsStream> {
        self.set_state(ConnectionState::Connecting);

        let host = self.url.connect_host();
        let port = self.url.port();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| ClientError::transport(TransportErrorKind::NameResolution, e.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(ClientError::transport(
                TransportErrorKind::NameResolution,
                format!("no addresses for {host}"),
            ));
        }

        let tcp = connect_tcp(&addrs).await?;
        self.set_state(ConnectionState::HandshakePending);

        if self.url.is_secure() {
            // Already installed on every call after the first.
            let _ = rustls::crypto::ring::default_provider().install_default();
        }
        let (ws, response) = client_async_tls(self.url.as_str(), tcp)
            .await
            .map_err(classify_ws_error)?;
        debug!("Upgrade response from {}: {}", self.url, response.status());
        Ok(ws)
    }

    /// Serve a ready connection until it closes. Returns pending disconnect
    /// callers.
    async fn serve(&mut self, mut ws: WsStream) -> Vec<oneshot::Sender<()>> {
        let mut waiters = Vec::new();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send { text, reply }) => {
                        debug!("Sending to {}: {}", self.relay(), text);
                        if let Err(e) = ws.send(Message::Text(text.into())).await {
                            warn!("Send to {} failed: {}", self.relay(), e);
                            let _ = reply.send(Err(ClientError::transport(TransportErrorKind::Io, e.to_string())));
                            break;
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Connect { reply }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Disconnect { reply }) => {
                        info!("Disconnecting from relay: {}", self.url);
                        waiters.push(reply);
                        self.close(&mut ws).await;
                        break;
                    }
                    None => {
                        self.close(&mut ws).await;
                        break;
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = ws.send(Message::Pong(payload)).await {
                            warn!("Failed to answer ping from {}: {}", self.relay(), e);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Relay {} closed connection: {:?}", self.relay(), frame);
                        self.set_state(ConnectionState::Closing);
                        self.drain(&mut ws).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", self.relay(), e);
                        break;
                    }
                    None => {
                        info!("Relay {} hung up", self.relay());
                        break;
                    }
                },
            }
        }

        waiters
    }

    /// Best-effort close frame, bounded by the drain timeout.
    async fn close(&self, ws: &mut WsStream) {
        self.set_state(ConnectionState::Closing);
        let drain = self.ctx.config.close_drain_timeout;
        if let Ok(Err(e)) = tokio::time::timeout(drain, ws.close(None)).await {
            debug!("Close handshake with {} failed: {}", self.relay(), e);
        }
    }

    /// Process frames still buffered after a remote close.
    async fn drain(&mut self, ws: &mut WsStream) {
        let deadline = tokio::time::sleep(self.ctx.config.close_drain_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", self.relay(), e);
                return;
            }
        };
        debug!("Received {} from {}", message.kind(), self.relay());

        let relay = self.relay().clone();
        let dispatcher = &self.ctx.dispatcher;
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if self.closed_subs.contains(&subscription_id) {
                    debug!("Ignoring event for closed subscription {} from {}", subscription_id, relay);
                    return;
                }
                dispatcher.deliver(
                    &Topic::subscription(subscription_id.as_str()),
                    Delivery::Event {
                        relay,
                        subscription_id,
                        event,
                    },
                );
            }
            RelayMessage::Eose { subscription_id } => {
                dispatcher.deliver(
                    &Topic::subscription(subscription_id.as_str()),
                    Delivery::Eose {
                        host: relay.host().to_string(),
                        relay,
                        subscription_id,
                    },
                );
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!("Relay {} closed subscription {}: {}", relay, subscription_id, message);
                self.ctx.index.delete_one(&relay, &subscription_id);
                self.closed_subs.insert(subscription_id.clone());
                dispatcher.deliver(
                    &Topic::subscription(subscription_id.as_str()),
                    Delivery::Closed {
                        relay,
                        subscription_id,
                        message,
                    },
                );
            }
            RelayMessage::Notice { message } => {
                warn!("Notice from {}: {}", relay, message);
                dispatcher.deliver(&Topic::Notice, Delivery::Notice { relay, message });
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                dispatcher.deliver(
                    &Topic::Ok,
                    Delivery::Ok {
                        host: relay.host().to_string(),
                        relay,
                        event_id,
                        accepted,
                        message,
                    },
                );
            }
            RelayMessage::Auth { .. } | RelayMessage::Count { .. } => {}
        }
    }

    fn terminate(&self) {
        self.set_state(ConnectionState::Terminated);
        let purged = self.ctx.index.delete_all_for_relay(self.relay());
        let released = self
            .ctx
            .registry
            .remove_if(self.relay(), |_, handle| handle.generation == self.generation)
            .is_some();
        info!(
            relay = %self.relay(),
            purged = purged.len(),
            released,
            "Connection terminated"
        );
    }
}

async fn connect_tcp(addrs: &[SocketAddr]) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    let kind = match &last_error {
        Some(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
        _ => TransportErrorKind::Io,
    };
    let message = last_error.map_or_else(|| "no address to connect to".to_string(), |e| e.to_string());
    Err(ClientError::transport(kind, message))
}

fn classify_ws_error(error: tungstenite::Error) -> ClientError {
    let kind = match &error {
        tungstenite::Error::Tls(_) => TransportErrorKind::Tls,
        tungstenite::Error::Io(io) if io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) => {
            TransportErrorKind::Tls
        }
        tungstenite::Error::Http(_)
        | tungstenite::Error::HttpFormat(_)
        | tungstenite::Error::Protocol(_)
        | tungstenite::Error::Url(_) => TransportErrorKind::Upgrade,
        _ => TransportErrorKind::Io,
    };
    ClientError::transport(kind, error.to_string())
}
