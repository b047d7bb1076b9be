//! Client error types

use crate::message::MessageError;
use crate::relay_url::RelayId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Where a transport-level failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// DNS lookup failed or returned no addresses
    NameResolution,
    /// The remote actively refused the TCP connection
    Refused,
    /// TLS negotiation failed
    Tls,
    /// The HTTP upgrade response was missing or malformed
    Upgrade,
    /// Any other I/O or WebSocket failure
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::NameResolution => "name resolution",
            TransportErrorKind::Refused => "connection refused",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Upgrade => "websocket upgrade",
            TransportErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

/// A failure attributed to one relay inside a fan-out operation.
#[derive(Debug)]
pub struct RelayFailure {
    /// Relay identity, or the raw entry when it could not be resolved
    pub relay: String,
    pub error: ClientError,
}

impl RelayFailure {
    pub fn new(relay: impl Into<String>, error: ClientError) -> Self {
        Self {
            relay: relay.into(),
            error,
        }
    }
}

impl fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.relay, self.error)
    }
}

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// URL could not be parsed at all
    #[error("invalid relay URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// URL parsed but is not a websocket URL
    #[error("unsupported scheme `{scheme}` in {url} (expected ws or wss)")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("relay URL has no host: {0}")]
    EmptyHost(String),

    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// The relay never completed the websocket handshake
    #[error("handshake with {relay} timed out after {timeout:?}")]
    HandshakeTimeout { relay: RelayId, timeout: Duration },

    /// The handshake finished but the connection never became usable
    #[error("relay {relay} did not become ready within {timeout:?}")]
    ReadyTimeout { relay: RelayId, timeout: Duration },

    #[error("relay {0} is not ready")]
    NotReady(RelayId),

    #[error("connection to {0} is closed")]
    ConnectionClosed(RelayId),

    #[error("relay not found: {0}")]
    RelayNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("no valid relays in {requested:?}")]
    NoValidRelays {
        requested: Vec<String>,
        failures: Vec<RelayFailure>,
    },

    #[error("all {} relays failed: {}", .0.len(), join_failures(.0))]
    AllRelaysFailed(Vec<RelayFailure>),

    #[error("protocol error: {0}")]
    Protocol(#[from] MessageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Per-relay failures carried by a fan-out error, empty for anything else.
    pub fn failures(&self) -> &[RelayFailure] {
        match self {
            ClientError::AllRelaysFailed(failures) => failures,
            ClientError::NoValidRelays { failures, .. } => failures,
            _ => &[],
        }
    }

    pub(crate) fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        ClientError::Transport {
            kind,
            message: message.into(),
        }
    }
}

fn join_failures(failures: &[RelayFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
