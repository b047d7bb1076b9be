//! Client configuration

use std::time::Duration;

const ENV_HANDSHAKE_TIMEOUT_MS: &str = "NOSTR_CLIENT_HANDSHAKE_TIMEOUT_MS";
const ENV_READY_TIMEOUT_MS: &str = "NOSTR_CLIENT_READY_TIMEOUT_MS";
const ENV_CLOSE_DRAIN_MS: &str = "NOSTR_CLIENT_CLOSE_DRAIN_MS";

/// Timeouts and buffer sizes shared by every relay connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Budget for DNS, TCP, TLS and the websocket upgrade together
    pub handshake_timeout: Duration,
    /// Budget for the connection to report ready after the handshake
    pub ready_timeout: Duration,
    /// How long to keep reading buffered frames after a remote close
    pub close_drain_timeout: Duration,
    /// Capacity of each connection's command inbox
    pub command_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(3000),
            ready_timeout: Duration::from_millis(3000),
            close_drain_timeout: Duration::from_millis(250),
            command_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `NOSTR_CLIENT_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            handshake_timeout: env_millis(ENV_HANDSHAKE_TIMEOUT_MS)
                .unwrap_or(defaults.handshake_timeout),
            ready_timeout: env_millis(ENV_READY_TIMEOUT_MS).unwrap_or(defaults.ready_timeout),
            close_drain_timeout: env_millis(ENV_CLOSE_DRAIN_MS)
                .unwrap_or(defaults.close_drain_timeout),
            ..defaults
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_close_drain_timeout(mut self, timeout: Duration) -> Self {
        self.close_drain_timeout = timeout;
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key).ok().as_deref().and_then(parse_millis)
}

fn parse_millis(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_millis)
}
