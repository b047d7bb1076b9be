//! Relay URL validation and relay identities.
//!
//! A relay identity is the lowercased host of the relay URL with trailing `/`
//! and `.` removed. When the URL carries an explicit non-default port the
//! identity keeps it as `host:port`, so two relays on one host stay distinct.
//! The identity is what the supervisor registers connections under and what
//! the subscription index is keyed by.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use url::{Host, Url};

/// Stable lookup key for one relay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

impl RelayId {
    /// Normalize a host (optionally `host:port`) into an identity.
    pub fn new(host: impl AsRef<str>) -> Self {
        let normalized = host
            .as_ref()
            .trim()
            .trim_end_matches(['/', '.'])
            .to_ascii_lowercase();
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part of the identity, without any port suffix.
    pub fn host(&self) -> &str {
        if self.0.starts_with('[') {
            // IPv6 literal: "[::1]" or "[::1]:7000"
            return match self.0.find(']') {
                Some(end) => &self.0[..=end],
                None => &self.0,
            };
        }
        match self.0.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.0,
        }
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelayId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for RelayId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<RelayId> for String {
    fn from(id: RelayId) -> Self {
        id.0
    }
}

/// A validated `ws://` or `wss://` relay URL together with its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUrl {
    url: Url,
    id: RelayId,
}

impl RelayUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let url = Url::parse(input).map_err(|e| match e {
            url::ParseError::EmptyHost => ClientError::EmptyHost(input.to_string()),
            other => ClientError::InvalidUrl {
                url: input.to_string(),
                reason: other.to_string(),
            },
        })?;

        match url.scheme() {
            "ws" | "wss" => {}
            scheme => {
                return Err(ClientError::UnsupportedScheme {
                    url: input.to_string(),
                    scheme: scheme.to_string(),
                });
            }
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.trim_end_matches('.').is_empty() => {
                domain.to_string()
            }
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => format!("[{addr}]"),
            _ => return Err(ClientError::EmptyHost(input.to_string())),
        };

        let id = match url.port() {
            Some(port) => RelayId::new(format!("{host}:{port}")),
            None => RelayId::new(host),
        };

        Ok(Self { url, id })
    }

    pub fn id(&self) -> &RelayId {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }

    /// Host suitable for DNS resolution (IPv6 literals without brackets).
    pub fn connect_host(&self) -> String {
        match self.url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => String::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identity_normalization() {
        assert_eq!(RelayId::new("relay.example.com"), RelayId::new("relay.example.com/"));
        assert_eq!(RelayId::new("Relay.Example.COM"), RelayId::new("relay.example.com"));
        assert_eq!(RelayId::new("relay.example.com.").as_str(), "relay.example.com");
        assert_ne!(RelayId::new("relay.example.com"), RelayId::new("relay.example.org"));
    }

    #[test]
    fn test_identity_is_pure() {
        for host in ["nos.lol", "Relay.Damus.io", "relay.test/", "127.0.0.1:7000"] {
            assert_eq!(RelayId::new(host), RelayId::new(host));
        }
    }

    #[test]
    fn test_identity_host_round_trip() {
        assert_eq!(RelayId::new("relay.test").host(), "relay.test");
        assert_eq!(RelayId::new("127.0.0.1:7000").host(), "127.0.0.1");
        assert_eq!(RelayId::new("[::1]:7000").host(), "[::1]");
        assert_eq!(RelayId::new("[::1]").host(), "[::1]");
    }

    #[test]
    fn test_parse_wss() {
        let url = RelayUrl::parse("wss://relay.test/").unwrap();
        assert_eq!(url.id().as_str(), "relay.test");
        assert!(url.is_secure());
        assert_eq!(url.port(), 443);
        assert_eq!(url.connect_host(), "relay.test");
    }

    #[test]
    fn test_parse_uppercase_host() {
        let url = RelayUrl::parse("ws://Relay.Example.COM").unwrap();
        assert_eq!(url.id().as_str(), "relay.example.com");
        assert_eq!(url.port(), 80);
    }

    #[test]
    fn test_parse_keeps_explicit_port() {
        let url = RelayUrl::parse("ws://127.0.0.1:17001").unwrap();
        assert_eq!(url.id().as_str(), "127.0.0.1:17001");
        assert_eq!(url.port(), 17001);

        // Default port is not part of the identity.
        let url = RelayUrl::parse("wss://relay.test:443/").unwrap();
        assert_eq!(url.id().as_str(), "relay.test");
    }

    #[test]
    fn test_parse_ipv6() {
        let url = RelayUrl::parse("ws://[::1]:7000").unwrap();
        assert_eq!(url.id().as_str(), "[::1]:7000");
        assert_eq!(url.connect_host(), "::1");
    }

    #[test]
    fn test_parse_rejects_http_scheme() {
        match RelayUrl::parse("https://relay.example.com") {
            Err(ClientError::UnsupportedScheme { scheme, .. }) => assert_eq!(scheme, "https"),
            other => panic!("expected UnsupportedScheme, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            RelayUrl::parse("not a url"),
            Err(ClientError::InvalidUrl { .. })
        ));
        assert!(matches!(
            RelayUrl::parse("relay.example.com"),
            Err(ClientError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_empty_host() {
        assert!(matches!(RelayUrl::parse("ws://"), Err(ClientError::EmptyHost(_))));
    }
}
