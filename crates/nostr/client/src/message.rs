//! Nostr relay message types.
//!
//! NIP-01 frames are JSON arrays carried in websocket text frames:
//! - Client to Relay: EVENT, REQ, CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE (plus AUTH and COUNT,
//!   which are decoded but not acted on)

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when decoding relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// ["EVENT", <event>]
    Event(Event),

    /// ["REQ", <subscription_id>, <filter>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// ["CLOSE", <subscription_id>]
    Close { subscription_id: String },
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        ClientMessage::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        ClientMessage::Close {
            subscription_id: subscription_id.into(),
        }
    }

    /// Serialize to the JSON text sent in a websocket frame.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = Vec::with_capacity(filters.len() + 2);
                arr.push(Value::from("REQ"));
                arr.push(Value::from(subscription_id.as_str()));
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => serde_json::json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// ["EVENT", <subscription_id>, <event>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    /// ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// ["NOTICE", <message>]
    Notice { message: String },

    /// ["AUTH", <challenge>] (NIP-42)
    Auth { challenge: String },

    /// ["COUNT", <subscription_id>, {"count": <n>}] (NIP-45)
    Count { subscription_id: String, count: u64 },
}

impl RelayMessage {
    /// Decode one text frame.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> = serde_json::from_str(json)?;
        let (kind, rest) = arr
            .split_first()
            .ok_or_else(|| MessageError::InvalidFormat("empty array".to_string()))?;
        let kind = kind
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match kind {
            "EVENT" => {
                let subscription_id = string_at(rest, 0, "subscription_id")?;
                let raw = rest.get(1).ok_or(MessageError::MissingField("event"))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = string_at(rest, 0, "event_id")?;
                let accepted = rest
                    .get(1)
                    .ok_or(MessageError::MissingField("accepted"))?
                    .as_bool()
                    .ok_or_else(|| MessageError::InvalidFormat("accepted not a boolean".to_string()))?;
                // Some relays omit the message on success.
                let message = rest.get(2).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(rest, 0, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: string_at(rest, 0, "subscription_id")?,
                message: rest.get(1).and_then(Value::as_str).unwrap_or("").to_string(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(rest, 0, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: string_at(rest, 0, "challenge")?,
            }),
            "COUNT" => {
                let subscription_id = string_at(rest, 0, "subscription_id")?;
                let count = rest
                    .get(1)
                    .and_then(|v| v.get("count"))
                    .and_then(Value::as_u64)
                    .ok_or(MessageError::MissingField("count"))?;
                Ok(RelayMessage::Count {
                    subscription_id,
                    count,
                })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Event { .. } => "EVENT",
            RelayMessage::Ok { .. } => "OK",
            RelayMessage::Eose { .. } => "EOSE",
            RelayMessage::Closed { .. } => "CLOSED",
            RelayMessage::Notice { .. } => "NOTICE",
            RelayMessage::Auth { .. } => "AUTH",
            RelayMessage::Count { .. } => "COUNT",
        }
    }
}

fn string_at(values: &[Value], index: usize, field: &'static str) -> Result<String, MessageError> {
    values
        .get(index)
        .ok_or(MessageError::MissingField(field))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{field} not a string")))
}

/// Filter for subscription requests.
///
/// The client never interprets filters; they are serialized into REQ frames
/// as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries keyed by `#<letter>`
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag query. `key` is the tag letter without `#`.
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }
}
