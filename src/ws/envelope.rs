//! Wire message envelope and heartbeat frames.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::WsError;
use crate::Result;

const PING: &str = "ping";
const PONG: &str = "pong";

/// Message envelope exchanged with the server: `{ type, data, timestamp }`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type. `ping` and `pong` are reserved for heartbeats.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Unix timestamp in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn new<S: Into<String>>(kind: S, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    /// Create an envelope whose `data` is the JSON form of `data`.
    pub fn with_data<S: Into<String>, T: Serialize>(kind: S, data: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_value(data)?))
    }

    #[must_use]
    pub fn ping(timestamp: i64) -> Self {
        Self {
            kind: PING.to_owned(),
            data: Value::Null,
            timestamp: Some(timestamp),
        }
    }

    #[must_use]
    pub fn pong(timestamp: Option<i64>) -> Self {
        Self {
            kind: PONG.to_owned(),
            data: Value::Null,
            timestamp,
        }
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.kind == PING || self.kind == PONG
    }

    /// Deserialize `data` into a concrete type.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound frame after heartbeat interception.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Server-initiated PING, answered with a PONG carrying the same timestamp
    Ping { timestamp: Option<i64> },
    /// Reply to one of our PINGs
    Pong { timestamp: Option<i64> },
    /// Anything else, handed to consumers
    Message(Envelope),
}

/// Parse a text frame.
///
/// Returns `Ok(None)` for empty or whitespace-only frames (server keepalives).
/// Bare `ping`/`pong` texts are accepted as heartbeats without a timestamp.
pub fn parse_frame(text: &str) -> Result<Option<Inbound>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.eq_ignore_ascii_case(PING) {
        return Ok(Some(Inbound::Ping { timestamp: None }));
    }
    if trimmed.eq_ignore_ascii_case(PONG) {
        return Ok(Some(Inbound::Pong { timestamp: None }));
    }

    let envelope: Envelope = serde_json::from_str(trimmed).map_err(WsError::MessageParse)?;
    let inbound = match envelope.kind.as_str() {
        PING => Inbound::Ping {
            timestamp: envelope.timestamp,
        },
        PONG => Inbound::Pong {
            timestamp: envelope.timestamp,
        },
        _ => Inbound::Message(envelope),
    };
    Ok(Some(inbound))
}
