//! JSON frames exchanged with the pub/sub relay.
//!
//! Outbound frames carry subscription intent for one connection; inbound
//! frames carry acknowledgements, published messages, relay errors and
//! keepalive replies. Every frame is a small JSON object tagged by `type`.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::ConnectionId;

/// Frames sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    Subscribe {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        channels: Vec<String>,
    },
    Unsubscribe {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
        channels: Vec<String>,
    },
    UnsubscribeAll {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    Ping {},
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `data` object of an inbound message frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Frames received from the relay.
///
/// Fields are optional on the wire; [`RelayMessage::from_parts`]
/// decides whether a `message` frame is complete enough to forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    Subscribed {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        channels: Option<Vec<String>>,
    },
    Unsubscribed {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        channels: Option<Vec<String>>,
    },
    Message {
        #[serde(default, rename = "connectionId")]
        connection_id: Option<ConnectionId>,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        message: Option<Value>,
        #[serde(default)]
        data: Option<MessageData>,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
    },
    Pong {},
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// A well-formed published message, ready for handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Connection the relay attributed the message to, when it says so.
    pub connection_id: Option<ConnectionId>,
    pub channel: String,
    pub message: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl RelayMessage {
    /// Validate the fields of an inbound `message` frame.
    pub fn from_parts(
        connection_id: Option<ConnectionId>,
        channel: Option<String>,
        message: Option<Value>,
        data: Option<MessageData>,
    ) -> Result<Self, ProtocolError> {
        let channel = channel
            .filter(|c| !c.is_empty())
            .ok_or(ProtocolError::MissingField("channel"))?;
        let message = match message {
            None | Some(Value::Null) => return Err(ProtocolError::MissingField("message")),
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
        };
        let timestamp = data
            .and_then(|d| d.timestamp)
            .ok_or(ProtocolError::MissingField("timestamp"))?;

        Ok(Self {
            connection_id,
            channel,
            message,
            timestamp: parse_timestamp(&timestamp)?,
        })
    }
}

/// Accept epoch milliseconds or an RFC 3339 string.
fn parse_timestamp(value: &Value) -> Result<i64, ProtocolError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| ProtocolError::InvalidTimestamp(n.to_string())),
        Value::String(s) => {
            if let Ok(ms) = s.parse::<i64>() {
                return Ok(ms);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .map_err(|_| ProtocolError::InvalidTimestamp(s.clone()))
        }
        other => Err(ProtocolError::InvalidTimestamp(other.to_string())),
    }
}
