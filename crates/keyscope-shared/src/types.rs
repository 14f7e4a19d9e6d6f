use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a backend connection.
///
/// Every persisted record (ledger, message history, active selection) is
/// keyed by this id, so it only changes under migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Fields describing a backend target, without its identifier.
///
/// This is what the backend needs to (re)create a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub tls: bool,
    /// Set when the connection targets a locally-managed instance. Those are
    /// recreated by the instance start flow, never by generic recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_instance: Option<String>,
}

/// A cached connection definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    #[serde(flatten)]
    pub params: ConnectionParams,
}

impl Connection {
    pub fn new(id: ConnectionId, params: ConnectionParams) -> Self {
        Self { id, params }
    }

    pub fn is_managed_instance(&self) -> bool {
        self.params.managed_instance.is_some()
    }
}

/// A pub/sub message as kept in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Locally generated, unique within the process.
    pub id: String,
    pub channel: String,
    pub message: String,
    /// Publish time in epoch milliseconds, as reported by the relay.
    pub timestamp: i64,
}

impl Message {
    pub fn new(channel: impl Into<String>, message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.into(),
            message: message.into(),
            timestamp,
        }
    }

    /// Key used to recognise the same delivery arriving twice.
    pub fn dedupe_key(&self) -> String {
        format!("{}{}{}", self.channel, self.timestamp, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}
