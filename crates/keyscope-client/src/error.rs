use thiserror::Error;

use keyscope_shared::ConnectionId;
use keyscope_store::StoreError;

/// Failures talking to the backend that owns connection sessions.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend answered {status}: {body}")]
    Status { status: u16, body: String },

    /// The requested id is already held by a different session.
    #[error("Connection id already in use: {0}")]
    IdConflict(ConnectionId),

    #[error("Invalid backend response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("No active connection")]
    NoActiveConnection,

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}
