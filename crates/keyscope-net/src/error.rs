use thiserror::Error;

/// Errors surfaced to transport error handlers.
///
/// None of these escape the client: they are delivered to handlers
/// registered with [`TransportClient::on_error`](crate::TransportClient::on_error)
/// and answered by the reconnect loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Relay handshake timed out")]
    Timeout,

    #[error("Socket error: {0}")]
    Socket(String),

    /// An `error` frame sent by the relay.
    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Transport driver stopped")]
    Closed,
}
