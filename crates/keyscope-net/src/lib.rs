//! Relay transport for the keyscope pub/sub monitor.
//!
//! A [`TransportClient`] keeps one WebSocket to the relay alive: keepalive
//! pings, a fixed-delay reconnect loop and a replay of every tracked
//! subscription after each successful open.  Inbound frames are fanned out
//! to registered handlers.

pub mod client;
mod driver;
pub mod error;
pub mod handlers;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::{TransportClient, TransportConfig};
pub use error::TransportError;
pub use handlers::{HandlerHandle, HandlerSet};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockRelay;
