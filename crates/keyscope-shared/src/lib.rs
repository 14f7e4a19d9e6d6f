//! # keyscope-shared
//!
//! Types shared by every keyscope crate: connection and message records,
//! the JSON frames exchanged with the pub/sub relay, and the fixed policy
//! constants that bound message history and deduplication.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{InboundFrame, OutboundFrame, RelayMessage};
pub use types::{Connection, ConnectionId, ConnectionParams, ConnectionState, Message};
