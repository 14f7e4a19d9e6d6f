use tokio::sync::broadcast;
use tracing::trace;

use keyscope_shared::{ConnectionId, Message};

/// Capacity of the session event channel; slow listeners lag past this.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for whatever front end drives a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A message passed deduplication and was added to the log.
    NewMessage {
        connection_id: ConnectionId,
        message: Message,
    },
    RelayConnected,
    RelayDisconnected,
    TransportError(String),
}

pub fn emit_event(tx: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    if tx.send(event).is_err() {
        trace!("No session event listeners");
    }
}
