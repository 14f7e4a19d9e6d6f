//! Per-connection runtime state.
//!
//! The [`ConnectionArena`] holds one [`ConnectionSlot`] per connection the
//! session has touched.  Slots are mutated in place while the session lock
//! is held; nothing here performs I/O.

use std::collections::{HashMap, VecDeque};

use keyscope_shared::{ConnectionId, Message};
use keyscope_store::ChannelMap;

/// Runtime state of one connection.
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    /// Mirror of the connection's ledger: channel → persist messages.
    pub subscriptions: ChannelMap,

    /// Received messages, newest first.
    pub messages: VecDeque<Message>,
}

impl ConnectionSlot {
    pub fn persists(&self, channel: &str) -> bool {
        self.subscriptions.get(channel).copied().unwrap_or(false)
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// In-memory messages of one channel, newest first.
    pub fn channel_messages(&self, channel: &str) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionArena {
    slots: HashMap<ConnectionId, ConnectionSlot>,
}

impl ConnectionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionSlot> {
        self.slots.get(id)
    }

    /// Slot of `id`, created empty on first use.
    pub fn slot_mut(&mut self, id: &ConnectionId) -> &mut ConnectionSlot {
        self.slots.entry(id.clone()).or_default()
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionSlot> {
        self.slots.remove(id)
    }

}
