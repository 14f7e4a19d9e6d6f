//! Message log.
//!
//! Inbound messages are deduplicated, prepended to the connection's
//! in-memory list (capped at `max_messages`) and, for channels with
//! persistence enabled, written through to the persisted history.

use tracing::{debug, trace, warn};

use keyscope_shared::{ConnectionId, Message};
use keyscope_store::MessageHistory;

use crate::dedup::RecentDeliveries;
use crate::state::ConnectionSlot;

pub struct MessageLog {
    history: MessageHistory,
    max_messages: usize,
    recent: RecentDeliveries,
}

impl MessageLog {
    pub fn new(history: MessageHistory, max_messages: usize) -> Self {
        Self {
            history,
            max_messages,
            recent: RecentDeliveries::new(),
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Record an inbound message.  Returns `false` when it was dropped as a
    /// duplicate.
    pub fn append(
        &mut self,
        connection_id: &ConnectionId,
        slot: &mut ConnectionSlot,
        message: Message,
    ) -> bool {
        if !self.recent.admit(message.dedupe_key()) {
            trace!(connection = %connection_id, channel = %message.channel, "Duplicate delivery dropped");
            return false;
        }

        let channel = message.channel.clone();
        slot.messages.push_front(message);
        slot.messages.truncate(self.max_messages);

        if slot.persists(&channel) {
            self.write_channel(connection_id, slot, &channel);
        }
        true
    }

    /// Remove one message.  A persisted copy is removed from its channel's
    /// list only.
    pub fn delete(
        &self,
        connection_id: &ConnectionId,
        slot: &mut ConnectionSlot,
        message_id: &str,
    ) -> bool {
        let Some(pos) = slot.messages.iter().position(|m| m.id == message_id) else {
            return false;
        };
        let Some(message) = slot.messages.remove(pos) else {
            return false;
        };

        if slot.persists(&message.channel) {
            self.history.remove(connection_id, &message.channel, message_id);
        }
        true
    }

    /// Drop every message of a connection, in memory and persisted.
    pub fn clear(&self, connection_id: &ConnectionId, slot: &mut ConnectionSlot) {
        slot.messages.clear();
        let removed = self.history.clear_connection(connection_id);
        debug!(connection = %connection_id, lists = removed, "Cleared messages");
    }

    /// Merge the persisted history of every persistence-enabled channel into
    /// memory.  Called when a connection becomes active.
    pub fn restore(&self, connection_id: &ConnectionId, slot: &mut ConnectionSlot) -> usize {
        let mut restored = 0;
        for (channel, persist) in &slot.subscriptions {
            if !persist {
                continue;
            }
            for message in self.history.load(connection_id, channel) {
                if slot.messages.iter().any(|m| m.id == message.id) {
                    continue;
                }
                slot.messages.push_back(message);
                restored += 1;
            }
        }

        if restored > 0 {
            slot.messages
                .make_contiguous()
                .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            slot.messages.truncate(self.max_messages);
            debug!(connection = %connection_id, restored, "Restored persisted messages");
        }
        restored
    }

    /// Persistence was switched on: write what memory holds for the channel.
    pub fn persist_channel(&self, connection_id: &ConnectionId, slot: &ConnectionSlot, channel: &str) {
        if slot.messages.iter().any(|m| m.channel == channel) {
            self.write_channel(connection_id, slot, channel);
        }
    }

    /// Persistence was switched off or the channel was unsubscribed.
    pub fn discard_channel(&self, connection_id: &ConnectionId, channel: &str) {
        self.history.clear(connection_id, channel);
    }

    fn write_channel(&self, connection_id: &ConnectionId, slot: &ConnectionSlot, channel: &str) {
        if let Err(e) = self
            .history
            .save(connection_id, channel, &slot.channel_messages(channel))
        {
            warn!(connection = %connection_id, channel, error = %e, "Failed to persist channel history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keyscope_store::DualStore;

    fn setup(max_messages: usize) -> (DualStore, MessageLog, ConnectionSlot) {
        let store = DualStore::in_memory().unwrap();
        let log = MessageLog::new(MessageHistory::new(store.clone()), max_messages);
        (store, log, ConnectionSlot::default())
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn duplicates_are_appended_once() {
        let (_store, mut log, mut slot) = setup(100);
        let c1 = ConnectionId::from("c1");
        let ts = now();

        assert!(log.append(&c1, &mut slot, Message::new("news", "hello", ts)));
        assert!(!log.append(&c1, &mut slot, Message::new("news", "hello", ts)));
        assert!(log.append(&c1, &mut slot, Message::new("news", "hello", ts + 1)));

        assert_eq!(slot.messages.len(), 2);
    }

    #[tokio::test]
    async fn in_memory_list_is_capped_newest_first() {
        let (_store, mut log, mut slot) = setup(3);
        let c1 = ConnectionId::from("c1");
        let ts = now();

        for i in 0..5 {
            log.append(&c1, &mut slot, Message::new("news", format!("m{i}"), ts + i));
        }

        let bodies: Vec<_> = slot.messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn only_persistent_channels_are_written() {
        let (_store, mut log, mut slot) = setup(100);
        let history = log.history.clone();
        let c1 = ConnectionId::from("c1");
        slot.subscriptions.insert("news".into(), true);
        slot.subscriptions.insert("chatter".into(), false);

        let ts = now();
        log.append(&c1, &mut slot, Message::new("news", "kept", ts));
        log.append(&c1, &mut slot, Message::new("chatter", "transient", ts));

        assert_eq!(history.load(&c1, "news").len(), 1);
        assert!(history.load(&c1, "chatter").is_empty());
    }

    #[tokio::test]
    async fn persisted_list_is_capped_at_fifty() {
        let (_store, mut log, mut slot) = setup(200);
        let history = log.history.clone();
        let c1 = ConnectionId::from("c1");
        slot.subscriptions.insert("news".into(), true);

        let ts = now();
        for i in 0..60 {
            log.append(&c1, &mut slot, Message::new("news", format!("m{i}"), ts + i));
        }

        let persisted = history.load(&c1, "news");
        assert_eq!(persisted.len(), 50);
        assert_eq!(persisted[0].message, "m59");
        assert_eq!(slot.messages.len(), 60);
    }

    #[tokio::test]
    async fn delete_touches_only_the_owning_channel() {
        let (_store, mut log, mut slot) = setup(100);
        let history = log.history.clone();
        let c1 = ConnectionId::from("c1");
        slot.subscriptions.insert("a".into(), true);
        slot.subscriptions.insert("b".into(), true);

        let ts = now();
        log.append(&c1, &mut slot, Message::new("a", "a1", ts));
        log.append(&c1, &mut slot, Message::new("a", "a2", ts + 1));
        log.append(&c1, &mut slot, Message::new("b", "b1", ts));
        let raw_b = history.load_raw(&c1, "b");

        let target = slot.messages.iter().find(|m| m.message == "a1").unwrap().id.clone();
        assert!(log.delete(&c1, &mut slot, &target));
        assert!(!log.delete(&c1, &mut slot, &target));

        let remaining: Vec<_> = history.load(&c1, "a").into_iter().map(|m| m.message).collect();
        assert_eq!(remaining, vec!["a2"]);
        assert_eq!(history.load_raw(&c1, "b"), raw_b);
    }

    #[tokio::test]
    async fn restore_merges_persisted_history() {
        let (store, mut log, mut slot) = setup(100);
        let c1 = ConnectionId::from("c1");
        slot.subscriptions.insert("news".into(), true);

        let ts = now();
        log.append(&c1, &mut slot, Message::new("news", "old", ts));
        log.append(&c1, &mut slot, Message::new("news", "new", ts + 1));

        // A fresh process: empty memory, same store.
        let log = MessageLog::new(MessageHistory::new(store), 100);
        let mut fresh = ConnectionSlot::default();
        fresh.subscriptions.insert("news".into(), true);

        assert_eq!(log.restore(&c1, &mut fresh), 2);
        assert_eq!(fresh.messages[0].message, "new");
        assert_eq!(log.restore(&c1, &mut fresh), 0);
    }

    #[tokio::test]
    async fn discard_and_clear_remove_persisted_lists() {
        let (_store, mut log, mut slot) = setup(100);
        let history = log.history.clone();
        let c1 = ConnectionId::from("c1");
        slot.subscriptions.insert("a".into(), true);
        slot.subscriptions.insert("b".into(), true);

        let ts = now();
        log.append(&c1, &mut slot, Message::new("a", "a1", ts));
        log.append(&c1, &mut slot, Message::new("b", "b1", ts));

        log.discard_channel(&c1, "a");
        assert!(history.load(&c1, "a").is_empty());
        assert_eq!(history.load(&c1, "b").len(), 1);

        log.clear(&c1, &mut slot);
        assert!(slot.messages.is_empty());
        assert!(history.load(&c1, "b").is_empty());
    }
}
