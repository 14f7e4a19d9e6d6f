//! Persisted per-channel message history.
//!
//! Only channels with persistence enabled are written here.  Each list is
//! newest-first, capped at [`MAX_PERSISTED_MESSAGES`] and limited to 24 hours
//! of age, independently of the in-memory cap.

use chrono::Utc;
use tracing::{debug, warn};

use keyscope_shared::constants::{MAX_PERSISTED_MESSAGES, PERSISTED_MESSAGE_MAX_AGE_MS};
use keyscope_shared::{ConnectionId, Message};

use crate::dual::DualStore;
use crate::error::Result;
use crate::keys;

#[derive(Clone)]
pub struct MessageHistory {
    store: DualStore,
}

impl MessageHistory {
    pub fn new(store: DualStore) -> Self {
        Self { store }
    }

    /// Persisted messages of one channel, newest first, without expired ones.
    pub fn load(&self, connection_id: &ConnectionId, channel: &str) -> Vec<Message> {
        let key = keys::messages(connection_id, channel);
        match self.store.get_json::<Vec<Message>>(&key) {
            Ok(Some(messages)) => retain_fresh(messages, Utc::now().timestamp_millis()),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable message history, discarding");
                self.store.delete(&key);
                Vec::new()
            }
        }
    }

    /// Write the newest-first list of a channel, applying the age limit and
    /// the persisted cap.  An empty result removes the key.
    pub fn save(&self, connection_id: &ConnectionId, channel: &str, messages: &[Message]) -> Result<()> {
        let key = keys::messages(connection_id, channel);
        let now = Utc::now().timestamp_millis();
        let kept: Vec<&Message> = messages
            .iter()
            .filter(|m| now - m.timestamp <= PERSISTED_MESSAGE_MAX_AGE_MS)
            .take(MAX_PERSISTED_MESSAGES)
            .collect();

        if kept.is_empty() {
            self.store.delete(&key);
            return Ok(());
        }

        debug!(key = %key, count = kept.len(), "Persisting channel history");
        self.store.put_json(&key, &kept)
    }

    /// Targeted removal of one message; other channels are not rewritten.
    pub fn remove(&self, connection_id: &ConnectionId, channel: &str, message_id: &str) {
        self.store
            .remove_list_item(&keys::messages(connection_id, channel), message_id);
    }

    pub fn clear(&self, connection_id: &ConnectionId, channel: &str) {
        self.store.delete(&keys::messages(connection_id, channel));
    }

    /// Remove every persisted channel list of a connection.
    pub fn clear_connection(&self, connection_id: &ConnectionId) -> usize {
        let keys = self.store.keys_with_prefix(&keys::messages_prefix(connection_id));
        for key in &keys {
            self.store.delete(key);
        }
        keys.len()
    }

    /// Stored JSON of a channel list, exactly as written.
    pub fn load_raw(&self, connection_id: &ConnectionId, channel: &str) -> Option<String> {
        self.store.get(&keys::messages(connection_id, channel))
    }

    pub fn put_raw(&self, connection_id: &ConnectionId, channel: &str, raw: String) {
        self.store.put(&keys::messages(connection_id, channel), raw);
    }
}

fn retain_fresh(mut messages: Vec<Message>, now_ms: i64) -> Vec<Message> {
    messages.retain(|m| now_ms - m.timestamp <= PERSISTED_MESSAGE_MAX_AGE_MS);
    messages.truncate(MAX_PERSISTED_MESSAGES);
    messages
}
