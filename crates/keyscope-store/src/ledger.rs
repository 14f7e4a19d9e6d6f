//! Subscription ledger.
//!
//! Per connection, the set of subscribed channels and whether each one
//! persists its messages.  The whole map is rewritten on every mutation and
//! stamped with the write time; a record older than 24 hours is discarded
//! wholesale on the next read.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keyscope_shared::constants::LEDGER_MAX_AGE_MS;
use keyscope_shared::ConnectionId;

use crate::dual::DualStore;
use crate::error::Result;
use crate::keys;

/// Channel name → persist messages.
pub type ChannelMap = BTreeMap<String, bool>;

/// Stored form of one connection's ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRecord {
    pub channels: ChannelMap,
    /// Epoch milliseconds of the last write.
    pub timestamp: i64,
}

impl LedgerRecord {
    pub fn is_stale(&self, now_ms: i64) -> bool {
        now_ms - self.timestamp > LEDGER_MAX_AGE_MS
    }
}

#[derive(Clone)]
pub struct SubscriptionLedger {
    store: DualStore,
}

impl SubscriptionLedger {
    pub fn new(store: DualStore) -> Self {
        Self { store }
    }

    /// Load the channel map of a connection.  Stale or unreadable records are
    /// removed and reported as empty.
    pub fn load(&self, connection_id: &ConnectionId) -> ChannelMap {
        let key = keys::subscriptions(connection_id);
        let record: LedgerRecord = match self.store.get_json(&key) {
            Ok(Some(record)) => record,
            Ok(None) => return ChannelMap::new(),
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Unreadable ledger record, discarding");
                self.remove(connection_id);
                return ChannelMap::new();
            }
        };

        if record.is_stale(Utc::now().timestamp_millis()) {
            info!(connection = %connection_id, "Ledger record older than 24h, discarding");
            self.remove(connection_id);
            return ChannelMap::new();
        }

        record.channels
    }

    /// Overwrite the full channel map of a connection.
    pub fn save(&self, connection_id: &ConnectionId, channels: &ChannelMap) -> Result<()> {
        if channels.is_empty() {
            self.remove(connection_id);
            return Ok(());
        }

        let record = LedgerRecord {
            channels: channels.clone(),
            timestamp: Utc::now().timestamp_millis(),
        };
        self.store
            .put_json(&keys::subscriptions(connection_id), &record)?;
        debug!(connection = %connection_id, channels = channels.len(), "Saved ledger");
        Ok(())
    }

    pub fn remove(&self, connection_id: &ConnectionId) {
        self.store.delete(&keys::subscriptions(connection_id));
    }

    /// Flip the persist flag of a subscribed channel.  Returns the new flag,
    /// or `None` when the channel is not subscribed.
    pub fn toggle(&self, connection_id: &ConnectionId, channel: &str) -> Result<Option<bool>> {
        let mut channels = self.load(connection_id);
        let Some(persist) = channels.get_mut(channel) else {
            return Ok(None);
        };
        *persist = !*persist;
        let updated = *persist;
        self.save(connection_id, &channels)?;
        Ok(Some(updated))
    }

    /// Channels of a connection with persistence enabled.
    pub fn persisted_channels(&self, connection_id: &ConnectionId) -> Vec<String> {
        self.load(connection_id)
            .into_iter()
            .filter_map(|(channel, persist)| persist.then_some(channel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, bool)]) -> ChannelMap {
        entries.iter().map(|(c, p)| (c.to_string(), *p)).collect()
    }

    #[tokio::test]
    async fn save_overwrites_the_whole_map() {
        let ledger = SubscriptionLedger::new(DualStore::in_memory().unwrap());
        let id = ConnectionId::from("c1");

        ledger.save(&id, &map(&[("a", true), ("b", false)])).unwrap();
        ledger.save(&id, &map(&[("c", true)])).unwrap();

        assert_eq!(ledger.load(&id), map(&[("c", true)]));
    }

    #[tokio::test]
    async fn toggle_flips_only_subscribed_channels() {
        let ledger = SubscriptionLedger::new(DualStore::in_memory().unwrap());
        let id = ConnectionId::from("c1");
        ledger.save(&id, &map(&[("a", false)])).unwrap();

        assert_eq!(ledger.toggle(&id, "a").unwrap(), Some(true));
        assert_eq!(ledger.toggle(&id, "missing").unwrap(), None);
        assert_eq!(ledger.persisted_channels(&id), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn stale_record_loads_empty_and_is_deleted() {
        let store = DualStore::in_memory().unwrap();
        let ledger = SubscriptionLedger::new(store.clone());
        let id = ConnectionId::from("c1");
        let key = keys::subscriptions(&id);

        let stale = LedgerRecord {
            channels: map(&[("news", true)]),
            timestamp: Utc::now().timestamp_millis() - LEDGER_MAX_AGE_MS - 60_000,
        };
        store.put_json(&key, &stale).unwrap();

        assert!(ledger.load(&id).is_empty());
        assert_eq!(store.get(&key), None);

        store.flush().await;
        assert_eq!(store.backup_get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn saving_empty_map_removes_record() {
        let store = DualStore::in_memory().unwrap();
        let ledger = SubscriptionLedger::new(store.clone());
        let id = ConnectionId::from("c1");

        ledger.save(&id, &map(&[("a", true)])).unwrap();
        ledger.save(&id, &ChannelMap::new()).unwrap();

        assert_eq!(store.get(&keys::subscriptions(&id)), None);
    }
}
