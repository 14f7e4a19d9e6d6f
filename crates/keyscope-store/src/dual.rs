//! Dual persistence: fast cache plus durable backup.
//!
//! Every write lands in the [`FastCache`] synchronously and is mirrored to the
//! [`BackupStore`] on a write lane, fire-and-forget.  Reads only ever touch
//! the cache; the backup is read once, by [`DualStore::hydrate`], when the
//! cache starts out empty.
//!
//! This is best-effort mirroring, not a transaction.  A crash between the
//! two writes leaves the backup one write behind.
//!
//! The cache snapshot file is rewritten by a background task, at most once
//! per [`SNAPSHOT_DEBOUNCE`], so callers never wait on disk I/O.

use std::path::Path;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backup::{self, BackupStore, SqliteBackup};
use crate::cache::{FastCache, SNAPSHOT_DEBOUNCE};
use crate::error::{Result, StoreError};
use crate::keys;
use crate::lanes::{BackupOp, WriteLanes, DEFAULT_LANES};

/// Cheap-to-clone handle over the cache and the backup lanes.
#[derive(Clone)]
pub struct DualStore {
    cache: Arc<FastCache>,
    backup: Arc<dyn BackupStore>,
    lanes: WriteLanes,
    snapshots: Option<mpsc::Sender<()>>,
}

impl DualStore {
    /// Must be called from within a tokio runtime: the write lanes and the
    /// snapshot writer are spawned immediately.
    pub fn new(cache: FastCache, backup: Arc<dyn BackupStore>) -> Self {
        let lanes = WriteLanes::spawn(backup.clone(), DEFAULT_LANES);
        let cache = Arc::new(cache);

        let snapshots = cache.has_snapshot().then(|| {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(write_snapshots(Arc::downgrade(&cache), rx));
            tx
        });

        Self {
            cache,
            backup,
            lanes,
            snapshots,
        }
    }

    /// Open the on-disk layout used by the application: `cache.json` and
    /// `keyscope.db` inside `data_dir`.
    pub fn open_dir(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let cache = FastCache::open(&data_dir.join("cache.json"));
        let backup = SqliteBackup::open_at(&data_dir.join("keyscope.db"))?;
        info!(dir = %data_dir.display(), "Opened dual persistence store");
        Ok(Self::new(cache, Arc::new(backup)))
    }

    /// Fully in-memory store, for tests and ephemeral sessions.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(
            FastCache::in_memory(),
            Arc::new(SqliteBackup::open_in_memory()?),
        ))
    }

    // ------------------------------------------------------------------
    // Raw access
    // ------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key)
    }

    pub fn put(&self, key: &str, value: String) {
        self.cache.put(key, value.clone());
        self.schedule_snapshot();
        self.lanes.dispatch(BackupOp::Put {
            key: key.to_string(),
            value,
        });
    }

    pub fn delete(&self, key: &str) {
        if self.cache.delete(key) {
            self.schedule_snapshot();
        }
        self.lanes.dispatch(BackupOp::Delete {
            key: key.to_string(),
        });
    }

    /// Remove one element (matched by its `id` field) from the JSON list
    /// stored under `key`, in both stores, without rewriting any other key.
    pub fn remove_list_item(&self, key: &str, item_id: &str) {
        let changed = self.cache.update(key, |raw| match backup::without_item(raw, item_id) {
            Ok(updated) => updated,
            Err(e) => {
                warn!(key, error = %e, "Cached list is not valid JSON");
                None
            }
        });
        if changed {
            self.schedule_snapshot();
        }
        self.lanes.dispatch(BackupOp::RemoveListItem {
            key: key.to_string(),
            item_id: item_id.to_string(),
        });
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.cache.keys_with_prefix(prefix)
    }

    // ------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.put(key, json);
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Startup reconciliation: when the cache is empty, repopulate it from
    /// the backup store.  Returns the number of entries restored.
    pub async fn hydrate(&self) -> Result<usize> {
        if !self.cache.is_empty() {
            return Ok(0);
        }

        let backup = self.backup.clone();
        let prefix = keys::namespace_prefix();
        let entries = tokio::task::spawn_blocking(move || backup.entries_with_prefix(&prefix))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        let restored = entries.len();
        if restored > 0 {
            info!(entries = restored, "Fast cache empty, restored from backup store");
            self.cache.extend(entries);
            self.schedule_snapshot();
        }
        Ok(restored)
    }

    /// Wait until every backup write issued so far has been applied and the
    /// cache snapshot is current.
    pub async fn flush(&self) {
        self.lanes.flush().await;

        let cache = self.cache.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || cache.persist()).await {
            warn!(error = %e, "Cache snapshot task failed");
        }
    }

    fn schedule_snapshot(&self) {
        if let Some(tx) = &self.snapshots {
            // A full channel already has a write pending.
            let _ = tx.try_send(());
        }
    }

    /// Read straight from the backup store, bypassing the cache.
    pub async fn backup_get(&self, key: &str) -> Result<Option<String>> {
        let backup = self.backup.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || backup.get(&key))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Coalesce snapshot requests: wait out the debounce, then write once.
/// Stops when every store handle is gone.
async fn write_snapshots(cache: Weak<FastCache>, mut requests: mpsc::Receiver<()>) {
    while requests.recv().await.is_some() {
        tokio::time::sleep(SNAPSHOT_DEBOUNCE).await;
        let Some(cache) = cache.upgrade() else {
            break;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || cache.persist()).await {
            warn!(error = %e, "Cache snapshot task failed");
        }
    }
    debug!("Snapshot writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backup that refuses every write.
    struct BrokenBackup {
        attempts: AtomicUsize,
    }

    impl BackupStore for BrokenBackup {
        fn put(&self, _key: &str, _value: &str) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn delete(&self, _key: &str) -> Result<()> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        fn entries_with_prefix(&self, _prefix: &str) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn writes_are_mirrored_to_backup() {
        let store = DualStore::in_memory().unwrap();
        store.put("keyscope:a", "1".into());
        store.put("keyscope:a", "2".into());
        store.put("keyscope:b", "3".into());
        store.delete("keyscope:b");
        store.flush().await;

        assert_eq!(store.get("keyscope:a").as_deref(), Some("2"));
        assert_eq!(store.backup_get("keyscope:a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.backup_get("keyscope:b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn backup_failures_never_reach_the_caller() {
        let backup = Arc::new(BrokenBackup {
            attempts: AtomicUsize::new(0),
        });
        let store = DualStore::new(FastCache::in_memory(), backup.clone());

        store.put("keyscope:a", "1".into());
        store.flush().await;

        assert_eq!(store.get("keyscope:a").as_deref(), Some("1"));
        assert_eq!(backup.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hydrate_restores_wiped_cache() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = DualStore::open_dir(dir.path()).unwrap();
            store.put("keyscope:connections", "[]".into());
            store.put("keyscope:ui:active_tab", "\"pubsub\"".into());
            store.flush().await;
        }

        std::fs::remove_file(dir.path().join("cache.json")).unwrap();

        let store = DualStore::open_dir(dir.path()).unwrap();
        assert_eq!(store.get("keyscope:connections"), None);
        assert_eq!(store.hydrate().await.unwrap(), 2);
        assert_eq!(store.get("keyscope:connections").as_deref(), Some("[]"));

        // A populated cache is never overwritten from the backup.
        assert_eq!(store.hydrate().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn snapshot_is_written_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let store = DualStore::open_dir(dir.path()).unwrap();

        for i in 0..50 {
            store.put("keyscope:counter", i.to_string());
        }
        assert!(!path.exists());

        tokio::time::sleep(SNAPSHOT_DEBOUNCE * 4).await;
        let snapshot = std::fs::read_to_string(&path).unwrap();
        assert_eq!(snapshot, r#"{"keyscope:counter":"49"}"#);
    }

    #[tokio::test]
    async fn remove_list_item_aligns_both_stores() {
        let store = DualStore::in_memory().unwrap();
        store.put("keyscope:l", r#"[{"id":"a"},{"id":"b"}]"#.into());
        store.put("keyscope:other", r#"[{"id":"a"}]"#.into());
        store.remove_list_item("keyscope:l", "a");
        store.flush().await;

        let expected = r#"[{"id":"b"}]"#;
        assert_eq!(store.get("keyscope:l").as_deref(), Some(expected));
        assert_eq!(store.backup_get("keyscope:l").await.unwrap().as_deref(), Some(expected));
        assert_eq!(store.get("keyscope:other").as_deref(), Some(r#"[{"id":"a"}]"#));
    }

    #[tokio::test]
    async fn same_key_writes_keep_issue_order() {
        let store = DualStore::in_memory().unwrap();
        for i in 0..200 {
            store.put("keyscope:counter", i.to_string());
        }
        store.flush().await;
        assert_eq!(
            store.backup_get("keyscope:counter").await.unwrap().as_deref(),
            Some("199")
        );
    }
}
