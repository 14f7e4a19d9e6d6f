//! Fast local cache.
//!
//! An in-memory map that serves every read of the running session.  When a
//! snapshot path is configured, mutations mark the cache dirty and
//! [`FastCache::persist`] writes a JSON snapshot so the cache survives an
//! ordinary restart.  Mutations never touch the disk themselves.  Losing the
//! snapshot is tolerated: the backup store can repopulate the cache at
//! startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace, warn};

/// Delay between the first unsaved mutation and the snapshot write.
pub const SNAPSHOT_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
pub struct FastCache {
    entries: Mutex<BTreeMap<String, String>>,
    snapshot: Option<PathBuf>,
    dirty: AtomicBool,
    /// Held across clone and write so snapshots land in mutation order.
    writing: Mutex<()>,
}

impl FastCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a cache backed by a snapshot file.  A missing or unreadable
    /// snapshot yields an empty cache.
    pub fn open(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt cache snapshot, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache snapshot, starting empty");
                BTreeMap::new()
            }
        };

        debug!(path = %path.display(), entries = entries.len(), "Opened fast cache");

        Self {
            entries: Mutex::new(entries),
            snapshot: Some(path.to_path_buf()),
            dirty: AtomicBool::new(false),
            writing: Mutex::new(()),
        }
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: String) {
        let mut entries = self.lock();
        entries.insert(key.to_string(), value);
        self.mark_dirty();
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.lock();
        let removed = entries.remove(key).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Apply `f` to the value under `key` in place; `f` returning `None`
    /// leaves the entry unchanged.
    pub fn update(&self, key: &str, f: impl FnOnce(&str) -> Option<String>) -> bool {
        let mut entries = self.lock();
        let Some(updated) = entries.get(key).and_then(|current| f(current)) else {
            return false;
        };
        entries.insert(key.to_string(), updated);
        self.mark_dirty();
        true
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn extend(&self, items: impl IntoIterator<Item = (String, String)>) {
        let mut entries = self.lock();
        entries.extend(items);
        self.mark_dirty();
    }

    /// Write the snapshot if anything changed since the last write.  Blocks
    /// on file I/O; async callers run it through `spawn_blocking`.
    pub fn persist(&self) {
        let Some(ref path) = self.snapshot else {
            return;
        };
        let _writing = self.writing.lock().unwrap_or_else(|p| p.into_inner());
        let json = {
            let entries = self.lock();
            if !self.dirty.swap(false, Ordering::SeqCst) {
                return;
            }
            serde_json::to_string(&*entries)
        };

        let result = json.map_err(std::io::Error::other).and_then(|json| {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, path)
        });
        match result {
            Ok(()) => trace!(path = %path.display(), "Cache snapshot written"),
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                warn!(path = %path.display(), error = %e, "Failed to write cache snapshot");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_dirty(&self) {
        if self.snapshot.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for FastCache {
    fn drop(&mut self) {
        self.persist();
    }
}
