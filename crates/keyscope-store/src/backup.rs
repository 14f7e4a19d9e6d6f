//! Durable backup store.
//!
//! The backup mirrors the fast cache so that a wiped cache or a process
//! restart can be recovered from.  Calls are blocking; the write lanes in
//! [`crate::lanes`] run them on the blocking thread pool.

use std::path::Path;
use std::sync::Mutex;

use serde_json::Value;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// A durable key/value store holding JSON documents.
pub trait BackupStore: Send + Sync + 'static {
    fn put(&self, key: &str, value: &str) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn delete(&self, key: &str) -> Result<()>;

    fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Remove the element whose `id` equals `item_id` from the JSON array
    /// stored under `key`.  Other keys are left untouched.
    fn remove_list_item(&self, key: &str, item_id: &str) -> Result<()> {
        let Some(raw) = self.get(key)? else {
            return Ok(());
        };
        match without_item(&raw, item_id)? {
            Some(updated) => self.put(key, &updated),
            None => Ok(()),
        }
    }
}

/// Return `raw` without the array element whose `id` is `item_id`, or `None`
/// if nothing matched.
pub(crate) fn without_item(raw: &str, item_id: &str) -> Result<Option<String>> {
    let mut items: Vec<Value> = serde_json::from_str(raw)?;
    let before = items.len();
    items.retain(|item| item.get("id").and_then(Value::as_str) != Some(item_id));
    if items.len() == before {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&items)?))
}

/// [`BackupStore`] over the SQLite `kv_entries` table.
pub struct SqliteBackup {
    db: Mutex<Database>,
}

impl SqliteBackup {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self
            .db
            .lock()
            .map_err(|e| StoreError::Task(format!("Lock poisoned: {e}")))?;
        f(&guard)
    }
}

impl BackupStore for SqliteBackup {
    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.with_db(|db| db.put_entry(key, value))
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_db(|db| db.get_entry(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_db(|db| db.delete_entry(key).map(|_| ()))
    }

    fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.with_db(|db| db.list_entries_with_prefix(prefix))
    }
}
