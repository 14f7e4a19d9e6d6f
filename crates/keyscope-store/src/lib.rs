//! # keyscope-store
//!
//! Local persistence for the keyscope pub/sub monitor.
//!
//! A [`DualStore`] pairs a fast synchronous cache with a durable SQLite
//! backup.  On top of it sit the typed stores the realtime layer needs: the
//! [`SubscriptionLedger`], the persisted [`MessageHistory`] and the
//! [`ConnectionRegistry`].

pub mod backup;
pub mod cache;
pub mod connections;
pub mod database;
pub mod dual;
pub mod history;
pub mod keys;
pub mod ledger;
pub mod migrations;

mod entries;
mod error;
mod lanes;

pub use backup::{BackupStore, SqliteBackup};
pub use cache::FastCache;
pub use connections::ConnectionRegistry;
pub use database::Database;
pub use dual::DualStore;
pub use error::{Result, StoreError};
pub use history::MessageHistory;
pub use ledger::{ChannelMap, LedgerRecord, SubscriptionLedger};
