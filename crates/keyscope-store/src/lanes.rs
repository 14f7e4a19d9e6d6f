//! Keyed write lanes for the backup store.
//!
//! Each lane is a tokio task draining its own queue; a key always hashes to
//! the same lane, so writes to one key are applied in the order they were
//! issued while writes to other keys proceed on other lanes.  Failures are
//! logged and dropped: the fast cache already holds the value.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::backup::BackupStore;
use crate::error::{Result, StoreError};

/// Number of lanes spawned by [`WriteLanes::spawn`].
pub const DEFAULT_LANES: usize = 4;

#[derive(Debug)]
pub(crate) enum BackupOp {
    Put { key: String, value: String },
    Delete { key: String },
    RemoveListItem { key: String, item_id: String },
    Flush(oneshot::Sender<()>),
}

impl BackupOp {
    fn key(&self) -> Option<&str> {
        match self {
            Self::Put { key, .. } | Self::Delete { key } | Self::RemoveListItem { key, .. } => {
                Some(key)
            }
            Self::Flush(_) => None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct WriteLanes {
    lanes: Vec<mpsc::UnboundedSender<BackupOp>>,
}

impl WriteLanes {
    /// Spawn `count` lane tasks on the current tokio runtime.
    pub fn spawn(backup: Arc<dyn BackupStore>, count: usize) -> Self {
        let lanes = (0..count.max(1))
            .map(|index| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_lane(index, backup.clone(), rx));
                tx
            })
            .collect();
        Self { lanes }
    }

    pub fn dispatch(&self, op: BackupOp) {
        let lane = op.key().map(|k| self.lane_for(k)).unwrap_or(0);
        if self.lanes[lane].send(op).is_err() {
            warn!(lane, "Backup lane closed, dropping write");
        }
    }

    /// Resolve once every write queued before this call has been applied.
    pub async fn flush(&self) {
        let acks = self.lanes.iter().filter_map(|lane| {
            let (tx, rx) = oneshot::channel();
            lane.send(BackupOp::Flush(tx)).ok().map(|_| rx)
        });
        join_all(acks).await;
    }

    fn lane_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }
}

async fn run_lane(
    index: usize,
    backup: Arc<dyn BackupStore>,
    mut rx: mpsc::UnboundedReceiver<BackupOp>,
) {
    while let Some(op) = rx.recv().await {
        if let BackupOp::Flush(ack) = op {
            let _ = ack.send(());
            continue;
        }

        let key = op.key().unwrap_or_default().to_string();
        let backup = backup.clone();
        let result = tokio::task::spawn_blocking(move || apply(backup.as_ref(), op))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(()) => debug!(lane = index, key = %key, "Backup write applied"),
            Err(e) => warn!(lane = index, key = %key, error = %e, "Backup write failed"),
        }
    }
    debug!(lane = index, "Backup lane stopped");
}

fn apply(backup: &dyn BackupStore, op: BackupOp) -> Result<()> {
    match op {
        BackupOp::Put { key, value } => backup.put(&key, &value),
        BackupOp::Delete { key } => backup.delete(&key),
        BackupOp::RemoveListItem { key, item_id } => backup.remove_list_item(&key, &item_id),
        BackupOp::Flush(_) => Ok(()),
    }
}
