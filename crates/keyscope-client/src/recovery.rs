//! Connection recovery.
//!
//! After a restart the backend may have forgotten sessions the client still
//! has cached.  [`RecoveryCoordinator::run`] checks every cached connection,
//! recreates missing ones (asking the backend to keep the same id) and,
//! when the backend hands out a different id, migrates every record keyed
//! by the old id: ledger, persisted history, registry entry and active
//! selection.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use keyscope_shared::{Connection, ConnectionId, ConnectionParams};
use keyscope_store::{ConnectionRegistry, DualStore, MessageHistory, SubscriptionLedger};

use crate::error::BackendError;

/// The backend that owns connection sessions.
#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    async fn connection_exists(&self, id: &ConnectionId) -> Result<bool, BackendError>;

    /// Create a session.  With `id`, the backend should reuse it; it must
    /// fail with [`BackendError::IdConflict`] if a different session holds it.
    async fn create_connection(
        &self,
        params: &ConnectionParams,
        id: Option<&ConnectionId>,
    ) -> Result<Connection, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub old: ConnectionId,
    pub new: ConnectionId,
}

/// Outcome of one recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Cache entries restored from the backup store.
    pub hydrated: usize,
    /// Still known to the backend.
    pub kept: Vec<ConnectionId>,
    /// Recreated under the same id.
    pub recreated: Vec<ConnectionId>,
    /// Managed-instance connections, left alone.
    pub skipped: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, String)>,
    pub migrations: Vec<Migration>,
}

enum Outcome {
    Kept,
    Recreated,
    Skipped,
    Migrated(ConnectionId),
}

pub struct RecoveryCoordinator {
    store: DualStore,
    registry: ConnectionRegistry,
    ledger: SubscriptionLedger,
    history: MessageHistory,
    backend: Arc<dyn ConnectionBackend>,
}

impl RecoveryCoordinator {
    pub fn new(store: DualStore, backend: Arc<dyn ConnectionBackend>) -> Self {
        Self {
            registry: ConnectionRegistry::new(store.clone()),
            ledger: SubscriptionLedger::new(store.clone()),
            history: MessageHistory::new(store.clone()),
            store,
            backend,
        }
    }

    pub async fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        match self.store.hydrate().await {
            Ok(restored) => report.hydrated = restored,
            Err(e) => warn!(error = %e, "Cache hydration failed"),
        }

        let connections = match self.registry.list() {
            Ok(connections) => connections,
            Err(e) => {
                warn!(error = %e, "Unreadable connection list, skipping recovery");
                return report;
            }
        };
        info!(count = connections.len(), "Recovering cached connections");

        let mut taken: HashSet<ConnectionId> = connections.iter().map(|c| c.id.clone()).collect();

        for connection in &connections {
            let id = connection.id.clone();
            match self.recover(connection, &taken).await {
                Ok(Outcome::Kept) => report.kept.push(id),
                Ok(Outcome::Recreated) => report.recreated.push(id),
                Ok(Outcome::Skipped) => report.skipped.push(id),
                Ok(Outcome::Migrated(new)) => {
                    taken.insert(new.clone());
                    report.migrations.push(Migration { old: id, new });
                }
                Err(e) => {
                    warn!(connection = %id, error = %e, "Connection recovery failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        let mut migrations = Vec::with_capacity(report.migrations.len());
        for migration in report.migrations.drain(..) {
            match self.migrate(&migration.old, &migration.new) {
                Ok(()) => migrations.push(migration),
                Err(e) => {
                    warn!(old = %migration.old, new = %migration.new, error = %e, "Migration failed");
                    report.failed.push((migration.old, e.to_string()));
                }
            }
        }
        report.migrations = migrations;

        info!(
            kept = report.kept.len(),
            recreated = report.recreated.len(),
            migrated = report.migrations.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Connection recovery finished"
        );
        report
    }

    async fn recover(
        &self,
        connection: &Connection,
        taken: &HashSet<ConnectionId>,
    ) -> Result<Outcome, BackendError> {
        let id = &connection.id;
        if self.backend.connection_exists(id).await? {
            debug!(connection = %id, "Connection still known to backend");
            return Ok(Outcome::Kept);
        }

        if connection.is_managed_instance() {
            info!(connection = %id, "Skipping managed-instance connection");
            return Ok(Outcome::Skipped);
        }

        let created = self
            .backend
            .create_connection(&connection.params, Some(id))
            .await?;

        if &created.id == id {
            info!(connection = %id, "Recreated connection with its original id");
            return Ok(Outcome::Recreated);
        }
        if taken.contains(&created.id) {
            return Err(BackendError::IdConflict(created.id));
        }

        warn!(old = %id, new = %created.id, "Backend assigned a new connection id");
        Ok(Outcome::Migrated(created.id))
    }

    /// Move every record keyed by `old` to `new`.
    fn migrate(&self, old: &ConnectionId, new: &ConnectionId) -> keyscope_store::Result<()> {
        let channels = self.ledger.load(old);

        let mut copied = 0;
        for (channel, persist) in &channels {
            if !persist {
                continue;
            }
            if let Some(raw) = self.history.load_raw(old, channel) {
                self.history.put_raw(new, channel, raw);
                copied += 1;
            }
        }

        if !channels.is_empty() {
            self.ledger.save(new, &channels)?;
        }

        self.ledger.remove(old);
        self.history.clear_connection(old);
        self.registry.rename(old, new)?;

        warn!(
            old = %old,
            new = %new,
            channels = channels.len(),
            histories = copied,
            "Migrated connection data to new id"
        );
        Ok(())
    }
}
