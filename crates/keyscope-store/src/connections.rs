//! Cached connection definitions and the active selection.

use tracing::{debug, info};

use keyscope_shared::{Connection, ConnectionId};

use crate::dual::DualStore;
use crate::error::Result;
use crate::keys;

#[derive(Clone)]
pub struct ConnectionRegistry {
    store: DualStore,
}

impl ConnectionRegistry {
    pub fn new(store: DualStore) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<Connection>> {
        Ok(self
            .store
            .get_json::<Vec<Connection>>(&keys::connections())?
            .unwrap_or_default())
    }

    pub fn get(&self, id: &ConnectionId) -> Result<Option<Connection>> {
        Ok(self.list()?.into_iter().find(|c| &c.id == id))
    }

    pub fn save_all(&self, connections: &[Connection]) -> Result<()> {
        self.store.put_json(&keys::connections(), &connections)
    }

    /// Insert a connection, or replace the one with the same id.
    pub fn upsert(&self, connection: Connection) -> Result<()> {
        let mut connections = self.list()?;
        match connections.iter_mut().find(|c| c.id == connection.id) {
            Some(existing) => *existing = connection,
            None => connections.push(connection),
        }
        self.save_all(&connections)
    }

    /// Remove a connection.  Clears the active selection if it pointed at it.
    pub fn remove(&self, id: &ConnectionId) -> Result<bool> {
        let mut connections = self.list()?;
        let before = connections.len();
        connections.retain(|c| &c.id != id);
        if connections.len() == before {
            return Ok(false);
        }
        self.save_all(&connections)?;

        if self.active()?.as_ref() == Some(id) {
            self.set_active(None)?;
        }
        debug!(connection = %id, "Removed connection");
        Ok(true)
    }

    /// Rewrite the id of a cached connection, following it with the active
    /// selection.
    pub fn rename(&self, old: &ConnectionId, new: &ConnectionId) -> Result<bool> {
        let mut connections = self.list()?;
        let Some(connection) = connections.iter_mut().find(|c| &c.id == old) else {
            return Ok(false);
        };
        connection.id = new.clone();
        self.save_all(&connections)?;

        if self.active()?.as_ref() == Some(old) {
            self.set_active(Some(new))?;
        }
        info!(old = %old, new = %new, "Connection id rewritten");
        Ok(true)
    }

    pub fn active(&self) -> Result<Option<ConnectionId>> {
        self.store.get_json(&keys::active_connection())
    }

    pub fn set_active(&self, id: Option<&ConnectionId>) -> Result<()> {
        match id {
            Some(id) => self.store.put_json(&keys::active_connection(), id),
            None => {
                self.store.delete(&keys::active_connection());
                Ok(())
            }
        }
    }
}
