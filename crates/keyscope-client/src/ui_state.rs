//! Persisted UI state: active tab and panel width.
//!
//! Setters are called at interaction rate (a drag produces a width per
//! frame), so each one is debounced: a new value cancels the pending write
//! and restarts the timer.  Only the last value of a burst reaches the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use keyscope_shared::constants::UI_STATE_DEBOUNCE;
use keyscope_store::{keys, DualStore};

const ACTIVE_TAB: &str = "active_tab";
const PANEL_WIDTH: &str = "panel_width";

#[derive(Clone)]
pub struct UiState {
    store: DualStore,
    debounce: Duration,
    pending: Arc<Mutex<HashMap<&'static str, JoinHandle<()>>>>,
}

impl UiState {
    pub fn new(store: DualStore) -> Self {
        Self::with_debounce(store, UI_STATE_DEBOUNCE)
    }

    pub fn with_debounce(store: DualStore, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_tab(&self) -> Option<String> {
        self.read(ACTIVE_TAB)
    }

    pub fn set_active_tab(&self, tab: impl Into<String>) {
        self.schedule(ACTIVE_TAB, tab.into());
    }

    pub fn panel_width(&self) -> Option<u32> {
        self.read(PANEL_WIDTH)
    }

    pub fn set_panel_width(&self, width: u32) {
        self.schedule(PANEL_WIDTH, width);
    }

    fn read<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        match self.store.get_json(&keys::ui(name)) {
            Ok(value) => value,
            Err(e) => {
                warn!(name, error = %e, "Unreadable UI state");
                None
            }
        }
    }

    fn schedule<T: Serialize + Send + 'static>(&self, name: &'static str, value: T) {
        let store = self.store.clone();
        let debounce = self.debounce;

        let mut guard = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = guard.remove(name) {
            previous.abort();
        }

        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) = store.put_json(&keys::ui(name), &value) {
                warn!(name, error = %e, "Failed to persist UI state");
            } else {
                trace!(name, "UI state persisted");
            }
        });
        guard.insert(name, task);
    }
}
