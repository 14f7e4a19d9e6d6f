//! Handler registries.
//!
//! Each event kind keeps its own [`HandlerSet`].  Registering returns a
//! [`HandlerHandle`]; calling [`HandlerHandle::remove`] unregisters the
//! handler.  Emission snapshots the current handlers, so a handler may
//! register or remove handlers while it runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::error;

use keyscope_shared::RelayMessage;

use crate::error::TransportError;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct HandlerSet<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
}

impl<T: 'static> HandlerSet<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn register(
        self: &Arc<Self>,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> HandlerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(handler)));

        let set: Weak<Self> = Arc::downgrade(self);
        HandlerHandle {
            remove: Some(Box::new(move || {
                if let Some(set) = set.upgrade() {
                    set.lock().retain(|(hid, _)| *hid != id);
                }
            })),
        }
    }

    /// Call every handler with `event`.  A panicking handler is logged and
    /// does not prevent the remaining handlers from running.
    pub fn emit(&self, kind: &'static str, event: &T) {
        let snapshot: Vec<Handler<T>> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(kind, "Transport handler panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Handler<T>)>> {
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registration returned by the `on_*` methods.  Dropping it keeps the
/// handler registered; call [`remove`](Self::remove) to unregister.
#[must_use = "keep the handle to be able to remove the handler"]
pub struct HandlerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl HandlerHandle {
    pub fn remove(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for HandlerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerHandle").finish_non_exhaustive()
    }
}

/// All registries of one transport client.
pub(crate) struct Handlers {
    pub message: Arc<HandlerSet<RelayMessage>>,
    pub connect: Arc<HandlerSet<()>>,
    pub disconnect: Arc<HandlerSet<()>>,
    pub error: Arc<HandlerSet<TransportError>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self {
            message: HandlerSet::new(),
            connect: HandlerSet::new(),
            disconnect: HandlerSet::new(),
            error: HandlerSet::new(),
        }
    }
}
