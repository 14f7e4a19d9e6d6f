//! Short-window suppression of duplicate deliveries.
//!
//! The relay may deliver the same publish twice (for example once per
//! subscription replay).  A delivery is identified by its dedupe key
//! (channel, timestamp and payload); a key seen within the window is dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use keyscope_shared::constants::{DEDUP_RETENTION, DEDUP_WINDOW};

pub struct RecentDeliveries {
    seen: HashMap<String, Instant>,
    window: Duration,
    retention: Duration,
}

impl RecentDeliveries {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
            window: DEDUP_WINDOW,
            retention: DEDUP_RETENTION,
        }
    }

    /// Returns `true` the first time `key` is offered within the window,
    /// `false` for a duplicate.  Records older than the retention period are
    /// pruned on every call.
    pub fn admit(&mut self, key: String) -> bool {
        let now = Instant::now();
        if let Some(first_seen) = self.seen.get(&key) {
            if now.duration_since(*first_seen) < self.window {
                return false;
            }
        }

        self.seen.insert(key, now);
        let retention = self.retention;
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) <= retention);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for RecentDeliveries {
    fn default() -> Self {
        Self::new()
    }
}
