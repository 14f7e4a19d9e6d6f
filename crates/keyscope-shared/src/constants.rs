use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "keyscope";

/// Prefix of every key written to the persistence store
pub const STORAGE_NAMESPACE: &str = "keyscope";

/// Default cap of the in-memory message list of one connection
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// Cap of the persisted message list of one channel
pub const MAX_PERSISTED_MESSAGES: usize = 50;

/// Persisted messages older than this are evicted (24 h)
pub const PERSISTED_MESSAGE_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Subscription ledger records older than this are discarded (24 h)
pub const LEDGER_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Identical deliveries inside this window are dropped
pub const DEDUP_WINDOW: Duration = Duration::from_millis(5_000);

/// Recent-delivery records are pruned after this long
pub const DEDUP_RETENTION: Duration = Duration::from_secs(10);

/// Delay before an automatic reconnect attempt
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Interval between keepalive pings on an open relay socket
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period between socket open and subscription replay
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on the relay WebSocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Debounce window for persisting UI state (tab, panel width)
pub const UI_STATE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Default relay WebSocket endpoint
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3001/ws";

/// Default backend HTTP endpoint
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:3001";
