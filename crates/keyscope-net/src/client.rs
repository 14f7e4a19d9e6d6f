//! Transport client handle.
//!
//! A [`TransportClient`] is an explicit instance: create one per application
//! session and pass it to whatever needs it.  The socket itself is owned by a
//! driver task (see [`crate::driver`]); the handle only records subscription
//! intent, queues frames and registers handlers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use keyscope_shared::constants::{
    CONNECT_TIMEOUT, KEEPALIVE_INTERVAL, RECONNECT_DELAY, RESUBSCRIBE_DELAY,
};
use keyscope_shared::{ConnectionId, ConnectionState, OutboundFrame, RelayMessage};

use crate::driver::{Driver, DriverCommand};
use crate::error::TransportError;
use crate::handlers::{HandlerHandle, Handlers};

/// Relay endpoint and timing of the transport state machine.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL of the relay, e.g. `ws://127.0.0.1:3001/ws`.
    pub url: String,
    /// Fixed delay before every automatic reconnect attempt.
    pub reconnect_delay: Duration,
    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,
    /// Delay between socket open and subscription replay.
    pub resubscribe_delay: Duration,
    /// Upper bound on the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: RECONNECT_DELAY,
            keepalive_interval: KEEPALIVE_INTERVAL,
            resubscribe_delay: RESUBSCRIBE_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Tracked subscriptions, per connection.
pub(crate) type SubscriptionMap = BTreeMap<ConnectionId, BTreeSet<String>>;

/// State shared between the handle and the driver task.
pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    reconnecting: AtomicBool,
    subscriptions: Mutex<SubscriptionMap>,
    pub handlers: Handlers,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            reconnecting: AtomicBool::new(false),
            subscriptions: Mutex::new(SubscriptionMap::new()),
            handlers: Handlers::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn set_reconnecting(&self, value: bool) {
        self.reconnecting.store(value, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> MutexGuard<'_, SubscriptionMap> {
        self.subscriptions.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Clone)]
pub struct TransportClient {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<DriverCommand>,
}

impl TransportClient {
    /// Create a client and spawn its driver task on the current tokio
    /// runtime.  The client starts disconnected; call [`connect`](Self::connect).
    pub fn spawn(config: TransportConfig) -> Self {
        let shared = Arc::new(Shared::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(config, shared.clone());
        tokio::spawn(driver.run(cmd_rx));

        Self { shared, cmd_tx }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Open (or reopen) the relay socket.  The outcome is reported through
    /// the connect, disconnect and error handlers.
    pub fn connect(&self) {
        self.command(DriverCommand::Connect);
    }

    /// Tear the connection down for good: cancel any pending reconnect,
    /// close the socket and forget every tracked subscription.
    pub async fn disconnect(&self) {
        self.shared.subscriptions().clear();

        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(DriverCommand::Disconnect(ack_tx));
        if ack_rx.await.is_err() {
            debug!("Transport driver already stopped");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether an automatic reconnect is pending or in progress.
    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Track `channels` for `connection_id` and ask the relay to subscribe.
    ///
    /// The tracked set is updated before the frame is queued, so a replay
    /// after reconnect always reflects the latest intent.
    pub fn subscribe(&self, connection_id: &ConnectionId, channels: &[String]) {
        if channels.is_empty() {
            return;
        }
        self.shared
            .subscriptions()
            .entry(connection_id.clone())
            .or_default()
            .extend(channels.iter().cloned());

        self.command(DriverCommand::Send(OutboundFrame::Subscribe {
            connection_id: connection_id.clone(),
            channels: channels.to_vec(),
        }));
    }

    pub fn unsubscribe(&self, connection_id: &ConnectionId, channels: &[String]) {
        if channels.is_empty() {
            return;
        }
        {
            let mut tracked = self.shared.subscriptions();
            if let Some(set) = tracked.get_mut(connection_id) {
                for channel in channels {
                    set.remove(channel);
                }
                if set.is_empty() {
                    tracked.remove(connection_id);
                }
            }
        }

        self.command(DriverCommand::Send(OutboundFrame::Unsubscribe {
            connection_id: connection_id.clone(),
            channels: channels.to_vec(),
        }));
    }

    pub fn unsubscribe_all(&self, connection_id: &ConnectionId) {
        self.shared.subscriptions().remove(connection_id);

        self.command(DriverCommand::Send(OutboundFrame::UnsubscribeAll {
            connection_id: connection_id.clone(),
        }));
    }

    /// Channels currently tracked for a connection.
    pub fn tracked_channels(&self, connection_id: &ConnectionId) -> BTreeSet<String> {
        self.shared
            .subscriptions()
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tracked_connections(&self) -> Vec<ConnectionId> {
        self.shared.subscriptions().keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    pub fn on_message(
        &self,
        handler: impl Fn(&RelayMessage) + Send + Sync + 'static,
    ) -> HandlerHandle {
        self.shared.handlers.message.register(handler)
    }

    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerHandle {
        self.shared.handlers.connect.register(move |_| handler())
    }

    pub fn on_disconnect(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerHandle {
        self.shared.handlers.disconnect.register(move |_| handler())
    }

    pub fn on_error(
        &self,
        handler: impl Fn(&TransportError) + Send + Sync + 'static,
    ) -> HandlerHandle {
        self.shared.handlers.error.register(handler)
    }

    fn command(&self, cmd: DriverCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            warn!("Transport driver stopped, command dropped");
            self.shared.handlers.error.emit("error", &TransportError::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> TransportConfig {
        // Port 9 (discard) on localhost refuses connections.
        let mut config = TransportConfig::new("ws://127.0.0.1:9/ws");
        config.reconnect_delay = Duration::from_secs(3600);
        config
    }

    #[tokio::test]
    async fn tracking_updates_before_any_socket_exists() {
        let client = TransportClient::spawn(unreachable_config());
        let c1 = ConnectionId::from("c1");

        client.subscribe(&c1, &["a".into(), "b".into()]);
        client.unsubscribe(&c1, &["a".into()]);
        assert_eq!(
            client.tracked_channels(&c1),
            BTreeSet::from(["b".to_string()])
        );

        client.unsubscribe(&c1, &["b".into()]);
        assert!(client.tracked_connections().is_empty());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn manual_disconnect_forgets_subscriptions() {
        let client = TransportClient::spawn(unreachable_config());
        let c1 = ConnectionId::from("c1");
        client.subscribe(&c1, &["a".into()]);

        client.disconnect().await;

        assert!(client.tracked_channels(&c1).is_empty());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_reconnecting());
    }
}
