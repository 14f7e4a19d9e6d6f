//! The realtime session.
//!
//! A [`Session`] ties the persistence layer to the transport.  Every user
//! action that changes subscriptions updates the ledger and the transport
//! together; inbound messages flow from the transport into the message log.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{info, warn};

use keyscope_net::{HandlerHandle, TransportClient};
use keyscope_shared::{Connection, ConnectionId, ConnectionParams, Message};
use keyscope_store::{ChannelMap, ConnectionRegistry, DualStore, MessageHistory, SubscriptionLedger};

use crate::backend::HttpBackend;
use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::events::{emit_event, SessionEvent, EVENT_CHANNEL_CAPACITY};
use crate::message_log::MessageLog;
use crate::recovery::{ConnectionBackend, RecoveryCoordinator, RecoveryReport};
use crate::state::ConnectionArena;

struct SessionState {
    arena: ConnectionArena,
    log: MessageLog,
    active: Option<ConnectionId>,
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Session {
    store: DualStore,
    ledger: SubscriptionLedger,
    registry: ConnectionRegistry,
    transport: TransportClient,
    backend: Arc<dyn ConnectionBackend>,
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    handles: Mutex<Vec<HandlerHandle>>,
}

impl Session {
    pub fn new(
        store: DualStore,
        transport: TransportClient,
        backend: Arc<dyn ConnectionBackend>,
        max_messages: usize,
    ) -> Self {
        let log = MessageLog::new(MessageHistory::new(store.clone()), max_messages);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            ledger: SubscriptionLedger::new(store.clone()),
            registry: ConnectionRegistry::new(store.clone()),
            store,
            transport,
            backend,
            state: Arc::new(Mutex::new(SessionState {
                arena: ConnectionArena::new(),
                log,
                active: None,
            })),
            events,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Build a session from configuration: on-disk store, relay transport
    /// and HTTP backend.  Must run inside a tokio runtime.
    pub fn open(config: &ClientConfig) -> Result<Self, SessionError> {
        let data_dir = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => keyscope_store::database::default_data_dir()?,
        };
        info!(path = %data_dir.display(), "Opening local store");

        let store = DualStore::open_dir(&data_dir)?;
        let transport = TransportClient::spawn(config.transport());
        let backend = Arc::new(HttpBackend::new(config.backend_url.clone())?);

        Ok(Self::new(store, transport, backend, config.max_messages))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Recover cached connections, wire the transport into the message log,
    /// restore the active connection's subscriptions, check them against the
    /// transport and connect.
    pub async fn start(&self) -> Result<RecoveryReport, SessionError> {
        let report = RecoveryCoordinator::new(self.store.clone(), self.backend.clone())
            .run()
            .await;

        self.register_handlers();

        let mut active = self.registry.active()?;
        if let Some(id) = &active {
            if self.registry.get(id)?.is_none() {
                warn!(connection = %id, "Active connection no longer cached, clearing");
                self.registry.set_active(None)?;
                active = None;
            }
        }
        if let Some(id) = &active {
            self.activate(id);
            self.resync();
        }

        self.transport.connect();
        Ok(report)
    }

    /// Manual disconnect, then wait for pending backup writes.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.remove();
        }

        self.transport.disconnect().await;
        self.store.flush().await;
        info!("Session shut down");
    }

    fn register_handlers(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        if !handles.is_empty() {
            return;
        }

        let state = self.state.clone();
        let events = self.events.clone();
        handles.push(self.transport.on_message(move |relayed| {
            let mut guard = lock(&state);
            let st = &mut *guard;

            let Some(target) = relayed.connection_id.clone().or_else(|| st.active.clone()) else {
                warn!(channel = %relayed.channel, "Message for no connection, dropping");
                return;
            };

            let message = Message::new(
                relayed.channel.clone(),
                relayed.message.clone(),
                relayed.timestamp,
            );
            let slot = st.arena.slot_mut(&target);
            let appended = st.log.append(&target, slot, message.clone());
            drop(guard);

            if appended {
                emit_event(
                    &events,
                    SessionEvent::NewMessage {
                        connection_id: target,
                        message,
                    },
                );
            }
        }));

        let events = self.events.clone();
        handles.push(self.transport.on_connect(move || {
            emit_event(&events, SessionEvent::RelayConnected);
        }));

        let events = self.events.clone();
        handles.push(self.transport.on_disconnect(move || {
            emit_event(&events, SessionEvent::RelayDisconnected);
        }));

        let events = self.events.clone();
        handles.push(self.transport.on_error(move |e| {
            emit_event(&events, SessionEvent::TransportError(e.to_string()));
        }));
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe the active connection to `channels`.
    ///
    /// Memory, ledger and transport are updated under the session lock, so
    /// concurrent callers can never leave an older ledger snapshot behind.
    pub fn subscribe(&self, channels: &[String], persist: bool) -> Result<(), SessionError> {
        let id = self.require_active()?;
        let channels = normalize(channels);
        if channels.is_empty() {
            return Ok(());
        }

        let mut guard = self.lock();
        let st = &mut *guard;
        let slot = st.arena.slot_mut(&id);
        for channel in &channels {
            let previous = slot.subscriptions.insert(channel.clone(), persist);
            if persist {
                st.log.persist_channel(&id, slot, channel);
            } else if previous == Some(true) {
                st.log.discard_channel(&id, channel);
            }
        }

        self.ledger.save(&id, &slot.subscriptions)?;
        self.transport.subscribe(&id, &channels);
        drop(guard);

        info!(connection = %id, ?channels, persist, "Subscribed");
        Ok(())
    }

    /// Unsubscribe the active connection from `channels`, dropping their
    /// persisted history.
    pub fn unsubscribe(&self, channels: &[String]) -> Result<(), SessionError> {
        let id = self.require_active()?;
        let channels = normalize(channels);
        if channels.is_empty() {
            return Ok(());
        }

        let mut guard = self.lock();
        let st = &mut *guard;
        let slot = st.arena.slot_mut(&id);
        for channel in &channels {
            slot.subscriptions.remove(channel);
            st.log.discard_channel(&id, channel);
        }

        self.ledger.save(&id, &slot.subscriptions)?;
        self.transport.unsubscribe(&id, &channels);
        drop(guard);

        info!(connection = %id, ?channels, "Unsubscribed");
        Ok(())
    }

    pub fn unsubscribe_all(&self) -> Result<(), SessionError> {
        let id = self.require_active()?;

        let mut guard = self.lock();
        let st = &mut *guard;
        let slot = st.arena.slot_mut(&id);
        for channel in std::mem::take(&mut slot.subscriptions).keys() {
            st.log.discard_channel(&id, channel);
        }

        self.ledger.remove(&id);
        self.transport.unsubscribe_all(&id);
        drop(guard);

        info!(connection = %id, "Unsubscribed from every channel");
        Ok(())
    }

    /// Flip message persistence of a subscribed channel.  Returns the new
    /// flag, or `None` if the channel is not subscribed.
    pub fn toggle_persistence(&self, channel: &str) -> Result<Option<bool>, SessionError> {
        let id = self.require_active()?;

        let mut guard = self.lock();
        let st = &mut *guard;
        let Some(persist) = self.ledger.toggle(&id, channel)? else {
            return Ok(None);
        };

        let slot = st.arena.slot_mut(&id);
        slot.subscriptions.insert(channel.to_string(), persist);
        if persist {
            st.log.persist_channel(&id, slot, channel);
        } else {
            st.log.discard_channel(&id, channel);
        }
        drop(guard);

        info!(connection = %id, channel, persist, "Toggled persistence");
        Ok(Some(persist))
    }

    /// Full resubscribe of the active connection when the transport's
    /// tracked channels differ from the ledger.  Returns whether a resync
    /// was needed.
    pub fn resync(&self) -> bool {
        let Some(id) = self.active_connection() else {
            return false;
        };

        let mut guard = self.lock();
        let ledger = self.ledger.load(&id);
        let wanted: BTreeSet<String> = ledger.keys().cloned().collect();
        guard.arena.slot_mut(&id).subscriptions = ledger;

        if self.transport.tracked_channels(&id) == wanted {
            return false;
        }

        warn!(connection = %id, channels = wanted.len(), "Ledger and transport diverged, resubscribing");
        self.transport.unsubscribe_all(&id);
        let channels: Vec<String> = wanted.into_iter().collect();
        self.transport.subscribe(&id, &channels);
        true
    }

    pub fn subscriptions(&self, id: &ConnectionId) -> ChannelMap {
        self.lock()
            .arena
            .get(id)
            .map(|slot| slot.subscriptions.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    pub fn connections(&self) -> Result<Vec<Connection>, SessionError> {
        Ok(self.registry.list()?)
    }

    pub fn active_connection(&self) -> Option<ConnectionId> {
        self.lock().active.clone()
    }

    /// Switch the active connection.  The previous one is unsubscribed in
    /// the transport; the new one is subscribed from its ledger.
    pub fn set_active_connection(&self, id: Option<ConnectionId>) -> Result<(), SessionError> {
        if let Some(id) = &id {
            if self.registry.get(id)?.is_none() {
                return Err(SessionError::UnknownConnection(id.clone()));
            }
        }

        let previous = {
            let mut st = self.lock();
            if st.active == id {
                return Ok(());
            }
            st.active.take()
        };

        if let Some(previous) = &previous {
            self.transport.unsubscribe_all(previous);
        }
        self.registry.set_active(id.as_ref())?;
        if let Some(id) = &id {
            self.activate(id);
        }

        info!(from = ?previous, to = ?id, "Active connection changed");
        Ok(())
    }

    /// Create a connection on the backend and cache it.
    pub async fn add_connection(&self, params: ConnectionParams) -> Result<Connection, SessionError> {
        let connection = self.backend.create_connection(&params, None).await?;
        self.registry.upsert(connection.clone())?;
        info!(connection = %connection.id, name = %connection.params.name, "Connection added");
        Ok(connection)
    }

    /// Forget a connection: transport subscriptions, ledger, history,
    /// in-memory messages and the cached definition.
    pub fn delete_connection(&self, id: &ConnectionId) -> Result<bool, SessionError> {
        self.transport.unsubscribe_all(id);
        self.ledger.remove(id);

        {
            let mut guard = self.lock();
            let st = &mut *guard;
            let mut slot = st.arena.remove(id).unwrap_or_default();
            st.log.clear(id, &mut slot);
            if st.active.as_ref() == Some(id) {
                st.active = None;
            }
        }

        let removed = self.registry.remove(id)?;
        info!(connection = %id, removed, "Connection deleted");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Messages of a connection, newest first.
    pub fn messages(&self, id: &ConnectionId) -> Vec<Message> {
        self.lock()
            .arena
            .get(id)
            .map(|slot| slot.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn delete_message(&self, id: &ConnectionId, message_id: &str) -> bool {
        let mut guard = self.lock();
        let st = &mut *guard;
        let slot = st.arena.slot_mut(id);
        st.log.delete(id, slot, message_id)
    }

    pub fn clear_messages(&self, id: &ConnectionId) {
        let mut guard = self.lock();
        let st = &mut *guard;
        let slot = st.arena.slot_mut(id);
        st.log.clear(id, slot);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn store(&self) -> &DualStore {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    fn require_active(&self) -> Result<ConnectionId, SessionError> {
        self.active_connection().ok_or(SessionError::NoActiveConnection)
    }

    /// Make `id` active in memory: load its ledger, restore persisted
    /// history and subscribe in the transport.
    fn activate(&self, id: &ConnectionId) {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.active = Some(id.clone());
        let slot = st.arena.slot_mut(id);
        slot.subscriptions = self.ledger.load(id);
        st.log.restore(id, slot);
        self.transport.subscribe(id, &slot.subscribed_channels());
    }
}

fn normalize(channels: &[String]) -> Vec<String> {
    channels
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect()
}
