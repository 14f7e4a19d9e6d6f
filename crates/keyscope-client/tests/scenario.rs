use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use keyscope_client::{BackendError, ConnectionBackend, RecoveryCoordinator, Session};
use keyscope_net::{MockRelay, TransportClient, TransportConfig};
use keyscope_shared::{Connection, ConnectionId, ConnectionParams, Message};
use keyscope_store::{keys, ChannelMap, ConnectionRegistry, DualStore, MessageHistory, SubscriptionLedger};

const WAIT: Duration = Duration::from_secs(5);

/// Backend that still knows every connection.
struct HealthyBackend;

#[async_trait]
impl ConnectionBackend for HealthyBackend {
    async fn connection_exists(&self, _id: &ConnectionId) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn create_connection(
        &self,
        params: &ConnectionParams,
        id: Option<&ConnectionId>,
    ) -> Result<Connection, BackendError> {
        Ok(Connection::new(id.cloned().unwrap_or_default(), params.clone()))
    }
}

/// Backend that lost every session and hands out a fixed new id.
struct RestartedBackend {
    new_id: ConnectionId,
}

#[async_trait]
impl ConnectionBackend for RestartedBackend {
    async fn connection_exists(&self, _id: &ConnectionId) -> Result<bool, BackendError> {
        Ok(false)
    }

    async fn create_connection(
        &self,
        params: &ConnectionParams,
        _id: Option<&ConnectionId>,
    ) -> Result<Connection, BackendError> {
        Ok(Connection::new(self.new_id.clone(), params.clone()))
    }
}

fn params(name: &str) -> ConnectionParams {
    ConnectionParams {
        name: name.into(),
        host: "localhost".into(),
        port: 6379,
        username: None,
        password: None,
        db: 0,
        tls: false,
        managed_instance: None,
    }
}

fn transport(url: String) -> TransportClient {
    let mut config = TransportConfig::new(url);
    config.reconnect_delay = Duration::from_millis(150);
    config.resubscribe_delay = Duration::from_millis(20);
    TransportClient::spawn(config)
}

fn seed_active(store: &DualStore, id: &ConnectionId) {
    let registry = ConnectionRegistry::new(store.clone());
    registry.upsert(Connection::new(id.clone(), params("primary"))).unwrap();
    registry.set_active(Some(id)).unwrap();
}

async fn wait_for_messages(session: &Session, id: &ConnectionId, count: usize) -> Vec<Message> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let messages = session.messages(id);
        if messages.len() >= count || tokio::time::Instant::now() >= deadline {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn has_channel(frame: &Value, channel: &str) -> bool {
    frame["channels"]
        .as_array()
        .map(|a| a.iter().any(|c| c == channel))
        .unwrap_or(false)
}

#[tokio::test]
async fn persisted_channel_survives_a_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let store = DualStore::open_dir(dir.path()).unwrap();
    let c1 = ConnectionId::from("c1");
    seed_active(&store, &c1);

    let relay = MockRelay::start().await.unwrap();
    let session = Session::new(store.clone(), transport(relay.url()), Arc::new(HealthyBackend), 100);
    session.start().await.unwrap();
    session.subscribe(&["news".to_string()], true).unwrap();

    // The direct subscribe plus the replay that follows the open.
    assert!(relay.wait_for_frames("subscribe", 2, WAIT).await);

    let base = Utc::now().timestamp_millis();
    relay.publish_message("c1", "news", "first", base);
    relay.publish_message("c1", "news", "second", base + 1_000);
    assert_eq!(wait_for_messages(&session, &c1, 2).await.len(), 2);

    relay.clear_received();
    relay.drop_clients();
    assert!(relay.wait_for_connections(2, WAIT).await);
    assert!(relay.wait_for_frames("subscribe", 1, WAIT).await);

    // A redelivery of the second message right after reconnect is dropped.
    relay.publish_message("c1", "news", "second", base + 1_000);
    relay.publish_message("c1", "news", "third", base + 2_000);
    let messages = wait_for_messages(&session, &c1, 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let subscribes = relay.frames_of_type("subscribe");
    assert_eq!(subscribes.len(), 1);
    assert!(has_channel(&subscribes[0], "news"));

    let bodies: Vec<_> = messages.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(bodies, vec!["third", "second", "first"]);
    assert_eq!(session.messages(&c1).len(), 3);

    session.shutdown().await;

    let raw = store
        .backup_get(&keys::messages(&c1, "news"))
        .await
        .unwrap()
        .expect("backup holds the channel history");
    let persisted: Vec<Message> = serde_json::from_str(&raw).unwrap();
    assert_eq!(persisted.len(), 3);
    assert_eq!(persisted[0].message, "third");
}

#[tokio::test]
async fn migration_moves_history_byte_for_byte() {
    let store = DualStore::in_memory().unwrap();
    let old = ConnectionId::from("old-id");
    let new = ConnectionId::from("new-id");
    seed_active(&store, &old);

    let ledger = SubscriptionLedger::new(store.clone());
    let history = MessageHistory::new(store.clone());
    ledger
        .save(&old, &ChannelMap::from([("a".to_string(), true), ("b".to_string(), true)]))
        .unwrap();

    let base = Utc::now().timestamp_millis();
    for channel in ["a", "b"] {
        let messages: Vec<Message> = (0..3)
            .map(|i| Message::new(channel, format!("{channel}-{i}"), base - i))
            .collect();
        history.save(&old, channel, &messages).unwrap();
    }
    let raw_a = history.load_raw(&old, "a").unwrap();
    let raw_b = history.load_raw(&old, "b").unwrap();

    let backend = Arc::new(RestartedBackend { new_id: new.clone() });
    let report = RecoveryCoordinator::new(store.clone(), backend).run().await;
    assert_eq!(report.migrations.len(), 1);

    assert_eq!(history.load_raw(&new, "a").as_deref(), Some(raw_a.as_str()));
    assert_eq!(history.load_raw(&new, "b").as_deref(), Some(raw_b.as_str()));
    assert_eq!(history.load(&new, "a").len(), 3);

    assert!(history.load_raw(&old, "a").is_none());
    assert!(history.load_raw(&old, "b").is_none());
    assert!(ledger.load(&old).is_empty());
    assert!(store.keys_with_prefix(&keys::messages_prefix(&old)).is_empty());

    let registry = ConnectionRegistry::new(store);
    assert_eq!(registry.active().unwrap(), Some(new));
}

#[tokio::test]
async fn restart_with_lost_cache_restores_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let c1 = ConnectionId::from("c1");

    {
        let store = DualStore::open_dir(dir.path()).unwrap();
        seed_active(&store, &c1);
        SubscriptionLedger::new(store.clone())
            .save(&c1, &ChannelMap::from([("news".to_string(), true)]))
            .unwrap();
        MessageHistory::new(store.clone())
            .save(&c1, "news", &[Message::new("news", "kept", Utc::now().timestamp_millis())])
            .unwrap();
        store.flush().await;
    }

    std::fs::remove_file(dir.path().join("cache.json")).unwrap();

    let relay = MockRelay::start().await.unwrap();
    let store = DualStore::open_dir(dir.path()).unwrap();
    let session = Session::new(store, transport(relay.url()), Arc::new(HealthyBackend), 100);

    let report = session.start().await.unwrap();
    assert!(report.hydrated > 0);
    assert_eq!(session.active_connection(), Some(c1.clone()));

    let messages = session.messages(&c1);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, "kept");

    // The restored ledger is replayed once the socket opens.
    assert!(relay.wait_for_frames("subscribe", 1, WAIT).await);
    assert!(has_channel(&relay.frames_of_type("subscribe")[0], "news"));

    session.shutdown().await;
}
