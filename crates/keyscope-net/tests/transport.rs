use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use keyscope_net::{MockRelay, TransportClient, TransportConfig, TransportError};
use keyscope_shared::{ConnectionId, RelayMessage};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(url: String) -> TransportConfig {
    let mut config = TransportConfig::new(url);
    config.reconnect_delay = Duration::from_millis(150);
    config.resubscribe_delay = Duration::from_millis(20);
    config.connect_timeout = Duration::from_secs(2);
    config
}

fn channels_of(frame: &Value) -> Vec<String> {
    let mut channels: Vec<String> = frame["channels"]
        .as_array()
        .map(|a| a.iter().filter_map(|c| c.as_str().map(String::from)).collect())
        .unwrap_or_default();
    channels.sort();
    channels
}

async fn wait_for<T: Clone>(cell: &Arc<Mutex<Vec<T>>>, count: usize) -> Vec<T> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let items = cell.lock().unwrap().clone();
        if items.len() >= count || tokio::time::Instant::now() >= deadline {
            return items;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn every_reconnect_replays_the_same_subscriptions() {
    let relay = MockRelay::start().await.unwrap();
    let client = TransportClient::spawn(fast_config(relay.url()));
    let c1 = ConnectionId::from("c1");

    // Queued while disconnected: tracked, but the frame itself is dropped.
    client.subscribe(&c1, &["A".into(), "B".into()]);
    client.connect();

    for round in 1..=3 {
        assert!(relay.wait_for_connections(round, WAIT).await);
        assert!(relay.wait_for_frames("subscribe", round, WAIT).await);
        if round < 3 {
            relay.drop_clients();
        }
    }

    // Give a stray duplicate replay a chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let subscribes = relay.frames_of_type("subscribe");
    assert_eq!(subscribes.len(), 3);
    for frame in &subscribes {
        assert_eq!(frame["connectionId"], "c1");
        assert_eq!(channels_of(frame), vec!["A", "B"]);
    }

    client.disconnect().await;
}

#[tokio::test]
async fn malformed_message_frames_are_dropped() {
    let relay = MockRelay::start().await.unwrap();
    let client = TransportClient::spawn(fast_config(relay.url()));

    let received: Arc<Mutex<Vec<RelayMessage>>> = Arc::default();
    let sink = received.clone();
    let _handle = client.on_message(move |msg| sink.lock().unwrap().push(msg.clone()));

    client.connect();
    assert!(relay.wait_for_connections(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // No timestamp.
    relay.publish(json!({ "type": "message", "channel": "news", "message": "lost" }));
    // Not a known frame at all.
    relay.publish(json!({ "type": "bogus" }));
    relay.publish_message("c1", "news", "kept", 1_700_000_000_000);

    let messages = wait_for(&received, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let messages_after = received.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages_after.len(), 1);
    assert_eq!(messages_after[0].message, "kept");
    assert_eq!(messages_after[0].connection_id, Some(ConnectionId::from("c1")));
    assert_eq!(messages_after[0].timestamp, 1_700_000_000_000);

    client.disconnect().await;
}

#[tokio::test]
async fn relay_error_frames_reach_error_handlers() {
    let relay = MockRelay::start().await.unwrap();
    let client = TransportClient::spawn(fast_config(relay.url()));

    let errors: Arc<Mutex<Vec<TransportError>>> = Arc::default();
    let sink = errors.clone();
    let _handle = client.on_error(move |e| sink.lock().unwrap().push(e.clone()));

    client.connect();
    assert!(relay.wait_for_connections(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    relay.publish(json!({ "type": "error", "error": "unknown connection" }));

    let errors = wait_for(&errors, 1).await;
    assert_eq!(
        errors,
        vec![TransportError::Relay("unknown connection".into())]
    );
    assert!(client.is_connected());

    client.disconnect().await;
}

#[tokio::test]
async fn manual_disconnect_cancels_reconnect() {
    let relay = MockRelay::start().await.unwrap();
    let client = TransportClient::spawn(fast_config(relay.url()));

    let disconnects: Arc<Mutex<Vec<()>>> = Arc::default();
    let sink = disconnects.clone();
    let _handle = client.on_disconnect(move || sink.lock().unwrap().push(()));

    client.connect();
    assert!(relay.wait_for_connections(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.is_connected());

    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(relay.connection_count(), 1);
    assert!(!client.is_connected());
    assert!(!client.is_reconnecting());
    assert_eq!(disconnects.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn dropped_socket_schedules_a_reconnect() {
    let relay = MockRelay::start().await.unwrap();
    let client = TransportClient::spawn(fast_config(relay.url()));

    let connects: Arc<Mutex<Vec<()>>> = Arc::default();
    let sink = connects.clone();
    let handle = client.on_connect(move || sink.lock().unwrap().push(()));

    client.connect();
    assert!(relay.wait_for_connections(1, WAIT).await);
    relay.drop_clients();
    assert!(relay.wait_for_connections(2, WAIT).await);

    assert_eq!(wait_for(&connects, 2).await.len(), 2);

    // A removed handler no longer hears about later opens.
    handle.remove();
    relay.drop_clients();
    assert!(relay.wait_for_connections(3, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connects.lock().unwrap().len(), 2);

    client.disconnect().await;
}

#[tokio::test]
async fn keepalive_pings_while_connected() {
    let relay = MockRelay::start().await.unwrap();
    let mut config = fast_config(relay.url());
    config.keepalive_interval = Duration::from_millis(50);
    let client = TransportClient::spawn(config);

    client.connect();
    assert!(relay.wait_for_frames("ping", 2, WAIT).await);

    client.disconnect().await;
}
