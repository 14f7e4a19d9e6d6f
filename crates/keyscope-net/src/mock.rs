//! In-process relay for tests.
//!
//! [`MockRelay`] accepts WebSocket clients on an ephemeral localhost port,
//! records every frame they send, answers `ping` with `pong` and
//! `subscribe` with `subscribed`, and lets a test publish messages or drop
//! every client to force a reconnect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, warn};

enum Control {
    Publish(String),
    Drop,
}

#[derive(Default)]
struct RelayState {
    received: Mutex<Vec<Value>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
    accepted: AtomicUsize,
}

impl RelayState {
    fn received(&self) -> MutexGuard<'_, Vec<Value>> {
        self.received.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn clients(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<Control>>> {
        self.clients.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    accept_task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(RelayState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_client(stream, peer, accept_state.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "Mock relay accept failed");
                        break;
                    }
                }
            }
        });

        debug!(%addr, "Mock relay listening");
        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Every frame received so far, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.state.received().clone()
    }

    /// Received frames whose `type` equals `ty`.
    pub fn frames_of_type(&self, ty: &str) -> Vec<Value> {
        self.state
            .received()
            .iter()
            .filter(|f| f.get("type").and_then(Value::as_str) == Some(ty))
            .cloned()
            .collect()
    }

    pub fn clear_received(&self) {
        self.state.received().clear();
    }

    /// Number of sockets accepted since start.
    pub fn connection_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Send `frame` to every connected client.
    pub fn publish(&self, frame: Value) {
        let text = frame.to_string();
        self.state
            .clients()
            .retain(|tx| tx.send(Control::Publish(text.clone())).is_ok());
    }

    /// Convenience wrapper for a `message` frame.
    pub fn publish_message(&self, connection_id: &str, channel: &str, message: &str, timestamp: i64) {
        self.publish(json!({
            "type": "message",
            "connectionId": connection_id,
            "channel": channel,
            "message": message,
            "data": { "timestamp": timestamp },
        }));
    }

    /// Abruptly drop every connected client.
    pub fn drop_clients(&self) {
        for tx in self.state.clients().drain(..) {
            let _ = tx.send(Control::Drop);
        }
    }

    /// Wait until at least `count` frames of type `ty` were received.
    pub async fn wait_for_frames(&self, ty: &str, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.frames_of_type(ty).len() >= count)
            .await
    }

    /// Wait until at least `count` sockets were accepted.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.connection_count() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_clients();
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(%peer, error = %e, "Mock relay handshake failed");
            return;
        }
    };
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    state.clients().push(ctl_tx);
    state.accepted.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            ctl = ctl_rx.recv() => match ctl {
                Some(Control::Publish(text)) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Control::Drop) | None => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let reply = match value.get("type").and_then(Value::as_str) {
                        Some("ping") => Some(json!({ "type": "pong" })),
                        Some("subscribe") => Some(json!({
                            "type": "subscribed",
                            "channels": value.get("channels").cloned().unwrap_or(Value::Null),
                        })),
                        _ => None,
                    };
                    state.received().push(value);
                    if let Some(reply) = reply {
                        if sink.send(WsMessage::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(%peer, "Mock relay client gone");
}
