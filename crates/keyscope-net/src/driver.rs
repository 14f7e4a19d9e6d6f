//! Socket driver.
//!
//! One tokio task owns the relay socket and every timer of the state
//! machine.  It multiplexes, with `tokio::select!`:
//!
//! - commands from [`TransportClient`](crate::TransportClient) handles,
//! - inbound frames,
//! - the keepalive interval,
//! - the reconnect delay,
//! - the resubscribe delay that follows every successful open.
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Connected
//!      ^                        |                    |
//!      +------ error/close -----+--------------------+
//!      (reconnect after a fixed delay unless the disconnect was manual)
//! ```

use std::pin::Pin;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use keyscope_shared::{ConnectionState, InboundFrame, OutboundFrame, RelayMessage};

use crate::client::{Shared, TransportConfig};
use crate::error::TransportError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsResult = Result<WsMessage, tokio_tungstenite::tungstenite::Error>;

/// Commands sent *into* the driver task.
#[derive(Debug)]
pub(crate) enum DriverCommand {
    /// Open (or reopen) the socket.
    Connect,
    /// Manual teardown; acknowledged once the socket is closed.
    Disconnect(oneshot::Sender<()>),
    /// Write a frame if connected, otherwise drop it.
    Send(OutboundFrame),
}

pub(crate) struct Driver {
    config: TransportConfig,
    shared: Arc<Shared>,
    socket: Option<Socket>,
    keepalive: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    resubscribe: Option<Pin<Box<Sleep>>>,
    manual_disconnect: bool,
}

impl Driver {
    pub fn new(config: TransportConfig, shared: Arc<Shared>) -> Self {
        Self {
            config,
            shared,
            socket: None,
            keepalive: None,
            reconnect: None,
            resubscribe: None,
            manual_disconnect: false,
        }
    }

    pub async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<DriverCommand>) {
        debug!(url = %self.config.url, "Transport driver started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                frame = next_frame(&mut self.socket) => self.handle_frame(frame).await,
                _ = tick(&mut self.keepalive) => {
                    trace!("Sending keepalive ping");
                    self.send(OutboundFrame::Ping {}).await;
                }
                _ = fire(&mut self.reconnect) => {
                    self.reconnect = None;
                    info!(url = %self.config.url, "Attempting reconnect");
                    self.open().await;
                }
                _ = fire(&mut self.resubscribe) => {
                    self.resubscribe = None;
                    self.replay_subscriptions().await;
                }
            }
        }

        self.close_socket().await;
        self.shared.set_state(ConnectionState::Disconnected);
        debug!("Transport driver stopped");
    }

    async fn handle_command(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::Connect => {
                self.manual_disconnect = false;
                self.reconnect = None;
                self.open().await;
            }
            DriverCommand::Disconnect(ack) => {
                self.manual_disconnect = true;
                self.reconnect = None;
                self.keepalive = None;
                self.resubscribe = None;
                self.shared.set_reconnecting(false);

                let was_open = self.socket.is_some();
                self.close_socket().await;
                self.shared.set_state(ConnectionState::Disconnected);
                info!("Disconnected from relay");
                if was_open {
                    self.shared.handlers.disconnect.emit("disconnect", &());
                }
                let _ = ack.send(());
            }
            DriverCommand::Send(frame) => self.send(frame).await,
        }
    }

    /// Close any prior socket, then open a fresh one.
    async fn open(&mut self) {
        self.close_socket().await;
        self.keepalive = None;
        self.resubscribe = None;
        self.shared.set_state(ConnectionState::Connecting);

        info!(url = %self.config.url, "Connecting to relay");

        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(self.config.url.as_str()),
        )
        .await;

        match attempt {
            Ok(Ok((socket, _response))) => {
                self.socket = Some(socket);
                self.shared.set_state(ConnectionState::Connected);
                self.shared.set_reconnecting(false);

                let period = self.config.keepalive_interval;
                let mut keepalive = interval_at(Instant::now() + period, period);
                keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.keepalive = Some(keepalive);
                self.resubscribe = Some(Box::pin(sleep(self.config.resubscribe_delay)));

                info!(url = %self.config.url, "Connected to relay");
                self.shared.handlers.connect.emit("connect", &());
            }
            Ok(Err(e)) => self.connection_lost(Some(TransportError::Connect(e.to_string()))),
            Err(_) => self.connection_lost(Some(TransportError::Timeout)),
        }
    }

    /// Unexpected loss of the socket (or a failed open).
    fn connection_lost(&mut self, error: Option<TransportError>) {
        self.socket = None;
        self.keepalive = None;
        self.resubscribe = None;
        self.shared.set_state(ConnectionState::Disconnected);

        if let Some(error) = error {
            warn!(error = %error, "Relay transport error");
            self.shared.handlers.error.emit("error", &error);
        }
        self.shared.handlers.disconnect.emit("disconnect", &());

        if self.manual_disconnect {
            return;
        }
        if self.reconnect.is_some() {
            debug!("Reconnect already scheduled");
            return;
        }

        self.shared.set_reconnecting(true);
        info!(
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.reconnect = Some(Box::pin(sleep(self.config.reconnect_delay)));
    }

    async fn handle_frame(&mut self, frame: Option<WsResult>) {
        match frame {
            Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
            Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => self.dispatch(&text),
                Err(_) => warn!("Dropping non-UTF-8 binary frame"),
            },
            Some(Ok(WsMessage::Close(close))) => {
                info!(frame = ?close, "Relay closed the socket");
                self.connection_lost(None);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => self.connection_lost(Some(TransportError::Socket(e.to_string()))),
            None => {
                info!("Relay socket ended");
                self.connection_lost(None);
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unparsable relay frame");
                return;
            }
        };

        match frame {
            InboundFrame::Message {
                connection_id,
                channel,
                message,
                data,
            } => match RelayMessage::from_parts(connection_id, channel, message, data) {
                Ok(msg) => {
                    trace!(channel = %msg.channel, "Relay message");
                    self.shared.handlers.message.emit("message", &msg);
                }
                Err(e) => warn!(error = %e, "Dropping malformed message frame"),
            },
            InboundFrame::Subscribed { channel, channels } => {
                debug!(?channel, ?channels, "Relay confirmed subscription");
            }
            InboundFrame::Unsubscribed { channel, channels } => {
                debug!(?channel, ?channels, "Relay confirmed unsubscription");
            }
            InboundFrame::Error { error } => {
                let error = TransportError::Relay(
                    error.unwrap_or_else(|| "unspecified relay error".to_string()),
                );
                warn!(error = %error, "Relay reported an error");
                self.shared.handlers.error.emit("error", &error);
            }
            InboundFrame::Pong {} => trace!("Keepalive pong"),
        }
    }

    /// Write a frame.  Frames issued while not connected are dropped; the
    /// replay after the next open restores subscription state.
    async fn send(&mut self, frame: OutboundFrame) {
        let Some(socket) = self.socket.as_mut() else {
            debug!(?frame, "Not connected, dropping frame");
            return;
        };

        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                return;
            }
        };

        if let Err(e) = socket.send(WsMessage::Text(text)).await {
            self.connection_lost(Some(TransportError::Socket(e.to_string())));
        }
    }

    /// Send one `subscribe` frame per tracked connection with channels.
    async fn replay_subscriptions(&mut self) {
        if self.socket.is_none() {
            debug!("Socket closed before resubscribe, skipping replay");
            return;
        }

        let tracked: Vec<_> = self
            .shared
            .subscriptions()
            .iter()
            .filter(|(_, channels)| !channels.is_empty())
            .map(|(id, channels)| (id.clone(), channels.iter().cloned().collect::<Vec<_>>()))
            .collect();

        for (connection_id, channels) in tracked {
            info!(
                connection = %connection_id,
                channels = channels.len(),
                "Replaying subscriptions"
            );
            self.send(OutboundFrame::Subscribe {
                connection_id,
                channels,
            })
            .await;
        }
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!(error = %e, "Error while closing relay socket");
            }
        }
    }
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<WsResult> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
