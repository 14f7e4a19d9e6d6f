//! # keyscope-client
//!
//! Realtime pub/sub session of the keyscope client: message log with
//! deduplication, connection recovery after restart, and the session that
//! keeps the subscription ledger and the relay transport in lock-step.

pub mod backend;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod message_log;
pub mod recovery;
pub mod session;
pub mod state;
pub mod ui_state;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub use backend::HttpBackend;
pub use config::ClientConfig;
pub use error::{BackendError, SessionError};
pub use events::SessionEvent;
pub use message_log::MessageLog;
pub use recovery::{ConnectionBackend, Migration, RecoveryCoordinator, RecoveryReport};
pub use session::Session;
pub use ui_state::UiState;

/// Install the `fmt` subscriber, honouring `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("keyscope_client=debug,keyscope_net=debug,keyscope_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Run the monitor until Ctrl+C: recover, connect, subscribe the active
/// connection to the configured channels and log every message.
pub async fn run(config: ClientConfig) -> anyhow::Result<()> {
    info!("Starting keyscope monitor v{}", env!("CARGO_PKG_VERSION"));
    info!(relay = %config.relay_url, backend = %config.backend_url, "Loaded configuration");

    let session = Session::open(&config)?;
    let mut events = session.events();

    let report = session.start().await?;
    info!(
        hydrated = report.hydrated,
        kept = report.kept.len(),
        migrated = report.migrations.len(),
        failed = report.failed.len(),
        "Recovery complete"
    );

    match session.active_connection() {
        Some(active) if !config.subscribe_channels.is_empty() => {
            session.subscribe(&config.subscribe_channels, false)?;
            info!(connection = %active, channels = ?config.subscribe_channels, "Monitoring");
        }
        Some(active) => info!(connection = %active, "Monitoring persisted subscriptions"),
        None => tracing::warn!("No active connection, nothing to monitor"),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::NewMessage { connection_id, message }) => info!(
                    connection = %connection_id,
                    channel = %message.channel,
                    timestamp = message.timestamp,
                    "{}",
                    message.message
                ),
                Ok(SessionEvent::RelayConnected) => info!("Relay connected"),
                Ok(SessionEvent::RelayDisconnected) => info!("Relay disconnected"),
                Ok(SessionEvent::TransportError(e)) => tracing::warn!(error = %e, "Transport error"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event listener lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
