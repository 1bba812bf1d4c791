//! # murmur-server
//!
//! Real-time relay for two-party encrypted chat rooms.
//!
//! This binary provides:
//! - **Chat socket** (`/ws/chat/:room_id?token=...`) that admits authenticated
//!   users into a room and fans out typing indicators, messages and upload
//!   notices without ever decrypting them
//! - **Presence tracking** with full snapshots on every join and leave
//! - **Durable history** in SQLite, written through an ordered outbox
//! - **Upload storage** on disk, served back under `/uploads/`

mod api;
mod broker;
mod config;
mod error;
mod file_store;
mod gateway;
mod persistence;
mod presence;
mod relay;
mod services;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use murmur_store::Database;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::broker::RoomBroker;
use crate::config::ServerConfig;
use crate::file_store::DiskFileStore;
use crate::gateway::ConnectionGateway;
use crate::persistence::SqliteBackend;
use crate::presence::PresenceRegistry;
use crate::relay::MessageRelay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_server=debug")),
        )
        .init();

    info!("Starting Murmur relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize storage
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    let backend = Arc::new(SqliteBackend::new(db));

    let files = Arc::new(
        DiskFileStore::new(config.upload_dir.clone(), config.max_upload_size).await?,
    );

    // -----------------------------------------------------------------------
    // 4. Wire the relay core
    // -----------------------------------------------------------------------
    let presence = Arc::new(PresenceRegistry::new());
    let broker = Arc::new(RoomBroker::new());
    let relay = Arc::new(MessageRelay::new(
        Arc::clone(&broker),
        backend.clone(),
        files.clone(),
    ));
    let gateway = Arc::new(ConnectionGateway::new(
        Arc::clone(&presence),
        Arc::clone(&broker),
        backend.clone(),
        backend,
        Arc::clone(&relay),
    ));

    let http_addr = config.http_addr;
    let app_state = AppState {
        gateway,
        presence,
        broker,
        relay,
        files,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state.clone(), http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            let closed = api::shutdown(&app_state, api::SHUTDOWN_GRACE).await;
            info!(closed, "Connections closed and outbox drained");
        }
    }

    Ok(())
}
