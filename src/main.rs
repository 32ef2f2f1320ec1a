//! Katana Lobby Server
//!
//! Serves the game lobby over WebSocket until interrupted.

use std::sync::Arc;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use katana::{GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("Failed to load configuration")?;

    // Initialize logging
    let default_filter = if config.is_development() { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Katana Server v{}", VERSION);
    if config.is_development() {
        info!("Running in development environment");
    }
    info!(
        "Seats: {}, players to start: {}, token lifetime: {}h",
        config.session.max_players,
        config.session.min_players,
        config.auth.token_ttl.num_hours()
    );

    let server = Arc::new(GameServer::new(config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    server.run().await.context("Server terminated with an error")?;

    info!("Server stopped");
    Ok(())
}
