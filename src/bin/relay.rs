//! PeerLink relay server
//!
//! Reads `[relay]` defaults overridden by `HOST`, `PORT` and `SECRET_KEY`
//! and serves until Ctrl+C.

use anyhow::{Context, Result};
use peerlink::{
    config::Config,
    logging::{init_logging, LogLevel},
    relay::{RelayServer, RelayServerConfig},
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|name| LogLevel::parse(&name))
        .unwrap_or(if std::env::var("RUST_LOG").is_ok() {
            LogLevel::Debug
        } else {
            LogLevel::Info
        });
    init_logging(log_level);

    info!("Starting PeerLink relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::default();
    config
        .apply_env_overrides()
        .context("Invalid relay environment")?;
    config.validate().context("Invalid relay configuration")?;

    if config.relay.secret_key.is_empty() {
        warn!("SECRET_KEY is not set; every client token will be accepted");
    }

    let server = RelayServer::new(RelayServerConfig::from_settings(&config.relay));
    let addr = server
        .start()
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.relay.host, config.relay.port))?;
    info!("Relay ready on {}. Press Ctrl+C to exit", addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down relay...");
    server.shutdown().await;
    Ok(())
}
