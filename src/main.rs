//! PeerLink - peer node
//!
//! Starts a connection manager from the configuration file, dials any peers
//! given as `peer_id@host:port` arguments and logs connectivity events until
//! Ctrl+C. When a relay URL is configured, peers that cannot be dialed
//! directly are paired through the relay instead.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use peerlink::{
    config::{Config, ConfigManager},
    logging::{init_logging, LogLevel},
    network::{ConnectionEvent, ConnectionManager, ManagerConfig, WireMessage},
    relay::{RelayClient, RelayEvent},
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Parses `peer_id@host:port`
fn parse_peer_arg(arg: &str) -> Result<(String, String)> {
    let Some((peer_id, target)) = arg.split_once('@') else {
        bail!("Expected peer_id@host:port, got {:?}", arg);
    };
    if peer_id.is_empty() || target.is_empty() {
        bail!("Expected peer_id@host:port, got {:?}", arg);
    }
    Ok((peer_id.to_string(), target.to_string()))
}

async fn resolve(target: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("Could not resolve {}", target))?
        .next()
        .with_context(|| format!("No address for {}", target))
}

/// Application state
struct App {
    config: Config,
    manager: Arc<ConnectionManager>,
    peers: Vec<(String, String)>,
}

impl App {
    /// Loads configuration and builds the connection manager
    fn initialize(args: &[String]) -> Result<Self> {
        info!("Initializing PeerLink...");

        let config_manager = ConfigManager::new()?;
        let config = config_manager.load_with_env()?;
        info!(
            "Configuration loaded from: {:?}",
            config_manager.config_directory()
        );

        let peers = args
            .iter()
            .map(|arg| parse_peer_arg(arg))
            .collect::<Result<Vec<_>>>()?;

        info!("Peer ID: {}", config.node.peer_id);
        info!("Network - Listen port: {}", config.network.listen_port);
        info!("Network - STUN servers: {}", config.network.stun_servers.len());
        info!(
            "Network - Reconnect: {} attempts, {}s base delay ({:?})",
            config.network.max_reconnect_attempts,
            config.network.reconnect_delay_secs,
            config.network.backoff
        );
        info!("Discovery - Enabled: {}", config.discovery.enabled);

        let manager = Arc::new(ConnectionManager::new(ManagerConfig::from_config(&config)));
        Ok(Self {
            config,
            manager,
            peers,
        })
    }

    /// Runs until Ctrl+C
    async fn run(&self) -> Result<()> {
        let mut events = self
            .manager
            .take_events()
            .context("Event channel already taken")?;

        let addr = self
            .manager
            .start(self.config.network.listen_port)
            .await
            .context("Failed to start the connection manager")?;
        info!("PeerLink is ready on {}. Press Ctrl+C to exit", addr);

        let mut relay = self.connect_relay().await;

        for (peer_id, target) in &self.peers {
            let direct = match resolve(target).await {
                Ok(addr) => self.manager.connect_to_peer(peer_id, addr).await,
                Err(e) => {
                    error!("{:#}", e);
                    false
                }
            };
            if direct {
                continue;
            }
            match &relay {
                Some((client, _)) => {
                    info!("{} not reachable directly, pairing through the relay", peer_id);
                    if let Err(e) = client.connect_peer(peer_id) {
                        warn!("Relay pairing with {} failed: {}", peer_id, e);
                    }
                }
                None => warn!("{} not reachable yet, retrying in the background", peer_id),
            }
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Some(event) => log_event(event),
                    None => break,
                },
                Some(event) = recv_relay(&mut relay) => log_relay_event(event),
            }
        }

        info!("Shutting down PeerLink...");
        if let Some((client, _)) = relay {
            client.close().await;
        }
        self.manager.stop().await;
        Ok(())
    }

    async fn connect_relay(&self) -> Option<(RelayClient, mpsc::UnboundedReceiver<RelayEvent>)> {
        let url = self.config.relay.url.as_ref()?;
        match RelayClient::connect(url, &self.config.node.peer_id, &self.config.relay.secret_key).await {
            Ok(client) => {
                let events = client.take_events()?;
                Some((client, events))
            }
            Err(e) => {
                warn!("Relay {} unavailable: {}", url, e);
                None
            }
        }
    }
}

async fn recv_relay(
    relay: &mut Option<(RelayClient, mpsc::UnboundedReceiver<RelayEvent>)>,
) -> Option<RelayEvent> {
    match relay {
        Some((_, events)) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Extracts a peer message carried in relay data
fn relayed_message(event: &RelayEvent) -> Option<(String, WireMessage)> {
    let RelayEvent::Data { peer_id, data } = event else {
        return None;
    };
    match serde_json::from_value::<WireMessage>(data.clone()) {
        Ok(message) => Some((peer_id.clone(), message)),
        Err(e) => {
            warn!("Unreadable relay data from {}: {}", peer_id, e);
            None
        }
    }
}

fn log_relay_event(event: RelayEvent) {
    if let Some((peer_id, message)) = relayed_message(&event) {
        log_event(ConnectionEvent::MessageReceived { peer_id, message });
        return;
    }
    match event {
        RelayEvent::ConnectResponse {
            target_id,
            success: true,
            ..
        } => info!("Paired with {} through the relay", target_id),
        RelayEvent::ConnectResponse {
            target_id, error, ..
        } => warn!(
            "Relay could not pair with {}: {}",
            target_id,
            error.unwrap_or_default()
        ),
        RelayEvent::PeerConnected { peer_id } => info!("{} paired with us through the relay", peer_id),
        RelayEvent::PeerDisconnected { peer_id } => info!("{} left the relay", peer_id),
        RelayEvent::Heartbeat { .. } => debug!("Relay heartbeat"),
        RelayEvent::Data { .. } => {}
    }
}

fn log_event(event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected { peer_id, addr, role } => {
            info!("Connected to {} at {} ({:?})", peer_id, addr, role)
        }
        ConnectionEvent::Disconnected { peer_id, reason } => {
            info!("Disconnected from {}: {}", peer_id, reason)
        }
        ConnectionEvent::MessageReceived { peer_id, message } => match message {
            WireMessage::Message { content, .. } => info!("{}: {}", peer_id, content),
            other => info!("{} sent {}", peer_id, other.message_type()),
        },
        ConnectionEvent::StunCompleted { bindings } => {
            for binding in bindings {
                info!("Public address {} via {}", binding.mapped_address, binding.server);
            }
        }
        ConnectionEvent::ReconnectFailed { peer_id, attempts } => {
            warn!("Gave up on {} after {} attempts", peer_id, attempts)
        }
        other => info!("{:?}", other),
    }
}

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|name| LogLevel::parse(&name))
        .unwrap_or(if std::env::var("RUST_LOG").is_ok() {
            LogLevel::Debug
        } else {
            LogLevel::Info
        });
    init_logging(log_level);

    info!("Starting PeerLink v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().skip(1).collect();
    match App::initialize(&args) {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("Application error: {:#}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Failed to initialize PeerLink: {:#}", e);
            std::process::exit(1);
        }
    }

    info!("PeerLink stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_arg() {
        let (peer_id, target) = parse_peer_arg("bob@127.0.0.1:8001").unwrap();
        assert_eq!(peer_id, "bob");
        assert_eq!(target, "127.0.0.1:8001");

        assert!(parse_peer_arg("127.0.0.1:8001").is_err());
        assert!(parse_peer_arg("@127.0.0.1:8001").is_err());
        assert!(parse_peer_arg("bob@").is_err());
    }

    #[test]
    fn test_relayed_message() {
        let message = WireMessage::message("bob", "alice", "via relay", None);
        let event = RelayEvent::Data {
            peer_id: "bob".to_string(),
            data: serde_json::to_value(&message).unwrap(),
        };
        assert_eq!(relayed_message(&event), Some(("bob".to_string(), message)));

        let junk = RelayEvent::Data {
            peer_id: "bob".to_string(),
            data: serde_json::json!({"type": "teleport"}),
        };
        assert_eq!(relayed_message(&junk), None);
        assert_eq!(
            relayed_message(&RelayEvent::PeerConnected {
                peer_id: "bob".to_string()
            }),
            None
        );
    }
}
