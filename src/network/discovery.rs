//! Node discovery for PeerLink
//!
//! This module finds peers on the local network without a rendezvous
//! server. Each node periodically broadcasts an `announce` datagram naming
//! its peer id and listening port, and records the announcements it hears
//! from others. Entries older than the maximum node age are filtered out
//! when read and pruned whenever a new announcement arrives.
//!
//! Discovery is best-effort and unauthenticated: any host on the subnet can
//! announce itself.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DiscoverySettings;
use crate::error::{NetworkError, NetworkResult};
use crate::network::protocol::unix_timestamp_secs;

// Discovery constants (avoiding magic numbers)
const MAX_DATAGRAM_SIZE: usize = 1024;
const DEFAULT_MAX_NODE_AGE_SECS: u64 = 300;
const RECV_ERROR_BACKOFF_MS: u64 = 100;
const MAX_RECV_ERROR_BACKOFF_MS: u64 = 5_000;

/// Default age after which a node is no longer reported
pub const DEFAULT_MAX_NODE_AGE: Duration = Duration::from_secs(DEFAULT_MAX_NODE_AGE_SECS);

/// Datagrams exchanged on the discovery port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    /// Presence announcement
    #[serde(alias = "node_announce")]
    Announce {
        #[serde(alias = "node_id")]
        peer_id: String,
        port: u16,
        #[serde(default)]
        timestamp: u64,
    },
}

/// A node heard on the local network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredNode {
    /// Announced peer id
    pub peer_id: String,
    /// Source IP of the announcement
    pub ip: IpAddr,
    /// Announced listening port
    pub port: u16,
    /// When the last announcement arrived
    pub last_seen: Instant,
}

impl DiscoveredNode {
    /// Address to dial this node on
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// UDP broadcast announcer and listener
pub struct NodeDiscovery {
    peer_id: String,
    discovery_port: u16,
    node_port: u16,
    broadcast_target: SocketAddr,
    interval: Duration,
    max_node_age: Duration,
    nodes: Arc<RwLock<HashMap<String, DiscoveredNode>>>,
    socket: Option<Arc<UdpSocket>>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeDiscovery {
    /// Creates a discovery service; nothing is bound until `start`
    pub fn new(peer_id: impl Into<String>, settings: &DiscoverySettings) -> Self {
        let broadcast_ip = settings
            .broadcast_address
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::BROADCAST));

        Self {
            peer_id: peer_id.into(),
            discovery_port: settings.discovery_port,
            node_port: settings.node_port,
            broadcast_target: SocketAddr::new(broadcast_ip, settings.discovery_port),
            interval: Duration::from_secs(settings.broadcast_interval_secs),
            max_node_age: Duration::from_secs(settings.max_node_age_secs),
            nodes: Arc::new(RwLock::new(HashMap::new())),
            socket: None,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    /// Sends announcements to a specific address instead of the broadcast address
    pub fn with_broadcast_target(mut self, target: SocketAddr) -> Self {
        self.broadcast_target = target;
        self
    }

    /// Sets the port advertised to other nodes
    pub fn with_node_port(mut self, port: u16) -> Self {
        self.node_port = port;
        self
    }

    /// Sets the announcement interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets how long an unheard node is kept
    pub fn with_max_node_age(mut self, max_age: Duration) -> Self {
        self.max_node_age = max_age;
        self
    }

    /// Returns true while the loops are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the discovery socket is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Number of live announce/listen tasks
    pub fn task_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Binds the discovery socket and launches the announce and listen loops
    pub async fn start(&mut self) -> NetworkResult<()> {
        if self.is_running() {
            return Ok(());
        }

        let socket = Arc::new(bind_broadcast_socket(self.discovery_port)?);
        info!(
            "Node discovery for {} listening on {}",
            self.peer_id,
            socket.local_addr()?
        );

        self.running.store(true, Ordering::SeqCst);
        self.socket = Some(socket.clone());

        let announcement = DiscoveryMessage::Announce {
            peer_id: self.peer_id.clone(),
            port: self.node_port,
            timestamp: 0,
        };
        self.tasks.push(tokio::spawn(broadcast_presence(
            socket.clone(),
            announcement,
            self.broadcast_target,
            self.interval,
            self.running.clone(),
        )));

        self.tasks.push(tokio::spawn(listen_for_nodes(
            socket,
            self.listener(),
            self.running.clone(),
        )));

        Ok(())
    }

    /// Stops both loops and releases the socket
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.socket = None;
        info!("Node discovery for {} stopped", self.peer_id);
    }

    /// Records one received datagram; returns the node if it was accepted
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Option<DiscoveredNode> {
        self.listener().handle_datagram(data, from).await
    }

    fn listener(&self) -> Listener {
        Listener {
            peer_id: self.peer_id.clone(),
            max_node_age: self.max_node_age,
            nodes: self.nodes.clone(),
        }
    }

    /// Nodes heard from within `max_age`
    pub async fn get_active_nodes(&self, max_age: Duration) -> Vec<DiscoveredNode> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|node| node.last_seen.elapsed() <= max_age)
            .cloned()
            .collect()
    }
}

/// Shared state used by the listen loop
struct Listener {
    peer_id: String,
    max_node_age: Duration,
    nodes: Arc<RwLock<HashMap<String, DiscoveredNode>>>,
}

impl Listener {
    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Option<DiscoveredNode> {
        let message: DiscoveryMessage = match serde_json::from_slice(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring invalid discovery datagram from {}: {}", from, e);
                return None;
            }
        };

        let DiscoveryMessage::Announce { peer_id, port, .. } = message;
        if peer_id == self.peer_id {
            return None;
        }

        let node = DiscoveredNode {
            peer_id: peer_id.clone(),
            ip: from.ip(),
            port,
            last_seen: Instant::now(),
        };

        let mut nodes = self.nodes.write().await;
        let max_age = self.max_node_age;
        nodes.retain(|id, known| {
            let fresh = known.last_seen.elapsed() <= max_age;
            if !fresh {
                debug!("Forgetting node {}", id);
            }
            fresh
        });
        let previous = nodes.insert(peer_id, node.clone());
        drop(nodes);

        if previous.is_none() {
            info!("Discovered node {} at {}", node.peer_id, node.addr());
        }
        Some(node)
    }
}

fn bind_broadcast_socket(port: u16) -> NetworkResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&bind_addr.into()).map_err(|e| {
        NetworkError::ConnectionFailed(format!("discovery bind on {} failed: {}", bind_addr, e))
    })?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

async fn broadcast_presence(
    socket: Arc<UdpSocket>,
    announcement: DiscoveryMessage,
    target: SocketAddr,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;

        let DiscoveryMessage::Announce { peer_id, port, .. } = &announcement;
        let message = DiscoveryMessage::Announce {
            peer_id: peer_id.clone(),
            port: *port,
            timestamp: unix_timestamp_secs(),
        };

        match serde_json::to_vec(&message) {
            Ok(payload) => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    warn!("Failed to broadcast presence to {}: {}", target, e);
                } else {
                    debug!("Announced presence to {}", target);
                }
            }
            Err(e) => warn!("Failed to encode announcement: {}", e),
        }
    }
}

/// Pause after consecutive receive failures, doubling up to a ceiling
fn recv_error_backoff(failures: u32) -> Duration {
    let factor = 1u64 << failures.saturating_sub(1).min(16);
    Duration::from_millis((RECV_ERROR_BACKOFF_MS * factor).min(MAX_RECV_ERROR_BACKOFF_MS))
}

async fn listen_for_nodes(socket: Arc<UdpSocket>, listener: Listener, running: Arc<AtomicBool>) {
    let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
    let mut failures = 0u32;

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from)) => {
                failures = 0;
                listener.handle_datagram(&buffer[..len], from).await;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let backoff = recv_error_backoff(failures);
                warn!("Discovery receive failed: {} (retrying in {:?})", e, backoff);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
