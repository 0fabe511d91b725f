//! Connection manager for PeerLink
//!
//! This module provides the main interface for peer connectivity. It owns
//! the listener, the peer table, the address book and every background task
//! (readers, heartbeats, reconnection loops, STUN collection, TURN refresh
//! and discovery), and publishes what happens on an event channel.
//!
//! Per-peer lifecycle:
//! `Disconnected -> Connecting -> Connected -> (Disconnected | Reconnecting -> Connecting)`.
//! Transport failures never surface as errors from `connect_to_peer` or
//! `send_message`; they return `false` and drive reconnection instead.
//!
//! When two peers dial each other at once, both ends keep the connection
//! initiated by the lower peer id and close the other one.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::{Config, DiscoverySettings};
use crate::error::{CodecError, NetworkError, NetworkResult};
use crate::nat::stun::{collect_bindings, StunBindingResult, MAX_BINDINGS, STUN_TIMEOUT};
use crate::nat::turn::{TurnAllocation, TurnClient, TurnConfig};
use crate::network::codec::{FrameCodec, FrameReader};
use crate::network::connection::{
    ConnectPath, ConnectionInfo, ConnectionRole, ConnectionState, PeerConnection,
    HEARTBEAT_INTERVAL,
};
use crate::network::discovery::NodeDiscovery;
use crate::network::listener::{
    bind_with_probe, AuthenticatedStream, ConnectionListener, Handshake, DEFAULT_AUTH_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT,
};
use crate::network::protocol::WireMessage;
use crate::network::reconnect::ReconnectPolicy;
use crate::network::table::{Offer, PeerTable};

// Manager constants (avoiding magic numbers)
const DEFAULT_PORT_PROBE_ATTEMPTS: u16 = 10;
const TASK_STOP_TIMEOUT_SECS: u64 = 2;
const TURN_CLOSE_TIMEOUT_SECS: u64 = 2;

/// Upper bound on waiting for one background task (including the listener) to stop
pub const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(TASK_STOP_TIMEOUT_SECS);

const TURN_CLOSE_TIMEOUT: Duration = Duration::from_secs(TURN_CLOSE_TIMEOUT_SECS);

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Local peer identifier
    pub peer_id: String,
    /// Display name sent during authentication
    pub username: Option<String>,
    /// Ports tried upward from the requested one
    pub port_probe_attempts: u16,
    /// Direct TCP connect timeout
    pub connect_timeout: Duration,
    /// Grace period for authentication frames
    pub auth_timeout: Duration,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is considered dead
    pub heartbeat_timeout: Duration,
    /// STUN servers queried at startup
    pub stun_servers: Vec<String>,
    /// STUN round-trip timeout
    pub stun_timeout: Duration,
    /// Retry schedule for lost or failed connections
    pub reconnect: ReconnectPolicy,
    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
    /// TURN server to allocate on at startup
    pub turn: Option<TurnConfig>,
    /// Local network discovery, when enabled
    pub discovery: Option<DiscoverySettings>,
}

impl ManagerConfig {
    /// Creates a config with defaults and no STUN servers
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            username: None,
            port_probe_attempts: DEFAULT_PORT_PROBE_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: 2 * HEARTBEAT_INTERVAL,
            stun_servers: Vec::new(),
            stun_timeout: STUN_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            max_frame_size: crate::network::codec::MAX_FRAME_SIZE,
            turn: None,
            discovery: None,
        }
    }

    /// Builds the manager config from the application config
    pub fn from_config(config: &Config) -> Self {
        let network = &config.network;
        let heartbeat_interval = Duration::from_secs(network.heartbeat_interval_secs);

        let turn = config.turn.server.as_ref().map(|server| {
            TurnConfig::new(
                server.clone(),
                config.turn.username.clone(),
                config.turn.password.clone(),
            )
        });

        Self {
            peer_id: config.node.peer_id.clone(),
            username: config.node.username.clone(),
            port_probe_attempts: network.port_probe_attempts,
            connect_timeout: Duration::from_millis(network.connect_timeout_ms),
            auth_timeout: Duration::from_secs(network.auth_timeout_secs),
            heartbeat_interval,
            heartbeat_timeout: 2 * heartbeat_interval,
            stun_servers: network.stun_servers.clone(),
            stun_timeout: STUN_TIMEOUT,
            reconnect: ReconnectPolicy::from_config(network),
            max_frame_size: network.max_frame_size,
            turn,
            discovery: config
                .discovery
                .enabled
                .then(|| config.discovery.clone()),
        }
    }

    /// Sets the display name
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the STUN server list
    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    /// Sets the reconnection policy
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the heartbeat interval; the timeout follows at twice the interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = 2 * interval;
        self
    }

    /// Sets the direct connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the authentication grace period
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Enables TURN allocation at startup
    pub fn with_turn(mut self, turn: TurnConfig) -> Self {
        self.turn = Some(turn);
        self
    }

    /// Enables local network discovery
    pub fn with_discovery(mut self, settings: DiscoverySettings) -> Self {
        self.discovery = Some(settings);
        self
    }
}

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The listener is accepting connections
    ListenerReady { addr: SocketAddr },
    /// STUN collection finished (possibly with no bindings)
    StunCompleted { bindings: Vec<StunBindingResult> },
    /// A peer was admitted into the peer table
    Connected {
        peer_id: String,
        addr: SocketAddr,
        role: ConnectionRole,
    },
    /// A peer's connection was torn down
    Disconnected { peer_id: String, reason: String },
    /// An application message arrived
    MessageReceived {
        peer_id: String,
        message: WireMessage,
    },
    /// Reconnection gave up
    ReconnectFailed { peer_id: String, attempts: u32 },
    /// A TURN relay address was allocated
    RelayAllocated { relayed_address: SocketAddr },
    /// A node announced itself on the local network
    NodeDiscovered { peer_id: String, addr: SocketAddr },
}

/// Background tasks owned by one manager
///
/// Once closed, no new task is accepted until reopened, so nothing spawned
/// during shutdown can outlive `stop`.
#[derive(Default)]
struct TaskSet {
    handles: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TaskSet {
    fn spawn<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock().ok()?;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        handles.retain(|handle| !handle.is_finished());
        let handle = tokio::spawn(task);
        let abort = handle.abort_handle();
        handles.push(handle);
        Some(abort)
    }

    fn active(&self) -> usize {
        self.handles
            .lock()
            .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };

        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await.is_err() {
                warn!("Background task did not stop within {:?}", TASK_STOP_TIMEOUT);
            }
        }
    }
}

/// State shared between the manager handle and its tasks
struct Inner {
    config: ManagerConfig,
    handshake: Arc<Handshake>,
    table: PeerTable,
    states: StdMutex<HashMap<String, ConnectionState>>,
    addresses: RwLock<HashMap<String, SocketAddr>>,
    dial_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    reconnecting: StdMutex<HashSet<String>>,
    stun: OnceLock<Vec<StunBindingResult>>,
    turn: Mutex<Option<TurnClient>>,
    allocation: StdMutex<Option<TurnAllocation>>,
    discovery: Mutex<Option<NodeDiscovery>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    listener_running: StdMutex<Option<Arc<AtomicBool>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    tasks: TaskSet,
    running: AtomicBool,
    stopping: AtomicBool,
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn state(&self, peer_id: &str) -> ConnectionState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(peer_id).copied())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, peer_id: &str, next: ConnectionState) {
        if let Ok(mut states) = self.states.lock() {
            let current = states
                .get(peer_id)
                .copied()
                .unwrap_or(ConnectionState::Disconnected);
            if !current.can_transition_to(next) {
                debug!("Unexpected transition for {}: {} -> {}", peer_id, current, next);
            }
            states.insert(peer_id.to_string(), next);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    fn is_reconnecting(&self, peer_id: &str) -> bool {
        self.reconnecting
            .lock()
            .map(|set| set.contains(peer_id))
            .unwrap_or(false)
    }

    fn finish_reconnect(&self, peer_id: &str) {
        if let Ok(mut set) = self.reconnecting.lock() {
            set.remove(peer_id);
        }
    }

    fn dial_lock(&self, peer_id: &str) -> Arc<Mutex<()>> {
        match self.dial_locks.lock() {
            Ok(mut locks) => locks.entry(peer_id.to_string()).or_default().clone(),
            Err(_) => Arc::new(Mutex::new(())),
        }
    }

    /// Drops per-peer bookkeeping once nothing is connecting or connected
    fn forget_peer(&self, peer_id: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(peer_id);
        }
        if let Ok(mut locks) = self.dial_locks.lock() {
            // A dial in flight still holds a clone
            if locks.get(peer_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(peer_id);
            }
        }
    }

    /// Crossed dials stay within this window of each other
    fn crossing_window(&self) -> Duration {
        self.config.connect_timeout + self.config.auth_timeout
    }

    /// True if the lower of the two peer ids opened this connection
    fn initiated_by_lower_id(&self, conn: &PeerConnection) -> bool {
        let local_is_lower = self.config.peer_id.as_str() < conn.peer_id();
        (conn.role() == ConnectionRole::Outbound) == local_is_lower
    }

    /// Decides whether an open entry survives a newly offered connection
    ///
    /// Connections opened from the same side replace each other. Connections
    /// opened from opposite sides within the crossing window are crossed
    /// dials; the one initiated by the lower peer id wins, so both ends
    /// settle on the same socket.
    fn keeps_existing(&self, existing: &PeerConnection, offered: &PeerConnection) -> bool {
        if existing.role() == offered.role() || existing.connected_for() > self.crossing_window() {
            return false;
        }
        self.initiated_by_lower_id(existing)
    }

    /// Direct address first, then our STUN-mapped IPs on the peer's port
    fn candidate_paths(&self, addr: SocketAddr) -> Vec<ConnectPath> {
        let mut paths = vec![ConnectPath::Direct(addr)];
        if let Some(bindings) = self.stun.get() {
            for binding in bindings {
                let candidate = SocketAddr::new(binding.mapped_address.ip(), addr.port());
                if !paths.iter().any(|path| path.addr() == candidate) {
                    paths.push(ConnectPath::StunMapped(candidate));
                }
            }
        }
        paths
    }

    /// Dials a peer and admits it; attempts for the same peer are serialized
    async fn establish(
        self: &Arc<Self>,
        peer_id: &str,
        addr: SocketAddr,
    ) -> NetworkResult<Arc<PeerConnection>> {
        let lock = self.dial_lock(peer_id);
        let _guard = lock.lock().await;

        if self.stopping.load(Ordering::SeqCst) {
            return Err(NetworkError::NotRunning);
        }

        self.set_state(peer_id, ConnectionState::Connecting);
        let listen_port = self.local_addr().map(|addr| addr.port());

        for path in self.candidate_paths(addr) {
            match self.handshake.dial(path.addr(), peer_id, listen_port).await {
                Ok(stream) => return self.admit(stream, ConnectionRole::Outbound, path).await,
                Err(e) => debug!("Connect to {} via {:?} failed: {}", peer_id, path, e),
            }
        }

        Err(NetworkError::PeerUnreachable(peer_id.to_string()))
    }

    /// Puts an authenticated socket into the table and starts its tasks
    async fn admit(
        self: &Arc<Self>,
        stream: AuthenticatedStream,
        role: ConnectionRole,
        path: ConnectPath,
    ) -> NetworkResult<Arc<PeerConnection>> {
        let AuthenticatedStream {
            peer_id,
            listen_port,
            remote_addr,
            reader,
            writer,
            ..
        } = stream;

        let dial_addr = match role {
            ConnectionRole::Outbound => Some(path.addr()),
            ConnectionRole::Inbound => {
                listen_port.map(|port| SocketAddr::new(remote_addr.ip(), port))
            }
        };
        if let Some(addr) = dial_addr {
            self.addresses.write().await.insert(peer_id.clone(), addr);
        }

        let conn = Arc::new(
            PeerConnection::new(peer_id.clone(), role, remote_addr, writer)
                .with_path(path)
                .with_dial_addr(dial_addr),
        );
        let offer = self
            .table
            .offer(conn.clone(), |existing, offered| {
                self.keeps_existing(existing, offered)
            })
            .await;
        if let Offer::Kept(winner) = offer {
            debug!(
                "Crossed dial with {}: keeping connection {}, closing {}",
                peer_id,
                winner.id(),
                conn.id()
            );
            conn.close().await;
            return Ok(winner);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let reader = self
            .tasks
            .spawn(read_loop(self.clone(), conn.clone(), reader, ready_rx));
        let heartbeat = self.tasks.spawn(heartbeat_loop(self.clone(), conn.clone()));

        if let Some(reader) = &reader {
            conn.set_reader(reader.clone());
        }
        if reader.is_none() || heartbeat.is_none() {
            self.table.remove_if_current(&peer_id, conn.id()).await;
            conn.close().await;
            return Err(NetworkError::NotRunning);
        }
        let _ = ready_tx.send(());

        self.set_state(&peer_id, ConnectionState::Connected);
        info!("Connected to {} at {} ({:?})", peer_id, remote_addr, role);
        self.emit(ConnectionEvent::Connected {
            peer_id,
            addr: remote_addr,
            role,
        });
        Ok(conn)
    }

    /// Tears down a connection that failed; reconnects only if it was current
    async fn connection_lost(self: &Arc<Self>, conn: &Arc<PeerConnection>, reason: String) {
        let current = self
            .table
            .remove_if_current(conn.peer_id(), conn.id())
            .await
            .is_some();
        conn.close().await;
        if !current {
            return;
        }

        let peer_id = conn.peer_id().to_string();
        info!("Lost connection to {}: {}", peer_id, reason);
        self.emit(ConnectionEvent::Disconnected {
            peer_id: peer_id.clone(),
            reason,
        });
        self.schedule_reconnect(&peer_id).await;
    }

    /// Starts a reconnection loop unless one is already running for the peer
    async fn schedule_reconnect(self: &Arc<Self>, peer_id: &str) {
        if self.stopping.load(Ordering::SeqCst) || self.config.reconnect.max_attempts == 0 {
            self.forget_peer(peer_id);
            return;
        }

        let Some(addr) = self.addresses.read().await.get(peer_id).copied() else {
            debug!("No known address for {}, not reconnecting", peer_id);
            self.forget_peer(peer_id);
            return;
        };

        let first = self
            .reconnecting
            .lock()
            .map(|mut set| set.insert(peer_id.to_string()))
            .unwrap_or(false);
        if !first {
            return;
        }

        self.set_state(peer_id, ConnectionState::Reconnecting);
        if self
            .tasks
            .spawn(reconnect_loop(self.clone(), peer_id.to_string(), addr))
            .is_none()
        {
            self.finish_reconnect(peer_id);
            self.forget_peer(peer_id);
        }
    }

    async fn connect_to_peer(self: &Arc<Self>, peer_id: &str, addr: SocketAddr) -> bool {
        self.addresses
            .write()
            .await
            .insert(peer_id.to_string(), addr);

        match self.establish(peer_id, addr).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Could not connect to {} at {}: {}", peer_id, addr, e);
                self.schedule_reconnect(peer_id).await;
                false
            }
        }
    }

    async fn send_message(self: &Arc<Self>, peer_id: &str, message: &WireMessage) -> bool {
        let conn = match self.table.get(peer_id).await {
            Some(conn) => conn,
            None => {
                let Some(addr) = self.addresses.read().await.get(peer_id).copied() else {
                    warn!("No connection or address for {}", peer_id);
                    return false;
                };
                match self.establish(peer_id, addr).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("On-demand connect to {} failed: {}", peer_id, e);
                        self.schedule_reconnect(peer_id).await;
                        return false;
                    }
                }
            }
        };

        match conn.send(message).await {
            Ok(()) => true,
            Err(e) => {
                // The entry may have been replaced after the lookup
                if let Some(current) = self.table.get(peer_id).await {
                    if current.id() != conn.id() && current.send(message).await.is_ok() {
                        return true;
                    }
                }
                warn!("Send to {} failed: {}", peer_id, e);
                self.connection_lost(&conn, e.to_string()).await;
                false
            }
        }
    }

    async fn disconnect(&self, peer_id: &str) -> bool {
        self.finish_reconnect(peer_id);

        match self.table.remove(peer_id).await {
            Some(conn) => {
                conn.close().await;
                self.forget_peer(peer_id);
                info!("Disconnected from {}", peer_id);
                self.emit(ConnectionEvent::Disconnected {
                    peer_id: peer_id.to_string(),
                    reason: "disconnected locally".to_string(),
                });
                true
            }
            None => {
                self.forget_peer(peer_id);
                false
            }
        }
    }

    fn spawn_stun_collection(self: &Arc<Self>) {
        if self.stun.get().is_some() {
            return;
        }

        let inner = self.clone();
        self.tasks.spawn(async move {
            let bindings = if inner.config.stun_servers.is_empty() {
                Vec::new()
            } else {
                collect_bindings(&inner.config.stun_servers, MAX_BINDINGS, inner.config.stun_timeout)
                    .await
            };

            for binding in &bindings {
                info!(
                    "Public address {} (local {}) via {}",
                    binding.mapped_address, binding.local_address, binding.server
                );
            }
            let _ = inner.stun.set(bindings.clone());
            inner.emit(ConnectionEvent::StunCompleted { bindings });
        });
    }

    async fn start_discovery(self: &Arc<Self>, settings: DiscoverySettings, node_port: u16) {
        let mut discovery =
            NodeDiscovery::new(self.config.peer_id.clone(), &settings).with_node_port(node_port);

        match discovery.start().await {
            Ok(()) => {
                *self.discovery.lock().await = Some(discovery);
                self.tasks.spawn(discovery_loop(
                    self.clone(),
                    Duration::from_secs(settings.broadcast_interval_secs),
                    Duration::from_secs(settings.max_node_age_secs),
                ));
            }
            Err(e) => warn!("Node discovery unavailable: {}", e),
        }
    }

    fn store_allocation(&self, allocation: Option<TurnAllocation>) {
        if let Ok(mut slot) = self.allocation.lock() {
            *slot = allocation;
        }
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    conn: Arc<PeerConnection>,
    mut reader: FrameReader<OwnedReadHalf>,
    ready: oneshot::Receiver<()>,
) {
    if ready.await.is_err() {
        return;
    }

    let reason = loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(CodecError::Closed) => break "connection closed by peer".to_string(),
            Err(e) => break e.to_string(),
        };
        conn.touch();

        match WireMessage::decode(&frame) {
            Ok(WireMessage::Heartbeat) => {
                if let Err(e) = conn.send(&WireMessage::HeartbeatAck).await {
                    break e.to_string();
                }
            }
            Ok(WireMessage::HeartbeatAck) => {}
            Ok(message @ (WireMessage::Auth { .. } | WireMessage::AuthReply { .. })) => {
                debug!(
                    "Ignoring {} from authenticated peer {}",
                    message.message_type(),
                    conn.peer_id()
                );
            }
            Ok(message) => {
                debug!("Received {} from {}", message.message_type(), conn.peer_id());
                inner.emit(ConnectionEvent::MessageReceived {
                    peer_id: conn.peer_id().to_string(),
                    message,
                });
            }
            Err(e) => warn!("Dropping frame from {}: {}", conn.peer_id(), e),
        }
    };

    conn.detach_reader();
    inner.connection_lost(&conn, reason).await;
}

async fn heartbeat_loop(inner: Arc<Inner>, conn: Arc<PeerConnection>) {
    let interval = inner.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        ticker.tick().await;
        if conn.is_closed() {
            return;
        }

        if conn.is_heartbeat_timeout(inner.config.heartbeat_timeout) {
            warn!(
                "No traffic from {} for {:?}, closing",
                conn.peer_id(),
                conn.idle_for()
            );
            inner
                .connection_lost(&conn, "heartbeat timeout".to_string())
                .await;
            return;
        }

        if let Err(e) = conn.send(&WireMessage::Heartbeat).await {
            inner.connection_lost(&conn, e.to_string()).await;
            return;
        }
    }
}

// Boxed so the reader -> reconnect -> reader task cycle has a nameable Send type
fn reconnect_loop(inner: Arc<Inner>, peer_id: String, addr: SocketAddr) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let policy = inner.config.reconnect;

        for attempt in 1..=policy.max_attempts {
            let Some(delay) = policy.delay_for(attempt) else {
                break;
            };
            tokio::time::sleep(policy.jittered(delay)).await;

            if !inner.is_reconnecting(&peer_id) {
                debug!("Reconnection to {} cancelled", peer_id);
                return;
            }
            // Connected meanwhile, by an inbound dial or another caller
            if inner.table.contains(&peer_id).await {
                inner.finish_reconnect(&peer_id);
                inner.set_state(&peer_id, ConnectionState::Connected);
                return;
            }

            info!(
                "Reconnecting to {} at {} (attempt {}/{})",
                peer_id, addr, attempt, policy.max_attempts
            );
            match inner.establish(&peer_id, addr).await {
                Ok(_) => {
                    inner.finish_reconnect(&peer_id);
                    return;
                }
                Err(e) => {
                    debug!("Reconnect attempt {} to {} failed: {}", attempt, peer_id, e);
                    inner.set_state(&peer_id, ConnectionState::Reconnecting);
                }
            }
        }

        inner.finish_reconnect(&peer_id);
        inner.forget_peer(&peer_id);
        warn!(
            "{}",
            NetworkError::MaxReconnectExceeded {
                peer_id: peer_id.clone(),
                attempts: policy.max_attempts,
            }
        );
        inner.emit(ConnectionEvent::ReconnectFailed {
            peer_id,
            attempts: policy.max_attempts,
        });
    })
}

async fn admission_loop(inner: Arc<Inner>, mut admitted: mpsc::UnboundedReceiver<AuthenticatedStream>) {
    while let Some(stream) = admitted.recv().await {
        let path = ConnectPath::Direct(stream.remote_addr);
        if let Err(e) = inner.admit(stream, ConnectionRole::Inbound, path).await {
            debug!("Inbound connection not admitted: {}", e);
        }
    }
}

async fn turn_task(inner: Arc<Inner>, config: TurnConfig) {
    let server = config.server.clone();
    let mut client = TurnClient::new(config);

    if let Err(e) = client.connect().await {
        warn!("TURN server {} unreachable: {}", server, e);
        return;
    }
    let allocation = match client.allocate().await {
        Ok(allocation) => allocation,
        Err(e) => {
            warn!("TURN allocation on {} failed: {}", server, e);
            client.close().await;
            return;
        }
    };

    let mut interval = allocation.refresh_interval();
    inner.emit(ConnectionEvent::RelayAllocated {
        relayed_address: allocation.relayed_address,
    });
    inner.store_allocation(Some(allocation));
    *inner.turn.lock().await = Some(client);

    loop {
        tokio::time::sleep(interval).await;

        let mut guard = inner.turn.lock().await;
        let Some(client) = guard.as_mut() else {
            return;
        };

        let refreshed = match client.refresh(None).await {
            Ok(_) => client.allocation().cloned(),
            Err(e) => {
                warn!("TURN refresh failed, reallocating: {}", e);
                match client.allocate().await {
                    Ok(allocation) => Some(allocation),
                    Err(e) => {
                        warn!("TURN reallocation failed: {}", e);
                        None
                    }
                }
            }
        };

        if let Some(allocation) = &refreshed {
            interval = allocation.refresh_interval();
        }
        inner.store_allocation(refreshed);
    }
}

async fn discovery_loop(inner: Arc<Inner>, interval: Duration, max_age: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let nodes = match inner.discovery.lock().await.as_ref() {
            Some(discovery) => discovery.get_active_nodes(max_age).await,
            None => return,
        };

        for node in nodes {
            let addr = node.addr();
            let known = inner.addresses.read().await.get(&node.peer_id).copied();
            if known != Some(addr) {
                inner
                    .addresses
                    .write()
                    .await
                    .insert(node.peer_id.clone(), addr);
                inner.emit(ConnectionEvent::NodeDiscovered {
                    peer_id: node.peer_id.clone(),
                    addr,
                });
            }

            // The node with the lower peer id dials
            if inner.config.peer_id < node.peer_id
                && !inner.table.contains(&node.peer_id).await
                && !inner.is_reconnecting(&node.peer_id)
            {
                inner.connect_to_peer(&node.peer_id, addr).await;
            }
        }
    }
}

/// Main connection manager
pub struct ConnectionManager {
    inner: Arc<Inner>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl ConnectionManager {
    /// Creates a manager; nothing is bound until `start`
    pub fn new(config: ManagerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let codec = FrameCodec::default().with_max_frame_size(config.max_frame_size);
        let handshake = Handshake::new(config.peer_id.clone(), config.username.clone())
            .with_codec(codec)
            .with_auth_timeout(config.auth_timeout)
            .with_connect_timeout(config.connect_timeout);

        let inner = Inner {
            handshake: Arc::new(handshake),
            config,
            table: PeerTable::new(),
            states: StdMutex::new(HashMap::new()),
            addresses: RwLock::new(HashMap::new()),
            dial_locks: StdMutex::new(HashMap::new()),
            reconnecting: StdMutex::new(HashSet::new()),
            stun: OnceLock::new(),
            turn: Mutex::new(None),
            allocation: StdMutex::new(None),
            discovery: Mutex::new(None),
            local_addr: StdMutex::new(None),
            listener_running: StdMutex::new(None),
            events: event_tx,
            tasks: TaskSet::default(),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
            events: StdMutex::new(Some(event_rx)),
        }
    }

    /// Local peer identifier
    pub fn peer_id(&self) -> &str {
        &self.inner.config.peer_id
    }

    /// Takes the event receiver; only the first call gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    /// Binds the listener and starts background work
    ///
    /// Port 0 picks an ephemeral port; any other port is probed upward when
    /// taken. `ListenerReady` is emitted as soon as the listener is live,
    /// before STUN collection completes.
    pub async fn start(&self, port: u16) -> NetworkResult<SocketAddr> {
        let inner = &self.inner;
        if inner.running.load(Ordering::SeqCst) {
            return inner.local_addr().ok_or(NetworkError::NotRunning);
        }

        info!("Starting connection manager for {}", inner.config.peer_id);
        inner.tasks.reopen();
        inner.stopping.store(false, Ordering::SeqCst);

        let listener = bind_with_probe(port, inner.config.port_probe_attempts).await?;
        let addr = listener.local_addr()?;
        if let Ok(mut local) = inner.local_addr.lock() {
            *local = Some(addr);
        }
        inner.running.store(true, Ordering::SeqCst);

        let (admitted_tx, admitted_rx) = mpsc::unbounded_channel();
        let accept_loop = ConnectionListener::new(listener, inner.handshake.clone());
        if let Ok(mut flag) = inner.listener_running.lock() {
            *flag = Some(accept_loop.running_flag());
        }
        inner.tasks.spawn(accept_loop.run(admitted_tx));
        inner.tasks.spawn(admission_loop(inner.clone(), admitted_rx));

        info!("Listening for peers on {}", addr);
        inner.emit(ConnectionEvent::ListenerReady { addr });

        inner.spawn_stun_collection();
        if let Some(turn) = inner.config.turn.clone() {
            inner.tasks.spawn(turn_task(inner.clone(), turn));
        }
        if let Some(settings) = inner.config.discovery.clone() {
            inner.start_discovery(settings, addr.port()).await;
        }

        Ok(addr)
    }

    /// Stops every task and closes every socket
    ///
    /// Each close is bounded, so this always returns even when individual
    /// closes fail.
    pub async fn stop(&self) {
        let inner = &self.inner;
        info!("Stopping connection manager for {}", inner.config.peer_id);

        inner.stopping.store(true, Ordering::SeqCst);
        inner.running.store(false, Ordering::SeqCst);
        if let Some(flag) = inner.listener_running.lock().ok().and_then(|mut f| f.take()) {
            flag.store(false, Ordering::SeqCst);
        }

        inner.tasks.shutdown().await;
        if let Ok(mut set) = inner.reconnecting.lock() {
            set.clear();
        }

        let connections = inner.table.drain().await;
        join_all(connections.iter().map(|conn| conn.close())).await;
        for conn in &connections {
            inner.emit(ConnectionEvent::Disconnected {
                peer_id: conn.peer_id().to_string(),
                reason: "shutdown".to_string(),
            });
        }
        if let Ok(mut states) = inner.states.lock() {
            for state in states.values_mut() {
                *state = ConnectionState::Disconnected;
            }
        }

        if let Some(mut discovery) = inner.discovery.lock().await.take() {
            discovery.stop().await;
        }
        if let Some(mut client) = inner.turn.lock().await.take() {
            if tokio::time::timeout(TURN_CLOSE_TIMEOUT, client.close())
                .await
                .is_err()
            {
                warn!("Timed out releasing TURN allocation");
            }
        }
        inner.store_allocation(None);

        if let Ok(mut local) = inner.local_addr.lock() {
            *local = None;
        }
        info!("Connection manager stopped");
    }

    /// Returns true between `start` and `stop`
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    /// Connects to a peer, falling back to STUN-derived addresses
    ///
    /// Returns false without waiting for the retry window when every path
    /// fails; reconnection continues in the background.
    pub async fn connect_to_peer(&self, peer_id: &str, addr: SocketAddr) -> bool {
        self.inner.connect_to_peer(peer_id, addr).await
    }

    /// Dials and admits a peer, returning its live connection
    ///
    /// That is the new connection unless a crossed dial from the peer won.
    /// Unlike `connect_to_peer` this reports the error and does not schedule
    /// reconnection.
    pub async fn establish(
        &self,
        peer_id: &str,
        addr: SocketAddr,
    ) -> NetworkResult<Arc<PeerConnection>> {
        self.inner.establish(peer_id, addr).await
    }

    /// Sends a message, connecting on demand when the peer's address is known
    pub async fn send_message(&self, peer_id: &str, message: &WireMessage) -> bool {
        self.inner.send_message(peer_id, message).await
    }

    /// Sends a message to every connected peer; returns how many succeeded
    pub async fn broadcast(&self, message: &WireMessage) -> usize {
        let mut delivered = 0;
        for conn in self.inner.table.snapshot().await {
            if self.inner.send_message(conn.peer_id(), message).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Closes a peer's connection without reconnecting
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        self.inner.disconnect(peer_id).await
    }

    /// Current lifecycle state of a peer
    pub fn peer_state(&self, peer_id: &str) -> ConnectionState {
        self.inner.state(peer_id)
    }

    /// Identifiers of connected peers
    pub async fn connected_peers(&self) -> Vec<String> {
        self.inner.table.peer_ids().await
    }

    /// Snapshot of a peer's connection
    pub async fn connection_info(&self, peer_id: &str) -> Option<ConnectionInfo> {
        self.inner.table.get(peer_id).await.map(|conn| conn.info())
    }

    /// Records where a peer can be dialed
    pub async fn add_peer_address(&self, peer_id: &str, addr: SocketAddr) {
        self.inner
            .addresses
            .write()
            .await
            .insert(peer_id.to_string(), addr);
    }

    /// Known dial address for a peer
    pub async fn peer_address(&self, peer_id: &str) -> Option<SocketAddr> {
        self.inner.addresses.read().await.get(peer_id).copied()
    }

    /// STUN bindings collected at startup
    pub fn stun_bindings(&self) -> Vec<StunBindingResult> {
        self.inner.stun.get().cloned().unwrap_or_default()
    }

    /// Current TURN allocation, if one was made
    pub fn relay_allocation(&self) -> Option<TurnAllocation> {
        self.inner
            .allocation
            .lock()
            .ok()
            .and_then(|allocation| allocation.clone())
    }

    /// Number of background tasks still scheduled
    pub async fn active_task_count(&self) -> usize {
        let discovery_tasks = self
            .inner
            .discovery
            .lock()
            .await
            .as_ref()
            .map(|d| d.task_count())
            .unwrap_or(0);
        self.inner.tasks.active() + discovery_tasks
    }

    /// Number of sockets this manager holds open
    pub async fn open_socket_count(&self) -> usize {
        let mut count = self.inner.table.len().await;
        if self.inner.local_addr().is_some() {
            count += 1;
        }
        if let Some(discovery) = self.inner.discovery.lock().await.as_ref() {
            if discovery.local_addr().is_some() {
                count += 1;
            }
        }
        if let Some(turn) = self.inner.turn.lock().await.as_ref() {
            if turn.is_connected() {
                count += 1;
            }
        }
        count
    }
}
