//! Relay server
//!
//! Forwards opaque payloads between peers that cannot reach each other
//! directly. Each WebSocket client authenticates with an HMAC token, then
//! pairs with other registered peers. Data only flows between paired peers.
//!
//! The session table is a single map behind one mutex and every operation
//! on it is synchronous, so pairings stay symmetric under concurrent
//! connect, disconnect and timeout handling.
//!
//! Each client's outgoing frames go through a bounded queue. A client that
//! lets its queue fill up is closed with a policy violation.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::RelaySettings;
use crate::error::{RelayError, RelayResult};
use crate::relay::auth::verify_token;
use crate::relay::protocol::{RelayAuth, RelayEvent, RelayRequest};

// Relay constants (avoiding magic numbers)
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
const WRITER_DRAIN_TIMEOUT_SECS: u64 = 1;
const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(WRITER_DRAIN_TIMEOUT_SECS);

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared HMAC secret; empty accepts every token
    pub secret_key: String,
    /// Sessions silent for longer than this are closed
    pub heartbeat_timeout: Duration,
    /// How often sessions are checked for silence
    pub sweep_interval: Duration,
    /// How long a new client has to send its auth frame
    pub auth_timeout: Duration,
    /// Frames queued per client before it is closed
    pub send_queue_capacity: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}

impl RelayServerConfig {
    /// Builds the server config from the `[relay]` section
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            secret_key: settings.secret_key.clone(),
            heartbeat_timeout: Duration::from_secs(settings.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            send_queue_capacity: settings.send_queue_capacity.max(1),
        }
    }

    /// Config bound to loopback on an ephemeral port
    pub fn local(secret_key: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            secret_key: secret_key.into(),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }

    /// Sets the heartbeat timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the auth timeout
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Sets the per-client send queue capacity
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bounded queue feeding one client's socket writer
#[derive(Clone)]
struct Outbound {
    queue: mpsc::Sender<Message>,
    overflow: Arc<Notify>,
}

impl Outbound {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let outbound = Self {
            queue,
            overflow: Arc::new(Notify::new()),
        };
        (outbound, rx)
    }

    fn push(&self, message: Message) {
        match self.queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.overflow.notify_one(),
            // The writer is gone, so the session is already going away
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// One registered client
struct Session {
    serial: u64,
    outbound: Outbound,
    connected_peers: HashSet<String>,
    last_heartbeat: Instant,
}

impl Session {
    fn send(&self, event: &RelayEvent) {
        match event.encode() {
            Ok(text) => self.outbound.push(Message::Text(text)),
            Err(e) => error!("Failed to encode relay event: {}", e),
        }
    }

    fn close(&self, code: CloseCode, reason: &'static str) {
        self.outbound.push(close_message(code, reason));
    }
}

fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Session table shared by all connection handlers
#[derive(Default)]
struct RelayState {
    sessions: Mutex<HashMap<String, Session>>,
    next_serial: AtomicU64,
}

impl RelayState {
    fn register(&self, peer_id: &str, outbound: Outbound) -> RelayResult<u64> {
        let mut sessions = self.lock();
        if sessions.contains_key(peer_id) {
            return Err(RelayError::DuplicatePeer(peer_id.to_string()));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            peer_id.to_string(),
            Session {
                serial,
                outbound,
                connected_peers: HashSet::new(),
                last_heartbeat: Instant::now(),
            },
        );
        Ok(serial)
    }

    /// Removes a session if it is still the given registration
    fn unregister(&self, peer_id: &str, serial: u64) -> bool {
        let mut sessions = self.lock();
        if sessions.get(peer_id).map(|s| s.serial) != Some(serial) {
            return false;
        }
        Self::teardown(&mut sessions, peer_id);
        true
    }

    fn touch(&self, peer_id: &str, serial: u64) {
        if let Some(session) = self.lock().get_mut(peer_id) {
            if session.serial == serial {
                session.last_heartbeat = Instant::now();
            }
        }
    }

    fn handle_request(&self, peer_id: &str, request: RelayRequest) {
        let mut sessions = self.lock();

        match request {
            RelayRequest::Connect { target_id } => {
                if target_id == peer_id || !sessions.contains_key(&target_id) {
                    if let Some(session) = sessions.get(peer_id) {
                        session.send(&RelayEvent::ConnectResponse {
                            target_id,
                            success: false,
                            error: Some("Target peer not found".to_string()),
                        });
                    }
                    return;
                }

                if let Some(session) = sessions.get_mut(peer_id) {
                    session.connected_peers.insert(target_id.clone());
                    session.send(&RelayEvent::ConnectResponse {
                        target_id: target_id.clone(),
                        success: true,
                        error: None,
                    });
                }
                if let Some(target) = sessions.get_mut(&target_id) {
                    target.connected_peers.insert(peer_id.to_string());
                    target.send(&RelayEvent::PeerConnected {
                        peer_id: peer_id.to_string(),
                    });
                }
                info!("Paired {} with {}", peer_id, target_id);
            }
            RelayRequest::Disconnect { target_id } => {
                let was_paired = sessions
                    .get_mut(peer_id)
                    .map(|s| s.connected_peers.remove(&target_id))
                    .unwrap_or(false);
                if !was_paired {
                    debug!("{} asked to unpair from unpaired {}", peer_id, target_id);
                    return;
                }

                if let Some(target) = sessions.get_mut(&target_id) {
                    target.connected_peers.remove(peer_id);
                    target.send(&RelayEvent::PeerDisconnected {
                        peer_id: peer_id.to_string(),
                    });
                }
                info!("Unpaired {} from {}", peer_id, target_id);
            }
            RelayRequest::Data { target_id, data } => {
                let paired = sessions
                    .get(peer_id)
                    .map(|s| s.connected_peers.contains(&target_id))
                    .unwrap_or(false);
                if !paired {
                    warn!(
                        "Dropping data from {} to {}: peers are not paired",
                        peer_id, target_id
                    );
                    return;
                }

                match sessions.get(&target_id) {
                    Some(target) => target.send(&RelayEvent::Data {
                        peer_id: peer_id.to_string(),
                        data,
                    }),
                    None => warn!("Dropping data from {}: {} is gone", peer_id, target_id),
                }
            }
            RelayRequest::Heartbeat { .. } => {
                if let Some(session) = sessions.get(peer_id) {
                    session.send(&RelayEvent::heartbeat());
                }
            }
        }
    }

    /// Closes sessions silent for longer than `timeout`; returns their ids
    fn sweep(&self, timeout: Duration) -> Vec<String> {
        let mut sessions = self.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.last_heartbeat.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for peer_id in &expired {
            warn!("Relay session {} timed out", peer_id);
            if let Some(session) = Self::teardown(&mut sessions, peer_id) {
                session.close(CloseCode::Away, "heartbeat timeout");
            }
        }
        expired
    }

    /// Removes a session and unpairs it from everyone, notifying each once
    fn teardown(sessions: &mut HashMap<String, Session>, peer_id: &str) -> Option<Session> {
        let session = sessions.remove(peer_id)?;
        for other in &session.connected_peers {
            if let Some(peer) = sessions.get_mut(other) {
                peer.connected_peers.remove(peer_id);
                peer.send(&RelayEvent::PeerDisconnected {
                    peer_id: peer_id.to_string(),
                });
            }
        }
        info!("Relay session {} removed", peer_id);
        Some(session)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        // A poisoned map is still structurally valid
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// WebSocket relay server
pub struct RelayServer {
    config: RelayServerConfig,
    state: Arc<RelayState>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        Self {
            config,
            state: Arc::new(RelayState::default()),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds the listener and starts accepting and sweeping
    pub async fn start(&self) -> RelayResult<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        if let Ok(mut local) = self.local_addr.lock() {
            *local = Some(addr);
        }

        let accept = tokio::spawn(accept_loop(
            listener,
            self.state.clone(),
            self.running.clone(),
            self.config.clone(),
        ));
        let sweep = tokio::spawn(sweep_loop(
            self.state.clone(),
            self.config.sweep_interval,
            self.config.heartbeat_timeout,
        ));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(accept);
            tasks.push(sweep);
        }

        info!("Relay server listening on {}", addr);
        Ok(addr)
    }

    /// Stops accepting new clients and stops the sweep
    ///
    /// Live sessions keep running until their sockets close.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        if let Ok(mut local) = self.local_addr.lock() {
            *local = None;
        }
        info!("Relay server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.state.lock().contains_key(peer_id)
    }

    /// Peers paired with `peer_id`, if it is registered
    pub fn connected_peers_of(&self, peer_id: &str) -> Option<HashSet<String>> {
        self.state
            .lock()
            .get(peer_id)
            .map(|s| s.connected_peers.clone())
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<RelayState>,
    running: Arc<AtomicBool>,
    config: RelayServerConfig,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = state.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    handle_connection(state, config, stream, addr).await;
                });
            }
            Err(e) => {
                error!("Relay accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn sweep_loop(state: Arc<RelayState>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let expired = state.sweep(timeout);
        if !expired.is_empty() {
            debug!("Heartbeat sweep closed {} session(s)", expired.len());
        }
    }
}

async fn close_with(ws: &mut WebSocketStream<TcpStream>, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws.close(Some(frame)).await;
}

async fn read_auth(ws: &mut WebSocketStream<TcpStream>) -> RelayResult<RelayAuth> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(RelayAuth::decode(&text)?),
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8(data)
                    .map_err(|e| RelayError::Handshake(e.to_string()))?;
                return Ok(RelayAuth::decode(&text)?);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) | None => return Err(RelayError::Closed),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Drains a client's queue into its socket until the queue closes or overflows
async fn write_loop(
    mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut queue: mpsc::Receiver<Message>,
    overflow: Arc<Notify>,
    peer_id: String,
) {
    loop {
        let message = tokio::select! {
            message = queue.recv() => message,
            _ = overflow.notified() => {
                close_overflowed(&mut write, &peer_id).await;
                return;
            }
        };
        let Some(message) = message else {
            break;
        };

        // A client that stops reading blocks the send; overflow still ends it
        let closing = matches!(message, Message::Close(_));
        let overflowed = tokio::select! {
            result = write.send(message) => {
                if result.is_err() || closing {
                    break;
                }
                false
            }
            _ = overflow.notified() => true,
        };
        if overflowed {
            close_overflowed(&mut write, &peer_id).await;
            return;
        }
    }
    let _ = write.close().await;
}

async fn close_overflowed(write: &mut SplitSink<WebSocketStream<TcpStream>, Message>, peer_id: &str) {
    warn!("Send queue for {} is full, closing session", peer_id);
    let close = write.send(close_message(CloseCode::Policy, "send queue full"));
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, close).await.is_err() {
        debug!("Close frame to {} not delivered in time", peer_id);
    }
}

async fn handle_connection(
    state: Arc<RelayState>,
    config: RelayServerConfig,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let auth = match tokio::time::timeout(config.auth_timeout, read_auth(&mut ws)).await {
        Ok(Ok(auth)) => auth,
        Ok(Err(e)) => {
            warn!("Relay client {} sent no valid auth frame: {}", addr, e);
            close_with(&mut ws, CloseCode::Policy, "authentication required").await;
            return;
        }
        Err(_) => {
            warn!("Relay client {} did not authenticate in time", addr);
            close_with(&mut ws, CloseCode::Policy, "authentication timeout").await;
            return;
        }
    };

    if !verify_token(&config.secret_key, &auth.peer_id, auth.timestamp, &auth.token) {
        warn!("Rejected relay client {} claiming {}: bad token", addr, auth.peer_id);
        close_with(&mut ws, CloseCode::Policy, "authentication failed").await;
        return;
    }

    let (outbound, outbound_rx) = Outbound::new(config.send_queue_capacity);
    let overflow = outbound.overflow.clone();
    let peer_id = auth.peer_id;
    let serial = match state.register(&peer_id, outbound) {
        Ok(serial) => serial,
        Err(e) => {
            warn!("Rejected relay client {}: {}", addr, e);
            close_with(&mut ws, CloseCode::Policy, "peer id already in use").await;
            return;
        }
    };
    info!("Relay client {} registered as {}", addr, peer_id);

    let (write, mut read) = ws.split();
    let mut writer = tokio::spawn(write_loop(write, outbound_rx, overflow, peer_id.clone()));

    let mut writer_done = false;
    loop {
        tokio::select! {
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non-UTF-8 frame from {}", peer_id);
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        state.touch(&peer_id, serial);
                        continue;
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Relay client {} errored: {}", peer_id, e);
                        break;
                    }
                };

                state.touch(&peer_id, serial);
                match RelayRequest::decode(&text) {
                    Ok(request) => state.handle_request(&peer_id, request),
                    Err(e) => warn!("Invalid relay request from {}: {}", peer_id, e),
                }
            }
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    state.unregister(&peer_id, serial);
    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("Writer for {} did not drain in time", peer_id);
    }
    info!("Relay client {} ({}) disconnected", peer_id, addr);
}
