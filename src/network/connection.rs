//! Peer connections for PeerLink
//!
//! This module holds the per-peer state machine and the `PeerConnection`
//! handle stored in the peer table. A connection owns the write half of its
//! socket behind a mutex so frames from concurrent senders never interleave;
//! the read half lives in the connection's reader task.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::network::codec::FrameWriter;
use crate::network::protocol::WireMessage;

// Connection constants (avoiding magic numbers)
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
const CLOSE_TIMEOUT_MS: u64 = 1_000;

/// Heartbeat interval duration
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);

/// Silence longer than this tears a connection down
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2 * HEARTBEAT_INTERVAL_SECS);

/// Upper bound on closing one socket
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(CLOSE_TIMEOUT_MS);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No live connection and no retry pending
    Disconnected,
    /// An attempt is in flight
    Connecting,
    /// Authenticated and in the peer table
    Connected,
    /// Waiting for the next reconnection attempt
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

impl ConnectionState {
    /// Returns true if frames can be sent
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [ConnectionState] {
        match self {
            ConnectionState::Disconnected => &[ConnectionState::Connecting],
            ConnectionState::Connecting => &[
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Disconnected,
            ],
            ConnectionState::Connected => &[
                ConnectionState::Disconnected,
                ConnectionState::Reconnecting,
            ],
            ConnectionState::Reconnecting => &[
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
            ],
        }
    }

    /// Checks whether moving to `next` is allowed
    ///
    /// A peer can also be admitted directly from any state when it dials us.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        *self == next
            || next == ConnectionState::Connected
            || self.valid_transitions().contains(&next)
    }
}

/// Which side opened the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We dialed the peer
    Outbound,
    /// The peer dialed us
    Inbound,
}

/// Address that carried a successful outbound connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPath {
    /// The address the caller supplied
    Direct(SocketAddr),
    /// A candidate derived from a STUN-mapped address
    StunMapped(SocketAddr),
}

impl ConnectPath {
    /// The address that was dialed
    pub fn addr(&self) -> SocketAddr {
        match self {
            ConnectPath::Direct(addr) | ConnectPath::StunMapped(addr) => *addr,
        }
    }
}

/// Snapshot of a connection for reporting
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote peer identifier
    pub peer_id: String,
    /// Connection role
    pub role: ConnectionRole,
    /// Socket peer address
    pub remote_addr: SocketAddr,
    /// Set when the direct path succeeded or the peer dialed in
    pub local_addr: Option<SocketAddr>,
    /// Set when a STUN-derived address succeeded
    pub public_addr: Option<SocketAddr>,
    /// Time since the connection was admitted
    pub connected_for: Duration,
    /// Time since any traffic was seen
    pub idle_for: Duration,
}

/// One live, authenticated connection to a peer
pub struct PeerConnection {
    id: u64,
    peer_id: String,
    role: ConnectionRole,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    public_addr: Option<SocketAddr>,
    dial_addr: Option<SocketAddr>,
    writer: Mutex<Option<FrameWriter<OwnedWriteHalf>>>,
    last_heartbeat: StdMutex<Instant>,
    reader: StdMutex<Option<AbortHandle>>,
    closed: AtomicBool,
    connected_at: Instant,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerConnection {
    /// Creates a connection around an authenticated socket's write half
    pub fn new(
        peer_id: impl Into<String>,
        role: ConnectionRole,
        remote_addr: SocketAddr,
        writer: FrameWriter<OwnedWriteHalf>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_id: peer_id.into(),
            role,
            remote_addr,
            local_addr: None,
            public_addr: None,
            dial_addr: None,
            writer: Mutex::new(Some(writer)),
            last_heartbeat: StdMutex::new(now),
            reader: StdMutex::new(None),
            closed: AtomicBool::new(false),
            connected_at: now,
        }
    }

    /// Records the path used to reach the peer
    pub fn with_path(mut self, path: ConnectPath) -> Self {
        match path {
            ConnectPath::Direct(addr) => self.local_addr = Some(addr),
            ConnectPath::StunMapped(addr) => self.public_addr = Some(addr),
        }
        self
    }

    /// Records the address reconnection should dial
    pub fn with_dial_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.dial_addr = addr;
        self
    }

    /// Process-unique connection serial
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote peer identifier
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Connection role
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Socket peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Address to dial when reconnecting, if known
    pub fn dial_addr(&self) -> Option<SocketAddr> {
        self.dial_addr
    }

    /// Attaches the reader task so close can cancel it
    pub fn set_reader(&self, handle: AbortHandle) {
        if let Ok(mut reader) = self.reader.lock() {
            *reader = Some(handle);
        }
        // Close may have run before the reader was attached
        if self.is_closed() {
            self.abort_reader();
        }
    }

    /// Sends one message, serialized against other senders
    pub async fn send(&self, msg: &WireMessage) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::Disconnected(self.peer_id.clone()));
        }

        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| NetworkError::Disconnected(self.peer_id.clone()))?;
        writer.send(msg).await?;
        Ok(())
    }

    /// Time since the connection was admitted
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Records inbound traffic
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Instant::now();
        }
    }

    /// Time since inbound traffic was last seen
    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Checks if the peer has been silent for longer than `timeout`
    pub fn is_heartbeat_timeout(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    /// Returns true once close has started
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the connection closed without waiting on the socket
    ///
    /// Returns false if it was already closed. Used under the table lock so
    /// a replaced entry refuses new sends immediately.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Closes the socket exactly once
    ///
    /// Returns true for the call that performed the close.
    pub async fn close(&self) -> bool {
        let first = self.mark_closed();
        self.shutdown_socket().await;
        first
    }

    /// Cancels the reader and shuts the write half, bounded by `CLOSE_TIMEOUT`
    pub(crate) async fn shutdown_socket(&self) {
        self.abort_reader();

        let shutdown = async {
            let mut writer = self.writer.lock().await;
            if let Some(mut writer) = writer.take() {
                if let Err(e) = writer.shutdown().await {
                    debug!("Shutdown of {} failed: {}", self.peer_id, e);
                }
            }
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            warn!("Timed out closing connection to {}", self.peer_id);
        } else {
            debug!("Closed connection {} to {}", self.id, self.peer_id);
        }
    }

    /// Forgets the reader handle so a reader tearing down its own
    /// connection is not cancelled halfway through
    pub(crate) fn detach_reader(&self) {
        if let Ok(mut reader) = self.reader.lock() {
            reader.take();
        }
    }

    fn abort_reader(&self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }

    /// Returns a snapshot for reporting
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer_id: self.peer_id.clone(),
            role: self.role,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            public_addr: self.public_addr,
            connected_for: self.connected_for(),
            idle_for: self.idle_for(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::{FrameCodec, FrameReader};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_state_transitions() {
        assert!(ConnectionState::Disconnected.can_transition_to(ConnectionState::Connecting));
        assert!(ConnectionState::Connecting.can_transition_to(ConnectionState::Reconnecting));
        assert!(ConnectionState::Reconnecting.can_transition_to(ConnectionState::Connecting));
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Reconnecting));
        assert!(ConnectionState::Reconnecting.can_transition_to(ConnectionState::Connected));
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
    }

    #[tokio::test]
    async fn test_send_and_close_once() {
        let (client, server) = socket_pair().await;
        let remote = client.peer_addr().unwrap();
        let (_read, write) = client.into_split();

        let conn = PeerConnection::new(
            "bob",
            ConnectionRole::Outbound,
            remote,
            FrameWriter::new(write, FrameCodec::default()),
        )
        .with_path(ConnectPath::Direct(remote));

        conn.send(&WireMessage::Heartbeat).await.unwrap();

        let mut reader = FrameReader::new(server, FrameCodec::default());
        let received: WireMessage = reader.recv().await.unwrap();
        assert_eq!(received, WireMessage::Heartbeat);

        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert!(conn.is_closed());
        assert!(conn.send(&WireMessage::Heartbeat).await.is_err());
        assert_eq!(conn.info().local_addr, Some(remote));
    }

    #[tokio::test]
    async fn test_heartbeat_tracking() {
        let (client, _server) = socket_pair().await;
        let remote = client.peer_addr().unwrap();
        let (_read, write) = client.into_split();
        let conn = PeerConnection::new(
            "carol",
            ConnectionRole::Inbound,
            remote,
            FrameWriter::new(write, FrameCodec::default()),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(conn.is_heartbeat_timeout(Duration::from_millis(10)));
        conn.touch();
        assert!(!conn.is_heartbeat_timeout(Duration::from_secs(1)));
    }
}
