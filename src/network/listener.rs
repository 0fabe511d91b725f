//! Connection listener and authentication handshake
//!
//! This module handles connection establishment at the socket level:
//! - Binding the listening socket, probing upward when the port is taken
//! - Accepting inbound connections and requiring `auth` as the first frame
//! - Dialing peers and waiting for a matching `auth_reply`
//!
//! Unauthenticated sockets never reach the peer table. An inbound socket
//! that does not authenticate within the grace period is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::network::codec::{FrameCodec, FrameReader, FrameWriter};
use crate::network::protocol::WireMessage;

// Handshake constants (avoiding magic numbers)
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Grace period for the first frame on an inbound socket
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS);

/// Direct TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS);

/// A socket whose remote side has proven its peer id
pub struct AuthenticatedStream {
    /// Remote peer identifier
    pub peer_id: String,
    /// Remote display name, if sent
    pub username: Option<String>,
    /// Port the remote accepts connections on, if it listens
    pub listen_port: Option<u16>,
    /// Socket peer address
    pub remote_addr: SocketAddr,
    /// Read half, framed
    pub reader: FrameReader<OwnedReadHalf>,
    /// Write half, framed
    pub writer: FrameWriter<OwnedWriteHalf>,
}

/// Binds a listener on `base`, trying the next ports when it is taken
///
/// Port 0 asks the OS for an ephemeral port and is never probed.
pub async fn bind_with_probe(base: u16, attempts: u16) -> NetworkResult<TcpListener> {
    if base == 0 {
        return Ok(TcpListener::bind(("0.0.0.0", 0)).await?);
    }

    for offset in 0..attempts.max(1) {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                if offset > 0 {
                    info!("Port {} was taken, listening on {}", base, port);
                }
                return Ok(listener);
            }
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }

    Err(NetworkError::PortUnavailable { base, attempts })
}

/// Local identity and limits used on both sides of the handshake
#[derive(Debug, Clone)]
pub struct Handshake {
    local_peer_id: String,
    username: Option<String>,
    codec: FrameCodec,
    auth_timeout: Duration,
    connect_timeout: Duration,
}

impl Handshake {
    /// Creates a handshake for the local peer
    pub fn new(local_peer_id: impl Into<String>, username: Option<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            username,
            codec: FrameCodec::default(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the frame codec
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the grace period for authentication frames
    pub fn with_auth_timeout(mut self, auth_timeout: Duration) -> Self {
        self.auth_timeout = auth_timeout;
        self
    }

    /// Sets the TCP connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Local peer identifier
    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Authenticates an accepted socket
    ///
    /// The first frame must be `auth`; anything else, or silence past the
    /// grace period, rejects the socket.
    pub async fn accept(&self, stream: TcpStream) -> NetworkResult<AuthenticatedStream> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read, self.codec);
        let mut writer = FrameWriter::new(write, self.codec);

        let frame = timeout(self.auth_timeout, reader.read_frame())
            .await
            .map_err(|_| NetworkError::Timeout(self.auth_timeout))??;

        let (peer_id, username, listen_port) = match WireMessage::decode(&frame)? {
            WireMessage::Auth {
                peer_id,
                username,
                listen_port,
                ..
            } => (peer_id, username, listen_port),
            other => {
                return Err(NetworkError::AuthenticationFailed(format!(
                    "expected auth from {}, got {}",
                    remote_addr,
                    other.message_type()
                )));
            }
        };

        if peer_id.is_empty() || peer_id == self.local_peer_id {
            return Err(NetworkError::AuthenticationFailed(format!(
                "invalid peer id {:?} from {}",
                peer_id, remote_addr
            )));
        }

        writer
            .send(&WireMessage::auth_reply(
                self.local_peer_id.clone(),
                self.username.clone(),
            ))
            .await?;

        debug!("Authenticated inbound peer {} from {}", peer_id, remote_addr);
        Ok(AuthenticatedStream {
            peer_id,
            username,
            listen_port,
            remote_addr,
            reader,
            writer,
        })
    }

    /// Dials `addr` and authenticates as the local peer
    ///
    /// The reply must name `expected_peer_id`.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        expected_peer_id: &str,
        listen_port: Option<u16>,
    ) -> NetworkResult<AuthenticatedStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(self.connect_timeout))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read, self.codec);
        let mut writer = FrameWriter::new(write, self.codec);

        writer
            .send(&WireMessage::auth(
                self.local_peer_id.clone(),
                self.username.clone(),
                listen_port,
            ))
            .await?;

        let frame = timeout(self.auth_timeout, reader.read_frame())
            .await
            .map_err(|_| NetworkError::Timeout(self.auth_timeout))??;

        match WireMessage::decode(&frame)? {
            WireMessage::AuthReply {
                peer_id, username, ..
            } if peer_id == expected_peer_id => Ok(AuthenticatedStream {
                peer_id,
                username,
                listen_port: Some(addr.port()),
                remote_addr: addr,
                reader,
                writer,
            }),
            WireMessage::AuthReply { peer_id, .. } => Err(NetworkError::AuthenticationFailed(
                format!("{} answered as {}, expected {}", addr, peer_id, expected_peer_id),
            )),
            other => Err(NetworkError::AuthenticationFailed(format!(
                "expected auth_reply from {}, got {}",
                addr,
                other.message_type()
            ))),
        }
    }
}

/// Accept loop for inbound peer connections
pub struct ConnectionListener {
    listener: TcpListener,
    handshake: Arc<Handshake>,
    running: Arc<AtomicBool>,
}

impl ConnectionListener {
    /// Creates a listener around a bound socket
    pub fn new(listener: TcpListener, handshake: Arc<Handshake>) -> Self {
        Self {
            listener,
            handshake,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the loop at its next iteration when cleared
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Local address of the listening socket
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts sockets until stopped, forwarding authenticated ones
    ///
    /// Handshakes run concurrently and are cancelled with the loop.
    pub async fn run(self, admitted: mpsc::UnboundedSender<AuthenticatedStream>) {
        self.running.store(true, Ordering::SeqCst);
        info!("Connection listener started on {:?}", self.listener.local_addr().ok());

        let mut handshakes = JoinSet::new();

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!("Accepted socket from {}", remote_addr);
                        let handshake = self.handshake.clone();
                        let admitted = admitted.clone();
                        handshakes.spawn(async move {
                            match handshake.accept(stream).await {
                                Ok(peer) => {
                                    if admitted.send(peer).is_err() {
                                        debug!("Admission channel closed, dropping {}", remote_addr);
                                    }
                                }
                                Err(e) => warn!("Rejected connection from {}: {}", remote_addr, e),
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            }
        }

        handshakes.shutdown().await;
        info!("Connection listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_listener(local: &str) -> (SocketAddr, mpsc::UnboundedReceiver<AuthenticatedStream>) {
        let listener = bind_with_probe(0, 1).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handshake = Arc::new(
            Handshake::new(local, Some("Host".to_string()))
                .with_auth_timeout(Duration::from_millis(200)),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(ConnectionListener::new(listener, handshake).run(tx));
        (SocketAddr::from(([127, 0, 0, 1], port)), rx)
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let (addr, mut admitted) = spawn_listener("host").await;
        let dialer = Handshake::new("guest", None);

        let outbound = dialer.dial(addr, "host", Some(9000)).await.unwrap();
        assert_eq!(outbound.peer_id, "host");
        assert_eq!(outbound.username.as_deref(), Some("Host"));

        let inbound = admitted.recv().await.unwrap();
        assert_eq!(inbound.peer_id, "guest");
        assert_eq!(inbound.listen_port, Some(9000));
    }

    #[tokio::test]
    async fn test_dial_rejects_wrong_peer_id() {
        let (addr, _admitted) = spawn_listener("host").await;
        let dialer = Handshake::new("guest", None);

        let result = dialer.dial(addr, "someone-else", None).await;
        assert!(matches!(result, Err(NetworkError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_non_auth_first_frame_rejected() {
        let (addr, mut admitted) = spawn_listener("host").await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let mut writer = FrameWriter::new(write, FrameCodec::default());
        writer
            .send(&WireMessage::message("guest", "host", "hi", None))
            .await
            .unwrap();

        let mut reader = FrameReader::new(read, FrameCodec::default());
        assert!(reader.read_frame().await.is_err());
        assert!(admitted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_silent_socket_dropped_after_grace_period() {
        let (addr, mut admitted) = spawn_listener("host").await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = FrameReader::new(stream, FrameCodec::default());
        let closed = timeout(Duration::from_secs(2), reader.read_frame()).await;

        assert!(matches!(closed, Ok(Err(_))));
        assert!(admitted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_probe_skips_taken_port() {
        let taken = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let base = taken.local_addr().unwrap().port();

        match bind_with_probe(base, 5).await {
            Ok(listener) => assert_ne!(listener.local_addr().unwrap().port(), base),
            // The next ports may all be in use on a busy host
            Err(e) => assert!(matches!(e, NetworkError::PortUnavailable { .. })),
        }

        assert!(matches!(
            bind_with_probe(base, 1).await,
            Err(NetworkError::PortUnavailable { attempts: 1, .. })
        ));
    }
}
