//! TURN client
//!
//! Allocates a relayed transport address using long-term credentials. The
//! first Allocate goes out unauthenticated; the server's 401 supplies the
//! realm and nonce, and every later request is signed with
//! MESSAGE-INTEGRITY keyed by MD5("username:realm:password").
//!
//! Servers on port 443 are reached over TCP with a 2-byte length prefix per
//! message; every other port uses plain UDP datagrams. Errors are returned
//! to the caller as-is; this client never retries on its own.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{TurnError, TurnResult};
use crate::nat::message::{attr, long_term_key, message_type, StunMessage};

// TURN constants (avoiding magic numbers)
const TURN_TIMEOUT_SECS: u64 = 5;
const TCP_TRANSPORT_PORT: u16 = 443;
const DEFAULT_LIFETIME_SECS: u32 = 600;
const PROTOCOL_UDP: u8 = 17;
const UNAUTHORIZED: u16 = 401;
const STALE_NONCE: u16 = 438;
const MAX_DATAGRAM_SIZE: usize = 65_535;
const TCP_LENGTH_PREFIX_SIZE: usize = 2;
const TCP_READ_BUFFER_CAPACITY: usize = 4 * 1024;
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Default round-trip timeout
pub const TURN_TIMEOUT: Duration = Duration::from_secs(TURN_TIMEOUT_SECS);

/// TURN server and credentials
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Server as host:port
    pub server: String,
    /// Long-term credential username
    pub username: String,
    /// Long-term credential password
    pub password: String,
}

impl TurnConfig {
    /// Creates a TURN configuration
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Transport used to reach the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransportKind {
    /// Plain datagrams
    Udp,
    /// Stream with a 2-byte length prefix per message
    Tcp,
}

/// Selects the transport from the server port
pub fn transport_for_port(port: u16) -> TurnTransportKind {
    if port == TCP_TRANSPORT_PORT {
        TurnTransportKind::Tcp
    } else {
        TurnTransportKind::Udp
    }
}

/// Prefixes a message with its 2-byte big-endian length for TCP
pub fn frame_for_tcp(msg: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(TCP_LENGTH_PREFIX_SIZE + msg.len());
    framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

/// Splits one length-prefixed message off the front of `buffer`
///
/// Returns None until the whole message has arrived; partial bytes stay
/// buffered for the next call.
pub fn split_tcp_frame(buffer: &mut BytesMut) -> Option<Vec<u8>> {
    if buffer.len() < TCP_LENGTH_PREFIX_SIZE {
        return None;
    }
    let len = u16::from_be_bytes([buffer[0], buffer[1]]) as usize;
    if buffer.len() < TCP_LENGTH_PREFIX_SIZE + len {
        buffer.reserve(TCP_LENGTH_PREFIX_SIZE + len - buffer.len());
        return None;
    }
    buffer.advance(TCP_LENGTH_PREFIX_SIZE);
    Some(buffer.split_to(len).to_vec())
}

/// A relayed transport address held on the server
#[derive(Debug, Clone)]
pub struct TurnAllocation {
    /// Address peers send to
    pub relayed_address: SocketAddr,
    /// Our reflexive address as seen by the server
    pub mapped_address: Option<SocketAddr>,
    /// Granted lifetime
    pub lifetime: Duration,
    /// Peer IPs allowed to send through the relay
    pub permissions: HashSet<IpAddr>,
    refreshed_at: Instant,
}

impl TurnAllocation {
    /// How often the allocation should be refreshed (half its lifetime)
    pub fn refresh_interval(&self) -> Duration {
        (self.lifetime / 2).max(MIN_REFRESH_INTERVAL)
    }

    /// True once the lifetime has elapsed without a refresh
    pub fn is_expired(&self) -> bool {
        self.refreshed_at.elapsed() >= self.lifetime
    }

    /// True once half the lifetime has elapsed
    pub fn needs_refresh(&self) -> bool {
        self.refreshed_at.elapsed() >= self.refresh_interval()
    }

    /// Checks whether a permission exists for a peer address
    pub fn has_permission(&self, peer: &SocketAddr) -> bool {
        self.permissions.contains(&peer.ip())
    }
}

/// Realm/nonce state learned from the server's challenge
struct Credentials {
    username: String,
    realm: String,
    nonce: String,
    key: [u8; 16],
}

enum Transport {
    Udp { socket: UdpSocket, server: SocketAddr },
    Tcp { stream: TcpStream, buffer: BytesMut },
}

impl Transport {
    async fn send(&mut self, msg: &[u8]) -> TurnResult<()> {
        match self {
            Transport::Udp { socket, server } => {
                socket.send_to(msg, *server).await?;
            }
            Transport::Tcp { stream, .. } => {
                stream.write_all(&frame_for_tcp(msg)).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    /// Receives one message from the server
    ///
    /// Cancel safe: a TCP message cut short by a timeout stays in the read
    /// buffer and completes on the next call.
    async fn recv(&mut self) -> TurnResult<Vec<u8>> {
        match self {
            Transport::Udp { socket, server } => {
                let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    let (len, from) = socket.recv_from(&mut buffer).await?;
                    if from == *server {
                        buffer.truncate(len);
                        return Ok(buffer);
                    }
                    debug!("Ignoring datagram from {}", from);
                }
            }
            Transport::Tcp { stream, buffer } => loop {
                if let Some(msg) = split_tcp_frame(buffer) {
                    return Ok(msg);
                }
                if stream.read_buf(buffer).await? == 0 {
                    return Err(TurnError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            },
        }
    }
}

/// Client for one TURN server
pub struct TurnClient {
    config: TurnConfig,
    transport_kind: Option<TurnTransportKind>,
    transport: Option<Transport>,
    credentials: Option<Credentials>,
    allocation: Option<TurnAllocation>,
    pending_data: VecDeque<(SocketAddr, Vec<u8>)>,
    timeout: Duration,
}

impl TurnClient {
    /// Creates a client; no socket is opened until `connect`
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            transport_kind: None,
            transport: None,
            credentials: None,
            allocation: None,
            pending_data: VecDeque::new(),
            timeout: TURN_TIMEOUT,
        }
    }

    /// Sets the round-trip timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the port-based transport selection
    pub fn with_transport(mut self, kind: TurnTransportKind) -> Self {
        self.transport_kind = Some(kind);
        self
    }

    /// Returns true while the transport is open
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Current allocation, if any
    pub fn allocation(&self) -> Option<&TurnAllocation> {
        self.allocation.as_ref()
    }

    /// Opens the transport to the server
    pub async fn connect(&mut self) -> TurnResult<()> {
        let server = tokio::net::lookup_host(&self.config.server)
            .await
            .map_err(|_| TurnError::Resolve(self.config.server.clone()))?
            .next()
            .ok_or_else(|| TurnError::Resolve(self.config.server.clone()))?;

        let kind = self
            .transport_kind
            .unwrap_or_else(|| transport_for_port(server.port()));

        let transport = match kind {
            TurnTransportKind::Udp => {
                let bind_addr: SocketAddr = if server.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(bind_addr).await?;
                Transport::Udp { socket, server }
            }
            TurnTransportKind::Tcp => {
                let stream = timeout(self.timeout, TcpStream::connect(server))
                    .await
                    .map_err(|_| TurnError::Timeout(self.timeout))??;
                Transport::Tcp {
                    stream,
                    buffer: BytesMut::with_capacity(TCP_READ_BUFFER_CAPACITY),
                }
            }
        };

        info!("Connected to TURN server {} over {:?}", server, kind);
        self.transport = Some(transport);
        Ok(())
    }

    /// Allocates a relayed address
    pub async fn allocate(&mut self) -> TurnResult<TurnAllocation> {
        let mut request = StunMessage::new(message_type::ALLOCATE_REQUEST);
        request.add_attribute(attr::REQUESTED_TRANSPORT, vec![PROTOCOL_UDP, 0, 0, 0]);

        let mut response = self.transact(&request, request.encode()).await?;

        if response.message_type == message_type::ALLOCATE_ERROR {
            let (code, reason) = decode_error(&response);
            if code != UNAUTHORIZED && code != STALE_NONCE {
                return Err(TurnError::ErrorResponse { code, reason });
            }
            self.learn_credentials(&response)?;

            let mut request = StunMessage::new(message_type::ALLOCATE_REQUEST);
            request.add_attribute(attr::REQUESTED_TRANSPORT, vec![PROTOCOL_UDP, 0, 0, 0]);
            let signed = self.sign(&mut request)?;
            response = self.transact(&request, signed).await?;
        }

        match response.message_type {
            message_type::ALLOCATE_RESPONSE => {
                let relayed_address = response
                    .xor_address(attr::XOR_RELAYED_ADDRESS)
                    .ok_or(TurnError::MissingAttribute("XOR-RELAYED-ADDRESS"))?;
                let lifetime = response.lifetime().unwrap_or(DEFAULT_LIFETIME_SECS);

                let allocation = TurnAllocation {
                    relayed_address,
                    mapped_address: response.xor_address(attr::XOR_MAPPED_ADDRESS),
                    lifetime: Duration::from_secs(lifetime as u64),
                    permissions: HashSet::new(),
                    refreshed_at: Instant::now(),
                };
                info!(
                    "TURN allocation {} granted for {}s",
                    relayed_address, lifetime
                );
                self.allocation = Some(allocation.clone());
                Ok(allocation)
            }
            message_type::ALLOCATE_ERROR => {
                self.update_nonce(&response);
                let (code, reason) = decode_error(&response);
                Err(TurnError::ErrorResponse { code, reason })
            }
            other => Err(TurnError::InvalidResponse(format!(
                "unexpected message type 0x{:04x} to Allocate",
                other
            ))),
        }
    }

    /// Installs a permission so `peer` may exchange data through the relay
    pub async fn create_permission(&mut self, peer: SocketAddr) -> TurnResult<()> {
        if self.allocation.is_none() {
            return Err(TurnError::NoAllocation);
        }

        let mut request = StunMessage::new(message_type::CREATE_PERMISSION_REQUEST);
        request.add_xor_address(attr::XOR_PEER_ADDRESS, peer);
        let signed = self.sign(&mut request)?;
        let response = self.transact(&request, signed).await?;

        match response.message_type {
            message_type::CREATE_PERMISSION_RESPONSE => {
                if let Some(allocation) = self.allocation.as_mut() {
                    allocation.permissions.insert(peer.ip());
                }
                debug!("TURN permission installed for {}", peer.ip());
                Ok(())
            }
            message_type::CREATE_PERMISSION_ERROR => {
                self.update_nonce(&response);
                let (code, reason) = decode_error(&response);
                Err(TurnError::ErrorResponse { code, reason })
            }
            other => Err(TurnError::InvalidResponse(format!(
                "unexpected message type 0x{:04x} to CreatePermission",
                other
            ))),
        }
    }

    /// Sends data to a peer inside a Send Indication
    pub async fn send_data(&mut self, data: &[u8], peer: SocketAddr) -> TurnResult<()> {
        let allocation = self.allocation.as_ref().ok_or(TurnError::NoAllocation)?;
        if !allocation.has_permission(&peer) {
            return Err(TurnError::PermissionMissing(peer.ip()));
        }

        let mut indication = StunMessage::new(message_type::SEND_INDICATION);
        indication.add_xor_address(attr::XOR_PEER_ADDRESS, peer);
        indication.add_attribute(attr::DATA, data.to_vec());

        let transport = self.transport.as_mut().ok_or(TurnError::NotConnected)?;
        transport.send(&indication.encode()).await
    }

    /// Waits up to `wait` for a Data Indication from any permitted peer
    pub async fn receive_data(&mut self, wait: Duration) -> TurnResult<Option<(SocketAddr, Vec<u8>)>> {
        if let Some(pending) = self.pending_data.pop_front() {
            return Ok(Some(pending));
        }

        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let transport = self.transport.as_mut().ok_or(TurnError::NotConnected)?;
            let raw = match timeout(remaining, transport.recv()).await {
                Ok(raw) => raw?,
                Err(_) => return Ok(None),
            };

            match StunMessage::decode(&raw) {
                Ok(msg) => {
                    if let Some(data) = parse_data_indication(&msg) {
                        return Ok(Some(data));
                    }
                    debug!("Ignoring TURN message 0x{:04x}", msg.message_type);
                }
                Err(e) => debug!("Ignoring undecodable TURN message: {}", e),
            }
        }
    }

    /// Refreshes the allocation; `Some(0)` releases it
    pub async fn refresh(&mut self, lifetime: Option<u32>) -> TurnResult<Duration> {
        if self.allocation.is_none() {
            return Err(TurnError::NoAllocation);
        }

        let mut request = StunMessage::new(message_type::REFRESH_REQUEST);
        if let Some(lifetime) = lifetime {
            request.add_attribute(attr::LIFETIME, lifetime.to_be_bytes().to_vec());
        }
        let signed = self.sign(&mut request)?;
        let response = self.transact(&request, signed).await?;

        match response.message_type {
            message_type::REFRESH_RESPONSE => {
                let granted = Duration::from_secs(
                    response
                        .lifetime()
                        .or(lifetime)
                        .unwrap_or(DEFAULT_LIFETIME_SECS) as u64,
                );
                if granted.is_zero() {
                    self.allocation = None;
                    info!("TURN allocation released");
                } else if let Some(allocation) = self.allocation.as_mut() {
                    allocation.lifetime = granted;
                    allocation.refreshed_at = Instant::now();
                    debug!("TURN allocation refreshed for {:?}", granted);
                }
                Ok(granted)
            }
            message_type::REFRESH_ERROR => {
                self.update_nonce(&response);
                let (code, reason) = decode_error(&response);
                Err(TurnError::ErrorResponse { code, reason })
            }
            other => Err(TurnError::InvalidResponse(format!(
                "unexpected message type 0x{:04x} to Refresh",
                other
            ))),
        }
    }

    /// Releases the allocation and the transport
    pub async fn close(&mut self) {
        if self.allocation.is_some() && self.transport.is_some() {
            if let Err(e) = self.refresh(Some(0)).await {
                warn!("Failed to release TURN allocation: {}", e);
            }
        }
        self.allocation = None;
        self.credentials = None;
        self.transport = None;
        self.pending_data.clear();
    }

    fn learn_credentials(&mut self, challenge: &StunMessage) -> TurnResult<()> {
        let realm = challenge
            .string_attribute(attr::REALM)
            .ok_or(TurnError::MissingAttribute("REALM"))?;
        let nonce = challenge
            .string_attribute(attr::NONCE)
            .ok_or(TurnError::MissingAttribute("NONCE"))?;

        let key = long_term_key(&self.config.username, &realm, &self.config.password);
        self.credentials = Some(Credentials {
            username: self.config.username.clone(),
            realm,
            nonce,
            key,
        });
        Ok(())
    }

    fn update_nonce(&mut self, response: &StunMessage) {
        if let (Some(credentials), Some(nonce)) = (
            self.credentials.as_mut(),
            response.string_attribute(attr::NONCE),
        ) {
            credentials.nonce = nonce;
        }
    }

    /// Adds credential attributes and MESSAGE-INTEGRITY when authenticated
    fn sign(&self, request: &mut StunMessage) -> TurnResult<Vec<u8>> {
        match &self.credentials {
            Some(credentials) => {
                request
                    .add_attribute(attr::USERNAME, credentials.username.as_bytes().to_vec())
                    .add_attribute(attr::REALM, credentials.realm.as_bytes().to_vec())
                    .add_attribute(attr::NONCE, credentials.nonce.as_bytes().to_vec());
                Ok(request.encode_with_integrity(&credentials.key)?)
            }
            None => Ok(request.encode()),
        }
    }

    /// Sends a request and waits for the response with the same transaction id
    async fn transact(&mut self, request: &StunMessage, bytes: Vec<u8>) -> TurnResult<StunMessage> {
        let round_trip = self.timeout;
        let transport = self.transport.as_mut().ok_or(TurnError::NotConnected)?;
        transport.send(&bytes).await?;

        let deadline = Instant::now() + round_trip;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let raw = timeout(remaining, transport.recv())
                .await
                .map_err(|_| TurnError::Timeout(round_trip))??;

            let msg = match StunMessage::decode(&raw) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Ignoring undecodable TURN message: {}", e);
                    continue;
                }
            };
            if msg.matches(&request.transaction_id) {
                return Ok(msg);
            }
            if let Some(data) = parse_data_indication(&msg) {
                self.pending_data.push_back(data);
            }
        }
    }
}

fn decode_error(response: &StunMessage) -> (u16, String) {
    response
        .error_code()
        .unwrap_or((0, "error response without ERROR-CODE".to_string()))
}

fn parse_data_indication(msg: &StunMessage) -> Option<(SocketAddr, Vec<u8>)> {
    if msg.message_type != message_type::DATA_INDICATION {
        return None;
    }
    let peer = msg.xor_address(attr::XOR_PEER_ADDRESS)?;
    let data = msg.attribute(attr::DATA)?.to_vec();
    Some((peer, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::message::{encode_error_code, HEADER_SIZE};
    use hmac::{Hmac, Mac};
    use sha1::Sha1;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    const REALM: &str = "example.org";
    const NONCE: &str = "nonce-1";
    const RELAYED: &str = "198.51.100.20:49152";

    #[derive(Default)]
    struct ServerLog {
        sent: Vec<(SocketAddr, Vec<u8>)>,
        refreshes: Vec<Option<u32>>,
    }

    fn integrity_ok(raw: &[u8], key: &[u8]) -> bool {
        if raw.len() < HEADER_SIZE + 24 {
            return false;
        }
        let mi = raw.len() - 24;
        if u16::from_be_bytes([raw[mi], raw[mi + 1]]) != attr::MESSAGE_INTEGRITY {
            return false;
        }
        let mut mac = Hmac::<Sha1>::new_from_slice(key).unwrap();
        mac.update(&raw[..mi]);
        mac.verify_slice(&raw[mi + 4..]).is_ok()
    }

    fn respond(request: &StunMessage, raw: &[u8], from: SocketAddr, log: &mut ServerLog) -> Option<StunMessage> {
        let key = long_term_key("alice", REALM, "secret");
        let txn = request.transaction_id;
        let error = |kind: u16, code: u16, reason: &str| {
            let mut msg = StunMessage::with_transaction_id(kind, txn);
            msg.add_attribute(attr::ERROR_CODE, encode_error_code(code, reason))
                .add_attribute(attr::REALM, REALM.as_bytes().to_vec())
                .add_attribute(attr::NONCE, NONCE.as_bytes().to_vec());
            msg
        };

        match request.message_type {
            message_type::ALLOCATE_REQUEST => {
                if !integrity_ok(raw, &key) {
                    return Some(error(message_type::ALLOCATE_ERROR, 401, "Unauthorized"));
                }
                let mut ok = StunMessage::with_transaction_id(message_type::ALLOCATE_RESPONSE, txn);
                ok.add_xor_address(attr::XOR_RELAYED_ADDRESS, RELAYED.parse().unwrap())
                    .add_xor_address(attr::XOR_MAPPED_ADDRESS, from)
                    .add_attribute(attr::LIFETIME, 600u32.to_be_bytes().to_vec());
                Some(ok)
            }
            message_type::CREATE_PERMISSION_REQUEST => {
                if !integrity_ok(raw, &key) {
                    return Some(error(message_type::CREATE_PERMISSION_ERROR, 401, "Unauthorized"));
                }
                Some(StunMessage::with_transaction_id(
                    message_type::CREATE_PERMISSION_RESPONSE,
                    txn,
                ))
            }
            message_type::REFRESH_REQUEST => {
                let lifetime = request.lifetime();
                log.refreshes.push(lifetime);
                let mut ok = StunMessage::with_transaction_id(message_type::REFRESH_RESPONSE, txn);
                ok.add_attribute(
                    attr::LIFETIME,
                    lifetime.unwrap_or(600).to_be_bytes().to_vec(),
                );
                Some(ok)
            }
            message_type::SEND_INDICATION => {
                let peer = request.xor_address(attr::XOR_PEER_ADDRESS).unwrap();
                let data = request.attribute(attr::DATA).unwrap().to_vec();
                log.sent.push((peer, data.clone()));

                // Echo back as a Data Indication from the same peer
                let mut echo = StunMessage::new(message_type::DATA_INDICATION);
                echo.add_xor_address(attr::XOR_PEER_ADDRESS, peer)
                    .add_attribute(attr::DATA, data);
                Some(echo)
            }
            _ => None,
        }
    }

    async fn spawn_udp_server() -> (SocketAddr, Arc<Mutex<ServerLog>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let log = Arc::new(Mutex::new(ServerLog::default()));
        let server_log = log.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let request = StunMessage::decode(&buf[..len]).unwrap();
                let reply = respond(&request, &buf[..len], from, &mut *server_log.lock().await);
                if let Some(reply) = reply {
                    socket.send_to(&reply.encode(), from).await.unwrap();
                }
            }
        });

        (addr, log)
    }

    #[test]
    fn test_transport_selection() {
        assert_eq!(transport_for_port(443), TurnTransportKind::Tcp);
        assert_eq!(transport_for_port(3478), TurnTransportKind::Udp);
        assert_eq!(frame_for_tcp(&[1, 2, 3]), vec![0, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_allocate_with_challenge() {
        let (server, _) = spawn_udp_server().await;
        let mut client = TurnClient::new(TurnConfig::new(server.to_string(), "alice", "secret"));
        client.connect().await.unwrap();

        let allocation = client.allocate().await.unwrap();
        assert_eq!(allocation.relayed_address, RELAYED.parse().unwrap());
        assert_eq!(allocation.lifetime, Duration::from_secs(600));
        assert_eq!(allocation.refresh_interval(), Duration::from_secs(300));
        assert!(!allocation.needs_refresh());
    }

    #[tokio::test]
    async fn test_wrong_password_reports_error_code() {
        let (server, _) = spawn_udp_server().await;
        let mut client = TurnClient::new(TurnConfig::new(server.to_string(), "alice", "wrong"));
        client.connect().await.unwrap();

        match client.allocate().await {
            Err(TurnError::ErrorResponse { code, reason }) => {
                assert_eq!(code, 401);
                assert_eq!(reason, "Unauthorized");
            }
            other => panic!("expected 401, got {:?}", other.map(|a| a.relayed_address)),
        }
    }

    #[tokio::test]
    async fn test_permission_required_before_send() {
        let (server, log) = spawn_udp_server().await;
        let mut client = TurnClient::new(TurnConfig::new(server.to_string(), "alice", "secret"));
        client.connect().await.unwrap();

        let peer: SocketAddr = "203.0.113.9:7000".parse().unwrap();
        assert!(matches!(
            client.create_permission(peer).await,
            Err(TurnError::NoAllocation)
        ));

        client.allocate().await.unwrap();
        assert!(matches!(
            client.send_data(b"hello", peer).await,
            Err(TurnError::PermissionMissing(_))
        ));

        client.create_permission(peer).await.unwrap();
        client.send_data(b"hello", peer).await.unwrap();

        let (from, data) = client
            .receive_data(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, peer);
        assert_eq!(data, b"hello");
        assert_eq!(log.lock().await.sent, vec![(peer, b"hello".to_vec())]);
    }

    #[tokio::test]
    async fn test_refresh_and_release() {
        let (server, log) = spawn_udp_server().await;
        let mut client = TurnClient::new(TurnConfig::new(server.to_string(), "alice", "secret"));
        client.connect().await.unwrap();
        client.allocate().await.unwrap();

        let granted = client.refresh(None).await.unwrap();
        assert_eq!(granted, Duration::from_secs(600));

        client.close().await;
        assert!(client.allocation().is_none());
        assert_eq!(log.lock().await.refreshes, vec![None, Some(0)]);
    }

    #[tokio::test]
    async fn test_tcp_transport_framing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, from) = listener.accept().await.unwrap();
            let mut log = ServerLog::default();
            loop {
                let mut len = [0u8; 2];
                if stream.read_exact(&mut len).await.is_err() {
                    break;
                }
                let mut raw = vec![0u8; u16::from_be_bytes(len) as usize];
                stream.read_exact(&mut raw).await.unwrap();
                let request = StunMessage::decode(&raw).unwrap();
                if let Some(reply) = respond(&request, &raw, from, &mut log) {
                    stream.write_all(&frame_for_tcp(&reply.encode())).await.unwrap();
                }
            }
        });

        let mut client = TurnClient::new(TurnConfig::new(addr.to_string(), "alice", "secret"))
            .with_transport(TurnTransportKind::Tcp);
        client.connect().await.unwrap();
        let allocation = client.allocate().await.unwrap();
        assert_eq!(allocation.relayed_address, RELAYED.parse().unwrap());
    }

    #[test]
    fn test_split_tcp_frame_waits_for_whole_message() {
        let framed = frame_for_tcp(&[7, 8, 9]);
        let mut buffer = BytesMut::from(&framed[..1]);
        assert_eq!(split_tcp_frame(&mut buffer), None);
        buffer.extend_from_slice(&framed[1..4]);
        assert_eq!(split_tcp_frame(&mut buffer), None);
        assert_eq!(buffer.len(), 4);

        buffer.extend_from_slice(&framed[4..]);
        buffer.extend_from_slice(&frame_for_tcp(&[1]));
        assert_eq!(split_tcp_frame(&mut buffer), Some(vec![7, 8, 9]));
        assert_eq!(split_tcp_frame(&mut buffer), Some(vec![1]));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_receive_survives_timeout_mid_message() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer: SocketAddr = "203.0.113.9:7000".parse().unwrap();

        let indication = |data: &[u8]| {
            let mut msg = StunMessage::new(message_type::DATA_INDICATION);
            msg.add_xor_address(attr::XOR_PEER_ADDRESS, peer)
                .add_attribute(attr::DATA, data.to_vec());
            frame_for_tcp(&msg.encode())
        };
        let first = indication(b"first");
        let second = indication(b"second");

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&first[..10]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            stream.write_all(&first[10..]).await.unwrap();
            stream.write_all(&second).await.unwrap();
            // Hold the stream open until the client is done
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = TurnClient::new(TurnConfig::new(addr.to_string(), "alice", "secret"))
            .with_transport(TurnTransportKind::Tcp);
        client.connect().await.unwrap();

        assert!(client
            .receive_data(Duration::from_millis(100))
            .await
            .unwrap()
            .is_none());
        let (from, data) = client
            .receive_data(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, peer);
        assert_eq!(data, b"first");
        let (_, data) = client
            .receive_data(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"second");
    }

    #[tokio::test]
    async fn test_undecodable_datagram_is_skipped() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();

            socket.send_to(b"not a stun message", from).await.unwrap();
            let mut ok = StunMessage::with_transaction_id(
                message_type::ALLOCATE_RESPONSE,
                request.transaction_id,
            );
            ok.add_xor_address(attr::XOR_RELAYED_ADDRESS, RELAYED.parse().unwrap())
                .add_attribute(attr::LIFETIME, 600u32.to_be_bytes().to_vec());
            socket.send_to(&ok.encode(), from).await.unwrap();
        });

        let mut client = TurnClient::new(TurnConfig::new(addr.to_string(), "alice", "secret"))
            .with_timeout(Duration::from_secs(2));
        client.connect().await.unwrap();
        let allocation = client.allocate().await.unwrap();
        assert_eq!(allocation.relayed_address, RELAYED.parse().unwrap());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = TurnClient::new(TurnConfig::new(
            silent.local_addr().unwrap().to_string(),
            "alice",
            "secret",
        ))
        .with_timeout(Duration::from_millis(100));
        client.connect().await.unwrap();
        assert!(matches!(client.allocate().await, Err(TurnError::Timeout(_))));
    }
}
