//! STUN client
//!
//! Discovers this host's server-reflexive address by sending a Binding
//! Request over UDP. A single server failing is never fatal: `get_binding`
//! logs and returns `None`, and `collect_bindings` moves on to the next
//! server in the list.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{StunError, StunResult};
use crate::nat::message::{message_type, StunMessage};

// STUN constants (avoiding magic numbers)
const STUN_TIMEOUT_MS: u64 = 2_000;
const MAX_DATAGRAM_SIZE: usize = 1_500;
const URI_SCHEME: &str = "stun:";

/// Default round-trip timeout
pub const STUN_TIMEOUT: Duration = Duration::from_millis(STUN_TIMEOUT_MS);

/// Bindings collected before the server list stops being consulted
pub const MAX_BINDINGS: usize = 2;

/// Result of one successful Binding transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunBindingResult {
    /// Local socket address used for the query
    pub local_address: SocketAddr,
    /// Address the server saw the request come from
    pub mapped_address: SocketAddr,
    /// Server that answered
    pub server: String,
}

/// Client for a single STUN server
pub struct StunClient {
    server: String,
    socket: Option<UdpSocket>,
    timeout: Duration,
}

impl StunClient {
    /// Creates a client for `host:port` (a `stun:` prefix is accepted)
    pub fn new(server: impl Into<String>) -> Self {
        let server = server.into();
        let server = server
            .strip_prefix(URI_SCHEME)
            .map(str::to_string)
            .unwrap_or(server);
        Self {
            server,
            socket: None,
            timeout: STUN_TIMEOUT,
        }
    }

    /// Sets the round-trip timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Server this client queries
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Binds a UDP socket on an ephemeral local port
    pub async fn connect(&mut self) -> StunResult<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        debug!("STUN socket bound to {}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    /// Local address of the bound socket
    pub fn local_addr(&self) -> StunResult<SocketAddr> {
        let socket = self.socket.as_ref().ok_or(StunError::NotConnected)?;
        Ok(socket.local_addr()?)
    }

    /// Performs one Binding transaction, reporting why it failed
    pub async fn query(&self) -> StunResult<StunBindingResult> {
        let socket = self.socket.as_ref().ok_or(StunError::NotConnected)?;
        let server_addr = self.resolve().await?;

        let request = StunMessage::new(message_type::BINDING_REQUEST);
        socket.send_to(&request.encode(), server_addr).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, from) = timeout(remaining, socket.recv_from(&mut buffer))
                .await
                .map_err(|_| StunError::Timeout(self.timeout))??;

            if from != server_addr {
                debug!("Ignoring datagram from unexpected source {}", from);
                continue;
            }

            let response = StunMessage::decode(&buffer[..len])?;
            if !response.matches(&request.transaction_id) {
                debug!("Ignoring STUN response for another transaction");
                continue;
            }

            return match response.message_type {
                message_type::BINDING_RESPONSE => {
                    let mapped_address =
                        response.mapped_address().ok_or(StunError::NoMappedAddress)?;
                    Ok(StunBindingResult {
                        local_address: socket.local_addr()?,
                        mapped_address,
                        server: self.server.clone(),
                    })
                }
                message_type::BINDING_ERROR => {
                    let (code, reason) = response
                        .error_code()
                        .unwrap_or((0, "unspecified".to_string()));
                    Err(StunError::InvalidResponse(format!(
                        "binding error {}: {}",
                        code, reason
                    )))
                }
                other => Err(StunError::InvalidResponse(format!(
                    "unexpected message type 0x{:04x}",
                    other
                ))),
            };
        }
    }

    /// Performs one Binding transaction, returning None on any failure
    pub async fn get_binding(&self) -> Option<StunBindingResult> {
        match self.query().await {
            Ok(result) => {
                debug!(
                    "STUN {} mapped {} -> {}",
                    result.server, result.local_address, result.mapped_address
                );
                Some(result)
            }
            Err(e) => {
                warn!("STUN query to {} failed: {}", self.server, e);
                None
            }
        }
    }

    /// Releases the socket
    pub fn close(&mut self) {
        self.socket = None;
    }

    async fn resolve(&self) -> StunResult<SocketAddr> {
        let mut addrs = tokio::net::lookup_host(&self.server)
            .await
            .map_err(|_| StunError::Resolve(self.server.clone()))?
            .collect::<Vec<_>>();
        // The socket is bound to an IPv4 wildcard
        addrs.sort_by_key(|addr| !addr.is_ipv4());
        addrs
            .into_iter()
            .next()
            .ok_or_else(|| StunError::Resolve(self.server.clone()))
    }
}

/// Queries servers in order until `max` bindings succeed
pub async fn collect_bindings(
    servers: &[String],
    max: usize,
    round_trip: Duration,
) -> Vec<StunBindingResult> {
    let mut results = Vec::new();

    for server in servers {
        if results.len() >= max {
            break;
        }

        let mut client = StunClient::new(server.as_str()).with_timeout(round_trip);
        if let Err(e) = client.connect().await {
            warn!("Could not open STUN socket for {}: {}", server, e);
            continue;
        }
        if let Some(result) = client.get_binding().await {
            results.push(result);
        }
        client.close();
    }

    info!(
        "Collected {} STUN binding(s) from {} server(s)",
        results.len(),
        servers.len()
    );
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::message::attr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Answers Binding Requests with the requester's address
    async fn spawn_stun_server() -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let request = StunMessage::decode(&buf[..len]).unwrap();
                let mut response = StunMessage::with_transaction_id(
                    message_type::BINDING_RESPONSE,
                    request.transaction_id,
                );
                response.add_xor_address(attr::XOR_MAPPED_ADDRESS, from);
                socket.send_to(&response.encode(), from).await.unwrap();
            }
        });

        (addr, requests)
    }

    #[test]
    fn test_scheme_prefix_stripped() {
        let client = StunClient::new("stun:stun.example.org:3478");
        assert_eq!(client.server(), "stun.example.org:3478");
    }

    #[tokio::test]
    async fn test_get_binding_against_local_server() {
        let (server, _) = spawn_stun_server().await;
        let mut client = StunClient::new(server.to_string());
        client.connect().await.unwrap();
        let port = client.local_addr().unwrap().port();

        let result = client.get_binding().await.unwrap();
        assert_eq!(result.mapped_address, SocketAddr::from(([127, 0, 0, 1], port)));
        assert_eq!(result.server, server.to_string());
        client.close();
        assert!(client.local_addr().is_err());
    }

    #[tokio::test]
    async fn test_silent_server_times_out_to_none() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = StunClient::new(silent.local_addr().unwrap().to_string())
            .with_timeout(Duration::from_millis(100));
        client.connect().await.unwrap();

        assert!(matches!(client.query().await, Err(StunError::Timeout(_))));
        assert!(client.get_binding().await.is_none());
    }

    #[tokio::test]
    async fn test_collect_stops_after_two() {
        let (first, _) = spawn_stun_server().await;
        let (second, _) = spawn_stun_server().await;
        let (third, third_requests) = spawn_stun_server().await;

        let servers = vec![
            "127.0.0.1:1".to_string(),
            first.to_string(),
            second.to_string(),
            third.to_string(),
        ];
        let results = collect_bindings(&servers, MAX_BINDINGS, Duration::from_millis(200)).await;

        assert_eq!(results.len(), 2);
        assert_eq!(third_requests.load(Ordering::SeqCst), 0);
    }
}
