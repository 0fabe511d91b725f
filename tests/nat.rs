//! Integration tests for NAT traversal through the connection manager
//!
//! Local UDP servers stand in for STUN and TURN servers so the full
//! startup, fallback and release paths run without network access.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerlink::nat::message::{attr, message_type, StunMessage};
use peerlink::nat::TurnConfig;
use peerlink::network::{ConnectionEvent, ConnectionManager, ManagerConfig, ReconnectPolicy};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers binding requests, reporting every client as 127.0.0.1
async fn spawn_stun_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let Ok(request) = StunMessage::decode(&buf[..len]) else {
                continue;
            };
            let mut response =
                StunMessage::with_transaction_id(message_type::BINDING_RESPONSE, request.transaction_id);
            response.add_xor_address(attr::XOR_MAPPED_ADDRESS, from);
            let _ = socket.send_to(&response.encode(), from).await;
        }
    });

    addr
}

#[derive(Default)]
struct TurnLog {
    allocations: AtomicUsize,
    refreshes: AtomicUsize,
    releases: AtomicUsize,
}

/// Grants allocations without a credential challenge
async fn spawn_turn_server(lifetime_secs: u32) -> (SocketAddr, Arc<TurnLog>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let log = Arc::new(TurnLog::default());
    let server_log = log.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let Ok(request) = StunMessage::decode(&buf[..len]) else {
                continue;
            };
            let response = match request.message_type {
                message_type::ALLOCATE_REQUEST => {
                    server_log.allocations.fetch_add(1, Ordering::SeqCst);
                    let mut response = StunMessage::with_transaction_id(
                        message_type::ALLOCATE_RESPONSE,
                        request.transaction_id,
                    );
                    response
                        .add_xor_address(attr::XOR_RELAYED_ADDRESS, SocketAddr::from(([198, 51, 100, 7], 49152)))
                        .add_xor_address(attr::XOR_MAPPED_ADDRESS, from)
                        .add_attribute(attr::LIFETIME, lifetime_secs.to_be_bytes().to_vec());
                    response
                }
                message_type::REFRESH_REQUEST => {
                    let lifetime = request.lifetime().unwrap_or(lifetime_secs);
                    if lifetime == 0 {
                        server_log.releases.fetch_add(1, Ordering::SeqCst);
                    } else {
                        server_log.refreshes.fetch_add(1, Ordering::SeqCst);
                    }
                    let mut response = StunMessage::with_transaction_id(
                        message_type::REFRESH_RESPONSE,
                        request.transaction_id,
                    );
                    response.add_attribute(attr::LIFETIME, lifetime.to_be_bytes().to_vec());
                    response
                }
                _ => continue,
            };
            let _ = socket.send_to(&response.encode(), from).await;
        }
    });

    (addr, log)
}

async fn wait_for<F>(events: &mut UnboundedReceiver<ConnectionEvent>, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_stun_bindings_reported_after_listener_ready() {
    let stun = spawn_stun_server().await;
    let manager = ConnectionManager::new(
        ManagerConfig::new("alice").with_stun_servers(vec![stun.to_string()]),
    );
    let mut events = manager.take_events().unwrap();
    manager.start(0).await.unwrap();

    // The listener is announced before STUN finishes
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::ListenerReady { .. }
    ));
    let event = wait_for(&mut events, |e| matches!(e, ConnectionEvent::StunCompleted { .. })).await;
    let ConnectionEvent::StunCompleted { bindings } = event else {
        unreachable!()
    };
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].mapped_address.ip(), Ipv4Addr::LOCALHOST);
    assert_eq!(bindings[0].server, stun.to_string());
    assert_eq!(manager.stun_bindings().len(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn test_unreachable_stun_server_yields_empty_bindings() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = ManagerConfig::new("alice")
        .with_stun_servers(vec![silent.local_addr().unwrap().to_string()]);
    config.stun_timeout = Duration::from_millis(100);
    let manager = ConnectionManager::new(config);
    let mut events = manager.take_events().unwrap();
    manager.start(0).await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, ConnectionEvent::StunCompleted { .. })).await;
    assert!(matches!(event, ConnectionEvent::StunCompleted { ref bindings } if bindings.is_empty()));
    assert!(manager.is_running());

    manager.stop().await;
}

#[tokio::test]
async fn test_falls_back_to_stun_mapped_address() {
    let stun = spawn_stun_server().await;
    let alice = ConnectionManager::new(
        ManagerConfig::new("alice")
            .with_stun_servers(vec![stun.to_string()])
            .with_connect_timeout(Duration::from_millis(200))
            .with_reconnect_policy(ReconnectPolicy::fixed(0, Duration::from_millis(50))),
    );
    let mut alice_events = alice.take_events().unwrap();
    alice.start(0).await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, ConnectionEvent::StunCompleted { .. })).await;

    let bob = ConnectionManager::new(ManagerConfig::new("bob"));
    let bob_port = bob.start(0).await.unwrap().port();

    // Documentation range, never routable; the mapped 127.0.0.1 candidate is
    let unroutable = SocketAddr::from(([192, 0, 2, 1], bob_port));
    assert!(alice.connect_to_peer("bob", unroutable).await);

    let info = alice.connection_info("bob").await.unwrap();
    let expected = SocketAddr::from((Ipv4Addr::LOCALHOST, bob_port));
    assert_eq!(info.public_addr, Some(expected));
    assert_eq!(info.local_addr, None);
    assert_eq!(alice.peer_address("bob").await, Some(expected));

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_turn_allocation_refreshed_and_released() {
    let (turn, log) = spawn_turn_server(2).await;
    let manager = ConnectionManager::new(
        ManagerConfig::new("alice").with_turn(TurnConfig::new(turn.to_string(), "user", "pass")),
    );
    let mut events = manager.take_events().unwrap();
    manager.start(0).await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, ConnectionEvent::RelayAllocated { .. })).await;
    let relayed = SocketAddr::from(([198, 51, 100, 7], 49152));
    assert!(matches!(
        event,
        ConnectionEvent::RelayAllocated { relayed_address } if relayed_address == relayed
    ));
    assert_eq!(manager.relay_allocation().unwrap().relayed_address, relayed);
    assert_eq!(log.allocations.load(Ordering::SeqCst), 1);

    // A 2s lifetime is refreshed every second
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(log.refreshes.load(Ordering::SeqCst) >= 1);
    assert!(manager.open_socket_count().await >= 2);

    manager.stop().await;
    assert_eq!(log.releases.load(Ordering::SeqCst), 1);
    assert!(manager.relay_allocation().is_none());
    assert_eq!(manager.open_socket_count().await, 0);
}
