//! Integration tests for the WebSocket relay
//!
//! A real relay server runs on loopback and clients talk to it over
//! WebSockets, both through `RelayClient` and through raw frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerlink::relay::{RelayAuth, RelayClient, RelayEvent, RelayServer, RelayServerConfig};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
};

const SECRET: &str = "relay-test-secret";
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_relay(config: RelayServerConfig) -> (RelayServer, String) {
    let server = RelayServer::new(config);
    let addr = server.start().await.unwrap();
    (server, format!("ws://{}", addr))
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Next event that is not a heartbeat echo
async fn next_event(events: &mut UnboundedReceiver<RelayEvent>) -> RelayEvent {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await.expect("relay event channel closed") {
                RelayEvent::Heartbeat { .. } => continue,
                event => return event,
            }
        }
    })
    .await
    .expect("timed out waiting for relay event")
}

async fn client(url: &str, server: &RelayServer, peer_id: &str) -> (RelayClient, UnboundedReceiver<RelayEvent>) {
    let client = RelayClient::connect(url, peer_id, SECRET).await.unwrap();
    let events = client.take_events().unwrap();
    wait_until(|| server.is_registered(peer_id)).await;
    (client, events)
}

#[tokio::test]
async fn test_pairing_and_forwarding() {
    let (server, url) = start_relay(RelayServerConfig::local(SECRET)).await;
    let (alice, mut alice_events) = client(&url, &server, "alice").await;
    let (bob, mut bob_events) = client(&url, &server, "bob").await;

    alice.connect_peer("bob").unwrap();
    assert_eq!(
        next_event(&mut alice_events).await,
        RelayEvent::ConnectResponse {
            target_id: "bob".to_string(),
            success: true,
            error: None,
        }
    );
    assert_eq!(
        next_event(&mut bob_events).await,
        RelayEvent::PeerConnected {
            peer_id: "alice".to_string()
        }
    );
    assert!(server.connected_peers_of("alice").unwrap().contains("bob"));
    assert!(server.connected_peers_of("bob").unwrap().contains("alice"));

    // Payloads are forwarded untouched, in both directions
    let payload = json!({"kind": "offer", "nested": {"n": [1, 2, 3]}});
    alice.send_data("bob", payload.clone()).unwrap();
    assert_eq!(
        next_event(&mut bob_events).await,
        RelayEvent::Data {
            peer_id: "alice".to_string(),
            data: payload,
        }
    );
    bob.send_data("alice", json!("pong")).unwrap();
    assert_eq!(
        next_event(&mut alice_events).await,
        RelayEvent::Data {
            peer_id: "bob".to_string(),
            data: json!("pong"),
        }
    );

    bob.disconnect_peer("alice").unwrap();
    assert_eq!(
        next_event(&mut alice_events).await,
        RelayEvent::PeerDisconnected {
            peer_id: "bob".to_string()
        }
    );
    assert!(server.connected_peers_of("alice").unwrap().is_empty());
    assert!(server.connected_peers_of("bob").unwrap().is_empty());

    alice.close().await;
    bob.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_to_unknown_peer_fails() {
    let (server, url) = start_relay(RelayServerConfig::local(SECRET)).await;
    let (alice, mut events) = client(&url, &server, "alice").await;

    alice.connect_peer("nobody").unwrap();
    match next_event(&mut events).await {
        RelayEvent::ConnectResponse {
            target_id,
            success,
            error,
        } => {
            assert_eq!(target_id, "nobody");
            assert!(!success);
            assert_eq!(error.as_deref(), Some("Target peer not found"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(server.connected_peers_of("alice").unwrap().is_empty());

    alice.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_is_echoed() {
    let (server, url) = start_relay(RelayServerConfig::local(SECRET)).await;
    let client = RelayClient::connect_with(&url, "alice", SECRET, None)
        .await
        .unwrap();
    let mut events = client.take_events().unwrap();
    wait_until(|| server.is_registered("alice")).await;

    client.heartbeat().unwrap();
    let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, RelayEvent::Heartbeat { timestamp } if timestamp > 0));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_bad_token_is_rejected_with_policy_close() {
    let (server, url) = start_relay(RelayServerConfig::local(SECRET)).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let auth = RelayAuth::signed("mallory", "wrong-secret");
    ws.send(Message::Text(auth.encode().unwrap())).await.unwrap();

    let close = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .unwrap();
    let frame = close.expect("relay closed without a close frame");
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(server.session_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_peer_id_is_rejected() {
    let (server, url) = start_relay(RelayServerConfig::local(SECRET)).await;
    let (alice, _events) = client(&url, &server, "alice").await;

    let impostor = RelayClient::connect_with(&url, "alice", SECRET, None)
        .await
        .unwrap();
    wait_until(|| !impostor.is_connected()).await;
    assert!(alice.is_connected());
    assert_eq!(server.session_count(), 1);

    impostor.close().await;
    alice.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_session_is_swept_and_peer_notified_once() {
    let config = RelayServerConfig::local(SECRET)
        .with_heartbeat_timeout(Duration::from_millis(300))
        .with_sweep_interval(Duration::from_millis(100));
    let (server, url) = start_relay(config).await;

    let alice = RelayClient::connect_with(&url, "alice", SECRET, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    let mut alice_events = alice.take_events().unwrap();
    wait_until(|| server.is_registered("alice")).await;

    let bob = RelayClient::connect_with(&url, "bob", SECRET, None)
        .await
        .unwrap();
    wait_until(|| server.is_registered("bob")).await;

    alice.connect_peer("bob").unwrap();
    assert!(matches!(
        next_event(&mut alice_events).await,
        RelayEvent::ConnectResponse { success: true, .. }
    ));

    assert_eq!(
        next_event(&mut alice_events).await,
        RelayEvent::PeerDisconnected {
            peer_id: "bob".to_string()
        }
    );
    wait_until(|| !bob.is_connected()).await;
    assert_eq!(server.session_count(), 1);
    assert!(server.is_registered("alice"));

    // No second notification for the same teardown
    tokio::time::sleep(Duration::from_millis(400)).await;
    while let Ok(event) = alice_events.try_recv() {
        assert!(matches!(event, RelayEvent::Heartbeat { .. }));
    }

    alice.close().await;
    bob.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_that_stops_reading_is_dropped() {
    let config = RelayServerConfig::local(SECRET).with_send_queue_capacity(4);
    let (server, url) = start_relay(config).await;
    let (alice, mut alice_events) = client(&url, &server, "alice").await;

    // Bob authenticates over a raw socket and never reads again
    let (mut bob, _) = connect_async(url.as_str()).await.unwrap();
    let auth = RelayAuth::signed("bob", SECRET);
    bob.send(Message::Text(auth.encode().unwrap())).await.unwrap();
    wait_until(|| server.is_registered("bob")).await;

    alice.connect_peer("bob").unwrap();
    assert!(matches!(
        next_event(&mut alice_events).await,
        RelayEvent::ConnectResponse { success: true, .. }
    ));

    // Far more than the socket buffers hold
    let chunk = json!("x".repeat(64 * 1024));
    for _ in 0..512 {
        alice.send_data("bob", chunk.clone()).unwrap();
    }

    assert_eq!(
        next_event(&mut alice_events).await,
        RelayEvent::PeerDisconnected {
            peer_id: "bob".to_string()
        }
    );
    wait_until(|| !server.is_registered("bob")).await;
    assert!(server.is_registered("alice"));
    assert!(server.connected_peers_of("alice").unwrap().is_empty());

    drop(bob);
    alice.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_closing_client_unpairs_everyone() {
    let (server, url) = start_relay(RelayServerConfig::local(SECRET)).await;
    let (alice, mut alice_events) = client(&url, &server, "alice").await;
    let (bob, _bob_events) = client(&url, &server, "bob").await;
    let (carol, mut carol_events) = client(&url, &server, "carol").await;

    bob.connect_peer("alice").unwrap();
    bob.connect_peer("carol").unwrap();
    assert!(matches!(next_event(&mut alice_events).await, RelayEvent::PeerConnected { .. }));
    assert!(matches!(next_event(&mut carol_events).await, RelayEvent::PeerConnected { .. }));

    bob.close().await;
    for events in [&mut alice_events, &mut carol_events] {
        assert_eq!(
            next_event(events).await,
            RelayEvent::PeerDisconnected {
                peer_id: "bob".to_string()
            }
        );
    }
    wait_until(|| !server.is_registered("bob")).await;
    assert!(server.connected_peers_of("alice").unwrap().is_empty());
    assert!(server.connected_peers_of("carol").unwrap().is_empty());

    alice.close().await;
    carol.close().await;
    server.shutdown().await;
}
