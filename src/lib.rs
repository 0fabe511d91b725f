//! PeerLink - NAT traversal and peer connectivity for peer-to-peer messaging
//!
//! This library provides the connectivity layer for PeerLink, including:
//! - Length-prefixed JSON framing and the peer wire protocol
//! - STUN binding discovery and TURN relay allocation
//! - Authenticated peer connections with heartbeats and bounded reconnection
//! - A WebSocket relay server and client for peers that cannot connect directly
//! - Local network node discovery
//!
//! # Examples
//!
//! ```no_run
//! use peerlink::{logging, network::{ConnectionManager, ManagerConfig, WireMessage}};
//!
//! # async fn demo() -> peerlink::Result<()> {
//! logging::init_default_logging();
//!
//! let manager = ConnectionManager::new(ManagerConfig::new("alice"));
//! let addr = manager.start(0).await?;
//! println!("listening on {}", addr);
//!
//! if manager.connect_to_peer("bob", "127.0.0.1:8001".parse().unwrap()).await {
//!     manager
//!         .send_message("bob", &WireMessage::message("alice", "bob", "hi", None))
//!         .await;
//! }
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;
pub mod nat;
pub mod network;
pub mod relay;
pub mod services;

// Re-export commonly used types at crate root
pub use error::{PeerLinkError, Result};
