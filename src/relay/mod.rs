//! Relay fallback for PeerLink
//!
//! A WebSocket rendezvous server that pairs authenticated peers and forwards
//! opaque payloads between them, plus the client peers use to reach it.

pub mod auth;
pub mod client;
pub mod protocol;
pub mod server;

pub use auth::{generate_token, verify_token};
pub use client::{RelayClient, DEFAULT_RELAY_HEARTBEAT};
pub use protocol::{RelayAuth, RelayEvent, RelayRequest};
pub use server::{RelayServer, RelayServerConfig};
