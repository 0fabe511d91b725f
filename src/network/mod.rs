//! Network module for PeerLink
//!
//! This module handles peer-to-peer connectivity including:
//! - Length-prefixed JSON framing and the wire message set
//! - Authenticated TCP connections with heartbeats
//! - The peer table and reconnection policy
//! - Connection lifecycle management
//! - Local network node discovery

pub mod codec;
pub mod connection;
pub mod discovery;
pub mod listener;
pub mod manager;
pub mod protocol;
pub mod reconnect;
pub mod table;

// Re-export commonly used types
pub use codec::{FrameCodec, FrameReader, FrameWriter, Framing, MAX_FRAME_SIZE};
pub use connection::{
    ConnectPath, ConnectionInfo, ConnectionRole, ConnectionState, PeerConnection,
    HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT,
};
pub use discovery::{DiscoveredNode, DiscoveryMessage, NodeDiscovery, DEFAULT_MAX_NODE_AGE};
pub use listener::{bind_with_probe, AuthenticatedStream, ConnectionListener, Handshake};
pub use manager::{ConnectionEvent, ConnectionManager, ManagerConfig};
pub use protocol::WireMessage;
pub use reconnect::{Backoff, ReconnectPolicy};
pub use table::{Offer, PeerTable};
