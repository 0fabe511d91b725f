//! Error types for PeerLink
//!
//! This module defines the error taxonomy shared by the connectivity layer.
//! Each concern owns a focused enum; `PeerLinkError` aggregates them for
//! callers that only need a single error type.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for PeerLink
#[derive(Error, Debug)]
pub enum PeerLinkError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Peer connection errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Framing errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// STUN client errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// TURN client errors
    #[error("TURN error: {0}")]
    Turn(#[from] TurnError),

    /// Relay server and client errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Collaborator service errors
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Generic(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvVar { name: String, value: String },

    #[error("Configuration directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Failed to create configuration directory: {0}")]
    DirectoryCreationFailed(String),
}

/// Peer connection errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("No available port starting at {base} after {attempts} attempts")]
    PortUnavailable { base: u16, attempts: u16 },

    #[error("Peer {0} is unreachable")]
    PeerUnreachable(String),

    #[error("Gave up reconnecting to {peer_id} after {attempts} attempts")]
    MaxReconnectExceeded { peer_id: String, attempts: u32 },

    #[error("Connection manager is not running")]
    NotRunning,

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Framing errors raised by the wire codec
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Stream ended mid-frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Stream closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Message-level protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Message has no type field")]
    MissingType,

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// STUN client errors
#[derive(Error, Debug)]
pub enum StunError {
    #[error("STUN request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid STUN response: {0}")]
    InvalidResponse(String),

    #[error("Transaction ID mismatch")]
    TransactionMismatch,

    #[error("Response carried no mapped address")]
    NoMappedAddress,

    #[error("Could not resolve STUN server {0}")]
    Resolve(String),

    #[error("STUN socket not connected")]
    NotConnected,

    #[error("Message integrity error: {0}")]
    Integrity(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// TURN client errors
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("TURN request timed out after {0:?}")]
    Timeout(Duration),

    #[error("TURN error {code}: {reason}")]
    ErrorResponse { code: u16, reason: String },

    #[error("Missing attribute {0}")]
    MissingAttribute(&'static str),

    #[error("No active allocation")]
    NoAllocation,

    #[error("No permission installed for {0}")]
    PermissionMissing(std::net::IpAddr),

    #[error("TURN client not connected")]
    NotConnected,

    #[error("Could not resolve TURN server {0}")]
    Resolve(String),

    #[error("Invalid TURN response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Peer {0} is already registered")]
    DuplicatePeer(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Relay connection closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reported by collaborator services
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Message could not be delivered to {0}")]
    Undelivered(String),
}

/// Type alias for Results using PeerLinkError
pub type Result<T> = std::result::Result<T, PeerLinkError>;

/// Type alias for Config Results
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Type alias for Network Results
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for Codec Results
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Type alias for STUN Results
pub type StunResult<T> = std::result::Result<T, StunError>;

/// Type alias for TURN Results
pub type TurnResult<T> = std::result::Result<T, TurnError>;

/// Type alias for Relay Results
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Type alias for Service Results
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

impl From<serde_json::Error> for PeerLinkError {
    fn from(err: serde_json::Error) -> Self {
        PeerLinkError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PeerLinkError {
    fn from(err: toml::de::Error) -> Self {
        PeerLinkError::Config(ConfigError::LoadFailed(err.to_string()))
    }
}

impl From<toml::ser::Error> for PeerLinkError {
    fn from(err: toml::ser::Error) -> Self {
        PeerLinkError::Config(ConfigError::SaveFailed(err.to_string()))
    }
}

impl From<StunError> for TurnError {
    fn from(err: StunError) -> Self {
        match err {
            StunError::Timeout(d) => TurnError::Timeout(d),
            StunError::Io(e) => TurnError::Io(e),
            other => TurnError::InvalidResponse(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
