//! Relay wire protocol
//!
//! Each WebSocket text message carries one JSON object. The first message
//! from a client is a bare [`RelayAuth`] frame; everything after it is a
//! [`RelayRequest`]. The server answers with [`RelayEvent`]s. Relayed
//! payloads are opaque JSON values and are forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::network::protocol::{check_type, unix_timestamp_secs};
use crate::relay::auth::generate_token;

const REQUEST_TYPES: &[&str] = &["connect", "disconnect", "data", "heartbeat"];
const EVENT_TYPES: &[&str] = &[
    "connect_response",
    "peer_connected",
    "peer_disconnected",
    "data",
    "heartbeat",
];

/// First frame sent by a relay client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAuth {
    pub peer_id: String,
    pub timestamp: u64,
    pub token: String,
}

impl RelayAuth {
    /// Builds an auth frame signed with the shared secret at the current time
    pub fn signed(peer_id: impl Into<String>, secret: &str) -> Self {
        let peer_id = peer_id.into();
        let timestamp = unix_timestamp_secs();
        let token = generate_token(secret, &peer_id, timestamp);
        Self {
            peer_id,
            timestamp,
            token,
        }
    }

    /// Parses an auth frame; every field is required
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes to JSON text
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Requests a client sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    /// Pair with another registered peer
    Connect { target_id: String },
    /// Undo a pairing
    Disconnect { target_id: String },
    /// Forward a payload to a paired peer
    Data { target_id: String, data: Value },
    /// Liveness probe
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl RelayRequest {
    /// Decodes a request, reporting unknown types separately
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        check_type(&value, REQUEST_TYPES)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Serializes to JSON text
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Events the relay sends to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Outcome of a `connect` request
    ConnectResponse {
        target_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Another peer paired with us
    PeerConnected { peer_id: String },
    /// A paired peer left or unpaired
    PeerDisconnected { peer_id: String },
    /// Payload forwarded from a paired peer
    Data { peer_id: String, data: Value },
    /// Heartbeat echo
    Heartbeat { timestamp: u64 },
}

impl RelayEvent {
    /// Heartbeat echo stamped with the current time
    pub fn heartbeat() -> Self {
        RelayEvent::Heartbeat {
            timestamp: unix_timestamp_secs(),
        }
    }

    /// Decodes an event, reporting unknown types separately
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        check_type(&value, EVENT_TYPES)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Serializes to JSON text
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
