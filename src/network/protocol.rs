//! Peer wire protocol for PeerLink
//!
//! Every frame exchanged between two peers carries one JSON object with a
//! mandatory `type` discriminant. The set of discriminants is closed; a
//! frame naming any other type decodes to `ProtocolError::UnknownMessageType`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CodecResult, ProtocolError};
use crate::network::codec::to_json;

// Protocol constants (avoiding magic numbers)
const TYPE_FIELD: &str = "type";
const KNOWN_TYPES: &[&str] = &[
    "auth",
    "auth_reply",
    "message",
    "friend_request",
    "friend_response",
    "heartbeat",
    "heartbeat_ack",
];

/// Messages exchanged over a direct peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// First frame on every connection, sent by the dialing side
    Auth {
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default)]
        timestamp: u64,
        /// Port the sender accepts connections on, if it listens
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen_port: Option<u16>,
    },
    /// Reply from the accepting side once `auth` is admitted
    AuthReply {
        peer_id: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        timestamp: u64,
    },
    /// Application chat message, usually carrying ciphertext
    Message {
        sender_id: String,
        recipient_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default)]
        timestamp: u64,
    },
    /// Contact request
    FriendRequest {
        sender_id: String,
        sender_username: String,
        recipient_id: String,
        id: String,
        #[serde(default)]
        timestamp: u64,
    },
    /// Answer to a contact request
    FriendResponse {
        sender_id: String,
        recipient_id: String,
        request_id: String,
        accepted: bool,
        #[serde(default)]
        timestamp: u64,
    },
    /// Liveness probe
    Heartbeat,
    /// Liveness probe answer
    HeartbeatAck,
}

impl WireMessage {
    /// Builds an auth frame stamped with the current time
    pub fn auth(peer_id: impl Into<String>, username: Option<String>, listen_port: Option<u16>) -> Self {
        WireMessage::Auth {
            peer_id: peer_id.into(),
            username,
            timestamp: unix_timestamp_millis(),
            listen_port,
        }
    }

    /// Builds an auth reply stamped with the current time
    pub fn auth_reply(peer_id: impl Into<String>, username: Option<String>) -> Self {
        WireMessage::AuthReply {
            peer_id: peer_id.into(),
            username,
            timestamp: unix_timestamp_millis(),
        }
    }

    /// Builds a chat message stamped with the current time
    pub fn message(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: impl Into<String>,
        key: Option<String>,
    ) -> Self {
        WireMessage::Message {
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            content: content.into(),
            key,
            timestamp: unix_timestamp_millis(),
        }
    }

    /// Returns the wire discriminant
    pub fn message_type(&self) -> &'static str {
        match self {
            WireMessage::Auth { .. } => "auth",
            WireMessage::AuthReply { .. } => "auth_reply",
            WireMessage::Message { .. } => "message",
            WireMessage::FriendRequest { .. } => "friend_request",
            WireMessage::FriendResponse { .. } => "friend_response",
            WireMessage::Heartbeat => "heartbeat",
            WireMessage::HeartbeatAck => "heartbeat_ack",
        }
    }

    /// Liveness traffic handled inside the connection manager
    pub fn is_keepalive(&self) -> bool {
        matches!(self, WireMessage::Heartbeat | WireMessage::HeartbeatAck)
    }

    /// Serializes to JSON bytes
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_json(self)
    }

    /// Decodes a JSON frame, distinguishing unknown types from malformed ones
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        check_type(&value, KNOWN_TYPES)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Validates the `type` field of a decoded JSON object against a closed set
pub(crate) fn check_type(value: &serde_json::Value, known: &[&str]) -> Result<(), ProtocolError> {
    let msg_type = value
        .get(TYPE_FIELD)
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?;

    if known.contains(&msg_type) {
        Ok(())
    } else {
        Err(ProtocolError::UnknownMessageType(msg_type.to_string()))
    }
}

/// Milliseconds since the Unix epoch
pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch
pub fn unix_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        let json = serde_json::to_value(WireMessage::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({"type": "heartbeat"}));

        let msg = WireMessage::message("alice", "bob", "hi", None);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["content"], "hi");
        assert!(json.get("key").is_none());
    }

    #[test]
    fn test_decode_known_types() {
        let decoded = WireMessage::decode(
            br#"{"type":"friend_response","sender_id":"a","recipient_id":"b","request_id":"r1","accepted":true,"timestamp":5}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            WireMessage::FriendResponse {
                sender_id: "a".to_string(),
                recipient_id: "b".to_string(),
                request_id: "r1".to_string(),
                accepted: true,
                timestamp: 5,
            }
        );

        let decoded = WireMessage::decode(br#"{"type":"auth","peer_id":"p1"}"#).unwrap();
        assert!(matches!(decoded, WireMessage::Auth { listen_port: None, .. }));
    }

    #[test]
    fn test_unknown_type_is_typed_error() {
        let err = WireMessage::decode(br#"{"type":"teleport","to":"mars"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(t) if t == "teleport"));

        let err = WireMessage::decode(br#"{"content":"no type"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));

        let err = WireMessage::decode(br#"{"type":"message","content":"missing ids"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_timestamps_advance() {
        let first = unix_timestamp_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(unix_timestamp_millis() > first);
        assert!(unix_timestamp_secs() > 1_600_000_000);
    }

    #[test]
    fn test_keepalive_classification() {
        assert!(WireMessage::HeartbeatAck.is_keepalive());
        assert!(!WireMessage::auth("p", None, None).is_keepalive());
        assert_eq!(WireMessage::auth_reply("p", None).message_type(), "auth_reply");
    }
}
