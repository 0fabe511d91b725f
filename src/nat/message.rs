//! STUN/TURN binary messages
//!
//! RFC 5389 framing shared by the STUN and TURN clients: a 20-byte header
//! (type, length, magic cookie, transaction id) followed by TLV attributes
//! padded to 4-byte boundaries.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{StunError, StunResult};

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Fixed header size
pub const HEADER_SIZE: usize = 20;

const ATTR_HEADER_SIZE: usize = 4;
const INTEGRITY_SIZE: usize = 20;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// 96-bit transaction identifier
pub type TransactionId = [u8; 12];

/// Message type codes
pub mod message_type {
    pub const BINDING_REQUEST: u16 = 0x0001;
    pub const BINDING_RESPONSE: u16 = 0x0101;
    pub const BINDING_ERROR: u16 = 0x0111;
    pub const ALLOCATE_REQUEST: u16 = 0x0003;
    pub const ALLOCATE_RESPONSE: u16 = 0x0103;
    pub const ALLOCATE_ERROR: u16 = 0x0113;
    pub const REFRESH_REQUEST: u16 = 0x0004;
    pub const REFRESH_RESPONSE: u16 = 0x0104;
    pub const REFRESH_ERROR: u16 = 0x0114;
    pub const CREATE_PERMISSION_REQUEST: u16 = 0x0008;
    pub const CREATE_PERMISSION_RESPONSE: u16 = 0x0108;
    pub const CREATE_PERMISSION_ERROR: u16 = 0x0118;
    pub const SEND_INDICATION: u16 = 0x0016;
    pub const DATA_INDICATION: u16 = 0x0017;
}

/// Attribute type codes
pub mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const SOFTWARE: u16 = 0x8022;
}

/// Generates a random transaction id
pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

/// Long-term credential key: MD5("username:realm:password")
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    md5::compute(format!("{}:{}:{}", username, realm, password)).0
}

/// One TLV attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute type code
    pub kind: u16,
    /// Unpadded value
    pub value: Vec<u8>,
}

/// A decoded or to-be-encoded STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message type code
    pub message_type: u16,
    /// Transaction id
    pub transaction_id: TransactionId,
    /// Attributes in wire order
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    /// Creates a message with a fresh transaction id
    pub fn new(message_type: u16) -> Self {
        Self::with_transaction_id(message_type, new_transaction_id())
    }

    /// Creates a message with a given transaction id
    pub fn with_transaction_id(message_type: u16, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Appends a raw attribute
    pub fn add_attribute(&mut self, kind: u16, value: impl Into<Vec<u8>>) -> &mut Self {
        self.attributes.push(Attribute {
            kind,
            value: value.into(),
        });
        self
    }

    /// Appends an XOR-encoded address attribute
    pub fn add_xor_address(&mut self, kind: u16, addr: SocketAddr) -> &mut Self {
        let value = encode_xor_address(addr, &self.transaction_id);
        self.add_attribute(kind, value)
    }

    /// Serializes the message without MESSAGE-INTEGRITY
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_attributes();
        let mut msg = self.encode_header(body.len());
        msg.extend_from_slice(&body);
        msg
    }

    /// Serializes the message and appends MESSAGE-INTEGRITY
    ///
    /// The HMAC covers the header (with the length already counting the
    /// integrity attribute) and every attribute before it.
    pub fn encode_with_integrity(&self, key: &[u8]) -> StunResult<Vec<u8>> {
        let body = self.encode_attributes();
        let mut msg = self.encode_header(body.len() + ATTR_HEADER_SIZE + INTEGRITY_SIZE);
        msg.extend_from_slice(&body);

        let mut mac = HmacSha1::new_from_slice(key)
            .map_err(|e| StunError::Integrity(e.to_string()))?;
        mac.update(&msg);
        let digest = mac.finalize().into_bytes();

        msg.extend_from_slice(&attr::MESSAGE_INTEGRITY.to_be_bytes());
        msg.extend_from_slice(&(INTEGRITY_SIZE as u16).to_be_bytes());
        msg.extend_from_slice(&digest);
        Ok(msg)
    }

    fn encode_header(&self, body_len: usize) -> Vec<u8> {
        let mut msg = Vec::with_capacity(HEADER_SIZE + body_len);
        msg.extend_from_slice(&self.message_type.to_be_bytes());
        msg.extend_from_slice(&(body_len as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&self.transaction_id);
        msg
    }

    fn encode_attributes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for attribute in &self.attributes {
            body.extend_from_slice(&attribute.kind.to_be_bytes());
            body.extend_from_slice(&(attribute.value.len() as u16).to_be_bytes());
            body.extend_from_slice(&attribute.value);
            let padding = padded_len(attribute.value.len()) - attribute.value.len();
            body.extend(std::iter::repeat(0u8).take(padding));
        }
        body
    }

    /// Parses a message, validating header and attribute bounds
    pub fn decode(data: &[u8]) -> StunResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StunError::InvalidResponse(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }
        if data[0] & 0xC0 != 0 {
            return Err(StunError::InvalidResponse(
                "leading bits are not zero".to_string(),
            ));
        }

        let message_type = u16::from_be_bytes([data[0], data[1]]);
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        if cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidResponse(format!(
                "bad magic cookie 0x{:08x}",
                cookie
            )));
        }
        if data.len() < HEADER_SIZE + length {
            return Err(StunError::InvalidResponse(format!(
                "declared length {} exceeds {} available bytes",
                length,
                data.len() - HEADER_SIZE
            )));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..HEADER_SIZE]);

        let end = HEADER_SIZE + length;
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset + ATTR_HEADER_SIZE <= end {
            let kind = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += ATTR_HEADER_SIZE;

            if offset + len > end {
                return Err(StunError::InvalidResponse(format!(
                    "attribute 0x{:04x} overruns message",
                    kind
                )));
            }
            attributes.push(Attribute {
                kind,
                value: data[offset..offset + len].to_vec(),
            });
            offset += padded_len(len);
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// First attribute of the given type
    pub fn attribute(&self, kind: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value.as_slice())
    }

    /// Decodes an XOR-encoded address attribute
    pub fn xor_address(&self, kind: u16) -> Option<SocketAddr> {
        self.attribute(kind)
            .and_then(|value| decode_xor_address(value, &self.transaction_id))
    }

    /// Server-reflexive address, preferring XOR-MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.xor_address(attr::XOR_MAPPED_ADDRESS).or_else(|| {
            self.attribute(attr::MAPPED_ADDRESS)
                .and_then(decode_plain_address)
        })
    }

    /// UTF-8 attribute value such as REALM or NONCE
    pub fn string_attribute(&self, kind: u16) -> Option<String> {
        self.attribute(kind)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// LIFETIME in seconds
    pub fn lifetime(&self) -> Option<u32> {
        self.attribute(attr::LIFETIME)
            .filter(|value| value.len() >= 4)
            .map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    /// ERROR-CODE decoded as (class * 100 + number, reason)
    pub fn error_code(&self) -> Option<(u16, String)> {
        let value = self.attribute(attr::ERROR_CODE)?;
        if value.len() < 4 {
            return None;
        }
        let class = (value[2] & 0x07) as u16;
        let number = value[3] as u16;
        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
        Some((class * 100 + number, reason))
    }

    /// Checks the transaction id against an expected value
    pub fn matches(&self, transaction_id: &TransactionId) -> bool {
        &self.transaction_id == transaction_id
    }
}

/// Encodes an ERROR-CODE attribute value
pub fn encode_error_code(code: u16, reason: &str) -> Vec<u8> {
    let mut value = vec![0u8, 0u8, (code / 100) as u8 & 0x07, (code % 100) as u8];
    value.extend_from_slice(reason.as_bytes());
    value
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// XOR-encodes an address against the cookie and transaction id
pub fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

    let mut value = Vec::with_capacity(20);
    value.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&port.to_be_bytes());
            for (octet, mask) in ip.octets().iter().zip(cookie.iter()) {
                value.push(octet ^ mask);
            }
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&port.to_be_bytes());
            let mask = ipv6_mask(transaction_id);
            for (octet, mask) in ip.octets().iter().zip(mask.iter()) {
                value.push(octet ^ mask);
            }
        }
    }
    value
}

/// Decodes an XOR-encoded address value
pub fn decode_xor_address(value: &[u8], transaction_id: &TransactionId) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

    match value[1] {
        FAMILY_IPV4 => {
            let xored = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let ip = Ipv4Addr::from(xored ^ MAGIC_COOKIE);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mask = ipv6_mask(transaction_id);
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ mask[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Decodes a plain MAPPED-ADDRESS value
pub fn decode_plain_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        FAMILY_IPV4 => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn ipv6_mask(transaction_id: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(transaction_id);
    mask
}
