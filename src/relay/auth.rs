//! Relay authentication tokens
//!
//! A peer proves knowledge of the relay's shared secret by sending
//! `hex(HMAC-SHA256(secret, "{peer_id}:{timestamp}"))` in its first frame.
//! An empty secret disables the check.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn token_input(peer_id: &str, timestamp: u64) -> String {
    format!("{}:{}", peer_id, timestamp)
}

/// Computes the token for a peer id and timestamp
///
/// Returns an empty string when no secret is configured.
pub fn generate_token(secret: &str, peer_id: &str, timestamp: u64) -> String {
    if secret.is_empty() {
        return String::new();
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(token_input(peer_id, timestamp).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a presented token in constant time
pub fn verify_token(secret: &str, peer_id: &str, timestamp: u64, token: &str) -> bool {
    if secret.is_empty() {
        return true;
    }

    let Ok(presented) = hex::decode(token) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(token_input(peer_id, timestamp).as_bytes());
    mac.verify_slice(&presented).is_ok()
}
