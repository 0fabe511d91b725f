//! NAT traversal for PeerLink
//!
//! This module contains the STUN and TURN clients and the binary message
//! format they share:
//! - Binding requests to learn the server-reflexive address
//! - Long-term-credential TURN allocations, permissions and data relay

pub mod message;
pub mod stun;
pub mod turn;

pub use message::{StunMessage, MAGIC_COOKIE};
pub use stun::{collect_bindings, StunBindingResult, StunClient, MAX_BINDINGS, STUN_TIMEOUT};
pub use turn::{TurnAllocation, TurnClient, TurnConfig, TurnTransportKind, TURN_TIMEOUT};
