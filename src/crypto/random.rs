//! Secure randomness for identifiers and nonces
//!
//! All ids and nonces come from the operating system RNG. Nothing here is
//! deterministic; route and session ids must be unpredictable to outsiders.

use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use crate::protocol::{MessageId, RouteId, SessionId};

/// Fresh 16-byte message id (random UUID bytes)
pub fn random_message_id() -> MessageId {
    Uuid::new_v4().into_bytes()
}

pub fn random_route_id() -> RouteId {
    Uuid::new_v4().into_bytes()
}

pub fn random_session_id() -> SessionId {
    Uuid::new_v4().into_bytes()
}

/// 12-byte AEAD nonce
pub fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn random_bytes(length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
