//! Protocol types for NetworkNeuron
//!
//! This module defines the core data model shared by every plane:
//! - Node, route, session and message identifiers
//! - Token amounts as fixed-point base units
//! - Bandwidth profiles and route requirements
//! - Routes and data packets
//! - Protocol constants

pub mod wire;

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Protocol identifier exchanged during handshake
pub const PROTOCOL_ID: &str = "networkneuron/1.0";

/// Protocol version byte carried in every envelope
pub const PROTOCOL_VERSION: u8 = 1;

/// Associated data bound into every AEAD operation
pub const PROTOCOL_AAD: &[u8] = b"networkneuron";

/// Node identifier - 32 bytes, the Ed25519 verifying key of the node
pub type NodeId = [u8; 32];

/// Route identifier - 16 bytes of secure randomness
pub type RouteId = [u8; 16];

/// Session identifier - 16 bytes of secure randomness
pub type SessionId = [u8; 16];

/// Message identifier - 16 bytes, unique per envelope for replay detection
pub type MessageId = [u8; 16];

/// Well-known ledger account that pays out periodic rewards
pub const REWARD_POOL_ADDRESS: NodeId = [0xEE; 32];

/// Well-known ledger account that holds locked stakes
pub const STAKE_POOL_ADDRESS: NodeId = [0x5A; 32];

/// Render a node id as a short hex prefix for logs
pub fn short_id(id: &NodeId) -> String {
    hex::encode(&id[..6])
}

/// Token amount in base units. One NRN token is 1,000,000 base units.
///
/// Newtype wrapper around u64 for type safety in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash)]
pub struct TokenAmount(pub u64);

/// Base units per whole token
pub const UNITS_PER_TOKEN: u64 = 1_000_000;

impl TokenAmount {
    pub const ZERO: Self = Self(0);

    pub fn new(units: u64) -> Self {
        Self(units)
    }

    pub fn units(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Convert a fractional token value into base units
    pub fn from_tokens(tokens: f64) -> Result<Self> {
        if tokens < 0.0 {
            return Err(Error::Serialization(
                "token amount cannot be negative".to_string(),
            ));
        }
        if tokens > (u64::MAX as f64 / 2.0) / UNITS_PER_TOKEN as f64 {
            return Err(Error::Serialization("token amount too large".to_string()));
        }
        Ok(Self((tokens * UNITS_PER_TOKEN as f64).round() as u64))
    }

    pub fn as_tokens(&self) -> f64 {
        self.0 as f64 / UNITS_PER_TOKEN as f64
    }
}

impl From<u64> for TokenAmount {
    fn from(units: u64) -> Self {
        Self(units)
    }
}

impl From<TokenAmount> for u64 {
    fn from(amount: TokenAmount) -> Self {
        amount.0
    }
}

impl std::fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} NRN", self.as_tokens())
    }
}

/// Bandwidth profile advertised by a peer and refreshed via heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthProfile {
    pub upload_mbps: f64,
    pub download_mbps: f64,
    pub latency_ms: f64,
    pub uptime_pct: f64,
    pub capacity_mbps: f64,
}

impl Default for BandwidthProfile {
    fn default() -> Self {
        Self {
            upload_mbps: 0.0,
            download_mbps: 0.0,
            latency_ms: 0.0,
            uptime_pct: 100.0,
            capacity_mbps: 0.0,
        }
    }
}

/// Capabilities a relay node can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Forwards packets for other nodes
    Relay,
    /// Supports AEAD-encrypted tunnels
    Encryption,
    /// Terminates traffic toward external destinations
    Exit,
}

/// Self-description a node advertises during handshake and discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: String,
    /// X25519 public key used for tunnel key agreement
    pub dh_public_key: [u8; 32],
    pub capabilities: Vec<Capability>,
    pub region: String,
    pub bandwidth_profile: BandwidthProfile,
    pub version: String,
}

/// Path selection algorithm requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RouteAlgorithm {
    Shortest,
    LowestLatency,
    HighestBandwidth,
    #[default]
    Balanced,
}

/// Optional constraints a client attaches to a route query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RouteRequirements {
    pub min_bandwidth_mbps: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub max_cost: Option<f64>,
    pub regions: Vec<String>,
    pub require_encryption: Option<bool>,
    pub algorithm: RouteAlgorithm,
}

impl RouteRequirements {
    /// Canonical hash used as part of the route cache key.
    ///
    /// Regions are sorted and deduplicated first so that semantically equal
    /// queries hash identically regardless of the order the caller listed them.
    pub fn canonical_hash(&self) -> [u8; 32] {
        let mut normalized = self.clone();
        normalized.regions.sort();
        normalized.regions.dedup();

        let bytes = bincode::serialize(&normalized)
            .expect("requirements serialize to bincode infallibly");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }
}

/// How the symmetric key for an encrypted route is distributed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyMode {
    /// Session-scoped tunnel key derived once per peer pair via ECDH + KDF
    #[default]
    Tunnel,
    /// Fresh per-packet key wrapped to the recipient's public key
    Ephemeral,
}

/// An active forwarding path through the mesh
#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: RouteId,
    pub destination: String,
    /// Requirements the route was created for; reused when re-routing
    pub requirements: RouteRequirements,
    /// Ordered hop list, length >= 1; every hop was active at creation
    pub hops: Vec<NodeId>,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub cost: f64,
    pub encrypted: bool,
    pub key_mode: KeyMode,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub bytes_used: u64,
}

impl Route {
    /// A route is expired once its deadline has been reached.
    ///
    /// `expires_at == now` counts as expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub fn first_hop(&self) -> NodeId {
        self.hops[0]
    }
}

/// A unit of client traffic moving along a route.
///
/// `route_snapshot` is consumed hop by hop: each forwarder removes itself
/// from the head before re-emitting the packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub packet_id: MessageId,
    pub source: NodeId,
    pub destination: String,
    pub route_snapshot: Vec<NodeId>,
    pub payload: Vec<u8>,
    pub created_at: u64,
    pub signature: Vec<u8>,
}

impl DataPacket {
    pub fn new(
        packet_id: MessageId,
        source: NodeId,
        destination: String,
        route_snapshot: Vec<NodeId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            packet_id,
            source,
            destination,
            route_snapshot,
            payload,
            created_at: unix_timestamp(),
            signature: Vec::new(),
        }
    }

    /// Canonical bytes signed by the packet source: the packet with the
    /// signature field empty.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        bincode::serialize(&unsigned).expect("packet serializes to bincode infallibly")
    }

    /// Basic field validation before any forwarding work happens
    pub fn validate(&self) -> Result<()> {
        if self.destination.is_empty() {
            return Err(Error::Route(crate::error::RouteError::Invalid(
                "packet has empty destination".to_string(),
            )));
        }
        if self.route_snapshot.is_empty() {
            return Err(Error::Route(crate::error::RouteError::Invalid(
                "packet has empty route snapshot".to_string(),
            )));
        }
        Ok(())
    }
}

/// Seconds since the Unix epoch
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
