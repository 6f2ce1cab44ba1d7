//! Wire codec for NetworkNeuron protocol messages
//!
//! Every message travels as a signed envelope in a length-prefixed frame.
//! The codec guarantees:
//! - a deterministic canonical byte form used for signing
//! - total decode: either a well-typed envelope or a `WireError`
//! - unknown type bytes are rejected before payload parsing
//! - per-source replay detection over a sliding window

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::crypto::{verify_signature, NodeKeypair};
use crate::error::{Result, WireError};
use crate::protocol::{
    BandwidthProfile, Capability, KeyMode, MessageId, NodeId, NodeInfo, RouteId,
    RouteRequirements, PROTOCOL_VERSION,
};

/// Maximum size of a single wire frame (envelope bytes, excluding the prefix)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default replay window duration
pub const REPLAY_WINDOW: Duration = Duration::from_secs(60);

/// Maximum tracked message ids per peer inside the replay window
pub const REPLAY_WINDOW_ENTRIES: usize = 1024;

// Message type bytes. Decode rejects anything else.
pub const KIND_HANDSHAKE: u8 = 0x01;
pub const KIND_NODE_DISCOVERY: u8 = 0x02;
pub const KIND_ROUTE_REQUEST: u8 = 0x10;
pub const KIND_ROUTE_RESPONSE: u8 = 0x11;
pub const KIND_DATA_PACKET: u8 = 0x20;
pub const KIND_HEARTBEAT: u8 = 0x30;
pub const KIND_BANDWIDTH_REPORT: u8 = 0x31;
pub const KIND_ERROR: u8 = 0x7F;

/// Handshake payload: the sender introduces itself and proves key ownership
/// through the envelope signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub node_info: NodeInfo,
    pub capabilities: Vec<Capability>,
    pub version: String,
    /// True when this handshake answers a received one
    pub ack: bool,
}

/// Gossip of known nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDiscoveryPayload {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequestPayload {
    pub request_id: MessageId,
    pub destination: String,
    pub requirements: RouteRequirements,
}

/// Serializable summary of a route offered to a requester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    pub route_id: RouteId,
    pub destination: String,
    pub hops: Vec<NodeId>,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub cost: f64,
    pub encrypted: bool,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResponsePayload {
    pub request_id: MessageId,
    pub route: Option<RouteDescriptor>,
    pub alternatives: Vec<RouteDescriptor>,
}

/// Encrypted (or plaintext) carrier for a `DataPacket`.
///
/// The Poly1305 tag rides at the end of `body`; `nonce` is the explicit IV.
/// In `Ephemeral` key mode the fresh X25519 public half travels alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacketPayload {
    pub encrypted: bool,
    pub key_mode: KeyMode,
    pub ephemeral_public_key: Option<[u8; 32]>,
    pub nonce: [u8; 12],
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub bandwidth_profile: BandwidthProfile,
}

/// Periodic self-report of forwarding volume; consumed by routers to
/// re-score cached routes through the reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthReportPayload {
    pub bandwidth_profile: BandwidthProfile,
    pub bytes_forwarded: u64,
    pub period_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Tagged union of every message payload
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Handshake(HandshakePayload),
    NodeDiscovery(NodeDiscoveryPayload),
    RouteRequest(RouteRequestPayload),
    RouteResponse(RouteResponsePayload),
    DataPacket(DataPacketPayload),
    Heartbeat(HeartbeatPayload),
    BandwidthReport(BandwidthReportPayload),
    Error(ErrorPayload),
}

impl MessagePayload {
    pub fn kind(&self) -> u8 {
        match self {
            MessagePayload::Handshake(_) => KIND_HANDSHAKE,
            MessagePayload::NodeDiscovery(_) => KIND_NODE_DISCOVERY,
            MessagePayload::RouteRequest(_) => KIND_ROUTE_REQUEST,
            MessagePayload::RouteResponse(_) => KIND_ROUTE_RESPONSE,
            MessagePayload::DataPacket(_) => KIND_DATA_PACKET,
            MessagePayload::Heartbeat(_) => KIND_HEARTBEAT,
            MessagePayload::BandwidthReport(_) => KIND_BANDWIDTH_REPORT,
            MessagePayload::Error(_) => KIND_ERROR,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            MessagePayload::Handshake(_) => "handshake",
            MessagePayload::NodeDiscovery(_) => "node-discovery",
            MessagePayload::RouteRequest(_) => "route-request",
            MessagePayload::RouteResponse(_) => "route-response",
            MessagePayload::DataPacket(_) => "data-packet",
            MessagePayload::Heartbeat(_) => "heartbeat",
            MessagePayload::BandwidthReport(_) => "bandwidth-report",
            MessagePayload::Error(_) => "error",
        }
    }

    fn encode(&self) -> Vec<u8> {
        let result = match self {
            MessagePayload::Handshake(p) => bincode::serialize(p),
            MessagePayload::NodeDiscovery(p) => bincode::serialize(p),
            MessagePayload::RouteRequest(p) => bincode::serialize(p),
            MessagePayload::RouteResponse(p) => bincode::serialize(p),
            MessagePayload::DataPacket(p) => bincode::serialize(p),
            MessagePayload::Heartbeat(p) => bincode::serialize(p),
            MessagePayload::BandwidthReport(p) => bincode::serialize(p),
            MessagePayload::Error(p) => bincode::serialize(p),
        };
        result.expect("payload serializes to bincode infallibly")
    }

    fn decode(kind: u8, bytes: &[u8]) -> std::result::Result<Self, WireError> {
        let decode_err = |e: bincode::Error| WireError::Decode(e.to_string());
        match kind {
            KIND_HANDSHAKE => Ok(MessagePayload::Handshake(
                bincode::deserialize(bytes).map_err(decode_err)?,
            )),
            KIND_NODE_DISCOVERY => Ok(MessagePayload::NodeDiscovery(
                bincode::deserialize(bytes).map_err(decode_err)?,
            )),
            KIND_ROUTE_REQUEST => Ok(MessagePayload::RouteRequest(
                bincode::deserialize(bytes).map_err(decode_err)?,
            )),
            KIND_ROUTE_RESPONSE => Ok(MessagePayload::RouteResponse(
                bincode::deserialize(bytes).map_err(decode_err)?,
            )),
            KIND_DATA_PACKET => Ok(MessagePayload::DataPacket(
                bincode::deserialize(bytes).map_err(decode_err)?,
            )),
            KIND_HEARTBEAT => Ok(MessagePayload::Heartbeat(
                bincode::deserialize(bytes).map_err(decode_err)?,
            )),
            KIND_BANDWIDTH_REPORT => Ok(MessagePayload::BandwidthReport(
                bincode::deserialize(bytes).map_err(decode_err)?,
            )),
            KIND_ERROR => Ok(MessagePayload::Error(
                bincode::deserialize(bytes).map_err(decode_err)?,
            )),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Signed message envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: u8,
    pub msg_id: MessageId,
    pub timestamp: u64,
    pub source: NodeId,
    pub dest: Option<NodeId>,
    pub payload: MessagePayload,
    pub signature: Vec<u8>,
}

/// On-the-wire shape of an envelope. The payload rides as opaque bytes keyed
/// by the kind discriminant so decode can reject unknown kinds before any
/// payload parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEnvelope {
    version: u8,
    kind: u8,
    msg_id: MessageId,
    timestamp: u64,
    source: NodeId,
    dest: Option<NodeId>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl Envelope {
    /// Build an unsigned envelope with a fresh message id
    pub fn new(source: NodeId, dest: Option<NodeId>, payload: MessagePayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_id: crate::crypto::random::random_message_id(),
            timestamp: crate::protocol::unix_timestamp(),
            source,
            dest,
            payload,
            signature: Vec::new(),
        }
    }

    fn to_raw(&self) -> RawEnvelope {
        RawEnvelope {
            version: self.version,
            kind: self.payload.kind(),
            msg_id: self.msg_id,
            timestamp: self.timestamp,
            source: self.source,
            dest: self.dest,
            payload: self.payload.encode(),
            signature: self.signature.clone(),
        }
    }

    /// The deterministic byte form covered by the envelope signature:
    /// the raw envelope with an empty signature field.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut raw = self.to_raw();
        raw.signature = Vec::new();
        bincode::serialize(&raw).expect("envelope serializes to bincode infallibly")
    }

    /// Sign the canonical bytes with the node keypair
    pub fn sign(&mut self, keypair: &NodeKeypair) {
        self.signature = keypair.sign(&self.canonical_bytes()).to_vec();
    }

    /// Verify the signature against the source id (which is the Ed25519
    /// verifying key of the sender).
    pub fn verify(&self) -> std::result::Result<(), WireError> {
        if verify_signature(&self.source, &self.canonical_bytes(), &self.signature) {
            Ok(())
        } else {
            Err(WireError::BadSignature)
        }
    }

    /// Encode to envelope bytes (no length prefix)
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(&self.to_raw()).expect("envelope serializes to bincode infallibly")
    }

    /// Decode envelope bytes. Total: every failure maps to a `WireError`.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, WireError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WireError::Decode(format!(
                "frame of {} bytes exceeds {} byte limit",
                bytes.len(),
                MAX_FRAME_SIZE
            )));
        }
        let raw: RawEnvelope =
            bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
        let payload = MessagePayload::decode(raw.kind, &raw.payload)?;
        Ok(Self {
            version: raw.version,
            msg_id: raw.msg_id,
            timestamp: raw.timestamp,
            source: raw.source,
            dest: raw.dest,
            payload,
            signature: raw.signature,
        })
    }

    /// Encode with the u32 big-endian length prefix used on the stream
    pub fn encode_framed(&self) -> Vec<u8> {
        let body = self.encode();
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }
}

/// Per-peer replay detection over a sliding window.
///
/// Remembers `{source, msg_id}` pairs for `window` and rejects repeats.
/// Old entries age out; per-peer history is also capped so a chatty peer
/// cannot exhaust memory.
pub struct ReplayGuard {
    seen: HashMap<(NodeId, MessageId), Instant>,
    order: HashMap<NodeId, VecDeque<(MessageId, Instant)>>,
    window: Duration,
    max_entries_per_peer: usize,
}

impl ReplayGuard {
    pub fn new(window: Duration, max_entries_per_peer: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: HashMap::new(),
            window,
            max_entries_per_peer,
        }
    }

    /// Record a message id; `WireError::Replay` when it was already seen
    /// inside the window.
    pub fn check_and_record(
        &mut self,
        source: NodeId,
        msg_id: MessageId,
    ) -> std::result::Result<(), WireError> {
        let now = Instant::now();
        self.expire(source, now);

        if self.seen.contains_key(&(source, msg_id)) {
            return Err(WireError::Replay);
        }

        self.seen.insert((source, msg_id), now);
        let order = self.order.entry(source).or_default();
        order.push_back((msg_id, now));

        if order.len() > self.max_entries_per_peer {
            if let Some((old_id, _)) = order.pop_front() {
                self.seen.remove(&(source, old_id));
            }
        }
        Ok(())
    }

    /// Drop every record for a peer (used when the peer is dropped)
    pub fn forget_peer(&mut self, source: &NodeId) {
        if let Some(order) = self.order.remove(source) {
            for (msg_id, _) in order {
                self.seen.remove(&(*source, msg_id));
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    fn expire(&mut self, source: NodeId, now: Instant) {
        if let Some(order) = self.order.get_mut(&source) {
            while let Some(&(msg_id, at)) = order.front() {
                if now.duration_since(at) > self.window {
                    order.pop_front();
                    self.seen.remove(&(source, msg_id));
                } else {
                    break;
                }
            }
        }
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(REPLAY_WINDOW, REPLAY_WINDOW_ENTRIES)
    }
}

/// Decode, verify signature, and run replay detection in the order the
/// protocol requires: signature before any payload-specific handling,
/// replay before the envelope reaches a handler.
pub fn decode_verified(
    bytes: &[u8],
    replay: &mut ReplayGuard,
) -> Result<Envelope> {
    let envelope = Envelope::decode(bytes)?;
    envelope.verify()?;
    replay.check_and_record(envelope.source, envelope.msg_id)?;
    Ok(envelope)
}
