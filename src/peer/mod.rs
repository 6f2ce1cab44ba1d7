//! Peer registry for NetworkNeuron
//!
//! Single owner of every peer record. Tracks the peer lifecycle
//! (`discovered → connecting → handshaking → active ⇄ quarantined → dropped`),
//! refreshes bandwidth profiles from heartbeats, and maintains reputation
//! from heartbeat regularity and forwarding outcomes reported by the router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};

use crate::coordinator::NodeEvent;
use crate::error::{Error, PeerError, Result};
use crate::protocol::{short_id, BandwidthProfile, Capability, NodeId, NodeInfo};

/// Peer lifecycle states. `Dropped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Connecting,
    Handshaking,
    Active,
    Quarantined,
    Dropped,
}

/// Everything the registry knows about one peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub address: String,
    pub dh_public_key: [u8; 32],
    pub capabilities: Vec<Capability>,
    pub region: String,
    pub bandwidth_profile: BandwidthProfile,
    pub reputation: f64,
    pub connected_at: Option<Instant>,
    pub last_seen: Instant,
    pub state: PeerState,
    heartbeats_received: u64,
    heartbeats_missed: u64,
    forwards_ok: u64,
    forwards_failed: u64,
}

impl PeerRecord {
    fn from_info(info: &NodeInfo, state: PeerState) -> Self {
        Self {
            node_id: info.node_id,
            address: info.address.clone(),
            dh_public_key: info.dh_public_key,
            capabilities: info.capabilities.clone(),
            region: info.region.clone(),
            bandwidth_profile: info.bandwidth_profile,
            reputation: 0.5,
            connected_at: None,
            last_seen: Instant::now(),
            state,
            heartbeats_received: 0,
            heartbeats_missed: 0,
            forwards_ok: 0,
            forwards_failed: 0,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Rebuild the gossip form of this peer
    pub fn to_node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id,
            address: self.address.clone(),
            dh_public_key: self.dh_public_key,
            capabilities: self.capabilities.clone(),
            region: self.region.clone(),
            bandwidth_profile: self.bandwidth_profile,
            version: crate::protocol::PROTOCOL_ID.to_string(),
        }
    }

    /// Reputation is a pure function of recent heartbeat regularity and
    /// forwarding success; peers never set it themselves.
    fn recompute_reputation(&mut self) {
        let heartbeat_total = self.heartbeats_received + self.heartbeats_missed;
        let regularity = if heartbeat_total == 0 {
            1.0
        } else {
            self.heartbeats_received as f64 / heartbeat_total as f64
        };

        let forward_total = self.forwards_ok + self.forwards_failed;
        let success_rate = if forward_total == 0 {
            1.0
        } else {
            self.forwards_ok as f64 / forward_total as f64
        };

        self.reputation = (0.5 * regularity + 0.5 * success_rate).clamp(0.0, 1.0);
    }
}

#[cfg(test)]
impl PeerRecord {
    /// Test helper: an active record built straight from node info
    pub fn test_active(info: &NodeInfo) -> Self {
        let mut record = Self::from_info(info, PeerState::Active);
        record.connected_at = Some(Instant::now());
        record
    }
}

/// Aggregate registry counters
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total: usize,
    pub discovered: usize,
    pub connecting: usize,
    pub active: usize,
    pub quarantined: usize,
    pub dropped: usize,
}

/// Peer registry: exclusive owner of peer records
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<NodeId, PeerRecord>>>,
    keepalive_window: Duration,
    misses_before_quarantine: u32,
    max_peers: usize,
    events: broadcast::Sender<NodeEvent>,
}

impl PeerRegistry {
    pub fn new(
        keepalive_interval: Duration,
        misses_before_quarantine: u32,
        max_peers: usize,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            keepalive_window: keepalive_interval * misses_before_quarantine.max(1),
            misses_before_quarantine,
            max_peers,
            events,
        }
    }

    /// Record a node learned through discovery. Known nodes are left alone;
    /// dropped peers stay dropped.
    pub async fn on_discover(&self, info: &NodeInfo) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&info.node_id) {
            return false;
        }
        if peers.len() >= self.max_peers {
            log::debug!(
                "ignoring discovered node {}: registry at max_peers {}",
                short_id(&info.node_id),
                self.max_peers
            );
            return false;
        }
        peers.insert(info.node_id, PeerRecord::from_info(info, PeerState::Discovered));
        log::debug!("discovered node {}", short_id(&info.node_id));
        true
    }

    /// Move a discovered peer into `Connecting` ahead of a dial
    pub async fn begin_connect(&self, node_id: &NodeId) -> Result<()> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(node_id)
            .ok_or(Error::Peer(PeerError::DialFail("unknown peer".to_string())))?;
        match peer.state {
            PeerState::Discovered | PeerState::Connecting => {
                peer.state = PeerState::Connecting;
                Ok(())
            }
            PeerState::Dropped => Err(Error::Peer(PeerError::Dropped)),
            other => Err(Error::Peer(PeerError::DialFail(format!(
                "peer in state {:?}",
                other
            )))),
        }
    }

    /// Dial succeeded; the signed handshake exchange is in flight
    pub async fn begin_handshake(&self, node_id: &NodeId) -> Result<()> {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            if peer.state == PeerState::Dropped {
                return Err(Error::Peer(PeerError::Dropped));
            }
            peer.state = PeerState::Handshaking;
        }
        Ok(())
    }

    /// Handshake verified: insert or promote the peer to `Active`.
    ///
    /// The caller must have verified the envelope signature against the
    /// advertised public key before calling this.
    pub async fn activate(&self, info: &NodeInfo) -> Result<()> {
        let mut peers = self.peers.write().await;
        let now = Instant::now();
        match peers.get_mut(&info.node_id) {
            Some(peer) => {
                if peer.state == PeerState::Dropped {
                    return Err(Error::Peer(PeerError::Dropped));
                }
                peer.state = PeerState::Active;
                peer.address = info.address.clone();
                peer.dh_public_key = info.dh_public_key;
                peer.capabilities = info.capabilities.clone();
                peer.region = info.region.clone();
                peer.bandwidth_profile = info.bandwidth_profile;
                peer.connected_at = Some(now);
                peer.last_seen = now;
            }
            None => {
                if peers.len() >= self.max_peers {
                    return Err(Error::Peer(PeerError::HandshakeFail(
                        "registry at max_peers".to_string(),
                    )));
                }
                let mut record = PeerRecord::from_info(info, PeerState::Active);
                record.connected_at = Some(now);
                peers.insert(info.node_id, record);
            }
        }
        drop(peers);

        log::info!("peer {} active", short_id(&info.node_id));
        let _ = self.events.send(NodeEvent::PeerConnected {
            node_id: info.node_id,
        });
        let _ = self.events.send(NodeEvent::HandshakeOk {
            node_id: info.node_id,
        });
        Ok(())
    }

    /// Handshake or dial failure: peer goes to `Dropped`, cause surfaces
    pub async fn connect_failed(&self, node_id: &NodeId, cause: PeerError) -> Error {
        self.drop_peer_inner(node_id, &cause.to_string()).await;
        let _ = self.events.send(NodeEvent::HandshakeErr {
            node_id: *node_id,
            reason: cause.to_string(),
        });
        Error::Peer(cause)
    }

    /// Heartbeat: refresh liveness and the advertised bandwidth profile.
    /// A quarantined peer that resumes heartbeats returns to `Active`.
    pub async fn on_heartbeat(&self, node_id: &NodeId, profile: BandwidthProfile) -> Result<()> {
        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(node_id).ok_or(Error::Peer(PeerError::Dropped))?;
        if peer.state == PeerState::Dropped {
            return Err(Error::Peer(PeerError::Dropped));
        }
        peer.last_seen = Instant::now();
        peer.bandwidth_profile = profile;
        peer.heartbeats_received += 1;
        if peer.state == PeerState::Quarantined {
            peer.state = PeerState::Active;
            log::info!("peer {} recovered from quarantine", short_id(node_id));
        }
        peer.recompute_reputation();
        Ok(())
    }

    /// Explicit disconnect: terminal drop
    pub async fn on_disconnect(&self, node_id: &NodeId) {
        self.drop_peer_inner(node_id, "disconnect").await;
    }

    /// Quarantine a peer that sent malformed or unauthentic traffic.
    /// Crypto and wire errors land here instead of surfacing to callers.
    pub async fn quarantine(&self, node_id: &NodeId, reason: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            if peer.state == PeerState::Active || peer.state == PeerState::Handshaking {
                peer.state = PeerState::Quarantined;
                log::warn!("peer {} quarantined: {}", short_id(node_id), reason);
            }
        }
    }

    /// Keepalive sweep, driven by the coordinator timer.
    ///
    /// Active peers silent for one full window degrade to `Quarantined`;
    /// quarantined peers silent for a second window are dropped.
    pub async fn check_keepalive(&self) {
        let now = Instant::now();
        let mut dropped = Vec::new();
        {
            let mut peers = self.peers.write().await;
            for peer in peers.values_mut() {
                let silent_for = now.duration_since(peer.last_seen);
                match peer.state {
                    PeerState::Active if silent_for > self.keepalive_window => {
                        peer.state = PeerState::Quarantined;
                        peer.heartbeats_missed += u64::from(self.misses_before_quarantine);
                        peer.recompute_reputation();
                        log::warn!(
                            "peer {} quarantined: silent for {:?}",
                            short_id(&peer.node_id),
                            silent_for
                        );
                    }
                    PeerState::Quarantined if silent_for > self.keepalive_window * 2 => {
                        peer.state = PeerState::Dropped;
                        dropped.push(peer.node_id);
                    }
                    _ => {}
                }
            }
        }
        for node_id in dropped {
            log::warn!("peer {} dropped: missed second keepalive window", short_id(&node_id));
            let _ = self.events.send(NodeEvent::PeerDropped { node_id });
        }
    }

    /// Forwarding outcome reported by the router; feeds reputation
    pub async fn record_forward_outcome(&self, node_id: &NodeId, success: bool) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            if success {
                peer.forwards_ok += 1;
            } else {
                peer.forwards_failed += 1;
            }
            peer.recompute_reputation();
        }
    }

    pub async fn get(&self, node_id: &NodeId) -> Option<PeerRecord> {
        self.peers.read().await.get(node_id).cloned()
    }

    /// All peers currently in `Active`
    pub async fn list_active(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state == PeerState::Active)
            .cloned()
            .collect()
    }

    pub async fn list_all(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn count_active(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state == PeerState::Active)
            .count()
    }

    /// Discovered peers worth dialing while below `min_peers`
    pub async fn dial_candidates(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state == PeerState::Discovered)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let peers = self.peers.read().await;
        let mut stats = RegistryStats {
            total: peers.len(),
            ..Default::default()
        };
        for peer in peers.values() {
            match peer.state {
                PeerState::Discovered => stats.discovered += 1,
                PeerState::Connecting | PeerState::Handshaking => stats.connecting += 1,
                PeerState::Active => stats.active += 1,
                PeerState::Quarantined => stats.quarantined += 1,
                PeerState::Dropped => stats.dropped += 1,
            }
        }
        stats
    }

    async fn drop_peer_inner(&self, node_id: &NodeId, reason: &str) {
        let mut peers = self.peers.write().await;
        let newly_dropped = match peers.get_mut(node_id) {
            Some(peer) if peer.state != PeerState::Dropped => {
                peer.state = PeerState::Dropped;
                true
            }
            _ => false,
        };
        drop(peers);

        if newly_dropped {
            log::info!("peer {} dropped: {}", short_id(node_id), reason);
            let _ = self.events.send(NodeEvent::PeerDropped { node_id: *node_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info(seed: u8) -> NodeInfo {
        NodeInfo {
            node_id: [seed; 32],
            address: format!("127.0.0.1:{}", 9000 + seed as u16),
            dh_public_key: [seed; 32],
            capabilities: vec![Capability::Relay, Capability::Encryption],
            region: "eu-west".to_string(),
            bandwidth_profile: BandwidthProfile::default(),
            version: crate::protocol::PROTOCOL_ID.to_string(),
        }
    }

    fn test_registry(keepalive: Duration) -> PeerRegistry {
        let (events, _) = broadcast::channel(64);
        PeerRegistry::new(keepalive, 2, 50, events)
    }

    #[tokio::test]
    async fn test_discover_then_activate() {
        let registry = test_registry(Duration::from_secs(15));
        let info = test_info(1);

        assert!(registry.on_discover(&info).await);
        assert!(!registry.on_discover(&info).await);
        assert_eq!(registry.get(&info.node_id).await.unwrap().state, PeerState::Discovered);

        registry.begin_connect(&info.node_id).await.unwrap();
        registry.begin_handshake(&info.node_id).await.unwrap();
        registry.activate(&info).await.unwrap();

        let peer = registry.get(&info.node_id).await.unwrap();
        assert_eq!(peer.state, PeerState::Active);
        assert!(peer.connected_at.is_some());
        assert_eq!(registry.count_active().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_profile_and_last_seen() {
        let registry = test_registry(Duration::from_secs(15));
        let info = test_info(2);
        registry.activate(&info).await.unwrap();

        let profile = BandwidthProfile {
            download_mbps: 50.0,
            latency_ms: 80.0,
            ..Default::default()
        };
        registry.on_heartbeat(&info.node_id, profile).await.unwrap();

        let peer = registry.get(&info.node_id).await.unwrap();
        assert_eq!(peer.bandwidth_profile.download_mbps, 50.0);
        assert_eq!(peer.bandwidth_profile.latency_ms, 80.0);
        assert!(peer.last_seen.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_missed_windows_quarantine_then_drop() {
        // Tight keepalive so the sweep sees a silent peer immediately
        let registry = test_registry(Duration::from_millis(10));
        let info = test_info(3);
        registry.activate(&info).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.check_keepalive().await;
        assert_eq!(registry.get(&info.node_id).await.unwrap().state, PeerState::Quarantined);

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.check_keepalive().await;
        assert_eq!(registry.get(&info.node_id).await.unwrap().state, PeerState::Dropped);
    }

    #[tokio::test]
    async fn test_dropped_peer_emits_event() {
        let (events, mut rx) = broadcast::channel(64);
        let registry = PeerRegistry::new(Duration::from_secs(15), 2, 50, events);
        let info = test_info(4);
        registry.activate(&info).await.unwrap();
        // Drain the connect events
        while let Ok(event) = rx.try_recv() {
            drop(event);
        }

        registry.on_disconnect(&info.node_id).await;
        match rx.try_recv() {
            Ok(NodeEvent::PeerDropped { node_id }) => assert_eq!(node_id, info.node_id),
            other => panic!("expected PeerDropped, got {:?}", other),
        }

        // Dropped is terminal
        assert!(registry.on_heartbeat(&info.node_id, BandwidthProfile::default()).await.is_err());
        assert!(registry.activate(&info).await.is_err());
    }

    #[tokio::test]
    async fn test_quarantined_peer_recovers_on_heartbeat() {
        let registry = test_registry(Duration::from_millis(10));
        let info = test_info(5);
        registry.activate(&info).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.check_keepalive().await;
        assert_eq!(registry.get(&info.node_id).await.unwrap().state, PeerState::Quarantined);

        registry
            .on_heartbeat(&info.node_id, BandwidthProfile::default())
            .await
            .unwrap();
        assert_eq!(registry.get(&info.node_id).await.unwrap().state, PeerState::Active);
    }

    #[tokio::test]
    async fn test_forward_outcomes_move_reputation() {
        let registry = test_registry(Duration::from_secs(15));
        let info = test_info(6);
        registry.activate(&info).await.unwrap();

        for _ in 0..10 {
            registry.record_forward_outcome(&info.node_id, true).await;
        }
        let good = registry.get(&info.node_id).await.unwrap().reputation;

        for _ in 0..10 {
            registry.record_forward_outcome(&info.node_id, false).await;
        }
        let worse = registry.get(&info.node_id).await.unwrap().reputation;
        assert!(worse < good);
        assert!((0.0..=1.0).contains(&worse));
    }

    #[tokio::test]
    async fn test_max_peers_bounds_discovery() {
        let (events, _) = broadcast::channel(64);
        let registry = PeerRegistry::new(Duration::from_secs(15), 2, 2, events);
        assert!(registry.on_discover(&test_info(1)).await);
        assert!(registry.on_discover(&test_info(2)).await);
        assert!(!registry.on_discover(&test_info(3)).await);
        assert_eq!(registry.count().await, 2);
    }
}
