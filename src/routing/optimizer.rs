//! Path optimizer
//!
//! Pure, deterministic selection of a relay hop from the set of active
//! peers. Given identical input, every algorithm returns the same result;
//! ties break toward the lexicographically lower node id.

use crate::error::{Error, Result, RouteError};
use crate::peer::PeerRecord;
use crate::protocol::{Capability, RouteAlgorithm, RouteRequirements};

/// Bandwidth figure used for scoring: the peer's advertised download rate
fn bandwidth_of(peer: &PeerRecord) -> f64 {
    peer.bandwidth_profile.download_mbps
}

fn latency_of(peer: &PeerRecord) -> f64 {
    peer.bandwidth_profile.latency_ms
}

/// Cost of relaying through a peer: scarce bandwidth and high latency both
/// raise the price.
pub fn path_cost(peer: &PeerRecord) -> f64 {
    100.0 / bandwidth_of(peer).max(1.0) + latency_of(peer) / 100.0
}

/// Score a peer under the given algorithm. Higher is better.
pub fn score(peer: &PeerRecord, algorithm: RouteAlgorithm) -> f64 {
    let bw = bandwidth_of(peer);
    let lat = latency_of(peer);
    match algorithm {
        RouteAlgorithm::Shortest => bw - lat,
        RouteAlgorithm::LowestLatency => -lat,
        RouteAlgorithm::HighestBandwidth => bw,
        RouteAlgorithm::Balanced => {
            let bw_norm = (bw / 100.0).min(1.0);
            let lat_norm = (lat / 1000.0).min(1.0);
            let uptime_norm = (peer.bandwidth_profile.uptime_pct / 100.0).clamp(0.0, 1.0);
            0.4 * bw_norm + 0.3 * (1.0 - lat_norm) + 0.2 * peer.reputation + 0.1 * uptime_norm
        }
    }
}

fn satisfies(peer: &PeerRecord, requirements: &RouteRequirements) -> bool {
    if let Some(min_bw) = requirements.min_bandwidth_mbps {
        if bandwidth_of(peer) < min_bw {
            return false;
        }
    }
    if let Some(max_lat) = requirements.max_latency_ms {
        if latency_of(peer) > max_lat {
            return false;
        }
    }
    if let Some(max_cost) = requirements.max_cost {
        if path_cost(peer) > max_cost {
            return false;
        }
    }
    if !requirements.regions.is_empty() && !requirements.regions.contains(&peer.region) {
        return false;
    }
    if requirements.require_encryption == Some(true) && !peer.supports(Capability::Encryption) {
        return false;
    }
    true
}

/// Select the single relay hop for a route, or `RouteError::NotFound` when
/// no active peer satisfies the hard filters.
pub fn select_path<'a>(
    candidates: &'a [PeerRecord],
    requirements: &RouteRequirements,
) -> Result<&'a PeerRecord> {
    let mut best: Option<(&PeerRecord, f64)> = None;

    for peer in candidates.iter().filter(|p| satisfies(p, requirements)) {
        let peer_score = score(peer, requirements.algorithm);
        best = match best {
            None => Some((peer, peer_score)),
            Some((current, current_score)) => {
                if peer_score > current_score
                    || (peer_score == current_score && peer.node_id < current.node_id)
                {
                    Some((peer, peer_score))
                } else {
                    Some((current, current_score))
                }
            }
        };
    }

    best.map(|(peer, _)| peer)
        .ok_or(Error::Route(RouteError::NotFound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BandwidthProfile, NodeInfo};

    fn peer(seed: u8, bw: f64, lat: f64, reputation: f64) -> PeerRecord {
        let info = NodeInfo {
            node_id: [seed; 32],
            address: format!("peer-{}", seed),
            dh_public_key: [seed; 32],
            capabilities: vec![Capability::Relay, Capability::Encryption],
            region: "eu-west".to_string(),
            bandwidth_profile: BandwidthProfile {
                download_mbps: bw,
                upload_mbps: bw,
                latency_ms: lat,
                uptime_pct: 100.0,
                capacity_mbps: bw,
            },
            version: crate::protocol::PROTOCOL_ID.to_string(),
        };
        let mut record = PeerRecord::test_active(&info);
        record.reputation = reputation;
        record
    }

    #[test]
    fn test_balanced_prefers_fast_reliable_peer() {
        let candidates = vec![
            peer(1, 100.0, 50.0, 0.95),
            peer(2, 50.0, 100.0, 0.85),
            peer(3, 200.0, 25.0, 0.98),
        ];
        let req = RouteRequirements::default();
        let chosen = select_path(&candidates, &req).unwrap();
        assert_eq!(chosen.node_id, [3u8; 32]);
    }

    #[test]
    fn test_lowest_latency_and_highest_bandwidth() {
        let candidates = vec![
            peer(1, 100.0, 50.0, 0.9),
            peer(2, 50.0, 10.0, 0.9),
            peer(3, 200.0, 80.0, 0.9),
        ];
        let req = RouteRequirements {
            algorithm: RouteAlgorithm::LowestLatency,
            ..Default::default()
        };
        assert_eq!(select_path(&candidates, &req).unwrap().node_id, [2u8; 32]);

        let req = RouteRequirements {
            algorithm: RouteAlgorithm::HighestBandwidth,
            ..Default::default()
        };
        assert_eq!(select_path(&candidates, &req).unwrap().node_id, [3u8; 32]);
    }

    #[test]
    fn test_shortest_maximizes_bandwidth_minus_latency() {
        let candidates = vec![
            peer(1, 100.0, 90.0, 0.9), // 10
            peer(2, 80.0, 20.0, 0.9),  // 60
        ];
        let req = RouteRequirements {
            algorithm: RouteAlgorithm::Shortest,
            ..Default::default()
        };
        assert_eq!(select_path(&candidates, &req).unwrap().node_id, [2u8; 32]);
    }

    #[test]
    fn test_hard_filters_apply_before_scoring() {
        let candidates = vec![
            peer(1, 200.0, 300.0, 0.99), // best bandwidth, too slow
            peer(2, 60.0, 40.0, 0.80),
        ];
        let req = RouteRequirements {
            max_latency_ms: Some(100.0),
            algorithm: RouteAlgorithm::HighestBandwidth,
            ..Default::default()
        };
        assert_eq!(select_path(&candidates, &req).unwrap().node_id, [2u8; 32]);

        let req = RouteRequirements {
            min_bandwidth_mbps: Some(500.0),
            ..Default::default()
        };
        assert!(matches!(
            select_path(&candidates, &req),
            Err(Error::Route(RouteError::NotFound))
        ));
    }

    #[test]
    fn test_region_filter() {
        let mut us_peer = peer(1, 300.0, 10.0, 0.99);
        us_peer.region = "us-east".to_string();
        let candidates = vec![us_peer, peer(2, 50.0, 90.0, 0.7)];

        let req = RouteRequirements {
            regions: vec!["eu-west".to_string()],
            ..Default::default()
        };
        assert_eq!(select_path(&candidates, &req).unwrap().node_id, [2u8; 32]);
    }

    #[test]
    fn test_empty_candidates_is_not_found() {
        let req = RouteRequirements::default();
        assert!(matches!(
            select_path(&[], &req),
            Err(Error::Route(RouteError::NotFound))
        ));
    }

    #[test]
    fn test_ties_break_by_lower_node_id() {
        let a = peer(9, 100.0, 50.0, 0.9);
        let b = peer(4, 100.0, 50.0, 0.9);
        let candidates = vec![a, b];
        let req = RouteRequirements::default();
        assert_eq!(select_path(&candidates, &req).unwrap().node_id, [4u8; 32]);
    }

    #[test]
    fn test_deterministic_given_same_input() {
        let candidates = vec![
            peer(1, 100.0, 50.0, 0.95),
            peer(2, 50.0, 100.0, 0.85),
            peer(3, 200.0, 25.0, 0.98),
        ];
        let req = RouteRequirements::default();
        let first = select_path(&candidates, &req).unwrap().node_id;
        for _ in 0..10 {
            assert_eq!(select_path(&candidates, &req).unwrap().node_id, first);
        }
    }
}
