//! Router: route cache, forwarding, and invalidation
//!
//! Exclusive owner of routes. `find_route` serves from an LRU cache keyed by
//! `(destination, requirements-hash)` and falls back to the optimizer; `send`
//! seals and emits packets toward the next hop with one re-route retry on
//! routing failures. Invalidation consumes peer drops and bandwidth reports.

pub mod optimizer;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::{broadcast, RwLock};

use crate::accounting::Accounting;
use crate::coordinator::NodeEvent;
use crate::crypto::{encryption, NodeIdentity};
use crate::error::{Error, Result, RouteError};
use crate::peer::{PeerRegistry, PeerState};
use crate::protocol::wire::{DataPacketPayload, Envelope, MessagePayload};
use crate::protocol::{
    short_id, DataPacket, KeyMode, NodeId, Route, RouteId, RouteRequirements,
};
use crate::transport::EnvelopeSink;

/// Fraction of a route's byte budget that triggers a bandwidth warning
const BANDWIDTH_WARN_FRACTION: f64 = 0.8;

/// Byte budget for a route: its bandwidth figure interpreted as megabytes
fn route_byte_budget(bandwidth_mbps: f64) -> f64 {
    bandwidth_mbps * 1_000_000.0
}

type CacheKey = (String, [u8; 32]);

/// Router configuration slice
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub route_ttl: Duration,
    pub cache_max: usize,
    pub encryption_required: bool,
    pub key_mode: KeyMode,
}

/// Aggregate router counters
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub active_routes: usize,
    pub cached_entries: usize,
    pub optimizer_runs: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

/// Router: route cache plus forwarding engine
pub struct Router {
    identity: Arc<NodeIdentity>,
    registry: Arc<PeerRegistry>,
    sink: Arc<dyn EnvelopeSink>,
    accounting: Arc<Accounting>,
    config: RouterConfig,
    routes: Arc<RwLock<HashMap<RouteId, Route>>>,
    cache: Arc<RwLock<LruCache<CacheKey, RouteId>>>,
    events: broadcast::Sender<NodeEvent>,
    optimizer_runs: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Router {
    pub fn new(
        identity: Arc<NodeIdentity>,
        registry: Arc<PeerRegistry>,
        sink: Arc<dyn EnvelopeSink>,
        accounting: Arc<Accounting>,
        config: RouterConfig,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let cache_max = NonZeroUsize::new(config.cache_max.max(1))
            .expect("cache_max clamped to at least 1");
        Self {
            identity,
            registry,
            sink,
            accounting,
            config,
            routes: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(RwLock::new(LruCache::new(cache_max))),
            events,
            optimizer_runs: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Find or create a route for a destination under the given requirements
    pub async fn find_route(
        &self,
        destination: &str,
        requirements: &RouteRequirements,
    ) -> Result<Route> {
        let key: CacheKey = (destination.to_string(), requirements.canonical_hash());

        // Cache hit path: the entry must still point at a valid route
        let cached_id = self.cache.write().await.get(&key).copied();
        if let Some(route_id) = cached_id {
            let route = self.routes.read().await.get(&route_id).cloned();
            if let Some(route) = route {
                if self.route_is_valid(&route).await {
                    return Ok(route);
                }
            }
            // Stale entry: drop it and rebuild below
            self.cache.write().await.pop(&key);
            self.remove_route_inner(&route_id).await;
        }

        self.create_route(destination, requirements, key).await
    }

    async fn create_route(
        &self,
        destination: &str,
        requirements: &RouteRequirements,
        key: CacheKey,
    ) -> Result<Route> {
        let candidates = self.registry.list_active().await;
        self.optimizer_runs.fetch_add(1, Ordering::Relaxed);
        let hop = optimizer::select_path(&candidates, requirements)?.clone();

        let now = Instant::now();
        let route = Route {
            route_id: crate::crypto::random::random_route_id(),
            destination: destination.to_string(),
            requirements: requirements.clone(),
            hops: vec![hop.node_id],
            latency_ms: hop.bandwidth_profile.latency_ms,
            bandwidth_mbps: hop.bandwidth_profile.download_mbps,
            cost: optimizer::path_cost(&hop),
            encrypted: requirements
                .require_encryption
                .unwrap_or(self.config.encryption_required),
            key_mode: self.config.key_mode,
            created_at: now,
            expires_at: now + self.config.route_ttl,
            bytes_used: 0,
        };

        self.routes.write().await.insert(route.route_id, route.clone());
        self.cache.write().await.put(key, route.route_id);

        log::info!(
            "route {} created to {} via {}",
            hex::encode(route.route_id),
            destination,
            short_id(&hop.node_id)
        );
        let _ = self.events.send(NodeEvent::RouteCreated {
            route_id: route.route_id,
            destination: destination.to_string(),
        });
        Ok(route)
    }

    /// A route is valid iff it has not expired and every hop is still active
    pub async fn route_is_valid(&self, route: &Route) -> bool {
        if route.is_expired(Instant::now()) {
            return false;
        }
        for hop in &route.hops {
            match self.registry.get(hop).await {
                Some(peer) if peer.state == PeerState::Active => {}
                _ => return false,
            }
        }
        true
    }

    /// Send a client payload along a route. Routing failures trigger exactly
    /// one re-route retry with a fresh route before surfacing. Returns the
    /// id of the route that actually carried the packet so callers can
    /// rebind after a transparent re-route.
    pub async fn send(&self, route_id: RouteId, payload: Vec<u8>) -> Result<RouteId> {
        let route = self
            .routes
            .read()
            .await
            .get(&route_id)
            .cloned()
            .ok_or(Error::Route(RouteError::Invalid("unknown route".to_string())))?;

        match self.forward_on(&route, &payload).await {
            Ok(()) => Ok(route_id),
            Err(Error::Route(cause)) => {
                log::warn!(
                    "forward on route {} failed ({}), retrying with a fresh route",
                    hex::encode(route_id),
                    cause
                );
                self.remove_route(&route_id).await;
                let fresh = self
                    .find_route(&route.destination, &route.requirements)
                    .await?;
                self.forward_on(&fresh, &payload).await?;
                Ok(fresh.route_id)
            }
            Err(other) => Err(other),
        }
    }

    /// One forwarding attempt: validate, seal, hand to the transport, then
    /// do the byte bookkeeping.
    async fn forward_on(&self, route: &Route, payload: &[u8]) -> Result<()> {
        if route.is_expired(Instant::now()) {
            return Err(Error::Route(RouteError::Expired));
        }
        let hop = route.first_hop();
        let peer = match self.registry.get(&hop).await {
            Some(peer) if peer.state == PeerState::Active => peer,
            _ => return Err(Error::Route(RouteError::PeerGone)),
        };

        let mut packet = DataPacket::new(
            crate::crypto::random::random_message_id(),
            self.identity.node_id,
            route.destination.clone(),
            route.hops.clone(),
            payload.to_vec(),
        );
        packet.signature = self.identity.sign(&packet.canonical_bytes()).to_vec();
        packet.validate()?;

        let sealed = if route.encrypted {
            encryption::seal_packet(&packet, route.key_mode, &self.identity, &peer.dh_public_key)?
        } else {
            encryption::seal_plain(&packet)?
        };

        let mut envelope = Envelope::new(
            self.identity.node_id,
            Some(hop),
            MessagePayload::DataPacket(sealed),
        );
        envelope.sign(&self.identity.keypair);

        if let Err(e) = self.sink.send_envelope(hop, envelope).await {
            self.registry.record_forward_outcome(&hop, false).await;
            return Err(match e {
                Error::Route(cause) => Error::Route(cause),
                Error::Peer(_) => Error::Route(RouteError::PeerGone),
                other => other,
            });
        }

        let bytes = payload.len() as u64;
        self.bookkeep_forward(route.route_id, hop, bytes).await;
        Ok(())
    }

    async fn bookkeep_forward(&self, route_id: RouteId, hop: NodeId, bytes: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);

        let mut warn = None;
        {
            let mut routes = self.routes.write().await;
            if let Some(route) = routes.get_mut(&route_id) {
                route.bytes_used = route.bytes_used.saturating_add(bytes);
                let budget = route_byte_budget(route.bandwidth_mbps);
                if route.bytes_used as f64 > BANDWIDTH_WARN_FRACTION * budget {
                    warn = Some((route.bytes_used, route.bandwidth_mbps));
                }
            }
        }

        if let Some((bytes_used, bandwidth_mbps)) = warn {
            log::warn!(
                "route {} nearing bandwidth budget: {} bytes used",
                hex::encode(route_id),
                bytes_used
            );
            let _ = self.events.send(NodeEvent::BandwidthWarning {
                route_id,
                bytes_used,
                bandwidth_mbps,
            });
        }

        self.accounting.record_forwarded(&hop, bytes).await;
        self.registry.record_forward_outcome(&hop, true).await;
        let _ = self.events.send(NodeEvent::PacketForwarded {
            node_id: hop,
            bytes,
        });
    }

    /// Transit forwarding: a sealed packet arrived addressed to us. Pop
    /// ourselves off the snapshot head and either pass it on or deliver.
    pub async fn handle_transit(
        &self,
        from: NodeId,
        payload: &DataPacketPayload,
    ) -> Result<Option<DataPacket>> {
        let from_peer = self.registry.get(&from).await;
        let remote_dh = from_peer.map(|p| p.dh_public_key).unwrap_or([0u8; 32]);
        let mut packet = encryption::open_packet(payload, &self.identity, &remote_dh)?;

        if !crate::crypto::verify_signature(
            &packet.source,
            &packet.canonical_bytes(),
            &packet.signature,
        ) {
            return Err(Error::Wire(crate::error::WireError::BadSignature));
        }

        // Consume our hop from the snapshot head
        if packet.route_snapshot.first() == Some(&self.identity.node_id) {
            packet.route_snapshot.remove(0);
        }

        let bytes = packet.payload.len() as u64;
        match packet.route_snapshot.first().copied() {
            Some(next_hop) => {
                let peer = match self.registry.get(&next_hop).await {
                    Some(peer) if peer.state == PeerState::Active => peer,
                    _ => return Err(Error::Route(RouteError::PeerGone)),
                };
                let sealed = if payload.encrypted {
                    encryption::seal_packet(
                        &packet,
                        payload.key_mode,
                        &self.identity,
                        &peer.dh_public_key,
                    )?
                } else {
                    encryption::seal_plain(&packet)?
                };
                let mut envelope = Envelope::new(
                    self.identity.node_id,
                    Some(next_hop),
                    MessagePayload::DataPacket(sealed),
                );
                envelope.sign(&self.identity.keypair);
                self.sink.send_envelope(next_hop, envelope).await?;

                self.accounting
                    .record_forwarded(&self.identity.node_id, bytes)
                    .await;
                let _ = self.events.send(NodeEvent::PacketForwarded {
                    node_id: self.identity.node_id,
                    bytes,
                });
                Ok(None)
            }
            None => {
                // End of the path: deliver locally
                self.accounting
                    .record_forwarded(&self.identity.node_id, bytes)
                    .await;
                let _ = self.events.send(NodeEvent::PacketForwarded {
                    node_id: self.identity.node_id,
                    bytes,
                });
                Ok(Some(packet))
            }
        }
    }

    /// A peer was dropped: remove every route referencing it. Returns the
    /// removed route ids so sessions bound to them can be closed.
    pub async fn invalidate_peer(&self, node_id: &NodeId) -> Vec<RouteId> {
        let removed: Vec<RouteId> = {
            let routes = self.routes.read().await;
            routes
                .values()
                .filter(|r| r.hops.contains(node_id))
                .map(|r| r.route_id)
                .collect()
        };
        for route_id in &removed {
            self.remove_route(route_id).await;
        }
        if !removed.is_empty() {
            log::info!(
                "invalidated {} route(s) through dropped peer {}",
                removed.len(),
                short_id(node_id)
            );
        }
        removed
    }

    /// A bandwidth report arrived from `reporter`: cached lookups through it
    /// must re-score on next use. Active routes keep flowing.
    pub async fn on_bandwidth_report(&self, reporter: &NodeId) {
        let routes = self.routes.read().await;
        let mut cache = self.cache.write().await;
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(_, route_id)| {
                routes
                    .get(*route_id)
                    .map(|r| r.hops.contains(reporter))
                    .unwrap_or(true)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
        let _ = self.events.send(NodeEvent::BandwidthReport {
            node_id: *reporter,
        });
    }

    /// Periodic sweep removing expired routes. Returns what was removed.
    pub async fn sweep_expired(&self) -> Vec<RouteId> {
        let now = Instant::now();
        let expired: Vec<RouteId> = {
            let routes = self.routes.read().await;
            routes
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.route_id)
                .collect()
        };
        for route_id in &expired {
            self.remove_route(route_id).await;
        }
        expired
    }

    /// Remove a route and its cache entry, announcing the removal
    pub async fn remove_route(&self, route_id: &RouteId) {
        if self.remove_route_inner(route_id).await {
            let _ = self.events.send(NodeEvent::RouteRemoved {
                route_id: *route_id,
            });
        }
    }

    async fn remove_route_inner(&self, route_id: &RouteId) -> bool {
        let removed = self.routes.write().await.remove(route_id);
        if let Some(route) = removed {
            let key = (route.destination.clone(), route.requirements.canonical_hash());
            self.cache.write().await.pop(&key);
            true
        } else {
            false
        }
    }

    pub async fn get_route(&self, route_id: &RouteId) -> Option<Route> {
        self.routes.read().await.get(route_id).cloned()
    }

    pub async fn list_routes(&self) -> Vec<Route> {
        self.routes.read().await.values().cloned().collect()
    }

    pub fn optimizer_runs(&self) -> u64 {
        self.optimizer_runs.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            active_routes: self.routes.read().await.len(),
            cached_entries: self.cache.read().await.len(),
            optimizer_runs: self.optimizer_runs.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}
