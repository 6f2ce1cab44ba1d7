//! Node coordinator
//!
//! Single owner of the component graph. Constructs every subsystem in
//! dependency order, wires them through one typed event bus, runs the
//! maintenance timers (keepalive sweep, route expiry sweep, reward
//! distribution), and tears everything down in reverse order, flushing the
//! ledger journal last.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;

use crate::accounting::{Accounting, Performance};
use crate::config::NodeConfig;
use crate::crypto::NodeIdentity;
use crate::error::Result;
use crate::ledger::{journal::Journal, Ledger};
use crate::peer::PeerRegistry;
use crate::protocol::wire::{
    BandwidthReportPayload, Envelope, MessagePayload, NodeDiscoveryPayload, RouteDescriptor,
    RouteResponsePayload,
};
use crate::protocol::{
    short_id, Capability, DataPacket, NodeId, NodeInfo, RouteId, SessionId, TokenAmount,
    PROTOCOL_ID,
};
use crate::reward::{RewardConfig, RewardEngine};
use crate::routing::{Router, RouterConfig};
use crate::session::SessionManager;
use crate::transport::{EnvelopeSink, InboundMessage, TransportConfig, TransportCoordinator};

/// Capacity of the broadcast event bus
const EVENT_BUS_CAPACITY: usize = 256;

/// Typed events published on the node's event bus. Publication order is
/// preserved per publisher; consumers treat events as hints over the
/// authoritative pull APIs.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected { node_id: NodeId },
    PeerDropped { node_id: NodeId },
    HandshakeOk { node_id: NodeId },
    HandshakeErr { node_id: NodeId, reason: String },
    RouteCreated { route_id: RouteId, destination: String },
    RouteRemoved { route_id: RouteId },
    PacketForwarded { node_id: NodeId, bytes: u64 },
    SessionOpened { session_id: SessionId, client_id: String },
    SessionClosed { session_id: SessionId },
    SessionServed { node_id: NodeId },
    BandwidthWarning { route_id: RouteId, bytes_used: u64, bandwidth_mbps: f64 },
    BandwidthReport { node_id: NodeId },
    RewardDistributed { node_id: NodeId, amount: TokenAmount },
    RewardPoolExhausted { remaining: TokenAmount },
}

/// The assembled node
pub struct NodeCoordinator {
    pub config: NodeConfig,
    pub identity: Arc<NodeIdentity>,
    pub registry: Arc<PeerRegistry>,
    pub transport: Arc<TransportCoordinator>,
    pub accounting: Arc<Accounting>,
    pub router: Arc<Router>,
    pub sessions: Arc<SessionManager>,
    pub ledger: Arc<Ledger>,
    pub rewards: Arc<RewardEngine>,
    events: broadcast::Sender<NodeEvent>,
    delivered_tx: mpsc::Sender<DataPacket>,
    delivered_rx: tokio::sync::Mutex<Option<mpsc::Receiver<DataPacket>>>,
    is_running: Arc<RwLock<bool>>,
}

impl NodeCoordinator {
    /// Build the full component graph with persistent identity and ledger
    /// under the configured data directory.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let data_dir = config.resolved_data_dir()?;
        std::fs::create_dir_all(&data_dir)?;
        let identity = Arc::new(NodeIdentity::load_or_generate(format!(
            "{}/identity.bin",
            data_dir
        ))?);

        // A configured node_id pins the expected identity; a mismatch means
        // the operator pointed the node at the wrong data directory
        if let Some(expected) = &config.node_id {
            let actual = hex::encode(identity.node_id);
            if expected.to_lowercase() != actual {
                return Err(crate::error::Error::Config(format!(
                    "configured node_id {} does not match identity {}",
                    expected, actual
                )));
            }
        }

        let journal = Journal::open(format!("{}/ledger", data_dir))?;
        Self::assemble(config, identity, Some(journal)).await
    }

    /// Build the graph with a fresh identity and no persistence. Used by
    /// tests and ephemeral nodes.
    pub async fn new_in_memory(config: NodeConfig) -> Result<Self> {
        let identity = Arc::new(NodeIdentity::generate());
        Self::assemble(config, identity, None).await
    }

    /// Startup order: crypto, codec, ledger genesis, registry, transport,
    /// router, sessions, accounting, rewards.
    async fn assemble(
        config: NodeConfig,
        identity: Arc<NodeIdentity>,
        journal: Option<Journal>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        // Ledger with genesis: the reward pool takes its fraction, the
        // operator account keeps the rest
        let ledger = Arc::new(Ledger::new(
            identity.keypair.clone(),
            config.min_stake_amount(),
        ));
        if let Some(journal) = journal {
            ledger.attach_journal(journal).await?;
        }
        let supply = config.initial_supply_amount();
        let pool = TokenAmount::new(
            (supply.units() as f64 * config.reward_pool_fraction) as u64,
        );
        let operator = supply.saturating_sub(pool);
        ledger.genesis(&[(identity.node_id, operator)], pool).await?;

        let registry = Arc::new(PeerRegistry::new(
            config.keepalive_interval,
            config.keepalive_misses_before_quarantine,
            config.max_peers,
            events.clone(),
        ));

        let local_info = NodeInfo {
            node_id: identity.node_id,
            address: config.listen_addr.clone(),
            dh_public_key: identity.dh_public,
            capabilities: vec![Capability::Relay, Capability::Encryption],
            region: config.region.clone(),
            bandwidth_profile: Default::default(),
            version: PROTOCOL_ID.to_string(),
        };
        let transport = Arc::new(TransportCoordinator::new(
            identity.clone(),
            registry.clone(),
            TransportConfig {
                listen_addr: config.listen_addr.clone(),
                handshake_timeout: config.handshake_timeout,
                keepalive_interval: config.keepalive_interval,
                send_queue_capacity: config.send_queue_capacity,
                max_peers: config.max_peers,
            },
            local_info,
        ));

        let accounting = Arc::new(Accounting::new());
        let router = Arc::new(Router::new(
            identity.clone(),
            registry.clone(),
            transport.clone(),
            accounting.clone(),
            RouterConfig {
                route_ttl: config.route_ttl,
                cache_max: config.route_cache_max,
                encryption_required: config.encryption_required,
                key_mode: config.key_mode,
            },
            events.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            router.clone(),
            accounting.clone(),
            events.clone(),
        ));
        let rewards = Arc::new(RewardEngine::new(
            ledger.clone(),
            accounting.clone(),
            RewardConfig {
                reward_rate: config.reward_rate,
                min_stake: config.min_stake_amount(),
                max_reward_per_day: config.max_reward_amount(),
            },
            events.clone(),
        ));

        let (delivered_tx, delivered_rx) = mpsc::channel(256);
        Ok(Self {
            config,
            identity,
            registry,
            transport,
            accounting,
            router,
            sessions,
            ledger,
            rewards,
            events,
            delivered_tx,
            delivered_rx: tokio::sync::Mutex::new(Some(delivered_rx)),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Subscribe to the event bus
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Take the stream of packets delivered to this node as final hop
    pub async fn take_delivered(&self) -> Option<mpsc::Receiver<DataPacket>> {
        self.delivered_rx.lock().await.take()
    }

    /// Start the node: listener, bootstrap dials, event pump, timers
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.is_running.write().await = true;
        self.transport.start().await?;

        for address in self.config.bootstrap_peers.clone() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                match this.transport.connect(&address).await {
                    Ok(peer) => log::info!("bootstrap peer {} connected", short_id(&peer)),
                    Err(e) => log::warn!("bootstrap dial {} failed: {}", address, e),
                }
            });
        }

        self.spawn_inbound_pump();
        self.spawn_event_pump();
        self.spawn_timers();

        log::info!(
            "node {} started on {}",
            short_id(&self.identity.node_id),
            self.config.listen_addr
        );
        Ok(())
    }

    /// Shutdown in reverse start order; the ledger flushes last
    pub async fn shutdown(&self) -> Result<()> {
        *self.is_running.write().await = false;
        self.transport.shutdown().await;
        self.ledger.flush().await?;
        log::info!("node {} stopped", short_id(&self.identity.node_id));
        Ok(())
    }

    /// Inbound messages from the transport, strictly ordered per peer
    fn spawn_inbound_pump(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut inbound) = this.transport.take_inbound().await else {
                return;
            };
            while let Some(message) = inbound.recv().await {
                if !*this.is_running.read().await {
                    break;
                }
                this.handle_inbound(message).await;
            }
        });
    }

    async fn handle_inbound(&self, message: InboundMessage) {
        let InboundMessage { from, envelope } = message;
        match envelope.payload {
            MessagePayload::RouteRequest(request) => {
                let response = match self
                    .router
                    .find_route(&request.destination, &request.requirements)
                    .await
                {
                    Ok(route) => RouteResponsePayload {
                        request_id: request.request_id,
                        route: Some(RouteDescriptor {
                            route_id: route.route_id,
                            destination: route.destination.clone(),
                            hops: route.hops.clone(),
                            latency_ms: route.latency_ms,
                            bandwidth_mbps: route.bandwidth_mbps,
                            cost: route.cost,
                            encrypted: route.encrypted,
                            ttl_secs: route.remaining_ttl(std::time::Instant::now()).as_secs(),
                        }),
                        alternatives: Vec::new(),
                    },
                    Err(e) => {
                        log::debug!("route request from {} failed: {}", short_id(&from), e);
                        RouteResponsePayload {
                            request_id: request.request_id,
                            route: None,
                            alternatives: Vec::new(),
                        }
                    }
                };
                let mut reply = Envelope::new(
                    self.identity.node_id,
                    Some(from),
                    MessagePayload::RouteResponse(response),
                );
                reply.sign(&self.identity.keypair);
                if let Err(e) = self.transport.send_envelope(from, reply).await {
                    log::debug!("route response to {} not sent: {}", short_id(&from), e);
                }
            }
            MessagePayload::DataPacket(payload) => {
                match self.router.handle_transit(from, &payload).await {
                    Ok(Some(packet)) => {
                        let _ = self.delivered_tx.send(packet).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("transit packet from {} rejected: {}", short_id(&from), e);
                        if e.quarantines_peer() {
                            self.registry.quarantine(&from, &e.to_string()).await;
                        }
                    }
                }
            }
            MessagePayload::NodeDiscovery(discovery) => {
                for info in &discovery.nodes {
                    if info.node_id != self.identity.node_id {
                        self.registry.on_discover(info).await;
                    }
                }
            }
            MessagePayload::BandwidthReport(report) => {
                self.router.on_bandwidth_report(&from).await;
                let reputation = self
                    .registry
                    .get(&from)
                    .await
                    .map(|p| p.reputation)
                    .unwrap_or(0.5);
                self.accounting
                    .update_performance(
                        &from,
                        Performance {
                            uptime_pct: report.bandwidth_profile.uptime_pct,
                            avg_latency_ms: report.bandwidth_profile.latency_ms,
                            reputation,
                        },
                    )
                    .await;
            }
            MessagePayload::Error(error) => {
                log::warn!("peer {} reported error: {}", short_id(&from), error.message);
            }
            MessagePayload::RouteResponse(_) => {
                // Relay nodes answer route requests in-process; a response
                // arriving here has no pending query to match
                log::debug!("unsolicited route response from {}", short_id(&from));
            }
            MessagePayload::Handshake(_) | MessagePayload::Heartbeat(_) => {
                // Absorbed by the transport before reaching this pump
            }
        }
    }

    /// Cross-component reactions to bus events: a dropped peer invalidates
    /// its routes and closes the sessions bound to them.
    fn spawn_event_pump(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::PeerDropped { node_id }) => {
                        this.handle_peer_dropped(&node_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("event pump lagged, {} events missed", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if !*this.is_running.read().await {
                    break;
                }
            }
        });
    }

    /// Remove routes through a dropped peer and close their sessions
    pub async fn handle_peer_dropped(&self, node_id: &NodeId) {
        let removed = self.router.invalidate_peer(node_id).await;
        if !removed.is_empty() {
            let closed = self.sessions.close_for_routes(&removed).await;
            log::info!(
                "peer {} drop closed {} route(s), {} session(s)",
                short_id(node_id),
                removed.len(),
                closed.len()
            );
        }
    }

    fn spawn_timers(self: &Arc<Self>) {
        // Keepalive sweep drives quarantine and drop transitions; the same
        // cadence carries peer gossip, and every fourth tick a bandwidth
        // self-report
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(this.config.keepalive_interval);
            let mut ticks = 0u64;
            loop {
                ticker.tick().await;
                if !*this.is_running.read().await {
                    break;
                }
                this.registry.check_keepalive().await;
                this.mirror_performance().await;
                this.maintain_min_peers().await;
                this.gossip_peers().await;
                ticks += 1;
                if ticks % 4 == 0 {
                    this.send_bandwidth_report().await;
                }
            }
        });

        // Route expiry sweep
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let sweep_every = (this.config.route_ttl / 10).max(Duration::from_secs(1));
            let mut ticker = interval(sweep_every);
            loop {
                ticker.tick().await;
                if !*this.is_running.read().await {
                    break;
                }
                let expired = this.router.sweep_expired().await;
                if !expired.is_empty() {
                    this.sessions.close_for_routes(&expired).await;
                }
            }
        });

        // Reward distribution on the configured interval
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(this.config.distribution_interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if !*this.is_running.read().await {
                    break;
                }
                let period = format!("auto-{}", crate::protocol::unix_timestamp());
                if let Err(e) = this.rewards.distribute(&period).await {
                    log::warn!("scheduled distribution failed: {}", e);
                }
            }
        });
    }

    /// Mirror registry reputation and heartbeat profiles into accounting's
    /// rolling performance figures.
    async fn mirror_performance(&self) {
        for peer in self.registry.list_active().await {
            self.accounting
                .update_performance(
                    &peer.node_id,
                    Performance {
                        uptime_pct: peer.bandwidth_profile.uptime_pct,
                        avg_latency_ms: peer.bandwidth_profile.latency_ms,
                        reputation: peer.reputation,
                    },
                )
                .await;
        }
    }

    /// Share the active peer set with every connected peer
    async fn gossip_peers(&self) {
        let active = self.registry.list_active().await;
        if active.is_empty() {
            return;
        }
        let payload = MessagePayload::NodeDiscovery(NodeDiscoveryPayload {
            nodes: active.iter().map(|p| p.to_node_info()).collect(),
        });
        for peer in self.transport.connected_peers() {
            let mut envelope = Envelope::new(self.identity.node_id, Some(peer), payload.clone());
            envelope.sign(&self.identity.keypair);
            let _ = self.transport.send_envelope(peer, envelope).await;
        }
    }

    /// Self-report forwarding volume so peers re-score routes through us
    async fn send_bandwidth_report(&self) {
        let bytes = self.accounting.snapshot(&self.identity.node_id).await.bytes;
        let profile = self.transport.local_info().await.bandwidth_profile;
        let payload = MessagePayload::BandwidthReport(BandwidthReportPayload {
            bandwidth_profile: profile,
            bytes_forwarded: bytes,
            period_secs: self.config.keepalive_interval.as_secs() * 4,
        });
        for peer in self.transport.connected_peers() {
            let mut envelope = Envelope::new(self.identity.node_id, Some(peer), payload.clone());
            envelope.sign(&self.identity.keypair);
            let _ = self.transport.send_envelope(peer, envelope).await;
        }
    }

    /// Dial discovered nodes while below `min_peers`
    async fn maintain_min_peers(self: &Arc<Self>) {
        let active = self.registry.count_active().await;
        if active >= self.config.min_peers {
            return;
        }
        for candidate in self.registry.dial_candidates().await {
            if self.registry.count_active().await >= self.config.min_peers {
                break;
            }
            if self.registry.begin_connect(&candidate.node_id).await.is_err() {
                continue;
            }
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.transport.connect(&candidate.address).await {
                    log::debug!(
                        "dial to discovered node {} failed: {}",
                        short_id(&candidate.node_id),
                        e
                    );
                    let _ = this
                        .registry
                        .connect_failed(
                            &candidate.node_id,
                            crate::error::PeerError::DialFail(e.to_string()),
                        )
                        .await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RouteRequirements;

    fn test_config(listen: &str) -> NodeConfig {
        NodeConfig {
            listen_addr: listen.to_string(),
            keepalive_interval: Duration::from_millis(200),
            initial_supply: 20_000.0,
            reward_pool_fraction: 0.5,
            min_stake: 100.0,
            encryption_required: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_genesis_seeds_pool_and_operator() {
        let node = NodeCoordinator::new_in_memory(test_config("127.0.0.1:19501"))
            .await
            .unwrap();
        let pool = node.ledger.reward_pool_balance().await;
        assert_eq!(pool, TokenAmount::from_tokens(10_000.0).unwrap());
        let operator = node.ledger.balance(&node.identity.node_id).await;
        assert_eq!(operator, TokenAmount::from_tokens(10_000.0).unwrap());
        assert_eq!(
            node.ledger.total_supply().await,
            TokenAmount::from_tokens(20_000.0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_two_nodes_connect_and_route() {
        let a = Arc::new(
            NodeCoordinator::new_in_memory(test_config("127.0.0.1:19502"))
                .await
                .unwrap(),
        );
        let b = Arc::new(
            NodeCoordinator::new_in_memory(test_config("127.0.0.1:19503"))
                .await
                .unwrap(),
        );
        a.start().await.unwrap();
        b.start().await.unwrap();

        let b_id = a.transport.connect("127.0.0.1:19503").await.unwrap();
        assert_eq!(b_id, b.identity.node_id);

        // A can now route through B
        let route = a
            .router
            .find_route("dest", &RouteRequirements::default())
            .await
            .unwrap();
        assert_eq!(route.hops, vec![b_id]);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_drop_cascades_to_sessions() {
        let a = Arc::new(
            NodeCoordinator::new_in_memory(test_config("127.0.0.1:19504"))
                .await
                .unwrap(),
        );
        let b = Arc::new(
            NodeCoordinator::new_in_memory(test_config("127.0.0.1:19505"))
                .await
                .unwrap(),
        );
        a.start().await.unwrap();
        b.start().await.unwrap();

        let b_id = a.transport.connect("127.0.0.1:19505").await.unwrap();
        let session = a
            .sessions
            .open("client-1", "dest", &RouteRequirements::default())
            .await
            .unwrap();

        // Drop B directly and run the cascade
        a.registry.on_disconnect(&b_id).await;
        a.handle_peer_dropped(&b_id).await;

        assert!(!a.sessions.get(&session.session_id).await.unwrap().active);
        assert!(a.router.get_route(&session.route_id).await.is_none());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
