//! Transport layer for NetworkNeuron
//!
//! This module implements the session plane over TCP:
//! - Listening, dialing, and the signed handshake exchange
//! - Two cooperative tasks per peer (inbound reader, outbound writer)
//! - Length-prefixed framing of wire envelopes
//! - Keepalive heartbeats on the configured interval
//! - Bounded per-peer send queues with fail-fast backpressure

pub mod bounded_queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, timeout};

use crate::crypto::NodeIdentity;
use crate::error::{Error, PeerError, Result, WireError};
use crate::peer::PeerRegistry;
use crate::protocol::wire::{
    Envelope, HandshakePayload, HeartbeatPayload, MessagePayload, ReplayGuard, MAX_FRAME_SIZE,
};
use crate::protocol::{short_id, BandwidthProfile, NodeId, NodeInfo, PROTOCOL_ID};

use bounded_queue::{send_queue, PeerSendQueue, PeerSendQueueReceiver, SendQueueStats};

/// Where the router hands envelopes for delivery to a next hop.
///
/// The trait seam lets tests drive the router without sockets.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send_envelope(&self, peer: NodeId, envelope: Envelope) -> Result<()>;
}

/// A verified inbound message handed up to the coordinator
#[derive(Debug)]
pub struct InboundMessage {
    pub from: NodeId,
    pub envelope: Envelope,
}

/// Live connection state for one peer
struct PeerConnection {
    queue: PeerSendQueue,
    address: String,
}

/// Transport configuration slice
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_addr: String,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub send_queue_capacity: usize,
    pub max_peers: usize,
}

/// Transport coordinator: owns sockets, framing, handshakes, and keepalive
pub struct TransportCoordinator {
    identity: Arc<NodeIdentity>,
    registry: Arc<PeerRegistry>,
    config: TransportConfig,
    /// Node info advertised in handshakes and heartbeats
    local_info: Arc<RwLock<NodeInfo>>,
    connections: Arc<DashMap<NodeId, PeerConnection>>,
    replay: Arc<Mutex<ReplayGuard>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    is_running: Arc<RwLock<bool>>,
}

impl TransportCoordinator {
    pub fn new(
        identity: Arc<NodeIdentity>,
        registry: Arc<PeerRegistry>,
        config: TransportConfig,
        local_info: NodeInfo,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        Self {
            identity,
            registry,
            config,
            local_info: Arc::new(RwLock::new(local_info)),
            connections: Arc::new(DashMap::new()),
            replay: Arc::new(Mutex::new(ReplayGuard::default())),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the inbound message stream. Called once by the coordinator.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().await.take()
    }

    /// Refresh the bandwidth profile advertised in heartbeats
    pub async fn update_local_profile(&self, profile: BandwidthProfile) {
        self.local_info.write().await.bandwidth_profile = profile;
    }

    pub async fn local_info(&self) -> NodeInfo {
        self.local_info.read().await.clone()
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.connections.contains_key(peer)
    }

    pub fn queue_stats(&self, peer: &NodeId) -> Option<SendQueueStats> {
        self.connections.get(peer).map(|c| c.queue.stats())
    }

    /// Bind the listener and start accepting inbound connections
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.is_running.write().await = true;

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| Error::Peer(PeerError::DialFail(format!("bind: {}", e))))?;
        log::info!("transport listening on {}", self.config.listen_addr);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !*this.is_running.read().await {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move {
                            if let Err(e) = this.accept_connection(stream, addr.to_string()).await {
                                log::debug!("inbound connection from {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                    }
                }
            }
        });

        self.start_keepalive();
        Ok(())
    }

    /// Stop accepting and drop every connection
    pub async fn shutdown(&self) {
        *self.is_running.write().await = false;
        self.connections.clear();
        log::info!("transport stopped");
    }

    /// Dial a peer and run the handshake. Retries the dial once on timeout.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<NodeId> {
        match self.connect_once(address).await {
            Err(Error::TimedOut(_)) => {
                log::debug!("dial to {} timed out, retrying once", address);
                self.connect_once(address).await
            }
            other => other,
        }
    }

    async fn connect_once(self: &Arc<Self>, address: &str) -> Result<NodeId> {
        let stream = timeout(self.config.handshake_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::TimedOut(format!("dial {}", address)))?
            .map_err(|e| Error::Peer(PeerError::DialFail(e.to_string())))?;

        let (mut reader, mut writer) = stream.into_split();

        // Initiate: our signed handshake first, then the peer's answer
        self.send_handshake(&mut writer, false).await?;
        let envelope = timeout(self.config.handshake_timeout, read_envelope(&mut reader))
            .await
            .map_err(|_| Error::TimedOut(format!("handshake with {}", address)))??;

        let info = self.verify_handshake(&envelope).await?;
        self.registry.activate(&info).await?;
        self.install_connection(info.node_id, address.to_string(), reader, writer);
        Ok(info.node_id)
    }

    /// Handle one inbound connection: expect the initiator's handshake,
    /// answer with ours, then run the peer loops.
    async fn accept_connection(self: &Arc<Self>, stream: TcpStream, address: String) -> Result<()> {
        if self.connections.len() >= self.config.max_peers {
            return Err(Error::Peer(PeerError::DialFail(
                "connection limit reached".to_string(),
            )));
        }

        let (mut reader, mut writer) = stream.into_split();
        let envelope = timeout(self.config.handshake_timeout, read_envelope(&mut reader))
            .await
            .map_err(|_| Error::TimedOut(format!("handshake from {}", address)))??;

        let info = self.verify_handshake(&envelope).await?;
        self.send_handshake(&mut writer, true).await?;
        self.registry.activate(&info).await?;
        self.install_connection(info.node_id, address, reader, writer);
        Ok(())
    }

    async fn send_handshake(&self, writer: &mut OwnedWriteHalf, ack: bool) -> Result<()> {
        let info = self.local_info.read().await.clone();
        let payload = MessagePayload::Handshake(HandshakePayload {
            capabilities: info.capabilities.clone(),
            version: PROTOCOL_ID.to_string(),
            node_info: info,
            ack,
        });
        let mut envelope = Envelope::new(self.identity.node_id, None, payload);
        envelope.sign(&self.identity.keypair);
        write_frame(writer, &envelope.encode_framed()).await
    }

    /// Check a handshake envelope: signature against the advertised key,
    /// protocol compatibility, and that the sender signs as who it claims
    /// to be.
    async fn verify_handshake(&self, envelope: &Envelope) -> Result<NodeInfo> {
        envelope
            .verify()
            .map_err(|_| Error::Peer(PeerError::HandshakeFail("bad signature".to_string())))?;

        let handshake = match &envelope.payload {
            MessagePayload::Handshake(h) => h,
            other => {
                return Err(Error::Peer(PeerError::HandshakeFail(format!(
                    "expected handshake, got {}",
                    other.kind_name()
                ))))
            }
        };
        if handshake.node_info.node_id != envelope.source {
            return Err(Error::Peer(PeerError::HandshakeFail(
                "node info does not match envelope source".to_string(),
            )));
        }
        if handshake.version != PROTOCOL_ID {
            return Err(Error::Peer(PeerError::HandshakeFail(format!(
                "incompatible protocol {}",
                handshake.version
            ))));
        }
        Ok(handshake.node_info.clone())
    }

    fn install_connection(
        self: &Arc<Self>,
        peer: NodeId,
        address: String,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    ) {
        let (queue, queue_rx) = send_queue(self.config.send_queue_capacity);
        self.connections.insert(peer, PeerConnection { queue, address });

        self.spawn_writer(peer, writer, queue_rx);
        self.spawn_reader(peer, reader);
        log::info!("connection established with {}", short_id(&peer));
    }

    fn spawn_writer(
        self: &Arc<Self>,
        peer: NodeId,
        mut writer: OwnedWriteHalf,
        mut queue_rx: PeerSendQueueReceiver,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = queue_rx.recv().await {
                let queued_for = frame.enqueued_at.elapsed();
                if queued_for > Duration::from_secs(1) {
                    log::debug!("frame to {} sat queued for {:?}", short_id(&peer), queued_for);
                }
                if let Err(e) = write_frame(&mut writer, &frame.bytes).await {
                    log::debug!("write to {} failed: {}", short_id(&peer), e);
                    break;
                }
            }
            this.teardown_connection(peer).await;
        });
    }

    fn spawn_reader(self: &Arc<Self>, peer: NodeId, mut reader: OwnedReadHalf) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let envelope = match read_envelope(&mut reader).await {
                    Ok(envelope) => envelope,
                    Err(Error::Wire(e)) => {
                        // Malformed traffic quarantines the sender and is
                        // not surfaced to anyone else
                        log::warn!("wire error from {}: {}", short_id(&peer), e);
                        this.registry.quarantine(&peer, &e.to_string()).await;
                        continue;
                    }
                    Err(_) => break,
                };
                if let Err(e) = this.handle_inbound(peer, envelope).await {
                    if e.quarantines_peer() {
                        log::warn!("rejected message from {}: {}", short_id(&peer), e);
                        this.registry.quarantine(&peer, &e.to_string()).await;
                    }
                }
            }
            this.teardown_connection(peer).await;
        });
    }

    /// Verify signature and replay window, then dispatch. Control messages
    /// (heartbeat) are absorbed here; everything else goes up to the
    /// coordinator in arrival order.
    async fn handle_inbound(&self, peer: NodeId, envelope: Envelope) -> Result<()> {
        envelope.verify().map_err(Error::Wire)?;
        if envelope.source != peer {
            return Err(Error::Wire(WireError::BadSignature));
        }
        self.replay
            .lock()
            .await
            .check_and_record(envelope.source, envelope.msg_id)
            .map_err(Error::Wire)?;

        match &envelope.payload {
            MessagePayload::Heartbeat(HeartbeatPayload { bandwidth_profile }) => {
                self.registry.on_heartbeat(&peer, *bandwidth_profile).await
            }
            _ => {
                let _ = self.inbound_tx.send(InboundMessage { from: peer, envelope }).await;
                Ok(())
            }
        }
    }

    async fn teardown_connection(&self, peer: NodeId) {
        if let Some((_, connection)) = self.connections.remove(&peer) {
            log::debug!(
                "connection to {} at {} closed",
                short_id(&peer),
                connection.address
            );
            self.replay.lock().await.forget_peer(&peer);
            self.registry.on_disconnect(&peer).await;
        }
    }

    /// Drop a peer connection deliberately
    pub async fn disconnect(&self, peer: &NodeId) {
        self.teardown_connection(*peer).await;
    }

    fn start_keepalive(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(this.config.keepalive_interval);
            loop {
                ticker.tick().await;
                if !*this.is_running.read().await {
                    break;
                }
                let profile = this.local_info.read().await.bandwidth_profile;
                let payload = MessagePayload::Heartbeat(HeartbeatPayload {
                    bandwidth_profile: profile,
                });
                for entry in this.connections.iter() {
                    let mut envelope =
                        Envelope::new(this.identity.node_id, Some(*entry.key()), payload.clone());
                    envelope.sign(&this.identity.keypair);
                    if let Err(e) = entry.value().queue.try_enqueue(envelope.encode_framed()) {
                        log::debug!("keepalive to {} not queued: {}", short_id(entry.key()), e);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl EnvelopeSink for TransportCoordinator {
    async fn send_envelope(&self, peer: NodeId, envelope: Envelope) -> Result<()> {
        let connection = self
            .connections
            .get(&peer)
            .ok_or(Error::Peer(PeerError::Dropped))?;
        connection.queue.try_enqueue(envelope.encode_framed())
    }
}

/// Read one length-prefixed envelope from the stream
async fn read_envelope(reader: &mut OwnedReadHalf) -> Result<Envelope> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Wire(WireError::Decode(format!(
            "frame length {} exceeds limit",
            len
        ))));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Envelope::decode(&body).map_err(Error::Wire)
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
