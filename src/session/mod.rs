//! Client session management
//!
//! Sessions bind a client to a route and meter its traffic. A session is
//! 1-to-1 with a route at creation; sessions whose requirement hashes
//! collide may share a route through the route cache. Closing the last
//! session on a route lets the router drop the route.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};

use crate::accounting::Accounting;
use crate::coordinator::NodeEvent;
use crate::error::{Error, Result, SessionError};
use crate::protocol::{unix_timestamp, RouteId, RouteRequirements, SessionId};
use crate::routing::Router;

/// A client's binding to a route
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub session_id: SessionId,
    pub client_id: String,
    pub route_id: RouteId,
    pub destination: String,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub bytes_transferred: u64,
    pub active: bool,
    opened: Instant,
}

impl ClientSession {
    pub fn duration_secs(&self) -> u64 {
        match self.ended_at {
            Some(ended) => ended.saturating_sub(self.started_at),
            None => self.opened.elapsed().as_secs(),
        }
    }
}

/// Aggregate session counters
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub bytes_transferred: u64,
}

/// Session manager: owner of client session records
pub struct SessionManager {
    router: Arc<Router>,
    accounting: Arc<Accounting>,
    sessions: Arc<RwLock<HashMap<SessionId, ClientSession>>>,
    events: broadcast::Sender<NodeEvent>,
}

impl SessionManager {
    pub fn new(
        router: Arc<Router>,
        accounting: Arc<Accounting>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            router,
            accounting,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Open a session: acquire a route for the destination and bind to it.
    /// Route errors from the lookup surface to the caller.
    pub async fn open(
        &self,
        client_id: &str,
        destination: &str,
        requirements: &RouteRequirements,
    ) -> Result<ClientSession> {
        let route = self.router.find_route(destination, requirements).await?;

        let session = ClientSession {
            session_id: crate::crypto::random::random_session_id(),
            client_id: client_id.to_string(),
            route_id: route.route_id,
            destination: destination.to_string(),
            started_at: unix_timestamp(),
            ended_at: None,
            bytes_transferred: 0,
            active: true,
            opened: Instant::now(),
        };
        self.sessions
            .write()
            .await
            .insert(session.session_id, session.clone());

        for hop in &route.hops {
            self.accounting.record_session(hop).await;
            let _ = self.events.send(NodeEvent::SessionServed { node_id: *hop });
        }
        log::info!(
            "session {} opened for client {} to {}",
            hex::encode(session.session_id),
            client_id,
            destination
        );
        let _ = self.events.send(NodeEvent::SessionOpened {
            session_id: session.session_id,
            client_id: client_id.to_string(),
        });
        Ok(session)
    }

    /// Send client payload through the session's route. The router may
    /// transparently re-route once; the session follows the fresh route.
    pub async fn send(&self, session_id: &SessionId, payload: Vec<u8>) -> Result<()> {
        let (route_id, bytes) = {
            let sessions = self.sessions.read().await;
            let session = sessions.get(session_id).ok_or(Error::Session(SessionError::NotFound))?;
            if !session.active {
                return Err(Error::Session(SessionError::NotActive));
            }
            (session.route_id, payload.len() as u64)
        };

        let used_route = self.router.send(route_id, payload).await?;

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.bytes_transferred = session.bytes_transferred.saturating_add(bytes);
            session.route_id = used_route;
        }
        Ok(())
    }

    /// Close a session. The route is dropped when no other active session
    /// still uses it.
    pub async fn close(&self, session_id: &SessionId) -> Result<()> {
        let route_id = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or(Error::Session(SessionError::NotFound))?;
            if !session.active {
                return Err(Error::Session(SessionError::NotActive));
            }
            session.active = false;
            session.ended_at = Some(unix_timestamp());
            session.route_id
        };

        if !self.route_in_use(&route_id).await {
            self.router.remove_route(&route_id).await;
        }

        log::info!("session {} closed", hex::encode(session_id));
        let _ = self.events.send(NodeEvent::SessionClosed {
            session_id: *session_id,
        });
        Ok(())
    }

    /// Close every active session bound to one of the given routes. Used
    /// when routes were invalidated under the sessions.
    pub async fn close_for_routes(&self, route_ids: &[RouteId]) -> Vec<SessionId> {
        let mut closed = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            for session in sessions.values_mut() {
                if session.active && route_ids.contains(&session.route_id) {
                    session.active = false;
                    session.ended_at = Some(unix_timestamp());
                    closed.push(session.session_id);
                }
            }
        }
        for session_id in &closed {
            log::info!("session {} closed: route invalidated", hex::encode(session_id));
            let _ = self.events.send(NodeEvent::SessionClosed {
                session_id: *session_id,
            });
        }
        closed
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<ClientSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn list_active(&self) -> Vec<ClientSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    pub async fn list_all(&self) -> Vec<ClientSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;
        SessionStats {
            total: sessions.len(),
            active: sessions.values().filter(|s| s.active).count(),
            bytes_transferred: sessions.values().map(|s| s.bytes_transferred).sum(),
        }
    }

    async fn route_in_use(&self, route_id: &RouteId) -> bool {
        self.sessions
            .read()
            .await
            .values()
            .any(|s| s.active && s.route_id == *route_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeIdentity;
    use crate::peer::PeerRegistry;
    use crate::protocol::wire::Envelope;
    use crate::protocol::{BandwidthProfile, Capability, KeyMode, NodeId, NodeInfo, PROTOCOL_ID};
    use crate::routing::RouterConfig;
    use crate::transport::EnvelopeSink;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl EnvelopeSink for NullSink {
        async fn send_envelope(&self, _peer: NodeId, _envelope: Envelope) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        manager: SessionManager,
        router: Arc<Router>,
        registry: Arc<PeerRegistry>,
        accounting: Arc<Accounting>,
    }

    async fn harness() -> Harness {
        let identity = Arc::new(NodeIdentity::generate());
        let (events, _) = broadcast::channel(256);
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15), 2, 50, events.clone()));
        let accounting = Arc::new(Accounting::new());
        let router = Arc::new(Router::new(
            identity,
            registry.clone(),
            Arc::new(NullSink),
            accounting.clone(),
            RouterConfig {
                route_ttl: Duration::from_secs(300),
                cache_max: 1000,
                encryption_required: false,
                key_mode: KeyMode::Tunnel,
            },
            events.clone(),
        ));
        let manager = SessionManager::new(router.clone(), accounting.clone(), events);
        Harness {
            manager,
            router,
            registry,
            accounting,
        }
    }

    async fn add_active_peer(registry: &PeerRegistry, seed: u8) -> NodeId {
        let info = NodeInfo {
            node_id: [seed; 32],
            address: format!("peer-{}", seed),
            dh_public_key: [seed; 32],
            capabilities: vec![Capability::Relay, Capability::Encryption],
            region: "test".to_string(),
            bandwidth_profile: BandwidthProfile {
                download_mbps: 100.0,
                upload_mbps: 100.0,
                latency_ms: 40.0,
                uptime_pct: 100.0,
                capacity_mbps: 100.0,
            },
            version: PROTOCOL_ID.to_string(),
        };
        registry.activate(&info).await.unwrap();
        info.node_id
    }

    #[tokio::test]
    async fn test_open_send_close_lifecycle() {
        let h = harness().await;
        let hop = add_active_peer(&h.registry, 1).await;

        let session = h
            .manager
            .open("client-1", "dest", &RouteRequirements::default())
            .await
            .unwrap();
        assert!(session.active);
        assert_eq!(h.accounting.snapshot(&hop).await.sessions, 1);

        h.manager.send(&session.session_id, vec![0u8; 512]).await.unwrap();
        let refreshed = h.manager.get(&session.session_id).await.unwrap();
        assert_eq!(refreshed.bytes_transferred, 512);

        h.manager.close(&session.session_id).await.unwrap();
        let closed = h.manager.get(&session.session_id).await.unwrap();
        assert!(!closed.active);
        assert!(closed.ended_at.is_some());
        assert_eq!(h.manager.list_active().await.len(), 0);
    }

    #[tokio::test]
    async fn test_open_without_peers_surfaces_route_error() {
        let h = harness().await;
        match h
            .manager
            .open("client-1", "dest", &RouteRequirements::default())
            .await
        {
            Err(Error::Route(crate::error::RouteError::NotFound)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_double_close_is_not_active() {
        let h = harness().await;
        add_active_peer(&h.registry, 1).await;

        let session = h
            .manager
            .open("client-1", "dest", &RouteRequirements::default())
            .await
            .unwrap();
        h.manager.close(&session.session_id).await.unwrap();
        match h.manager.close(&session.session_id).await {
            Err(Error::Session(SessionError::NotActive)) => {}
            other => panic!("expected NotActive, got {:?}", other),
        }

        match h.manager.close(&[0u8; 16]).await {
            Err(Error::Session(SessionError::NotFound)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sessions_share_route_on_cache_hit() {
        let h = harness().await;
        add_active_peer(&h.registry, 1).await;

        let req = RouteRequirements::default();
        let first = h.manager.open("client-1", "dest", &req).await.unwrap();
        let second = h.manager.open("client-2", "dest", &req).await.unwrap();
        assert_eq!(first.route_id, second.route_id);

        // Closing one session keeps the shared route alive
        h.manager.close(&first.session_id).await.unwrap();
        assert!(h.router.get_route(&second.route_id).await.is_some());

        // Closing the last user releases it
        h.manager.close(&second.session_id).await.unwrap();
        assert!(h.router.get_route(&second.route_id).await.is_none());
    }

    #[tokio::test]
    async fn test_close_for_routes_closes_bound_sessions() {
        let h = harness().await;
        add_active_peer(&h.registry, 1).await;

        let session = h
            .manager
            .open("client-1", "dest", &RouteRequirements::default())
            .await
            .unwrap();
        let closed = h.manager.close_for_routes(&[session.route_id]).await;
        assert_eq!(closed, vec![session.session_id]);
        assert!(!h.manager.get(&session.session_id).await.unwrap().active);
    }
}
