//! In-process administrative service
//!
//! The contract the external web layer consumes. Every operation delegates
//! to the owning component and surfaces its typed errors unchanged.

use std::sync::Arc;
use std::time::Instant;

use crate::coordinator::NodeCoordinator;
use crate::error::Result;
use crate::ledger::{LedgerStats, Transaction};
use crate::peer::{PeerRecord, RegistryStats};
use crate::protocol::{NodeId, Route, RouteRequirements, SessionId, TokenAmount};
use crate::reward::DistributionReport;
use crate::routing::RouterStats;
use crate::session::{ClientSession, SessionStats};

/// Snapshot of the node's overall condition
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub listen_addr: String,
    pub region: String,
    pub uptime_secs: u64,
    pub peers_active: usize,
    pub routes_active: usize,
    pub sessions_active: usize,
    pub balance: TokenAmount,
    pub stake: TokenAmount,
    pub reward_pool: TokenAmount,
}

/// Per-node statistics across planes
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub balance: TokenAmount,
    pub stake: TokenAmount,
    pub bytes_forwarded: u64,
    pub sessions_served: u64,
    pub reputation: f64,
    pub total_rewards: TokenAmount,
}

/// Aggregate statistics across the whole node
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub peers: RegistryStats,
    pub routes: RouterStats,
    pub sessions: SessionStats,
    pub ledger: LedgerStats,
    pub total_bytes_forwarded: u64,
}

/// Ranking dimension for the leaderboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderboardMetric {
    Rewards,
    Stake,
    Bandwidth,
}

/// One leaderboard row. `value` is tokens for rewards and stake, bytes for
/// bandwidth.
#[derive(Debug, Clone)]
pub struct LeaderboardEntry {
    pub node_id: NodeId,
    pub value: f64,
}

/// The administrative service handle
pub struct AdminApi {
    node: Arc<NodeCoordinator>,
    started_at: Instant,
}

impl AdminApi {
    pub fn new(node: Arc<NodeCoordinator>) -> Self {
        Self {
            node,
            started_at: Instant::now(),
        }
    }

    pub async fn status(&self) -> NodeStatus {
        let node_id = self.node.identity.node_id;
        NodeStatus {
            node_id,
            listen_addr: self.node.config.listen_addr.clone(),
            region: self.node.config.region.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            peers_active: self.node.registry.count_active().await,
            routes_active: self.node.router.stats().await.active_routes,
            sessions_active: self.node.sessions.stats().await.active,
            balance: self.node.ledger.balance(&node_id).await,
            stake: self.node.ledger.stake_of(&node_id).await,
            reward_pool: self.node.ledger.reward_pool_balance().await,
        }
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.node.registry.list_all().await
    }

    pub async fn sessions(&self) -> Vec<ClientSession> {
        self.node.sessions.list_all().await
    }

    pub async fn routes(&self) -> Vec<Route> {
        self.node.router.list_routes().await
    }

    pub async fn find_route(
        &self,
        destination: &str,
        requirements: &RouteRequirements,
    ) -> Result<Route> {
        self.node.router.find_route(destination, requirements).await
    }

    pub async fn create_session(
        &self,
        client_id: &str,
        destination: &str,
        requirements: &RouteRequirements,
    ) -> Result<ClientSession> {
        self.node
            .sessions
            .open(client_id, destination, requirements)
            .await
    }

    pub async fn close_session(&self, session_id: &SessionId) -> Result<()> {
        self.node.sessions.close(session_id).await
    }

    pub async fn node_stats(&self, node_id: &NodeId) -> NodeStats {
        let snapshot = self.node.accounting.snapshot(node_id).await;
        let reputation = self
            .node
            .registry
            .get(node_id)
            .await
            .map(|p| p.reputation)
            .unwrap_or(snapshot.performance.reputation);
        let total_rewards = self
            .node
            .rewards
            .rewards_by_node()
            .await
            .get(node_id)
            .copied()
            .unwrap_or(TokenAmount::ZERO);
        NodeStats {
            node_id: *node_id,
            balance: self.node.ledger.balance(node_id).await,
            stake: self.node.ledger.stake_of(node_id).await,
            bytes_forwarded: snapshot.bytes,
            sessions_served: snapshot.sessions,
            reputation,
            total_rewards,
        }
    }

    pub async fn network_stats(&self) -> NetworkStats {
        NetworkStats {
            peers: self.node.registry.stats().await,
            routes: self.node.router.stats().await,
            sessions: self.node.sessions.stats().await,
            ledger: self.node.ledger.stats().await,
            total_bytes_forwarded: self.node.accounting.total_bytes_forwarded().await,
        }
    }

    pub async fn stake(&self, node_id: &NodeId, amount: TokenAmount) -> Result<Transaction> {
        self.node.ledger.stake(node_id, amount).await
    }

    pub async fn unstake(&self, node_id: &NodeId, amount: TokenAmount) -> Result<Transaction> {
        self.node.ledger.unstake(node_id, amount).await
    }

    pub async fn calculate_reward(&self, node_id: &NodeId) -> TokenAmount {
        self.node.rewards.calculate_reward(node_id).await
    }

    pub async fn distribute_rewards(&self, period: &str) -> Result<DistributionReport> {
        self.node.rewards.distribute(period).await
    }

    pub async fn transaction_history(
        &self,
        node_id: Option<&NodeId>,
        limit: usize,
    ) -> Vec<Transaction> {
        self.node.ledger.transaction_history(node_id, limit).await
    }

    pub async fn leaderboard(
        &self,
        metric: LeaderboardMetric,
        limit: usize,
    ) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = match metric {
            LeaderboardMetric::Rewards => self
                .node
                .rewards
                .rewards_by_node()
                .await
                .into_iter()
                .map(|(node_id, amount)| LeaderboardEntry {
                    node_id,
                    value: amount.as_tokens(),
                })
                .collect(),
            LeaderboardMetric::Stake => self
                .node
                .ledger
                .staked_nodes()
                .await
                .into_iter()
                .map(|(node_id, amount)| LeaderboardEntry {
                    node_id,
                    value: amount.as_tokens(),
                })
                .collect(),
            LeaderboardMetric::Bandwidth => {
                let mut rows = Vec::new();
                for node_id in self.node.accounting.tracked_nodes().await {
                    let snapshot = self.node.accounting.snapshot(&node_id).await;
                    rows.push(LeaderboardEntry {
                        node_id,
                        value: snapshot.bytes as f64,
                    });
                }
                rows
            }
        };
        entries.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        entries.truncate(limit);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    async fn api() -> AdminApi {
        let config = NodeConfig {
            listen_addr: "127.0.0.1:19510".to_string(),
            initial_supply: 20_000.0,
            min_stake: 100.0,
            ..Default::default()
        };
        let node = Arc::new(NodeCoordinator::new_in_memory(config).await.unwrap());
        AdminApi::new(node)
    }

    #[tokio::test]
    async fn test_status_reflects_genesis() {
        let api = api().await;
        let status = api.status().await;
        assert_eq!(status.reward_pool, TokenAmount::from_tokens(10_000.0).unwrap());
        assert_eq!(status.balance, TokenAmount::from_tokens(10_000.0).unwrap());
        assert_eq!(status.peers_active, 0);
        assert_eq!(status.sessions_active, 0);
    }

    #[tokio::test]
    async fn test_stake_via_api_and_leaderboard() {
        let api = api().await;
        let operator = api.node.identity.node_id;

        api.stake(&operator, TokenAmount::from_tokens(500.0).unwrap())
            .await
            .unwrap();

        let board = api.leaderboard(LeaderboardMetric::Stake, 10).await;
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].node_id, operator);
        assert_eq!(board[0].value, 500.0);

        let history = api.transaction_history(Some(&operator), 10).await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_find_route_error_surfaces() {
        let api = api().await;
        match api.find_route("dest", &RouteRequirements::default()).await {
            Err(crate::error::Error::Route(crate::error::RouteError::NotFound)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }
}
