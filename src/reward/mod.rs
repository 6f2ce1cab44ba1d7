//! Reward engine
//!
//! Computes and distributes stake-weighted rewards from the reward pool.
//! A distribution run freezes accounting snapshots for every eligible node,
//! pays each reward atomically (pool check, ledger credit, accounting
//! consume), and skips the remainder of the period if the pool runs dry.
//! Scheduling is external: the coordinator calls `distribute` on its timer
//! and on operator request.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::accounting::{Accounting, AccountingSnapshot};
use crate::coordinator::NodeEvent;
use crate::error::{Error, LedgerError, Result};
use crate::ledger::Ledger;
use crate::protocol::{short_id, unix_timestamp, NodeId, TokenAmount};

/// Bytes per megabyte for the reward base (decimal MB, matching the
/// advertised `tokens per MB` reward rate)
const BYTES_PER_MB: f64 = 1_000_000.0;

/// Reward parameters
#[derive(Debug, Clone)]
pub struct RewardConfig {
    /// Tokens per MB forwarded
    pub reward_rate: f64,
    /// Stake floor for eligibility
    pub min_stake: TokenAmount,
    /// Clamp applied to every computed reward
    pub max_reward_per_day: TokenAmount,
}

/// Distribution run phases. One run in flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionPhase {
    Idle,
    Collecting,
    Paying,
    Finalizing,
}

/// One payout made during a distribution
#[derive(Debug, Clone)]
pub struct DistributionRecord {
    pub node_id: NodeId,
    pub period: String,
    pub distribution_ts: u64,
    pub amount: TokenAmount,
    pub bytes: u64,
    pub sessions: u64,
}

/// Outcome of one distribution run
#[derive(Debug, Clone, Default)]
pub struct DistributionReport {
    pub period: String,
    pub paid: Vec<DistributionRecord>,
    pub skipped: usize,
    pub pool_exhausted: bool,
}

/// Reward engine
pub struct RewardEngine {
    ledger: Arc<Ledger>,
    accounting: Arc<Accounting>,
    config: RewardConfig,
    phase: Arc<RwLock<DistributionPhase>>,
    history: Arc<RwLock<Vec<DistributionRecord>>>,
    events: tokio::sync::broadcast::Sender<NodeEvent>,
}

impl RewardEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        accounting: Arc<Accounting>,
        config: RewardConfig,
        events: tokio::sync::broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            ledger,
            accounting,
            config,
            phase: Arc::new(RwLock::new(DistributionPhase::Idle)),
            history: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    /// The reward formula, pure over a frozen snapshot and stake:
    ///
    /// ```text
    /// base          = MB(bytes) * reward_rate
    /// stake_mult    = min(1 + (stake / min_stake) * 0.5, 2.0)
    /// uptime_bonus  = uptime_pct / 100
    /// latency_bonus = max(0, 1 - avg_latency_ms / 1000)
    /// raw           = base * stake_mult * uptime_bonus * latency_bonus * max(sessions, 1)
    /// amount        = min(raw, max_reward_per_day)
    /// ```
    pub fn compute_reward(&self, snapshot: &AccountingSnapshot, stake: TokenAmount) -> TokenAmount {
        let base = snapshot.bytes as f64 / BYTES_PER_MB * self.config.reward_rate;
        let stake_ratio = if self.config.min_stake == TokenAmount::ZERO {
            1.0
        } else {
            stake.units() as f64 / self.config.min_stake.units() as f64
        };
        let stake_mult = (1.0 + stake_ratio * 0.5).min(2.0);
        let uptime_bonus = (snapshot.performance.uptime_pct / 100.0).clamp(0.0, 1.0);
        let latency_bonus = (1.0 - snapshot.performance.avg_latency_ms / 1000.0).max(0.0);
        let sessions = snapshot.sessions.max(1) as f64;

        let raw = base * stake_mult * uptime_bonus * latency_bonus * sessions;
        let amount = TokenAmount::from_tokens(raw).unwrap_or(TokenAmount::ZERO);
        amount.min(self.config.max_reward_per_day)
    }

    /// The reward a node would earn if a distribution ran now
    pub async fn calculate_reward(&self, node_id: &NodeId) -> TokenAmount {
        let stake = self.ledger.stake_of(node_id).await;
        if stake < self.config.min_stake {
            return TokenAmount::ZERO;
        }
        let snapshot = self.accounting.snapshot(node_id).await;
        self.compute_reward(&snapshot, stake)
    }

    /// Run one distribution over the period.
    ///
    /// 1. Collect eligible nodes in stable NodeId order and freeze their
    ///    snapshots.
    /// 2. Compute each reward against the frozen snapshot.
    /// 3. Pay each reward atomically: pool check via the ledger credit,
    ///    then `snapshot_and_consume` deducts the paid-for counters in a
    ///    single critical section.
    /// 4. A dry pool skips the remaining nodes for this period; paid
    ///    rewards stay paid.
    pub async fn distribute(&self, period: &str) -> Result<DistributionReport> {
        {
            let mut phase = self.phase.write().await;
            if *phase != DistributionPhase::Idle {
                return Err(Error::Internal(format!(
                    "distribution already in flight ({:?})",
                    *phase
                )));
            }
            *phase = DistributionPhase::Collecting;
        }

        let report = self.run_distribution(period).await;
        *self.phase.write().await = DistributionPhase::Idle;
        report
    }

    async fn run_distribution(&self, period: &str) -> Result<DistributionReport> {
        // Collecting: stable order, frozen snapshots
        let mut eligible: Vec<(NodeId, TokenAmount)> = self
            .ledger
            .staked_nodes()
            .await
            .into_iter()
            .filter(|(_, stake)| *stake >= self.config.min_stake)
            .collect();
        eligible.sort_by(|a, b| a.0.cmp(&b.0));

        let mut frozen = Vec::with_capacity(eligible.len());
        for (node_id, stake) in eligible {
            let snapshot = self.accounting.snapshot(&node_id).await;
            frozen.push((node_id, stake, snapshot));
        }

        *self.phase.write().await = DistributionPhase::Paying;
        let distribution_ts = unix_timestamp();
        let mut report = DistributionReport {
            period: period.to_string(),
            ..Default::default()
        };

        for (index, (node_id, stake, snapshot)) in frozen.iter().enumerate() {
            let amount = self.compute_reward(snapshot, *stake);
            if amount == TokenAmount::ZERO {
                continue;
            }

            match self
                .ledger
                .credit_reward(node_id, amount, Some(period.to_string()))
                .await
            {
                Ok(_) => {
                    // One critical section freezes and deducts the counters
                    // this payout covers; the record keeps the consumed
                    // figures
                    let consumed = self.accounting.snapshot_and_consume(node_id).await;
                    let record = DistributionRecord {
                        node_id: *node_id,
                        period: period.to_string(),
                        distribution_ts,
                        amount,
                        bytes: consumed.bytes,
                        sessions: consumed.sessions,
                    };
                    self.history.write().await.push(record.clone());
                    report.paid.push(record);
                    let _ = self.events.send(NodeEvent::RewardDistributed {
                        node_id: *node_id,
                        amount,
                    });
                    log::info!("rewarded {} with {}", short_id(node_id), amount);
                }
                Err(Error::Ledger(LedgerError::InsufficientRewardPool)) => {
                    // Dry pool: skip the rest, keep what was already paid
                    report.pool_exhausted = true;
                    report.skipped = frozen.len() - index;
                    let remaining = self.ledger.reward_pool_balance().await;
                    log::warn!(
                        "reward pool exhausted during {}: {} node(s) skipped",
                        period,
                        report.skipped
                    );
                    let _ = self
                        .events
                        .send(NodeEvent::RewardPoolExhausted { remaining });
                    break;
                }
                Err(other) => return Err(other),
            }
        }

        *self.phase.write().await = DistributionPhase::Finalizing;
        log::info!(
            "distribution {} complete: {} paid, {} skipped",
            period,
            report.paid.len(),
            report.skipped
        );
        Ok(report)
    }

    pub async fn phase(&self) -> DistributionPhase {
        *self.phase.read().await
    }

    /// Payout history, newest last
    pub async fn history(&self) -> Vec<DistributionRecord> {
        self.history.read().await.clone()
    }

    /// Total rewards ever paid per node, for leaderboards
    pub async fn rewards_by_node(&self) -> HashMap<NodeId, TokenAmount> {
        let mut totals: HashMap<NodeId, TokenAmount> = HashMap::new();
        for record in self.history.read().await.iter() {
            let entry = totals.entry(record.node_id).or_insert(TokenAmount::ZERO);
            *entry = entry.saturating_add(record.amount);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::Performance;
    use crate::crypto::NodeKeypair;

    fn tokens(value: f64) -> TokenAmount {
        TokenAmount::from_tokens(value).unwrap()
    }

    struct Harness {
        engine: RewardEngine,
        ledger: Arc<Ledger>,
        accounting: Arc<Accounting>,
    }

    async fn harness(pool: f64, min_stake: f64, max_reward: f64) -> Harness {
        let ledger = Arc::new(Ledger::new(NodeKeypair::generate(), tokens(min_stake)));
        ledger.genesis(&[], tokens(pool)).await.unwrap();
        let accounting = Arc::new(Accounting::new());
        let (events, _) = tokio::sync::broadcast::channel(256);
        let engine = RewardEngine::new(
            ledger.clone(),
            accounting.clone(),
            RewardConfig {
                reward_rate: 0.1,
                min_stake: tokens(min_stake),
                max_reward_per_day: tokens(max_reward),
            },
            events,
        );
        Harness {
            engine,
            ledger,
            accounting,
        }
    }

    /// Build a harness whose genesis also funds the given node
    async fn harness_with_node(
        node: NodeId,
        balance: f64,
        pool: f64,
        min_stake: f64,
    ) -> Harness {
        let ledger = Arc::new(Ledger::new(NodeKeypair::generate(), tokens(min_stake)));
        ledger
            .genesis(&[(node, tokens(balance))], tokens(pool))
            .await
            .unwrap();
        let accounting = Arc::new(Accounting::new());
        let (events, _) = tokio::sync::broadcast::channel(256);
        let engine = RewardEngine::new(
            ledger.clone(),
            accounting.clone(),
            RewardConfig {
                reward_rate: 0.1,
                min_stake: tokens(min_stake),
                max_reward_per_day: tokens(1000.0),
            },
            events,
        );
        Harness {
            engine,
            ledger,
            accounting,
        }
    }

    #[tokio::test]
    async fn test_reward_formula_combines_all_factors() {
        let h = harness(10_000.0, 1000.0, 1000.0).await;
        let snapshot = AccountingSnapshot {
            bytes: 100_000_000,
            sessions: 5,
            performance: Performance {
                uptime_pct: 100.0,
                avg_latency_ms: 50.0,
                reputation: 1.0,
            },
        };
        // base 10.0, stake_mult capped at 2.0, uptime 1.0, latency 0.95,
        // sessions 5 => 95.0
        let amount = h.engine.compute_reward(&snapshot, tokens(5000.0));
        assert_eq!(amount, tokens(95.0));
    }

    #[tokio::test]
    async fn test_reward_clamped_to_daily_max() {
        let h = harness(1_000_000.0, 1000.0, 1000.0).await;
        let snapshot = AccountingSnapshot {
            bytes: 100_000_000_000, // 100 GB
            sessions: 50,
            performance: Performance {
                uptime_pct: 100.0,
                avg_latency_ms: 0.0,
                reputation: 1.0,
            },
        };
        let amount = h.engine.compute_reward(&snapshot, tokens(5000.0));
        assert_eq!(amount, tokens(1000.0));
    }

    #[tokio::test]
    async fn test_stake_multiplier_scales_and_caps() {
        let h = harness(10_000.0, 1000.0, 100_000.0).await;
        let snapshot = AccountingSnapshot {
            bytes: 10_000_000,
            sessions: 1,
            performance: Performance {
                uptime_pct: 100.0,
                avg_latency_ms: 0.0,
                reputation: 1.0,
            },
        };
        // stake == min_stake: mult 1.5
        let at_min = h.engine.compute_reward(&snapshot, tokens(1000.0));
        assert_eq!(at_min, tokens(1.5));
        // stake >= 2 * min_stake: capped at 2.0
        let capped = h.engine.compute_reward(&snapshot, tokens(10_000.0));
        assert_eq!(capped, tokens(2.0));
    }

    #[tokio::test]
    async fn test_unstaked_node_earns_nothing() {
        let h = harness(10_000.0, 1000.0, 1000.0).await;
        let node = [1u8; 32];
        h.accounting.record_forwarded(&node, 100_000_000).await;
        assert_eq!(h.engine.calculate_reward(&node).await, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_distribute_twice_pays_once() {
        let node = [1u8; 32];
        let h = harness_with_node(node, 1_000.0, 10_000.0, 100.0).await;
        h.ledger.stake(&node, tokens(100.0)).await.unwrap();
        h.accounting.record_forwarded(&node, 10_000_000).await;

        let first = h.engine.distribute("daily").await.unwrap();
        assert_eq!(first.paid.len(), 1);
        let balance_after_first = h.ledger.balance(&node).await;

        // No intervening accounting events: the second run pays nothing
        let second = h.engine.distribute("daily").await.unwrap();
        assert!(second.paid.is_empty());
        assert_eq!(h.ledger.balance(&node).await, balance_after_first);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_skips_remainder() {
        let node_a = [1u8; 32];
        let node_b = [2u8; 32];

        let ledger = Arc::new(Ledger::new(NodeKeypair::generate(), tokens(10.0)));
        // Pool can cover one payout but not two
        ledger
            .genesis(
                &[(node_a, tokens(100.0)), (node_b, tokens(100.0))],
                tokens(1.5),
            )
            .await
            .unwrap();
        let accounting = Arc::new(Accounting::new());
        let (events, mut events_rx) = tokio::sync::broadcast::channel(256);
        let engine = RewardEngine::new(
            ledger.clone(),
            accounting.clone(),
            RewardConfig {
                reward_rate: 0.1,
                min_stake: tokens(10.0),
                max_reward_per_day: tokens(1000.0),
            },
            events,
        );

        for node in [&node_a, &node_b] {
            ledger.stake(node, tokens(10.0)).await.unwrap();
            accounting.record_forwarded(node, 10_000_000).await; // 1.0 base each
        }

        let report = engine.distribute("daily").await.unwrap();
        assert!(report.pool_exhausted);
        assert_eq!(report.paid.len(), 1);
        assert_eq!(report.skipped, 1);
        // Paid rewards are not rolled back
        assert_eq!(report.paid[0].node_id, node_a);
        assert!(ledger.balance(&node_a).await > tokens(90.0));

        let mut saw_exhausted = false;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, NodeEvent::RewardPoolExhausted { .. }) {
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[tokio::test]
    async fn test_only_one_distribution_in_flight() {
        let h = harness(10_000.0, 100.0, 1000.0).await;
        *h.engine.phase.write().await = DistributionPhase::Paying;
        assert!(h.engine.distribute("daily").await.is_err());
        *h.engine.phase.write().await = DistributionPhase::Idle;
        assert!(h.engine.distribute("daily").await.is_ok());
    }
}
