//! Token ledger for NetworkNeuron
//!
//! Exclusive owner of balances, stakes, and the signed transaction log.
//! Transactions apply in arrival order under a single writer; once applied,
//! their effect is visible to every subsequent read. Two well-known
//! accounts participate in transfers: the reward pool, which funds periodic
//! payouts, and the stake pool, which holds locked stakes.

pub mod journal;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::crypto::NodeKeypair;
use crate::error::{Error, LedgerError, Result};
use crate::protocol::{
    short_id, unix_timestamp, NodeId, TokenAmount, REWARD_POOL_ADDRESS, STAKE_POOL_ADDRESS,
};

use journal::Journal;

/// Default transaction log retention before ring-buffer eviction
pub const DEFAULT_LOG_RETENTION: usize = 10_000;

/// Transaction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Stake,
    Unstake,
    Reward,
    Transfer,
}

/// A signed, applied ledger transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: [u8; 32],
    pub kind: TransactionKind,
    pub from: NodeId,
    pub to: NodeId,
    pub amount: TokenAmount,
    pub timestamp: u64,
    pub signature: Vec<u8>,
    pub metadata: Option<String>,
}

impl Transaction {
    fn build(
        kind: TransactionKind,
        from: NodeId,
        to: NodeId,
        amount: TokenAmount,
        metadata: Option<String>,
        signer: &NodeKeypair,
    ) -> Self {
        let mut tx = Self {
            tx_id: [0u8; 32],
            kind,
            from,
            to,
            amount,
            timestamp: unix_timestamp(),
            signature: Vec::new(),
            metadata,
        };
        tx.tx_id = tx.content_hash();
        tx.signature = signer.sign(&tx.canonical_bytes()).to_vec();
        tx
    }

    /// Canonical bytes covered by the signature: the transaction with the
    /// signature field empty.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        bincode::serialize(&unsigned).expect("transaction serializes to bincode infallibly")
    }

    fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        hasher.update(crate::crypto::random::random_bytes(8));
        hasher.finalize().into()
    }
}

/// Summary counters for the ledger
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    pub accounts: usize,
    pub total_supply: TokenAmount,
    pub reward_pool: TokenAmount,
    pub total_staked: TokenAmount,
    pub transactions: usize,
}

struct LedgerState {
    balances: HashMap<NodeId, TokenAmount>,
    stakes: HashMap<NodeId, TokenAmount>,
    log: VecDeque<Transaction>,
    total_supply: TokenAmount,
    journal: Option<Journal>,
}

impl LedgerState {
    fn balance(&self, node: &NodeId) -> TokenAmount {
        self.balances.get(node).copied().unwrap_or(TokenAmount::ZERO)
    }

    fn stake(&self, node: &NodeId) -> TokenAmount {
        self.stakes.get(node).copied().unwrap_or(TokenAmount::ZERO)
    }

    /// Move `amount` between balances; the caller has already validated
    /// the debit side.
    fn move_balance(&mut self, from: &NodeId, to: &NodeId, amount: TokenAmount) -> Result<()> {
        let from_balance = self
            .balance(from)
            .checked_sub(amount)
            .ok_or(Error::Ledger(LedgerError::InsufficientBalance))?;
        let to_balance = self
            .balance(to)
            .checked_add(amount)
            .ok_or_else(|| Error::Internal("balance overflow".to_string()))?;
        self.balances.insert(*from, from_balance);
        self.balances.insert(*to, to_balance);
        Ok(())
    }

    /// Apply a transaction's balance and stake effects. Used both on the
    /// live path and during journal replay, so it must be deterministic.
    fn apply_effects(&mut self, tx: &Transaction) -> Result<()> {
        match tx.kind {
            TransactionKind::Stake => {
                self.move_balance(&tx.from, &STAKE_POOL_ADDRESS, tx.amount)?;
                let staked = self
                    .stake(&tx.from)
                    .checked_add(tx.amount)
                    .ok_or_else(|| Error::Internal("stake overflow".to_string()))?;
                self.stakes.insert(tx.from, staked);
            }
            TransactionKind::Unstake => {
                let staked = self
                    .stake(&tx.to)
                    .checked_sub(tx.amount)
                    .ok_or(Error::Ledger(LedgerError::InsufficientStake))?;
                self.move_balance(&STAKE_POOL_ADDRESS, &tx.to, tx.amount)?;
                self.stakes.insert(tx.to, staked);
            }
            TransactionKind::Reward => {
                self.move_balance(&REWARD_POOL_ADDRESS, &tx.to, tx.amount)?;
            }
            TransactionKind::Transfer => {
                self.move_balance(&tx.from, &tx.to, tx.amount)?;
            }
        }
        Ok(())
    }

    fn record(&mut self, tx: Transaction, retention: usize) -> Result<()> {
        if let Some(journal) = &mut self.journal {
            journal.append(&tx)?;
            if journal.should_snapshot() {
                journal.write_snapshot(&self.balances, &self.stakes, self.total_supply)?;
            }
        }
        self.log.push_back(tx);
        while self.log.len() > retention {
            self.log.pop_front();
        }
        Ok(())
    }
}

/// The token ledger
pub struct Ledger {
    state: Arc<RwLock<LedgerState>>,
    signer: NodeKeypair,
    min_stake: TokenAmount,
    retention: usize,
}

impl Ledger {
    /// Create an empty ledger signing with the coordinator keypair
    pub fn new(signer: NodeKeypair, min_stake: TokenAmount) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState {
                balances: HashMap::new(),
                stakes: HashMap::new(),
                log: VecDeque::new(),
                total_supply: TokenAmount::ZERO,
                journal: None,
            })),
            signer,
            min_stake,
            retention: DEFAULT_LOG_RETENTION,
        }
    }

    /// Attach a journal. When the journal already holds state, recover from
    /// it: load the latest snapshot, then replay the journal tail.
    pub async fn attach_journal(&self, mut journal: Journal) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(recovered) = journal.recover()? {
            state.balances = recovered.balances;
            state.stakes = recovered.stakes;
            state.total_supply = recovered.total_supply;
            for tx in recovered.tail {
                state.apply_effects(&tx)?;
                state.log.push_back(tx);
                while state.log.len() > self.retention {
                    state.log.pop_front();
                }
            }
            log::info!(
                "ledger recovered: {} accounts, supply {}",
                state.balances.len(),
                state.total_supply
            );
        }
        state.journal = Some(journal);
        Ok(())
    }

    /// Seed genesis state: bootstrap balances plus the reward pool. Only
    /// meaningful on an empty ledger.
    pub async fn genesis(
        &self,
        allocations: &[(NodeId, TokenAmount)],
        reward_pool: TokenAmount,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.total_supply != TokenAmount::ZERO {
            return Ok(());
        }
        let mut supply = reward_pool;
        state.balances.insert(REWARD_POOL_ADDRESS, reward_pool);
        for (node, amount) in allocations {
            state.balances.insert(*node, *amount);
            supply = supply
                .checked_add(*amount)
                .ok_or_else(|| Error::Internal("genesis supply overflow".to_string()))?;
        }
        state.total_supply = supply;

        // Genesis never rides the transaction log, so the journal tail
        // alone cannot rebuild it: snapshot immediately
        let (balances, stakes) = (state.balances.clone(), state.stakes.clone());
        if let Some(journal) = &mut state.journal {
            journal.write_snapshot(&balances, &stakes, supply)?;
        }

        log::info!(
            "ledger genesis: supply {}, reward pool {}",
            supply,
            reward_pool
        );
        Ok(())
    }

    /// Lock tokens as stake. The resulting stake must meet the minimum.
    pub async fn stake(&self, node: &NodeId, amount: TokenAmount) -> Result<Transaction> {
        let mut state = self.state.write().await;
        let resulting = state
            .stake(node)
            .checked_add(amount)
            .ok_or_else(|| Error::Internal("stake overflow".to_string()))?;
        if resulting < self.min_stake {
            return Err(Error::Ledger(LedgerError::MinStakeNotMet));
        }
        if state.balance(node) < amount {
            return Err(Error::Ledger(LedgerError::InsufficientBalance));
        }

        let tx = Transaction::build(
            TransactionKind::Stake,
            *node,
            STAKE_POOL_ADDRESS,
            amount,
            None,
            &self.signer,
        );
        state.apply_effects(&tx)?;
        state.record(tx.clone(), self.retention)?;
        log::info!("stake: {} locked {}", short_id(node), amount);
        Ok(tx)
    }

    /// Release staked tokens back to the node's balance
    pub async fn unstake(&self, node: &NodeId, amount: TokenAmount) -> Result<Transaction> {
        let mut state = self.state.write().await;
        if state.stake(node) < amount {
            return Err(Error::Ledger(LedgerError::InsufficientStake));
        }

        let tx = Transaction::build(
            TransactionKind::Unstake,
            STAKE_POOL_ADDRESS,
            *node,
            amount,
            None,
            &self.signer,
        );
        state.apply_effects(&tx)?;
        state.record(tx.clone(), self.retention)?;
        log::info!("unstake: {} released {}", short_id(node), amount);
        Ok(tx)
    }

    /// Pay a reward out of the reward pool
    pub async fn credit_reward(
        &self,
        node: &NodeId,
        amount: TokenAmount,
        metadata: Option<String>,
    ) -> Result<Transaction> {
        let mut state = self.state.write().await;
        if state.balance(&REWARD_POOL_ADDRESS) < amount {
            return Err(Error::Ledger(LedgerError::InsufficientRewardPool));
        }

        let tx = Transaction::build(
            TransactionKind::Reward,
            REWARD_POOL_ADDRESS,
            *node,
            amount,
            metadata,
            &self.signer,
        );
        state.apply_effects(&tx)?;
        state.record(tx.clone(), self.retention)?;
        log::info!("reward: {} credited {}", short_id(node), amount);
        Ok(tx)
    }

    /// Move tokens between two accounts
    pub async fn transfer(
        &self,
        from: &NodeId,
        to: &NodeId,
        amount: TokenAmount,
    ) -> Result<Transaction> {
        let mut state = self.state.write().await;
        if state.balance(from) < amount {
            return Err(Error::Ledger(LedgerError::InsufficientBalance));
        }

        let tx = Transaction::build(
            TransactionKind::Transfer,
            *from,
            *to,
            amount,
            None,
            &self.signer,
        );
        state.apply_effects(&tx)?;
        state.record(tx.clone(), self.retention)?;
        Ok(tx)
    }

    /// Verify a transaction signature against the coordinator public key
    pub fn verify(&self, tx: &Transaction) -> Result<()> {
        if self.signer.verify(&tx.canonical_bytes(), &tx.signature) {
            Ok(())
        } else {
            Err(Error::Ledger(LedgerError::BadSignature))
        }
    }

    pub async fn balance(&self, node: &NodeId) -> TokenAmount {
        self.state.read().await.balance(node)
    }

    pub async fn stake_of(&self, node: &NodeId) -> TokenAmount {
        self.state.read().await.stake(node)
    }

    pub async fn reward_pool_balance(&self) -> TokenAmount {
        self.state.read().await.balance(&REWARD_POOL_ADDRESS)
    }

    pub async fn total_supply(&self) -> TokenAmount {
        self.state.read().await.total_supply
    }

    /// Every account holding stake, with the staked amount
    pub async fn staked_nodes(&self) -> Vec<(NodeId, TokenAmount)> {
        self.state
            .read()
            .await
            .stakes
            .iter()
            .filter(|(_, amount)| **amount > TokenAmount::ZERO)
            .map(|(node, amount)| (*node, *amount))
            .collect()
    }

    /// Recent transactions, newest first, optionally filtered by account
    pub async fn transaction_history(
        &self,
        node: Option<&NodeId>,
        limit: usize,
    ) -> Vec<Transaction> {
        let state = self.state.read().await;
        state
            .log
            .iter()
            .rev()
            .filter(|tx| match node {
                Some(node) => tx.from == *node || tx.to == *node,
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// All balances, for leaderboards and snapshots
    pub async fn balances(&self) -> HashMap<NodeId, TokenAmount> {
        self.state.read().await.balances.clone()
    }

    pub async fn stats(&self) -> LedgerStats {
        let state = self.state.read().await;
        LedgerStats {
            accounts: state.balances.len(),
            total_supply: state.total_supply,
            reward_pool: state.balance(&REWARD_POOL_ADDRESS),
            total_staked: state
                .stakes
                .values()
                .fold(TokenAmount::ZERO, |acc, s| acc.saturating_add(*s)),
            transactions: state.log.len(),
        }
    }

    /// Flush pending journal state. Called at shutdown before tasks stop.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let (balances, stakes, supply) = (
            state.balances.clone(),
            state.stakes.clone(),
            state.total_supply,
        );
        if let Some(journal) = &mut state.journal {
            journal.write_snapshot(&balances, &stakes, supply)?;
        }
        Ok(())
    }

    /// Total held across balances; constant over stake moves and rewards
    pub async fn circulating_total(&self) -> TokenAmount {
        self.state
            .read()
            .await
            .balances
            .values()
            .fold(TokenAmount::ZERO, |acc, b| acc.saturating_add(*b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(value: f64) -> TokenAmount {
        TokenAmount::from_tokens(value).unwrap()
    }

    async fn seeded_ledger(min_stake: f64) -> (Ledger, NodeId) {
        let ledger = Ledger::new(NodeKeypair::generate(), tokens(min_stake));
        let node = [1u8; 32];
        ledger
            .genesis(&[(node, tokens(10_000.0))], tokens(10_000.0))
            .await
            .unwrap();
        (ledger, node)
    }

    #[tokio::test]
    async fn test_stake_moves_balance_into_pool() {
        let (ledger, node) = seeded_ledger(1000.0).await;

        ledger.stake(&node, tokens(5000.0)).await.unwrap();
        assert_eq!(ledger.balance(&node).await, tokens(5000.0));
        assert_eq!(ledger.stake_of(&node).await, tokens(5000.0));
        assert_eq!(ledger.balance(&STAKE_POOL_ADDRESS).await, tokens(5000.0));

        // Total balance never changes across a stake move
        assert_eq!(ledger.circulating_total().await, tokens(20_000.0));
    }

    #[tokio::test]
    async fn test_stake_boundaries() {
        let (ledger, node) = seeded_ledger(1000.0).await;

        // Below minimum fails
        match ledger.stake(&node, tokens(999.0)).await {
            Err(Error::Ledger(LedgerError::MinStakeNotMet)) => {}
            other => panic!("expected MinStakeNotMet, got {:?}", other),
        }

        // Exactly the minimum succeeds
        ledger.stake(&node, tokens(1000.0)).await.unwrap();

        // More than the balance fails
        match ledger.stake(&node, tokens(50_000.0)).await {
            Err(Error::Ledger(LedgerError::InsufficientBalance)) => {}
            other => panic!("expected InsufficientBalance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stake_unstake_restores_state_with_two_log_entries() {
        let (ledger, node) = seeded_ledger(1000.0).await;
        let balance_before = ledger.balance(&node).await;
        let log_before = ledger.stats().await.transactions;

        ledger.stake(&node, tokens(2000.0)).await.unwrap();
        ledger.unstake(&node, tokens(2000.0)).await.unwrap();

        assert_eq!(ledger.balance(&node).await, balance_before);
        assert_eq!(ledger.stake_of(&node).await, TokenAmount::ZERO);
        assert_eq!(ledger.stats().await.transactions, log_before + 2);
    }

    #[tokio::test]
    async fn test_unstake_more_than_staked_fails() {
        let (ledger, node) = seeded_ledger(1000.0).await;
        ledger.stake(&node, tokens(1500.0)).await.unwrap();
        match ledger.unstake(&node, tokens(2000.0)).await {
            Err(Error::Ledger(LedgerError::InsufficientStake)) => {}
            other => panic!("expected InsufficientStake, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reward_debits_pool() {
        let (ledger, node) = seeded_ledger(1000.0).await;
        let pool_before = ledger.reward_pool_balance().await;

        let tx = ledger
            .credit_reward(&node, tokens(95.0), Some("daily".to_string()))
            .await
            .unwrap();
        assert_eq!(tx.kind, TransactionKind::Reward);
        assert_eq!(ledger.balance(&node).await, tokens(10_095.0));
        assert_eq!(
            ledger.reward_pool_balance().await,
            pool_before.checked_sub(tokens(95.0)).unwrap()
        );

        // Pool exhaustion surfaces
        match ledger.credit_reward(&node, tokens(1_000_000.0), None).await {
            Err(Error::Ledger(LedgerError::InsufficientRewardPool)) => {}
            other => panic!("expected InsufficientRewardPool, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transactions_are_signed_and_verifiable() {
        let (ledger, node) = seeded_ledger(1000.0).await;
        let tx = ledger.stake(&node, tokens(1000.0)).await.unwrap();
        assert!(ledger.verify(&tx).is_ok());

        let mut forged = tx.clone();
        forged.amount = tokens(9999.0);
        match ledger.verify(&forged) {
            Err(Error::Ledger(LedgerError::BadSignature)) => {}
            other => panic!("expected BadSignature, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_log_ring_buffer_eviction() {
        let mut ledger = Ledger::new(NodeKeypair::generate(), tokens(1.0));
        ledger.retention = 5;
        let node = [1u8; 32];
        ledger
            .genesis(&[(node, tokens(10_000.0))], tokens(0.0))
            .await
            .unwrap();

        for _ in 0..4 {
            ledger.stake(&node, tokens(10.0)).await.unwrap();
            ledger.unstake(&node, tokens(10.0)).await.unwrap();
        }
        let stats = ledger.stats().await;
        assert_eq!(stats.transactions, 5);
    }

    #[tokio::test]
    async fn test_history_filters_by_node() {
        let (ledger, node) = seeded_ledger(1000.0).await;
        let other = [2u8; 32];
        ledger.transfer(&node, &other, tokens(100.0)).await.unwrap();
        ledger.stake(&node, tokens(1000.0)).await.unwrap();

        let all = ledger.transaction_history(None, 10).await;
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].kind, TransactionKind::Stake);

        let other_history = ledger.transaction_history(Some(&other), 10).await;
        assert_eq!(other_history.len(), 1);
        assert_eq!(other_history[0].kind, TransactionKind::Transfer);
    }

    #[tokio::test]
    async fn test_balances_never_negative() {
        let (ledger, node) = seeded_ledger(1000.0).await;
        let poor = [9u8; 32];
        assert!(ledger.transfer(&poor, &node, tokens(1.0)).await.is_err());
        assert_eq!(ledger.balance(&poor).await, TokenAmount::ZERO);
    }
}
