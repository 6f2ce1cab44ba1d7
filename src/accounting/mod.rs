//! Bandwidth and session accounting
//!
//! Exclusive owner of the per-node counters the reward engine pays against.
//! Counters are monotonic accumulators; a distribution reduces them by the
//! snapshot it paid for, never clears them, so traffic observed during a
//! payout is not lost.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::protocol::{short_id, NodeId};

/// Rolling performance figures for a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Performance {
    pub uptime_pct: f64,
    pub avg_latency_ms: f64,
    /// Reputation in [0, 1], mirrored from the peer registry
    pub reputation: f64,
}

impl Default for Performance {
    fn default() -> Self {
        Self {
            uptime_pct: 100.0,
            avg_latency_ms: 0.0,
            reputation: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct NodeCounters {
    bytes_forwarded: u64,
    sessions_served: u64,
    performance: Option<Performance>,
}

/// Frozen view of one node's counters, taken at distribution time
#[derive(Debug, Clone, Copy)]
pub struct AccountingSnapshot {
    pub bytes: u64,
    pub sessions: u64,
    pub performance: Performance,
}

/// Per-node accounting counters
pub struct Accounting {
    counters: Arc<RwLock<HashMap<NodeId, NodeCounters>>>,
}

impl Default for Accounting {
    fn default() -> Self {
        Self::new()
    }
}

impl Accounting {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A node forwarded `bytes` of client traffic
    pub async fn record_forwarded(&self, node_id: &NodeId, bytes: u64) {
        let mut counters = self.counters.write().await;
        let entry = counters.entry(*node_id).or_default();
        entry.bytes_forwarded = entry.bytes_forwarded.saturating_add(bytes);
    }

    /// A node carried one more client session
    pub async fn record_session(&self, node_id: &NodeId) {
        let mut counters = self.counters.write().await;
        let entry = counters.entry(*node_id).or_default();
        entry.sessions_served = entry.sessions_served.saturating_add(1);
    }

    /// Refresh the rolling performance figures for a node
    pub async fn update_performance(&self, node_id: &NodeId, performance: Performance) {
        let mut counters = self.counters.write().await;
        counters.entry(*node_id).or_default().performance = Some(performance);
    }

    /// Current counters for a node
    pub async fn snapshot(&self, node_id: &NodeId) -> AccountingSnapshot {
        let counters = self.counters.read().await;
        match counters.get(node_id) {
            Some(entry) => AccountingSnapshot {
                bytes: entry.bytes_forwarded,
                sessions: entry.sessions_served,
                performance: entry.performance.unwrap_or_default(),
            },
            None => AccountingSnapshot {
                bytes: 0,
                sessions: 0,
                performance: Performance::default(),
            },
        }
    }

    /// Freeze and deduct a node's counters in one critical section.
    /// Returns the pre-subtraction snapshot, so what the caller pays for
    /// is exactly what was removed; a concurrent reader can never observe
    /// the counters between the read and the deduction.
    pub async fn snapshot_and_consume(&self, node_id: &NodeId) -> AccountingSnapshot {
        let mut counters = self.counters.write().await;
        match counters.get_mut(node_id) {
            Some(entry) => {
                let snapshot = AccountingSnapshot {
                    bytes: entry.bytes_forwarded,
                    sessions: entry.sessions_served,
                    performance: entry.performance.unwrap_or_default(),
                };
                entry.bytes_forwarded = 0;
                entry.sessions_served = 0;
                log::debug!(
                    "consumed accounting for {}: -{} bytes, -{} sessions",
                    short_id(node_id),
                    snapshot.bytes,
                    snapshot.sessions
                );
                snapshot
            }
            None => AccountingSnapshot {
                bytes: 0,
                sessions: 0,
                performance: Performance::default(),
            },
        }
    }

    /// Deduct a paid-out snapshot from the counters. Saturating: anything
    /// accrued since the snapshot survives for the next period.
    pub async fn consume(&self, node_id: &NodeId, bytes: u64, sessions: u64) {
        let mut counters = self.counters.write().await;
        if let Some(entry) = counters.get_mut(node_id) {
            entry.bytes_forwarded = entry.bytes_forwarded.saturating_sub(bytes);
            entry.sessions_served = entry.sessions_served.saturating_sub(sessions);
            log::debug!(
                "consumed accounting for {}: -{} bytes, -{} sessions",
                short_id(node_id),
                bytes,
                sessions
            );
        }
    }

    /// Every node with nonzero counters or recorded performance
    pub async fn tracked_nodes(&self) -> Vec<NodeId> {
        self.counters.read().await.keys().copied().collect()
    }

    pub async fn total_bytes_forwarded(&self) -> u64 {
        self.counters
            .read()
            .await
            .values()
            .map(|c| c.bytes_forwarded)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate_monotonically() {
        let accounting = Accounting::new();
        let node = [1u8; 32];

        accounting.record_forwarded(&node, 1024).await;
        accounting.record_forwarded(&node, 2048).await;
        accounting.record_session(&node).await;

        let snap = accounting.snapshot(&node).await;
        assert_eq!(snap.bytes, 3072);
        assert_eq!(snap.sessions, 1);
    }

    #[tokio::test]
    async fn test_consume_reduces_by_snapshot_not_to_zero() {
        let accounting = Accounting::new();
        let node = [2u8; 32];

        accounting.record_forwarded(&node, 5000).await;
        let snap = accounting.snapshot(&node).await;

        // Traffic lands between snapshot and consume
        accounting.record_forwarded(&node, 300).await;
        accounting.consume(&node, snap.bytes, snap.sessions).await;

        let after = accounting.snapshot(&node).await;
        assert_eq!(after.bytes, 300);
    }

    #[tokio::test]
    async fn test_snapshot_and_consume_is_one_step() {
        let accounting = Accounting::new();
        let node = [5u8; 32];

        accounting.record_forwarded(&node, 5000).await;
        accounting.record_session(&node).await;

        let consumed = accounting.snapshot_and_consume(&node).await;
        assert_eq!(consumed.bytes, 5000);
        assert_eq!(consumed.sessions, 1);

        // Everything the snapshot covered is gone
        let after = accounting.snapshot(&node).await;
        assert_eq!(after.bytes, 0);
        assert_eq!(after.sessions, 0);

        // Traffic recorded afterwards starts the next period
        accounting.record_forwarded(&node, 300).await;
        assert_eq!(accounting.snapshot(&node).await.bytes, 300);

        // Unknown nodes yield an empty snapshot
        let empty = accounting.snapshot_and_consume(&[9u8; 32]).await;
        assert_eq!(empty.bytes, 0);
        assert_eq!(empty.sessions, 0);
    }

    #[tokio::test]
    async fn test_unknown_node_snapshot_is_empty() {
        let accounting = Accounting::new();
        let snap = accounting.snapshot(&[9u8; 32]).await;
        assert_eq!(snap.bytes, 0);
        assert_eq!(snap.sessions, 0);
        assert_eq!(snap.performance.uptime_pct, 100.0);
    }

    #[tokio::test]
    async fn test_performance_update_roundtrip() {
        let accounting = Accounting::new();
        let node = [3u8; 32];
        let performance = Performance {
            uptime_pct: 99.0,
            avg_latency_ms: 50.0,
            reputation: 0.9,
        };
        accounting.update_performance(&node, performance).await;
        assert_eq!(accounting.snapshot(&node).await.performance, performance);
    }
}
