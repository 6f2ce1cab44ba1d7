//! Ledger persistence: append-only journal plus periodic snapshots
//!
//! Every applied transaction is appended to the journal as a
//! length-prefixed bincode record. Periodically the full balance and stake
//! state is written as a snapshot (temp file, then atomic rename) and the
//! journal restarts empty. Recovery loads the latest snapshot and replays
//! the journal tail; the result must equal the state at shutdown.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{NodeId, TokenAmount};

use super::Transaction;

/// Transactions between snapshots before the next snapshot is due
pub const DEFAULT_SNAPSHOT_INTERVAL: usize = 100;

/// On-disk snapshot of ledger state
#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub balances: HashMap<NodeId, TokenAmount>,
    pub stakes: HashMap<NodeId, TokenAmount>,
    pub total_supply: TokenAmount,
    pub written_at: u64,
}

/// State rebuilt from disk at startup
pub struct RecoveredState {
    pub balances: HashMap<NodeId, TokenAmount>,
    pub stakes: HashMap<NodeId, TokenAmount>,
    pub total_supply: TokenAmount,
    /// Transactions applied after the snapshot, in order
    pub tail: Vec<Transaction>,
}

/// Append-only transaction journal with snapshot rotation
pub struct Journal {
    journal_path: PathBuf,
    snapshot_path: PathBuf,
    file: File,
    since_snapshot: usize,
    snapshot_interval: usize,
}

impl Journal {
    /// Open (or create) the journal files under `dir`
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let journal_path = dir.as_ref().join("ledger.journal");
        let snapshot_path = dir.as_ref().join("ledger.snapshot");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;
        Ok(Self {
            journal_path,
            snapshot_path,
            file,
            since_snapshot: 0,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        })
    }

    /// Append one transaction as a length-prefixed record and sync it
    pub fn append(&mut self, tx: &Transaction) -> Result<()> {
        let bytes = bincode::serialize(tx)?;
        self.file.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        self.since_snapshot += 1;
        Ok(())
    }

    pub fn should_snapshot(&self) -> bool {
        self.since_snapshot >= self.snapshot_interval
    }

    /// Write the full state snapshot and restart the journal.
    ///
    /// The snapshot goes to a temp file first and is renamed into place, so
    /// a crash mid-write never loses the previous snapshot.
    pub fn write_snapshot(
        &mut self,
        balances: &HashMap<NodeId, TokenAmount>,
        stakes: &HashMap<NodeId, TokenAmount>,
        total_supply: TokenAmount,
    ) -> Result<()> {
        let snapshot = LedgerSnapshot {
            balances: balances.clone(),
            stakes: stakes.clone(),
            total_supply,
            written_at: crate::protocol::unix_timestamp(),
        };
        let bytes = bincode::serialize(&snapshot)?;
        let temp = self.snapshot_path.with_extension("tmp");
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &self.snapshot_path)?;

        // The snapshot covers everything; the journal restarts empty
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.journal_path)?;
        self.since_snapshot = 0;
        log::debug!("ledger snapshot written to {:?}", self.snapshot_path);
        Ok(())
    }

    /// Load the latest snapshot and the journal tail, or `None` when the
    /// store is fresh.
    pub fn recover(&mut self) -> Result<Option<RecoveredState>> {
        let snapshot: Option<LedgerSnapshot> = if self.snapshot_path.exists() {
            let bytes = fs::read(&self.snapshot_path)?;
            Some(bincode::deserialize(&bytes)?)
        } else {
            None
        };

        let tail = self.read_journal_tail()?;
        self.since_snapshot = tail.len();

        match snapshot {
            Some(snapshot) => Ok(Some(RecoveredState {
                balances: snapshot.balances,
                stakes: snapshot.stakes,
                total_supply: snapshot.total_supply,
                tail,
            })),
            None if tail.is_empty() => Ok(None),
            None => Ok(Some(RecoveredState {
                balances: HashMap::new(),
                stakes: HashMap::new(),
                total_supply: TokenAmount::ZERO,
                tail,
            })),
        }
    }

    fn read_journal_tail(&self) -> Result<Vec<Transaction>> {
        let mut bytes = Vec::new();
        File::open(&self.journal_path)?.read_to_end(&mut bytes)?;

        let mut tail = Vec::new();
        let mut cursor = 0usize;
        while cursor + 4 <= bytes.len() {
            let len = u32::from_be_bytes(
                bytes[cursor..cursor + 4]
                    .try_into()
                    .map_err(|_| Error::Serialization("journal length prefix".to_string()))?,
            ) as usize;
            cursor += 4;
            if cursor + len > bytes.len() {
                // Torn final record from a crash mid-append; ignore it
                log::warn!("journal ends with a torn record, truncating replay");
                break;
            }
            let tx: Transaction = bincode::deserialize(&bytes[cursor..cursor + len])?;
            cursor += len;
            tail.push(tx);
        }
        Ok(tail)
    }
}
