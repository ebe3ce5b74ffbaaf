//! # storage
//!
//! why: describe what the consensus core needs from durable storage without choosing an engine
//! relations: implemented by raft-storage over a key-value engine, consumed by node.rs
//! what: HardState, LogStorage and StateMachine traits, MemLogStorage for tests and simulations

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::log::{CommandOutput, LogEntry};
use crate::node::NodeId;

/// The part of node state that must survive a restart besides the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Durable storage of the log and the hard state.
///
/// Every method must be durable before it returns `Ok`; the node answers rpcs
/// right after these calls and relies on them having reached disk.
pub trait LogStorage: Send + 'static {
    fn load_hard_state(&self) -> Result<HardState, StorageError>;

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError>;

    /// Append entries; the first must directly follow the current last index.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Entries in `from..=to`, clamped to what exists.
    fn read_entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, StorageError>;

    /// Remove the entry at `index` and every entry after it.
    fn truncate_from(&mut self, index: u64) -> Result<(), StorageError>;

    fn last_index(&self) -> Result<u64, StorageError>;

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        match self.last_index()? {
            0 => Ok(Vec::new()),
            last => self.read_entries(1, last),
        }
    }
}

/// The replicated state machine committed entries are applied to.
pub trait StateMachine: Send + 'static {
    /// Index of the last entry applied, persisted together with its effect.
    fn last_applied(&self) -> Result<u64, StorageError>;

    /// Apply the entry directly following `last_applied`.
    fn apply(&mut self, entry: &LogEntry) -> Result<CommandOutput, StorageError>;
}

/// In-memory storage for tests
///
/// Keeps everything in memory, nothing survives the process.
#[derive(Debug, Clone, Default)]
pub struct MemLogStorage {
    hard_state: HardState,
    log: Vec<LogEntry>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed storage as if a previous run had persisted this state.
    pub fn with_state(hard_state: HardState, log: Vec<LogEntry>) -> Self {
        Self { hard_state, log }
    }
}

impl LogStorage for MemLogStorage {
    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        Ok(self.hard_state.clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut next = self.log.len() as u64 + 1;
        for entry in entries {
            if entry.index != next {
                return Err(StorageError::Corrupt(format!(
                    "append of index {} after last index {}",
                    entry.index,
                    next - 1
                )));
            }
            self.log.push(entry.clone());
            next += 1;
        }
        Ok(())
    }

    fn read_entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self
            .log
            .iter()
            .filter(|e| e.index >= from && e.index <= to)
            .cloned()
            .collect())
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), StorageError> {
        self.log.retain(|e| e.index < index);
        Ok(())
    }

    fn last_index(&self) -> Result<u64, StorageError> {
        Ok(self.log.last().map_or(0, |e| e.index))
    }
}
