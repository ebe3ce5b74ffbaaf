//! # log store
//!
//! why: persist the raft log and hard state so a restarted node resumes where it stopped
//! relations: implements raft_core::LogStorage over any KvEngine from engine.rs
//! what: EngineLogStorage

use raft_core::{HardState, LogEntry, LogStorage, StorageError};
use tracing::debug;

use crate::engine::{BatchOp, KvEngine};

const HARD_STATE_KEY: &str = "raft/hard_state";
const LOG_PREFIX: &str = "raft/log/";
// first key after every "raft/log/..." key
const LOG_END: &str = "raft/log0";

fn log_key(index: u64) -> String {
    // zero padded so key order is index order
    format!("{LOG_PREFIX}{index:020}")
}

fn index_of(key: &str) -> Result<u64, StorageError> {
    key.strip_prefix(LOG_PREFIX)
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| StorageError::Corrupt(format!("malformed log key {key:?}")))
}

/// Log storage over a key-value engine.
///
/// Each entry is its own key, so appends and truncations touch only the keys
/// involved, and each call is one atomic batch.
#[derive(Debug, Clone)]
pub struct EngineLogStorage<E> {
    engine: E,
    last_index: u64,
}

impl<E: KvEngine> EngineLogStorage<E> {
    /// Open the log kept in `engine`, finding its last index.
    pub fn open(engine: E) -> Result<Self, StorageError> {
        let last_index = match engine.scan(LOG_PREFIX, LOG_END)?.last() {
            Some((key, _)) => index_of(key)?,
            None => 0,
        };
        debug!(last_index, "opened log storage");
        Ok(Self { engine, last_index })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: KvEngine> LogStorage for EngineLogStorage<E> {
    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        match self.engine.get(HARD_STATE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::codec("decoding hard state", e)),
            None => Ok(HardState::default()),
        }
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(state).map_err(|e| StorageError::codec("encoding hard state", e))?;
        self.engine.put(HARD_STATE_KEY, bytes)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        let mut ops = Vec::with_capacity(entries.len());
        for (offset, entry) in entries.iter().enumerate() {
            let expected = self.last_index + offset as u64 + 1;
            if entry.index != expected {
                return Err(StorageError::Corrupt(format!(
                    "append of index {} where {expected} was expected",
                    entry.index
                )));
            }
            let bytes = serde_json::to_vec(entry)
                .map_err(|e| StorageError::codec("encoding log entry", e))?;
            ops.push(BatchOp::put(log_key(entry.index), bytes));
        }
        self.engine.write_batch(ops)?;
        self.last_index = last.index;
        Ok(())
    }

    fn read_entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, StorageError> {
        let from = from.max(1);
        let to = to.min(self.last_index);
        if from > to {
            return Ok(Vec::new());
        }
        self.engine
            .scan(&log_key(from), &log_key(to + 1))?
            .into_iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::codec("decoding log entry", e))
            })
            .collect()
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), StorageError> {
        let index = index.max(1);
        if index > self.last_index {
            return Ok(());
        }
        let ops = self
            .engine
            .scan(&log_key(index), LOG_END)?
            .into_iter()
            .map(|(key, _)| BatchOp::delete(key))
            .collect();
        self.engine.write_batch(ops)?;
        debug!(from = index, dropped = self.last_index - index + 1, "truncated log");
        self.last_index = index - 1;
        Ok(())
    }

    fn last_index(&self) -> Result<u64, StorageError> {
        Ok(self.last_index)
    }
}
