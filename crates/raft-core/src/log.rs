//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via the LogStorage contract
//! what: Command, LogEntry, RaftLog with the index/term lookups the protocol needs

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A client command carried by the log, tagged as `{"type": "put" | "get", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Put { key: String, value: String },
    Get { key: String },
}

impl Command {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::Get { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Get { key } => key,
        }
    }
}

/// What applying one entry produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutput {
    /// A put was applied
    Written,
    /// A get observed this value
    Value(Option<String>),
    /// A leader no-op entry was applied
    Noop,
}

impl CommandOutput {
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Value(value) => value.as_deref(),
            Self::Written | Self::Noop => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries of its own term
    Noop,
    Command(Command),
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    pub fn command(term: u64, index: u64, command: Command) -> Self {
        Self::new(term, index, EntryPayload::Command(command))
    }

    pub fn noop(term: u64, index: u64) -> Self {
        Self::new(term, index, EntryPayload::Noop)
    }
}

/// In-memory view of the log. Entries are contiguous from index 1, so the
/// entry with index `i` lives at position `i - 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, checking they are contiguous from 1.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, StorageError> {
        for (position, entry) in entries.iter().enumerate() {
            let expected = position as u64 + 1;
            if entry.index != expected {
                return Err(StorageError::Corrupt(format!(
                    "log entry at position {position} has index {}, expected {expected}",
                    entry.index
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(0, |entry| entry.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |entry| entry.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|entry| entry.term)
    }

    /// Clone the entries in `from..=to`, clamped to what exists.
    pub fn slice(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let from = from.max(1);
        let to = to.min(self.last_index());
        if from > to {
            return Vec::new();
        }
        self.entries[(from - 1) as usize..to as usize].to_vec()
    }

    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log must stay contiguous");
        self.entries.push(entry);
    }

    /// Drop the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// Whether a log ending at `(last_log_term, last_log_index)` is at least as
    /// up-to-date as this one.
    pub fn is_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        (last_log_term, last_log_index) >= (self.last_term(), self.last_index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}
