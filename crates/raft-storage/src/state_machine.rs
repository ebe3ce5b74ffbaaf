//! # state machine
//!
//! why: the replicated key-value map committed commands are applied to
//! relations: implements raft_core::StateMachine over a KvEngine from engine.rs
//! what: KvStateMachine

use std::collections::BTreeMap;

use raft_core::{Command, CommandOutput, EntryPayload, LogEntry, StateMachine, StorageError};
use tracing::trace;

use crate::engine::{BatchOp, KvEngine};

const LAST_APPLIED_KEY: &str = "sm/last_applied";
const KV_PREFIX: &str = "kv/";
const KV_END: &str = "kv0";

fn kv_key(key: &str) -> String {
    format!("{KV_PREFIX}{key}")
}

fn decode_value(bytes: Vec<u8>) -> Result<String, StorageError> {
    String::from_utf8(bytes).map_err(|e| StorageError::Corrupt(format!("non utf-8 value: {e}")))
}

/// Key-value state machine.
///
/// The effect of an entry and the new applied index are written in one batch,
/// so after a crash the map and `last_applied` always agree.
#[derive(Debug, Clone)]
pub struct KvStateMachine<E> {
    engine: E,
    last_applied: u64,
}

impl<E: KvEngine> KvStateMachine<E> {
    pub fn open(engine: E) -> Result<Self, StorageError> {
        let last_applied = match engine.get(LAST_APPLIED_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::codec("decoding applied index", e))?,
            None => 0,
        };
        Ok(Self {
            engine,
            last_applied,
        })
    }

    /// Read a key directly, bypassing the log.
    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.engine.get(&kv_key(key))?.map(decode_value).transpose()
    }

    /// Every key and value currently in the map.
    pub fn snapshot(&self) -> Result<BTreeMap<String, String>, StorageError> {
        self.engine
            .scan(KV_PREFIX, KV_END)?
            .into_iter()
            .map(|(key, value)| {
                let key = key.strip_prefix(KV_PREFIX).unwrap_or(key.as_str()).to_string();
                Ok((key, decode_value(value)?))
            })
            .collect()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: KvEngine> StateMachine for KvStateMachine<E> {
    fn last_applied(&self) -> Result<u64, StorageError> {
        Ok(self.last_applied)
    }

    fn apply(&mut self, entry: &LogEntry) -> Result<CommandOutput, StorageError> {
        if entry.index != self.last_applied + 1 {
            return Err(StorageError::Corrupt(format!(
                "apply of index {} after applied index {}",
                entry.index, self.last_applied
            )));
        }
        let applied = serde_json::to_vec(&entry.index)
            .map_err(|e| StorageError::codec("encoding applied index", e))?;
        let mut ops = vec![BatchOp::put(LAST_APPLIED_KEY, applied)];

        let output = match &entry.payload {
            EntryPayload::Noop => CommandOutput::Noop,
            EntryPayload::Command(Command::Put { key, value }) => {
                ops.push(BatchOp::put(kv_key(key), value.as_bytes().to_vec()));
                CommandOutput::Written
            }
            EntryPayload::Command(Command::Get { key }) => CommandOutput::Value(self.get(key)?),
        };
        self.engine.write_batch(ops)?;
        self.last_applied = entry.index;
        trace!(index = entry.index, "applied entry");
        Ok(output)
    }
}
