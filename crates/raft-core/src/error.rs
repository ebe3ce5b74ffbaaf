//! # error
//!
//! why: name the failures the protocol core can hand back to its driver
//! relations: storage.rs adapters produce StorageError, replication.rs produces NotLeader
//! what: StorageError, RaftError

use std::io;

use thiserror::Error;

use crate::node::NodeId;

/// A durability failure. The node cannot keep its safety guarantees after one.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io failure while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("encoding failure while {action}: {source}")]
    Codec {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt storage: {0}")]
    Corrupt(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub fn io(action: &'static str, source: io::Error) -> Self {
        Self::Io { action, source }
    }

    pub fn codec(action: &'static str, source: serde_json::Error) -> Self {
        Self::Codec { action, source }
    }
}

#[derive(Debug, Error)]
pub enum RaftError {
    /// Proposals are only accepted by the leader of the current term.
    #[error("not the leader")]
    NotLeader { leader: Option<NodeId> },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
