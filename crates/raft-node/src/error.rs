//! # error
//!
//! why: separate what a client sees from what an operator sees
//! relations: TransportError from transport/, CommandError from node.rs and apply.rs
//! what: TransportError, CommandError, NodeError

use std::io;

use raft_core::{ConfigError, NodeId, StorageError};
use thiserror::Error;

/// An rpc that produced no response. Never fatal; the actor retries on its next tick.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("address {0} already has a listener")]
    AddressInUse(NodeId),

    #[error("rpc timed out")]
    Timeout,

    #[error("connection closed before a reply arrived")]
    Closed,

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Why a client command did not produce an output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Sent to a node that does not lead, or leadership was lost before the
    /// entry was applied. `leader` is the last known leader, if any.
    #[error("not the leader")]
    NotLeader { leader: Option<NodeId> },

    #[error("node is stopped")]
    Stopped,

    #[error("node failed: {0}")]
    Fatal(String),
}

impl CommandError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotLeader { .. } => "ENOTLEADER",
            Self::Stopped => "ESTOPPED",
            Self::Fatal(_) => "EFATAL",
        }
    }
}

/// Lifecycle failures of a Node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is already running")]
    AlreadyRunning,

    #[error("node storage was lost after an earlier failure")]
    StorageLost,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("node task ended abnormally: {0}")]
    Join(#[from] tokio::task::JoinError),
}
