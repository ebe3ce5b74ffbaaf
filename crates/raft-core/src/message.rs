//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by election.rs / replication.rs, serialized by raft-node transports
//! what: RequestVote and AppendEntries requests with their responses

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::node::NodeId;

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bookkeeping the leader keeps while the request is in flight.
    pub fn sent(&self) -> AppendSent {
        AppendSent {
            term: self.term,
            prev_log_index: self.prev_log_index,
            entry_count: self.entries.len() as u64,
        }
    }
}

/// Where the follower's log ends, returned on a failed consistency check so
/// the leader can skip back further than one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHint {
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_hint: Option<LogHint>,
}

/// Shape of an AppendEntries request that is awaiting its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendSent {
    pub term: u64,
    pub prev_log_index: u64,
    pub entry_count: u64,
}

/// Inbound rpc requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum RaftMessage {
    RequestVote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            Self::RequestVote(req) => req.term,
            Self::AppendEntries(req) => req.term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestVote(_) => "request_vote",
            Self::AppendEntries(_) => "append_entries",
        }
    }

    /// The node that issued the request.
    pub fn sender(&self) -> &NodeId {
        match self {
            Self::RequestVote(req) => &req.candidate_id,
            Self::AppendEntries(req) => &req.leader_id,
        }
    }
}

/// Responses, one per RaftMessage variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum RaftReply {
    RequestVote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
}

impl RaftReply {
    pub fn term(&self) -> u64 {
        match self {
            Self::RequestVote(resp) => resp.term,
            Self::AppendEntries(resp) => resp.term,
        }
    }
}
