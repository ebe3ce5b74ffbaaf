//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: election.rs and replication.rs add the rpc handlers, storage.rs persists it
//! what: NodeId, NodeState, Peer, NodeStatus, RaftNode

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RaftConfig;
use crate::error::StorageError;
use crate::log::{EntryPayload, LogEntry, RaftLog};
use crate::storage::{HardState, LogStorage};

/// Routable identity of a cluster member; the peer's transport address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for NodeId {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-peer volatile state, rebuilt on every election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    /// Next log index to send to this peer
    pub next_index: u64,
    /// Highest index known to be replicated on this peer
    pub match_index: u64,
    /// Whether this peer granted its vote in the current election
    pub vote_granted: bool,
}

impl Peer {
    fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            vote_granted: false,
        }
    }
}

/// Point-in-time summary of a node, cheap to clone and publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

/// A single Raft node in the cluster
///
/// Holds the durable state (term, vote, log) mirrored in `storage` and the
/// volatile state (role, commit index, peer cursors) rebuilt on restart.
#[derive(Debug)]
pub struct RaftNode<S> {
    pub(crate) id: NodeId,
    pub(crate) state: NodeState,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: RaftLog,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) leader: Option<NodeId>,
    pub(crate) peers: BTreeMap<NodeId, Peer>,
    pub(crate) config: RaftConfig,
    pub(crate) storage: S,
}

impl<S: LogStorage> RaftNode<S> {
    /// Create a node over fresh or previously used storage, in Follower state.
    pub fn new(
        id: NodeId,
        peers: impl IntoIterator<Item = NodeId>,
        storage: S,
        config: RaftConfig,
    ) -> Result<Self, StorageError> {
        Self::restore(id, peers, storage, config, 0)
    }

    /// Reload durable state; `last_applied` comes from the state machine and
    /// seeds the commit index.
    pub fn restore(
        id: NodeId,
        peers: impl IntoIterator<Item = NodeId>,
        storage: S,
        config: RaftConfig,
        last_applied: u64,
    ) -> Result<Self, StorageError> {
        Self::try_restore(id, peers, storage, config, last_applied).map_err(|(e, _)| e)
    }

    /// Like [`RaftNode::restore`], but hands the storage back when its state
    /// cannot be loaded, so the caller can retry later.
    pub fn try_restore(
        id: NodeId,
        peers: impl IntoIterator<Item = NodeId>,
        storage: S,
        config: RaftConfig,
        last_applied: u64,
    ) -> Result<Self, (StorageError, S)> {
        let (hard_state, log) = match load_durable(&storage, last_applied) {
            Ok(loaded) => loaded,
            Err(e) => return Err((e, storage)),
        };
        debug!(
            term = hard_state.current_term,
            last_log_index = log.last_index(),
            last_applied,
            "restored node state"
        );

        let mut node = Self {
            id,
            state: NodeState::Follower,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: last_applied,
            last_applied,
            leader: None,
            peers: BTreeMap::new(),
            config,
            storage,
        };
        for peer in peers {
            node.add_peer(peer);
        }
        Ok(node)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// The leader of the current term, if this node has heard from one.
    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn peer(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// Members including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Majority of the cluster: floor(n / 2) + 1.
    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Add a peer to the cluster view. Returns false for self or a known peer.
    pub fn add_peer(&mut self, id: NodeId) -> bool {
        if id == self.id || self.peers.contains_key(&id) {
            return false;
        }
        debug!(peer = %id, "peer joined cluster view");
        self.peers.insert(id, Peer::new(self.log.last_index() + 1));
        true
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.state,
            term: self.current_term,
            leader: self.leader.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    /// Revert to Follower, adopting `term` (and clearing the vote) when it is newer.
    pub fn become_follower(&mut self, term: u64, leader: Option<NodeId>) -> Result<(), StorageError> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        if self.state != NodeState::Follower {
            info!(term = self.current_term, from = %self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.leader = leader;
        for peer in self.peers.values_mut() {
            peer.vote_granted = false;
        }
        Ok(())
    }

    pub(crate) fn become_leader(&mut self) -> Result<(), StorageError> {
        self.state = NodeState::Leader;
        self.leader = Some(self.id.clone());
        let next_index = self.log.last_index() + 1;
        for peer in self.peers.values_mut() {
            *peer = Peer::new(next_index);
        }
        info!(term = self.current_term, "became leader");
        self.append_local(EntryPayload::Noop)?;
        self.advance_commit();
        Ok(())
    }

    pub(crate) fn persist_hard_state(&mut self) -> Result<(), StorageError> {
        let state = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.storage.save_hard_state(&state)
    }

    /// Append a new entry of the current term to the local log, durably.
    pub(crate) fn append_local(&mut self, payload: EntryPayload) -> Result<u64, StorageError> {
        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, payload);
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        let index = entry.index;
        self.log.push(entry);
        Ok(index)
    }
}

fn load_durable<S: LogStorage>(
    storage: &S,
    last_applied: u64,
) -> Result<(HardState, RaftLog), StorageError> {
    let hard_state = storage.load_hard_state()?;
    let log = RaftLog::from_entries(storage.load_log()?)?;
    if last_applied > log.last_index() {
        return Err(StorageError::Corrupt(format!(
            "state machine applied index {last_applied} beyond last log index {}",
            log.last_index()
        )));
    }
    Ok((hard_state, log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemLogStorage;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[test]
    fn new_node_starts_as_follower() {
        let node = RaftNode::new(
            NodeId::from("n1"),
            ids(&["n2", "n3"]),
            MemLogStorage::new(),
            RaftConfig::default(),
        )
        .unwrap();
        assert_eq!(node.state(), NodeState::Follower);
        assert_eq!(node.current_term(), 0);
        assert_eq!(node.voted_for(), None);
    }

    #[test]
    fn add_peer_is_idempotent_and_ignores_self() {
        let mut node = RaftNode::new(
            NodeId::from("n1"),
            Vec::new(),
            MemLogStorage::new(),
            RaftConfig::default(),
        )
        .unwrap();
        assert!(node.add_peer(NodeId::from("n2")));
        assert!(!node.add_peer(NodeId::from("n2")));
        assert!(!node.add_peer(NodeId::from("n1")));
        assert_eq!(node.cluster_size(), 2);
    }

    #[test]
    fn restore_rejects_applied_index_beyond_log() {
        let result = RaftNode::restore(
            NodeId::from("n1"),
            Vec::new(),
            MemLogStorage::new(),
            RaftConfig::default(),
            3,
        );
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn try_restore_hands_storage_back_on_failure() {
        let storage = MemLogStorage::with_state(
            HardState {
                current_term: 3,
                voted_for: None,
            },
            vec![LogEntry::noop(1, 1)],
        );
        let (err, storage) = RaftNode::try_restore(
            NodeId::from("n1"),
            Vec::new(),
            storage,
            RaftConfig::default(),
            5,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
        assert_eq!(storage.load_hard_state().unwrap().current_term, 3);

        let node =
            RaftNode::try_restore(NodeId::from("n1"), Vec::new(), storage, RaftConfig::default(), 1)
                .unwrap();
        assert_eq!(node.current_term(), 3);
        assert_eq!(node.commit_index(), 1);
    }

    #[test]
    fn become_follower_with_newer_term_clears_vote() {
        let storage = MemLogStorage::with_state(
            HardState {
                current_term: 2,
                voted_for: Some(NodeId::from("n1")),
            },
            Vec::new(),
        );
        let mut node =
            RaftNode::new(NodeId::from("n1"), ids(&["n2"]), storage, RaftConfig::default()).unwrap();
        node.become_follower(4, None).unwrap();
        assert_eq!(node.current_term(), 4);
        assert_eq!(node.voted_for(), None);
        assert_eq!(node.storage().load_hard_state().unwrap().current_term, 4);
    }
}
