//! # replication
//!
//! why: keep follower logs identical to the leader's and decide what is committed
//! relations: extends RaftNode from node.rs, messages from message.rs, applied by raft-node
//! what: propose, AppendEntries send/receive, commit advancement, apply bookkeeping

use tracing::{debug, warn};

use crate::error::{RaftError, StorageError};
use crate::log::{Command, EntryPayload, LogEntry};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, AppendSent, LogHint};
use crate::node::{NodeId, NodeState, RaftNode};
use crate::storage::LogStorage;

/// What a leader learned from one AppendEntries response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// The peer accepted the entries
    Accepted {
        /// The commit index moved forward
        committed: bool,
        /// The peer now holds the whole log
        caught_up: bool,
    },
    /// Consistency check failed; next_index moved back for the next attempt
    Rejected,
    /// The response carried a newer term and this node stepped down
    SteppedDown,
    /// The response no longer matches this node's term, role or cursor
    Stale,
}

impl<S: LogStorage> RaftNode<S> {
    /// Append a client command to the leader's log.
    ///
    /// Returns the `(index, term)` the entry was stored under; the caller
    /// waits for that pair to be applied.
    pub fn propose(&mut self, command: Command) -> Result<(u64, u64), RaftError> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader.clone(),
            });
        }
        let index = self.append_local(EntryPayload::Command(command))?;
        self.advance_commit();
        debug!(index, term = self.current_term, "proposed entry");
        Ok((index, self.current_term))
    }

    /// Build the next AppendEntries for `peer`, starting at its next_index.
    /// `None` unless this node leads and knows the peer.
    pub fn append_request_for(&self, peer: &NodeId) -> Option<AppendEntriesRequest> {
        if self.state != NodeState::Leader {
            return None;
        }
        let cursor = self.peers.get(peer)?;
        let prev_log_index = cursor.next_index.saturating_sub(1);
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let last = self
            .log
            .last_index()
            .min(prev_log_index + self.config.max_append_entries as u64);
        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries: self.log.slice(cursor.next_index, last),
            leader_commit: self.commit_index,
        })
    }

    /// One request per known peer; used for heartbeats and after proposals.
    pub fn append_requests(&self) -> Vec<(NodeId, AppendEntriesRequest)> {
        self.peers
            .keys()
            .filter_map(|peer| Some((peer.clone(), self.append_request_for(peer)?)))
            .collect()
    }

    /// Receive side of AppendEntries. The bool tells the driver to reset its
    /// election timer: true for every request from a current-or-newer leader.
    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<(AppendEntriesResponse, bool), StorageError> {
        if request.term < self.current_term {
            debug!(
                leader = %request.leader_id,
                term = request.term,
                current_term = self.current_term,
                "rejecting append from stale leader"
            );
            return Ok((self.append_response(false, None), false));
        }
        if request.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(request.term, Some(request.leader_id.clone()))?;
        } else {
            self.leader = Some(request.leader_id.clone());
        }

        if self.log.term_at(request.prev_log_index) != Some(request.prev_log_term) {
            debug!(
                prev_log_index = request.prev_log_index,
                prev_log_term = request.prev_log_term,
                last_log_index = self.log.last_index(),
                "log does not match leader"
            );
            return Ok((self.append_response(false, Some(self.log_hint())), true));
        }

        if !self.merge_entries(request.prev_log_index, &request.entries)? {
            return Ok((self.append_response(false, Some(self.log_hint())), true));
        }

        let last_new_index = request.prev_log_index + request.entries.len() as u64;
        if request.leader_commit > self.commit_index {
            let commit = request.leader_commit.min(last_new_index);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }
        Ok((self.append_response(true, None), true))
    }

    /// Leader side: fold a peer's answer into its cursors and the commit index.
    pub fn handle_append_entries_response(
        &mut self,
        from: &NodeId,
        sent: AppendSent,
        response: &AppendEntriesResponse,
    ) -> Result<ReplicationOutcome, StorageError> {
        if response.term > self.current_term {
            self.become_follower(response.term, None)?;
            return Ok(ReplicationOutcome::SteppedDown);
        }
        if self.state != NodeState::Leader || sent.term != self.current_term {
            return Ok(ReplicationOutcome::Stale);
        }
        let last_index = self.log.last_index();
        let Some(peer) = self.peers.get_mut(from) else {
            return Ok(ReplicationOutcome::Stale);
        };

        if response.success {
            let matched = sent.prev_log_index + sent.entry_count;
            if matched > peer.match_index {
                peer.match_index = matched;
            }
            peer.next_index = peer.next_index.max(peer.match_index + 1);
            let caught_up = peer.match_index >= last_index;
            let committed = self.advance_commit();
            return Ok(ReplicationOutcome::Accepted {
                committed,
                caught_up,
            });
        }

        // Only the answer to the request built from the current cursor may
        // move it; duplicates and reordered failures would over-decrement.
        if sent.prev_log_index + 1 != peer.next_index {
            return Ok(ReplicationOutcome::Stale);
        }
        let mut next_index = peer.next_index.saturating_sub(1);
        if let Some(hint) = response.match_hint {
            next_index = next_index.min(hint.last_log_index + 1);
        }
        peer.next_index = next_index.max(peer.match_index + 1).max(1);
        debug!(peer = %from, next_index = peer.next_index, "backing off replication cursor");
        Ok(ReplicationOutcome::Rejected)
    }

    /// Move the commit index to the highest entry of the current term stored
    /// on a majority. Entries of earlier terms only commit underneath it.
    pub fn advance_commit(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let mut matched: Vec<u64> = self.peers.values().map(|peer| peer.match_index).collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum_size() - 1];
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            debug!(from = self.commit_index, to = candidate, "commit index advanced");
            self.commit_index = candidate;
            return true;
        }
        false
    }

    /// Committed entries not yet applied, in index order.
    pub fn committed_unapplied(&self) -> Vec<LogEntry> {
        self.log.slice(self.last_applied + 1, self.commit_index)
    }

    /// Record that the entry at `index` reached the state machine. Only the
    /// next committed index is accepted.
    pub fn advance_applied(&mut self, index: u64) -> bool {
        if index != self.last_applied + 1 || index > self.commit_index {
            return false;
        }
        self.last_applied = index;
        true
    }

    /// Reconcile `entries` (which follow `prev_log_index`) with the local log.
    /// Entries already present are skipped, so re-delivery is a no-op; the
    /// first conflicting entry truncates the uncommitted suffix.
    fn merge_entries(
        &mut self,
        prev_log_index: u64,
        entries: &[LogEntry],
    ) -> Result<bool, StorageError> {
        let contiguous = entries
            .iter()
            .enumerate()
            .all(|(offset, entry)| entry.index == prev_log_index + offset as u64 + 1);
        if !contiguous {
            warn!(prev_log_index, "dropping append with non-contiguous entries");
            return Ok(false);
        }

        for (offset, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        warn!(
                            index = entry.index,
                            commit_index = self.commit_index,
                            "leader tried to overwrite a committed entry"
                        );
                        return Ok(false);
                    }
                    debug!(from = entry.index, "truncating conflicting suffix");
                    self.storage.truncate_from(entry.index)?;
                    self.log.truncate_from(entry.index);
                }
                None => {}
            }
            let rest = &entries[offset..];
            self.storage.append_entries(rest)?;
            for entry in rest {
                self.log.push(entry.clone());
            }
            break;
        }
        Ok(true)
    }

    fn log_hint(&self) -> LogHint {
        LogHint {
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    fn append_response(&self, success: bool, match_hint: Option<LogHint>) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            match_hint,
        }
    }
}
