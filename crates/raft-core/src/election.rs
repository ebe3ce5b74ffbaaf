//! # election
//!
//! why: decide who leads each term
//! relations: extends RaftNode from node.rs; the timer that triggers it lives in raft-node
//! what: start_election, vote request handling, vote response counting

use tracing::{debug, info};

use crate::error::StorageError;
use crate::message::{VoteRequest, VoteResponse};
use crate::node::{NodeId, NodeState, RaftNode};
use crate::storage::LogStorage;

impl<S: LogStorage> RaftNode<S> {
    /// Become Candidate for the next term and vote for self.
    ///
    /// The new term and vote are persisted before the request is returned. A
    /// node alone in its cluster view wins immediately.
    pub fn start_election(&mut self) -> Result<VoteRequest, StorageError> {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        for peer in self.peers.values_mut() {
            peer.vote_granted = false;
        }
        self.persist_hard_state()?;
        info!(term = self.current_term, peers = self.peers.len(), "starting election");

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        if self.has_quorum() {
            self.become_leader()?;
        }
        Ok(request)
    }

    /// Votes held in the current election, including our own.
    pub fn votes_received(&self) -> usize {
        if self.state != NodeState::Candidate {
            return 0;
        }
        let own = usize::from(self.voted_for.as_ref() == Some(&self.id));
        own + self.peers.values().filter(|peer| peer.vote_granted).count()
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received() >= self.quorum_size()
    }

    /// Answer a RequestVote. The bool tells the driver to reset its election
    /// timer, which happens only when the vote is granted.
    pub fn handle_vote_request(
        &mut self,
        request: &VoteRequest,
    ) -> Result<(VoteResponse, bool), StorageError> {
        if request.term < self.current_term {
            debug!(
                candidate = %request.candidate_id,
                term = request.term,
                current_term = self.current_term,
                "rejecting vote for stale term"
            );
            return Ok((self.vote_response(false), false));
        }
        if request.term > self.current_term {
            self.become_follower(request.term, None)?;
        }

        let free_to_vote = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == request.candidate_id,
        };
        let up_to_date = self
            .log
            .is_up_to_date(request.last_log_index, request.last_log_term);
        let granted = free_to_vote && up_to_date;

        if granted && self.voted_for.is_none() {
            self.voted_for = Some(request.candidate_id.clone());
            self.persist_hard_state()?;
        }
        debug!(
            candidate = %request.candidate_id,
            term = self.current_term,
            granted,
            up_to_date,
            "answered vote request"
        );
        Ok((self.vote_response(granted), granted))
    }

    /// Count a vote answer for the election started in `sent_term`.
    /// Returns true when this answer made the node leader.
    pub fn handle_vote_response(
        &mut self,
        from: &NodeId,
        sent_term: u64,
        response: &VoteResponse,
    ) -> Result<bool, StorageError> {
        if response.term > self.current_term {
            self.become_follower(response.term, None)?;
            return Ok(false);
        }
        if self.state != NodeState::Candidate
            || sent_term != self.current_term
            || response.term != self.current_term
        {
            debug!(peer = %from, sent_term, "ignoring stale vote response");
            return Ok(false);
        }
        if !response.vote_granted {
            return Ok(false);
        }
        let Some(peer) = self.peers.get_mut(from) else {
            debug!(peer = %from, "vote from a node outside the cluster view");
            return Ok(false);
        };
        peer.vote_granted = true;

        if self.has_quorum() {
            self.become_leader()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn vote_response(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }
}
