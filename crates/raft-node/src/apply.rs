//! # apply
//!
//! why: committed entries must reach the state machine once, in order, and answer their client
//! relations: called by actor.rs after every step; drives raft_core::StateMachine
//! what: PendingCommands, apply_committed

use std::collections::BTreeMap;

use raft_core::{CommandOutput, LogStorage, RaftNode, StateMachine, StorageError};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::CommandError;

pub(crate) type Responder = oneshot::Sender<Result<CommandOutput, CommandError>>;

/// Client commands proposed by this node, keyed by log index.
#[derive(Debug, Default)]
pub(crate) struct PendingCommands {
    waiting: BTreeMap<u64, (u64, Responder)>,
}

impl PendingCommands {
    pub(crate) fn insert(&mut self, index: u64, term: u64, respond_to: Responder) {
        if let Some((_, displaced)) = self.waiting.insert(index, (term, respond_to)) {
            // an older proposal at this index lost its slot
            let _ = displaced.send(Err(CommandError::NotLeader { leader: None }));
        }
    }

    /// Answer the command waiting on `index`, if any. A different term means
    /// the entry that got applied is not the one that was proposed.
    pub(crate) fn resolve(&mut self, applied: Applied) {
        let Applied {
            index,
            term,
            output,
        } = applied;
        let Some((proposed_term, respond_to)) = self.waiting.remove(&index) else {
            return;
        };
        let result = if proposed_term == term {
            Ok(output)
        } else {
            debug!(index, proposed_term, applied_term = term, "proposal was overwritten");
            Err(CommandError::NotLeader { leader: None })
        };
        let _ = respond_to.send(result);
    }

    pub(crate) fn fail_all(&mut self, error: &CommandError) {
        for (_, (_, respond_to)) in std::mem::take(&mut self.waiting) {
            let _ = respond_to.send(Err(error.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}

/// Output of one applied entry, held until the new status is published.
#[derive(Debug)]
pub(crate) struct Applied {
    pub(crate) index: u64,
    pub(crate) term: u64,
    pub(crate) output: CommandOutput,
}

/// Apply every committed but unapplied entry, pushing each output to
/// `applied`. Entries applied before an error stay in `applied`.
pub(crate) fn apply_committed<S, M>(
    core: &mut RaftNode<S>,
    state_machine: &mut M,
    applied: &mut Vec<Applied>,
) -> Result<(), StorageError>
where
    S: LogStorage,
    M: StateMachine,
{
    for entry in core.committed_unapplied() {
        let output = state_machine.apply(&entry)?;
        if !core.advance_applied(entry.index) {
            return Err(StorageError::Corrupt(format!(
                "applied index {} out of order after {}",
                entry.index,
                core.last_applied()
            )));
        }
        applied.push(Applied {
            index: entry.index,
            term: entry.term,
            output,
        });
    }
    Ok(())
}
