//! # timer
//!
//! why: followers and candidates must notice a silent leader after a randomized delay
//! relations: owned by actor.rs, durations from raft_core::RaftConfig
//! what: ElectionTimer

use std::pin::Pin;

use raft_core::RaftConfig;
use tokio::time::{sleep_until, Instant, Sleep};

/// A cancellable one-shot deadline with a fresh random duration per reset.
#[derive(Debug)]
pub(crate) struct ElectionTimer {
    config: RaftConfig,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl ElectionTimer {
    /// Create an armed timer.
    pub(crate) fn new(config: RaftConfig) -> Self {
        let deadline = Instant::now() + config.random_election_timeout(&mut rand::thread_rng());
        Self {
            config,
            sleep: Box::pin(sleep_until(deadline)),
            armed: true,
        }
    }

    /// Re-arm with a new random deadline.
    pub(crate) fn reset(&mut self) {
        let timeout = self.config.random_election_timeout(&mut rand::thread_rng());
        self.sleep.as_mut().reset(Instant::now() + timeout);
        self.armed = true;
    }

    pub(crate) fn cancel(&mut self) {
        self.armed = false;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    /// Completes when the deadline passes; never completes while cancelled.
    /// Cancel safe.
    pub(crate) async fn fired(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}
