//! # config
//!
//! why: keep every protocol timing and batching knob in one validated place
//! relations: read by node.rs for batching, by raft-node for timers and rpc deadlines
//! what: RaftConfig, ConfigError, randomized election timeout

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timing and batching configuration, all durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound (inclusive) of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound (exclusive) of the randomized election timeout
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats
    pub heartbeat_interval: u64,
    /// Deadline for a single outbound rpc
    pub rpc_timeout: u64,
    /// Maximum number of entries carried by one AppendEntries request
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_append_entries: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election timeout range {min}..{max}ms is empty")]
    EmptyElectionRange { min: u64, max: u64 },

    #[error("heartbeat interval {heartbeat}ms must be shorter than the minimum election timeout {min}ms")]
    HeartbeatTooSlow { heartbeat: u64, min: u64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),
}

impl RaftConfig {
    /// Parse a JSON document; missing fields fall back to the defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.rpc_timeout == 0 {
            return Err(ConfigError::Zero("rpc_timeout"));
        }
        if self.max_append_entries == 0 {
            return Err(ConfigError::Zero("max_append_entries"));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::EmptyElectionRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                min: self.election_timeout_min,
            });
        }
        Ok(())
    }

    /// Draw a fresh election timeout uniformly from the configured range.
    pub fn random_election_timeout<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let millis = rng.gen_range(self.election_timeout_min..self.election_timeout_max);
        Duration::from_millis(millis)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}
