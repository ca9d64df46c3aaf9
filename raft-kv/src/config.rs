use std::time::Duration;

use anyhow::{Result, ensure};
use rand::Rng;

/// Timing knobs for the consensus module.
///
/// Defaults follow the Raft paper: elections fire after a random
/// 150-300ms of silence, leaders heartbeat every 50ms.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Deadline for a single outbound peer RPC.
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(300),
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.election_timeout_min <= self.election_timeout_max,
            "election timeout min {:?} exceeds max {:?}",
            self.election_timeout_min,
            self.election_timeout_max
        );
        ensure!(
            self.heartbeat_interval < self.election_timeout_min,
            "heartbeat interval {:?} must be shorter than the election timeout {:?}",
            self.heartbeat_interval,
            self.election_timeout_min
        );
        ensure!(!self.rpc_timeout.is_zero(), "rpc timeout must be non-zero");
        Ok(())
    }

    /// Draws a fresh election timeout from the configured range.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}
