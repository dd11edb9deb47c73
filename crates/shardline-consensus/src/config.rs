use serde::{Deserialize, Serialize};
use shardline_p2p::DEFAULT_MAX_FRAME_LEN;
use std::time::Duration;

/// Timing and framing knobs shared by every chain of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChainConfig {
    /// Interval between event sealing attempts
    pub tick_ms: u64,

    /// How long an election may stall before idempotent packets are resent
    pub round_timeout_ms: u64,

    /// Largest frame accepted from a peer
    pub max_frame_len: usize,
}

impl ChainConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms.max(1))
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            round_timeout_ms: 5_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
