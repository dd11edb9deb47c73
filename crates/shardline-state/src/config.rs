use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShardingConfig {
    /// Contracts a shard accepts before a new shard is opened
    pub shard_capacity: usize,

    /// A shard holding more contracts than this is split in two
    pub split_threshold: usize,

    /// The two newest shards merge once they hold this many contracts or fewer
    pub merge_threshold: usize,

    pub rebalance_interval_secs: u64,
}

impl ShardingConfig {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs.max(1))
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_capacity: 16,
            split_threshold: 10,
            merge_threshold: 4,
            rebalance_interval_secs: 5,
        }
    }
}
