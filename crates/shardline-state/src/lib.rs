// === Model ===
pub mod shard;

// === Configuration & errors ===
pub mod config;
pub mod error;

// === Placement, split and merge ===
pub mod shard_manager;
pub mod tracker;

pub use config::ShardingConfig;
pub use error::ShardingError;
pub use shard::{Node, Shard, SmartContract};
pub use shard_manager::{MergeReport, ShardManager, SplitReport};
pub use tracker::ShardTracker;
