use shardline_core::ShardId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardingError {
    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    #[error("contract {contract} not found in shard {shard}")]
    ContractNotFound { shard: ShardId, contract: String },

    #[error("contract {contract} is already assigned to shard {shard}")]
    ContractAlreadyAssigned { contract: String, shard: ShardId },

    #[error("a merge needs two shards, {0} exist")]
    NotEnoughShards(usize),
}
