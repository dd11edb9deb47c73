use shardline_core::{NodeId, ShardId};
use thiserror::Error;

/// Reasons a packet or command is rejected by a chain.
///
/// None of these are fatal: the packet is logged and dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Event origin does not match the socket it arrived on
    #[error("event {proof} claims origin {claimed} but arrived from {sender}")]
    OriginMismatch {
        proof: String,
        claimed: NodeId,
        sender: NodeId,
    },

    /// Referenced proof is not in the local store
    #[error("unknown proof {0}")]
    UnknownProof(String),

    /// Sender is not a member of this shard
    #[error("{0} is not a member of this shard")]
    UnknownPeer(NodeId),

    /// Packet has no meaning for a chain (handshake or transport-level)
    #[error("unexpected {0} packet")]
    UnexpectedPacket(&'static str),

    #[error("failed to encode packet: {0}")]
    Encode(String),

    /// The chain was removed from its registry
    #[error("chain for shard {0} is shut down")]
    ShutDown(ShardId),
}
