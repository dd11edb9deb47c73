// === Node configuration ===
pub mod config;

// === Node runtime ===
pub mod node;

pub use config::{NodeConfig, NodeConfigError, PeerConfig};
pub use node::{LoggingPipeline, Node, DISCOVERY_INTERVAL};

pub use shardline_consensus as consensus;
pub use shardline_core as core;
pub use shardline_p2p as p2p;
pub use shardline_state as state;
