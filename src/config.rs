//! Node configuration.
//!
//! Layered with the `config` crate: serde defaults, then an optional TOML
//! file, then `SHARDLINE_*` environment variables (`__` separates nested
//! keys, e.g. `SHARDLINE_CHAIN__TICK_MS=50`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use shardline_consensus::ChainConfig;
use shardline_core::{Ed25519Signer, NodeId, SignerError};
use shardline_state::ShardingConfig;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("node_id must not be empty")]
    MissingNodeId,

    #[error("listen_addr must not be empty")]
    MissingListenAddr,

    #[error("peer entry {0} needs both an id and an address")]
    IncompletePeer(usize),

    #[error("peer {0} is listed more than once")]
    DuplicatePeer(NodeId),

    #[error("peer list contains the local node {0}")]
    LocalNodeInPeers(NodeId),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("merge_threshold ({merge}) must be below split_threshold ({split})")]
    Thresholds { merge: usize, split: usize },

    #[error("invalid signing seed: {0}")]
    Seed(#[from] SignerError),
}

/// A statically known member of the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: NodeId,
    pub address: String,
    #[serde(default = "default_power")]
    pub power: u32,
}

fn default_power() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_addr: String,
    pub power: u32,

    /// Hex-encoded 32-byte ed25519 seed. Derived from `node_id` when unset.
    pub signing_seed: Option<String>,

    /// Default tracing filter; `RUST_LOG` takes precedence
    pub log_filter: String,

    pub peers: Vec<PeerConfig>,
    pub chain: ChainConfig,
    pub sharding: ShardingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("node-0"),
            listen_addr: "127.0.0.1:7400".to_string(),
            power: default_power(),
            signing_seed: None,
            log_filter: "info".to_string(),
            peers: Vec::new(),
            chain: ChainConfig::default(),
            sharding: ShardingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reads and validates the configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: NodeConfig = builder
            .add_source(
                Environment::with_prefix("SHARDLINE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeConfigError> {
        if self.node_id.as_str().trim().is_empty() {
            return Err(NodeConfigError::MissingNodeId);
        }
        if self.listen_addr.trim().is_empty() {
            return Err(NodeConfigError::MissingListenAddr);
        }

        let mut seen = HashSet::new();
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.id.as_str().is_empty() || peer.address.is_empty() {
                return Err(NodeConfigError::IncompletePeer(index));
            }
            if peer.id == self.node_id {
                return Err(NodeConfigError::LocalNodeInPeers(peer.id.clone()));
            }
            if !seen.insert(&peer.id) {
                return Err(NodeConfigError::DuplicatePeer(peer.id.clone()));
            }
        }

        let positive = [
            ("chain.tick_ms", self.chain.tick_ms as usize),
            ("chain.round_timeout_ms", self.chain.round_timeout_ms as usize),
            ("chain.max_frame_len", self.chain.max_frame_len),
            ("sharding.shard_capacity", self.sharding.shard_capacity),
            ("sharding.rebalance_interval_secs", self.sharding.rebalance_interval_secs as usize),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(NodeConfigError::Zero(*name));
        }
        if self.sharding.merge_threshold >= self.sharding.split_threshold {
            return Err(NodeConfigError::Thresholds {
                merge: self.sharding.merge_threshold,
                split: self.sharding.split_threshold,
            });
        }

        if let Some(seed) = &self.signing_seed {
            Ed25519Signer::from_hex_seed(seed)?;
        }
        Ok(())
    }

    pub fn signer(&self) -> Result<Ed25519Signer, NodeConfigError> {
        match &self.signing_seed {
            Some(seed) => Ok(Ed25519Signer::from_hex_seed(seed)?),
            None => Ok(Ed25519Signer::from_node_id(&self.node_id)),
        }
    }

    /// `(id, address)` pairs for the peer directory.
    pub fn peer_addresses(&self) -> Vec<(NodeId, String)> {
        self.peers
            .iter()
            .map(|peer| (peer.id.clone(), peer.address.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn peer(id: &str) -> PeerConfig {
        PeerConfig {
            id: NodeId::from(id),
            address: "127.0.0.1:7401".to_string(),
            power: 1,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_peers() {
        let mut config = NodeConfig::default();
        config.peers = vec![peer("node-1"), peer("node-1")];
        assert!(matches!(config.validate(), Err(NodeConfigError::DuplicatePeer(_))));

        config.peers = vec![peer("node-0")];
        assert!(matches!(config.validate(), Err(NodeConfigError::LocalNodeInPeers(_))));

        config.peers = vec![PeerConfig {
            address: String::new(),
            ..peer("node-2")
        }];
        assert!(matches!(config.validate(), Err(NodeConfigError::IncompletePeer(0))));
    }

    #[test]
    fn test_validation_rejects_zero_and_inverted_thresholds() {
        let mut config = NodeConfig::default();
        config.chain.tick_ms = 0;
        assert!(matches!(config.validate(), Err(NodeConfigError::Zero("chain.tick_ms"))));

        let mut config = NodeConfig::default();
        config.sharding.merge_threshold = config.sharding.split_threshold;
        assert!(matches!(config.validate(), Err(NodeConfigError::Thresholds { .. })));
    }

    #[test]
    fn test_signing_seed() {
        let mut config = NodeConfig::default();
        config.signing_seed = Some("zz".to_string());
        assert!(matches!(config.validate(), Err(NodeConfigError::Seed(_))));

        config.signing_seed = Some("11".repeat(32));
        let seeded = config.signer().unwrap();
        assert_eq!(seeded.public_key_hex(), Ed25519Signer::from_seed([0x11; 32]).public_key_hex());

        config.signing_seed = None;
        let derived = config.signer().unwrap();
        assert_eq!(
            derived.public_key_hex(),
            Ed25519Signer::from_node_id(&config.node_id).public_key_hex()
        );
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!("shardline-config-{}.toml", std::process::id()));
        fs::write(
            &path,
            r#"
node_id = "node-a"
listen_addr = "127.0.0.1:9100"

[[peers]]
id = "node-b"
address = "127.0.0.1:9101"
power = 3

[chain]
tick_ms = 50

[sharding]
split_threshold = 20
"#,
        )
        .unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.node_id, NodeId::from("node-a"));
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].power, 3);
        assert_eq!(config.chain.tick_ms, 50);
        assert_eq!(config.chain.round_timeout_ms, ChainConfig::default().round_timeout_ms);
        assert_eq!(config.sharding.split_threshold, 20);
        assert_eq!(config.sharding.shard_capacity, ShardingConfig::default().shard_capacity);
    }
}
