//! Shard id to chain registry owned by the node.

use crate::chain::Chain;
use crate::config::ChainConfig;
use log::{info, warn};
use parking_lot::RwLock;
use shardline_core::{NodeId, Pipeline, ShardId, Signer, Transaction};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ChainRegistry {
    local_id: NodeId,
    config: ChainConfig,
    signer: Arc<dyn Signer>,
    chains: RwLock<HashMap<ShardId, Arc<Chain>>>,
    pipeline: RwLock<Option<Arc<dyn Pipeline>>>,
}

impl ChainRegistry {
    pub fn new(local_id: NodeId, config: ChainConfig, signer: Arc<dyn Signer>) -> Self {
        Self {
            local_id,
            config,
            signer,
            chains: RwLock::new(HashMap::new()),
            pipeline: RwLock::new(None),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Returns the chain for `shard_id`, creating it if needed. New chains
    /// inherit the registered pipeline but are not started.
    pub fn create(&self, shard_id: ShardId) -> Arc<Chain> {
        let mut chains = self.chains.write();
        if let Some(chain) = chains.get(&shard_id) {
            return Arc::clone(chain);
        }
        let chain = Chain::new(
            shard_id,
            self.local_id.clone(),
            self.config.clone(),
            Arc::clone(&self.signer),
        );
        if let Some(pipeline) = self.pipeline.read().clone() {
            chain.register_pipeline(pipeline);
        }
        chains.insert(shard_id, Arc::clone(&chain));
        info!("[ChainRegistry] created chain for shard {}", shard_id);
        chain
    }

    pub fn get(&self, shard_id: ShardId) -> Option<Arc<Chain>> {
        self.chains.read().get(&shard_id).cloned()
    }

    /// Unregisters a chain and shuts it down.
    pub fn remove(&self, shard_id: ShardId) -> Option<Arc<Chain>> {
        let chain = self.chains.write().remove(&shard_id)?;
        chain.shutdown();
        Some(chain)
    }

    /// Chains whose tasks are running, ordered by shard id.
    pub fn running(&self) -> Vec<Arc<Chain>> {
        let mut running: Vec<Arc<Chain>> = self
            .chains
            .read()
            .values()
            .filter(|chain| chain.is_running())
            .cloned()
            .collect();
        running.sort_by_key(|chain| chain.shard_id());
        running
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.chains.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.chains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.read().is_empty()
    }

    /// Registers the pipeline with every current and future chain.
    pub fn register_pipeline(&self, pipeline: Arc<dyn Pipeline>) {
        *self.pipeline.write() = Some(Arc::clone(&pipeline));
        for chain in self.chains.read().values() {
            chain.register_pipeline(Arc::clone(&pipeline));
        }
    }

    /// Delivers transactions straight to the pipeline, bypassing consensus.
    pub fn forward_to_pipeline(&self, shard_id: ShardId, transactions: Vec<Transaction>) {
        if transactions.is_empty() {
            return;
        }
        match self.pipeline.read().clone() {
            Some(pipeline) => pipeline.deliver(shard_id, transactions),
            None => warn!(
                "[ChainRegistry] no pipeline registered, dropping {} transactions of shard {}",
                transactions.len(),
                shard_id
            ),
        }
    }

    pub fn shutdown_all(&self) {
        let chains: Vec<Arc<Chain>> = self.chains.write().drain().map(|(_, chain)| chain).collect();
        for chain in chains {
            chain.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::{CollectingPipeline, Ed25519Signer};

    fn registry() -> ChainRegistry {
        let local = NodeId::from("a");
        let signer = Arc::new(Ed25519Signer::from_node_id(&local));
        ChainRegistry::new(local, ChainConfig::default(), signer)
    }

    #[test]
    fn test_create_is_get_or_create() {
        let registry = registry();
        let first = registry.create(ShardId(1));
        let second = registry.create(ShardId(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.shard_ids(), vec![ShardId(1)]);
    }

    #[test]
    fn test_remove_shuts_the_chain_down() {
        let registry = registry();
        registry.create(ShardId(2));
        let removed = registry.remove(ShardId(2)).unwrap();
        assert!(removed.is_shut_down());
        assert!(registry.get(ShardId(2)).is_none());
        assert!(registry.remove(ShardId(2)).is_none());
    }

    #[test]
    fn test_forward_reaches_registered_pipeline() {
        let registry = registry();
        let pipeline = Arc::new(CollectingPipeline::new());
        registry.register_pipeline(pipeline.clone());
        registry.forward_to_pipeline(ShardId(3), vec![Transaction::new("response", vec![1])]);
        registry.forward_to_pipeline(ShardId(3), Vec::new());
        assert_eq!(pipeline.batch_count(), 1);
    }
}
