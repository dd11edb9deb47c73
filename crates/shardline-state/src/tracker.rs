//! Pipeline that keeps the shard table in step with committed transactions
//! before handing them to the application.

use crate::shard_manager::ShardManager;
use log::debug;
use parking_lot::RwLock;
use shardline_core::{Pipeline, ShardId, Transaction};
use std::sync::{Arc, Weak};

pub struct ShardTracker {
    shards: Weak<ShardManager>,
    downstream: RwLock<Option<Arc<dyn Pipeline>>>,
}

impl ShardTracker {
    /// The tracker only holds a weak reference: the manager owns the chains
    /// that deliver into it.
    pub fn new(shards: &Arc<ShardManager>) -> Self {
        Self {
            shards: Arc::downgrade(shards),
            downstream: RwLock::new(None),
        }
    }

    /// Where application transactions go after the table saw them.
    pub fn set_downstream(&self, pipeline: Arc<dyn Pipeline>) {
        *self.downstream.write() = Some(pipeline);
    }
}

impl Pipeline for ShardTracker {
    fn deliver(&self, shard_id: ShardId, transactions: Vec<Transaction>) {
        if let Some(shards) = self.shards.upgrade() {
            for trx in &transactions {
                shards.apply_committed(shard_id, trx);
            }
        }

        let application: Vec<Transaction> = transactions
            .into_iter()
            .filter(|trx| !trx.is_contract_assignment())
            .collect();
        if application.is_empty() {
            return;
        }
        match self.downstream.read().clone() {
            Some(pipeline) => pipeline.deliver(shard_id, application),
            None => debug!(
                "[ShardTracker] no downstream pipeline, dropping {} transactions of shard {}",
                application.len(),
                shard_id
            ),
        }
    }
}

impl std::fmt::Debug for ShardTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardTracker")
            .field("downstream", &self.downstream.read().is_some())
            .finish()
    }
}
