use crate::ids::ShardId;
use crate::transaction::Transaction;
use parking_lot::Mutex;

/// Sink for finalized transaction batches, in commit order per shard.
pub trait Pipeline: Send + Sync {
    fn deliver(&self, shard_id: ShardId, transactions: Vec<Transaction>);
}

impl<F> Pipeline for F
where
    F: Fn(ShardId, Vec<Transaction>) + Send + Sync,
{
    fn deliver(&self, shard_id: ShardId, transactions: Vec<Transaction>) {
        self(shard_id, transactions)
    }
}

/// Pipeline that keeps every delivered batch in memory.
#[derive(Debug, Default)]
pub struct CollectingPipeline {
    batches: Mutex<Vec<(ShardId, Vec<Transaction>)>>,
}

impl CollectingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<(ShardId, Vec<Transaction>)> {
        self.batches.lock().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, batch)| batch.iter().cloned())
            .collect()
    }
}

impl Pipeline for CollectingPipeline {
    fn deliver(&self, shard_id: ShardId, transactions: Vec<Transaction>) {
        log::debug!(
            "Pipeline received {} transactions from shard {}",
            transactions.len(),
            shard_id
        );
        self.batches.lock().push((shard_id, transactions));
    }
}
