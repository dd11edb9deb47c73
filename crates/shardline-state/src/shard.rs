use serde::{Deserialize, Serialize};
use shardline_core::{NodeId, ShardId};

/// A unit of placement. Its transaction count drives split decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContract {
    pub id: String,
    pub shard_id: Option<ShardId>,
    pub transaction_count: i64,
}

impl SmartContract {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shard_id: None,
            transaction_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub shard_id: Option<ShardId>,
    /// Voting power; carried for placement reports, not weighted in tallies
    pub power: u32,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, power: u32) -> Self {
        Self {
            id: id.into(),
            shard_id: None,
            power,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub contracts: Vec<SmartContract>,
    pub nodes: Vec<Node>,
    pub capacity: usize,
    /// Transactions logged against the shard's contracts
    pub load: i64,
}

impl Shard {
    pub fn new(id: ShardId, capacity: usize) -> Self {
        Self {
            id,
            contracts: Vec::new(),
            nodes: Vec::new(),
            capacity,
            load: 0,
        }
    }

    pub fn has_room(&self) -> bool {
        self.contracts.len() < self.capacity
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|node| node.id == *id)
    }

    pub fn contains_contract(&self, id: &str) -> bool {
        self.contracts.iter().any(|contract| contract.id == id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }

    pub(crate) fn push_contract(&mut self, mut contract: SmartContract) {
        contract.shard_id = Some(self.id);
        self.load += contract.transaction_count;
        self.contracts.push(contract);
    }

    pub(crate) fn push_node(&mut self, mut node: Node) {
        node.shard_id = Some(self.id);
        self.nodes.push(node);
    }
}
