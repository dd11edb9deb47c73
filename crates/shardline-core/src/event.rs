// Gossiped batch of transactions.
//
// SAFETY INVARIANTS:
// 1. `proof` is the identity of an event; it is never rewritten after creation
// 2. `backed_responses` and `backed_proofs` only ever grow while the event is pending
// 3. `signed_update` is node-local: every node overwrites it with its own
//    signature of the proof before voting

use crate::ids::NodeId;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Transactions batched into this event, in submission order
    pub transactions: Vec<Transaction>,

    /// Unique identifier of the event, `"{millis}-{origin}"`
    pub proof: String,

    /// Node that proposed the event
    pub origin: NodeId,

    /// Creation time in milliseconds, used to interleave queues on shard merge
    #[serde(default)]
    pub timestamp: u64,

    /// This node's signature over `proof`, broadcast with its vote
    #[serde(default)]
    pub signed_update: Vec<u8>,

    /// Peers that acknowledged the proposal
    #[serde(default)]
    pub backed_responses: BTreeSet<NodeId>,

    /// Hex-encoded vote signatures, by voter
    #[serde(default)]
    pub backed_proofs: BTreeMap<NodeId, String>,
}

impl Event {
    pub fn new(origin: NodeId, timestamp: u64, transactions: Vec<Transaction>) -> Self {
        let proof = Self::proof_for(timestamp, &origin);
        Event {
            transactions,
            proof,
            origin,
            timestamp,
            signed_update: Vec::new(),
            backed_responses: BTreeSet::new(),
            backed_proofs: BTreeMap::new(),
        }
    }

    /// Proofs are qualified by origin so two proposers never collide, even
    /// within the same millisecond.
    pub fn proof_for(timestamp: u64, origin: &NodeId) -> String {
        format!("{}-{}", timestamp, origin)
    }

    /// Records an acknowledgement. Returns `false` for a duplicate.
    pub fn record_ack(&mut self, from: NodeId) -> bool {
        self.backed_responses.insert(from)
    }

    pub fn record_backed_proof(&mut self, voter: NodeId, signature: &[u8]) {
        self.backed_proofs.insert(voter, hex::encode(signature));
    }

    /// Removes and returns every transaction of kind `response`.
    pub fn strip_responses(&mut self) -> Vec<Transaction> {
        let (responses, rest): (Vec<_>, Vec<_>) = self
            .transactions
            .drain(..)
            .partition(|trx| trx.is_response());
        self.transactions = rest;
        responses
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
