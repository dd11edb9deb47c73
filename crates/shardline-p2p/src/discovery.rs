//! Static peer directory and the dial rule.
//!
//! Exactly one side of every pair dials: the node with the smaller id dials
//! the node with the greater id. Each dial is tracked per `(shard, peer)` so
//! the sweep never opens two connections for the same chain.

use parking_lot::Mutex;
use shardline_core::{NodeId, ShardId};
use std::collections::{HashMap, HashSet};

/// Whether `local` is the side that opens the connection to `peer`.
pub fn should_dial(local: &NodeId, peer: &NodeId) -> bool {
    peer > local
}

/// Members of a chain that `local` must dial and is not yet connected to.
pub fn dial_targets<'a, I, F>(local: &NodeId, members: I, is_connected: F) -> Vec<NodeId>
where
    I: IntoIterator<Item = &'a NodeId>,
    F: Fn(&NodeId) -> bool,
{
    members
        .into_iter()
        .filter(|peer| should_dial(local, *peer) && !is_connected(*peer))
        .cloned()
        .collect()
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    addresses: HashMap<NodeId, String>,
    dialing: Mutex<HashSet<(ShardId, NodeId)>>,
}

impl PeerDirectory {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, String)>,
    {
        Self {
            addresses: entries.into_iter().collect(),
            dialing: Mutex::new(HashSet::new()),
        }
    }

    pub fn address_of(&self, id: &NodeId) -> Option<&str> {
        self.addresses.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Claims a dial slot. Returns `false` if a dial is already running.
    pub fn begin_dial(&self, shard_id: ShardId, peer: &NodeId) -> bool {
        self.dialing.lock().insert((shard_id, peer.clone()))
    }

    pub fn finish_dial(&self, shard_id: ShardId, peer: &NodeId) {
        self.dialing.lock().remove(&(shard_id, peer.clone()));
    }
}
