// Pending-event store of one chain.
//
// SAFETY INVARIANTS:
// 1. Every proof in `pending` has exactly one entry in `proof_events` and
//    vice versa
// 2. `pending` holds proofs in local arrival order; the oldest is elected first
// 3. A proof is stored at most once

use shardline_core::Event;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Default, Clone)]
pub struct EventStore {
    proof_events: HashMap<String, Event>,
    pending: VecDeque<String>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an event at the back of the queue. Returns `false` if the proof
    /// is already known, in which case nothing changes.
    pub fn insert(&mut self, event: Event) -> bool {
        if self.proof_events.contains_key(&event.proof) {
            return false;
        }
        self.pending.push_back(event.proof.clone());
        self.proof_events.insert(event.proof.clone(), event);
        true
    }

    pub fn get(&self, proof: &str) -> Option<&Event> {
        self.proof_events.get(proof)
    }

    pub fn get_mut(&mut self, proof: &str) -> Option<&mut Event> {
        self.proof_events.get_mut(proof)
    }

    pub fn contains(&self, proof: &str) -> bool {
        self.proof_events.contains_key(proof)
    }

    /// Removes an event from both the map and the queue.
    pub fn remove(&mut self, proof: &str) -> Option<Event> {
        let event = self.proof_events.remove(proof)?;
        self.pending.retain(|p| p != proof);
        Some(event)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending events in queue order.
    pub fn pending_events(&self) -> Vec<Event> {
        self.pending
            .iter()
            .filter_map(|proof| self.proof_events.get(proof).cloned())
            .collect()
    }

    pub fn pending_proofs(&self) -> impl Iterator<Item = &String> {
        self.pending.iter()
    }

    /// Empties the store, returning its events in queue order.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.pending.len());
        for proof in self.pending.drain(..) {
            if let Some(event) = self.proof_events.remove(&proof) {
                events.push(event);
            }
        }
        self.proof_events.clear();
        events
    }

    /// Reorders the queue to match `events`, then keeps every local event the
    /// list did not mention at the back in its previous order.
    ///
    /// Locally known events keep their local state (acks, signatures). Returns
    /// the proofs that were not known before.
    pub fn replace_with(&mut self, events: Vec<Event>) -> Vec<String> {
        let mut order = VecDeque::with_capacity(events.len() + self.pending.len());
        let mut seen = HashSet::new();
        let mut added = Vec::new();

        for event in events {
            if !seen.insert(event.proof.clone()) {
                continue;
            }
            order.push_back(event.proof.clone());
            if !self.proof_events.contains_key(&event.proof) {
                added.push(event.proof.clone());
                self.proof_events.insert(event.proof.clone(), event);
            }
        }
        for proof in self.pending.drain(..) {
            if seen.insert(proof.clone()) {
                order.push_back(proof);
            }
        }
        self.pending = order;
        added
    }

    /// Appends, in the given order, every event whose proof is not yet known.
    /// The existing queue order is untouched.
    pub fn append(&mut self, events: Vec<Event>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|event| {
                let proof = event.proof.clone();
                self.insert(event).then_some(proof)
            })
            .collect()
    }

    pub fn is_consistent(&self) -> bool {
        self.pending.len() == self.proof_events.len()
            && self.pending.iter().all(|proof| self.proof_events.contains_key(proof))
    }
}

/// Stable merge of two pending queues by event timestamp.
///
/// Each input keeps its own relative order; on equal timestamps the left
/// queue goes first. A proof present in both queues appears once, at its
/// first position.
pub fn merge_by_timestamp(left: Vec<Event>, right: Vec<Event>) -> Vec<Event> {
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut seen = HashSet::new();
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => l.timestamp <= r.timestamp,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        if let Some(event) = next {
            if seen.insert(event.proof.clone()) {
                merged.push(event);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::{NodeId, Transaction};

    fn event(origin: &str, timestamp: u64) -> Event {
        Event::new(
            NodeId::from(origin),
            timestamp,
            vec![Transaction::new("x", vec![timestamp as u8])],
        )
    }

    fn proofs(events: &[Event]) -> Vec<String> {
        events.iter().map(|e| e.proof.clone()).collect()
    }

    #[test]
    fn test_insert_is_idempotent_and_fifo() {
        let mut store = EventStore::new();
        assert!(store.insert(event("a", 2)));
        assert!(store.insert(event("b", 1)));
        assert!(!store.insert(event("a", 2)));
        assert_eq!(store.len(), 2);
        assert_eq!(store.pending_proofs().next().map(String::as_str), Some("2-a"));
        assert!(store.is_consistent());
    }

    #[test]
    fn test_remove_keeps_map_and_queue_in_sync() {
        let mut store = EventStore::new();
        store.insert(event("a", 1));
        store.insert(event("a", 2));
        store.insert(event("a", 3));
        assert_eq!(store.remove("2-a").unwrap().timestamp, 2);
        assert!(store.remove("2-a").is_none());
        assert_eq!(proofs(&store.pending_events()), vec!["1-a", "3-a"]);
        assert!(store.is_consistent());
    }

    #[test]
    fn test_replace_with_keeps_unmentioned_local_events() {
        let mut store = EventStore::new();
        let mut local = event("a", 1);
        local.record_ack(NodeId::from("b"));
        store.insert(local);
        store.insert(event("a", 5));

        let added = store.replace_with(vec![event("c", 3), event("a", 1)]);
        assert_eq!(added, vec!["3-c".to_string()]);
        assert_eq!(proofs(&store.pending_events()), vec!["3-c", "1-a", "5-a"]);
        assert_eq!(store.get("1-a").unwrap().backed_responses.len(), 1);
        assert!(store.is_consistent());
    }

    #[test]
    fn test_append_skips_known_proofs() {
        let mut store = EventStore::new();
        store.insert(event("a", 1));
        let added = store.append(vec![event("b", 0), event("a", 1), event("b", 0)]);
        assert_eq!(added, vec!["0-b".to_string()]);
        assert_eq!(proofs(&store.pending_events()), vec!["1-a", "0-b"]);
    }

    #[test]
    fn test_merge_by_timestamp_is_stable() {
        let left = vec![event("a", 1), event("a", 4), event("a", 4)];
        let right = vec![event("b", 2), event("b", 4), event("b", 3)];
        let merged = merge_by_timestamp(left, right);
        assert_eq!(proofs(&merged), vec!["1-a", "2-b", "4-a", "4-b", "3-b"]);
    }

    #[test]
    fn test_drain_empties_the_store() {
        let mut store = EventStore::new();
        store.insert(event("a", 1));
        store.insert(event("b", 1));
        assert_eq!(proofs(&store.drain()), vec!["1-a", "1-b"]);
        assert!(store.is_empty());
        assert!(store.pending_proofs().next().is_none());
    }
}
