use shardline_core::NodeId;
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Picks the proof with the most votes.
///
/// Ties go to the lexicographically smallest proof, so every node that saw
/// the same ballots picks the same winner.
pub fn tally_votes(votes: &BTreeMap<NodeId, String>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for proof in votes.values() {
        *counts.entry(proof.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(proof, count)| (*count, Reverse(*proof)))
        .map(|(proof, _)| proof.to_string())
}
