// Consensus state machine of one shard chain.
//
// ChainState owns no sockets and spawns nothing: every input returns a `Step`
// describing the packets to send, the events committed and whether the
// election worker must wake. The `Chain` runtime applies steps under its lock.
//
// SAFETY INVARIANTS:
// 1. `chosen_proof` is Some only between a tally and barrier completion
// 2. At most one election round is active: `current_vote` is set by the
//    worker and cleared by the barrier
// 3. A proof is committed at most once; committed proofs are remembered in
//    `finalized` so late packets for them are ignored
// 4. Only proofs every member acknowledged (`announced`) are voted for, so a
//    ballot never names an event a peer does not hold
// 5. A vote or elector-ready counts only in the round it names; earlier
//    rounds are dropped and later ones held until the barrier lets us in

use crate::error::ChainError;
use crate::event_store::{merge_by_timestamp, EventStore};
use crate::tally::tally_votes;
use log::{debug, error, info, warn};
use lru::LruCache;
use shardline_core::{Event, NodeId, ShardId, Signer, Transaction};
use shardline_p2p::Packet;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::num::NonZeroUsize;

/// Number of committed proofs remembered for deduplication.
const FINALIZED_CACHE_SIZE: usize = 4096;

/// A packet the runtime must put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// To every connected member
    Broadcast(Packet),
    /// To one member
    SendTo(NodeId, Packet),
}

/// Effects of one state transition.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<Outbound>,
    /// Events to push to the committed queue, in commit order
    pub committed: Vec<Event>,
    /// Whether the election worker must run
    pub wake_election: bool,
}

impl Step {
    fn broadcast(&mut self, packet: Packet) {
        self.outbound.push(Outbound::Broadcast(packet));
    }

    fn send_to(&mut self, to: NodeId, packet: Packet) {
        self.outbound.push(Outbound::SendTo(to, packet));
    }

    pub fn absorb(&mut self, other: Step) {
        self.outbound.extend(other.outbound);
        self.committed.extend(other.committed);
        self.wake_election |= other.wake_election;
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.committed.is_empty() && !self.wake_election
    }
}

/// Where the current round stands, as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Idle,
    /// Holding peers' proposals that are not finalized yet
    AwaitingAck,
    /// Own proposal waiting for every member's ack
    AwaitingQuorumAck,
    /// Local vote cast, tally pending
    Voting,
    /// Winner committed, waiting for every member's elector-ready
    AwaitingElectorReady,
}

/// A vote that arrived before its round or its proposal.
#[derive(Debug, Clone)]
struct HeldVote {
    round: u64,
    signature: Vec<u8>,
    proof: String,
}

pub struct ChainState {
    local_id: NodeId,
    shard_id: ShardId,
    peers: BTreeSet<NodeId>,
    store: EventStore,
    chosen_proof: Option<String>,
    current_vote: Option<String>,
    election_in_progress: bool,
    ready_electors: BTreeSet<NodeId>,
    next_event_votes: BTreeMap<NodeId, String>,
    held_votes: BTreeMap<NodeId, HeldVote>,
    announced: HashSet<String>,
    late_joiners: BTreeSet<NodeId>,
    /// Members added after events started flowing; they sit out the round
    /// in progress when they were added
    joined_mid_round: BTreeSet<NodeId>,
    finalized: LruCache<String, ()>,
    pending_trxs: Vec<Transaction>,
    last_millis: u64,
    rounds_completed: u64,
}

impl ChainState {
    pub fn new(local_id: NodeId, shard_id: ShardId) -> Self {
        let capacity = NonZeroUsize::new(FINALIZED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_id,
            shard_id,
            peers: BTreeSet::new(),
            store: EventStore::new(),
            chosen_proof: None,
            current_vote: None,
            election_in_progress: false,
            ready_electors: BTreeSet::new(),
            next_event_votes: BTreeMap::new(),
            held_votes: BTreeMap::new(),
            announced: HashSet::new(),
            late_joiners: BTreeSet::new(),
            joined_mid_round: BTreeSet::new(),
            finalized: LruCache::new(capacity),
            pending_trxs: Vec::new(),
            last_millis: 0,
            rounds_completed: 0,
        }
    }

    // ============ Membership ============

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Other members of the shard.
    pub fn peers(&self) -> &BTreeSet<NodeId> {
        &self.peers
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        *id == self.local_id || self.peers.contains(id)
    }

    pub fn add_peer(&mut self, id: NodeId) -> bool {
        if id == self.local_id {
            return false;
        }
        self.peers.insert(id)
    }

    /// Drops a member and re-evaluates every quorum it was holding up.
    pub fn remove_peer(&mut self, id: &NodeId) -> Step {
        if !self.peers.remove(id) {
            return Step::default();
        }
        self.next_event_votes.remove(id);
        self.held_votes.remove(id);
        self.ready_electors.remove(id);
        self.late_joiners.remove(id);
        self.joined_mid_round.remove(id);
        self.reevaluate()
    }

    /// Replaces the member set. `members` may include the local node.
    pub fn set_members<I>(&mut self, members: I) -> Step
    where
        I: IntoIterator<Item = NodeId>,
    {
        let wanted: BTreeSet<NodeId> = members
            .into_iter()
            .filter(|id| *id != self.local_id)
            .collect();
        let removed: Vec<NodeId> = self.peers.difference(&wanted).cloned().collect();
        let has_history = self.rounds_completed > 0 || !self.store.is_empty();
        for id in wanted {
            if self.peers.insert(id.clone()) && has_history {
                self.late_joiners.insert(id.clone());
                self.joined_mid_round.insert(id);
            }
        }
        let mut step = Step::default();
        for id in removed {
            step.absorb(self.remove_peer(&id));
        }
        step
    }

    /// Packets that bring a member who joined after events started flowing
    /// up to date, handed out once on its first connection: the announced
    /// queue with the first round the joiner votes in, then our ballot if
    /// that round is already being voted on.
    pub fn take_sync_for(&mut self, peer: &NodeId) -> Vec<Packet> {
        if !self.late_joiners.remove(peer) {
            return Vec::new();
        }
        let sits_out = self.joined_mid_round.contains(peer);
        let round = self.rounds_completed + u64::from(sits_out);
        let events = self
            .queue_for_wire()
            .into_iter()
            .filter(|event| self.announced.contains(&event.proof))
            .collect();
        let mut packets = vec![Packet::OverwriteEvents { round, events }];
        if !sits_out && self.chosen_proof.is_none() {
            if let Some(event) = self.current_vote.as_ref().and_then(|proof| self.store.get(proof)) {
                packets.push(Packet::Vote {
                    round,
                    signature: event.signed_update.clone(),
                    proof: event.proof.clone(),
                });
            }
        }
        packets
    }

    /// Pending events minus the one already chosen this round.
    fn queue_for_wire(&self) -> Vec<Event> {
        self.store
            .pending_events()
            .into_iter()
            .filter(|event| self.chosen_proof.as_deref() != Some(event.proof.as_str()))
            .map(wire_copy)
            .collect()
    }

    /// Members whose vote and elector-ready the current round needs.
    fn electors(&self) -> impl Iterator<Item = &NodeId> {
        self.peers
            .iter()
            .filter(move |peer| !self.joined_mid_round.contains(*peer))
    }

    fn is_elector(&self, id: &NodeId) -> bool {
        *id == self.local_id || (self.peers.contains(id) && !self.joined_mid_round.contains(id))
    }

    fn reevaluate(&mut self) -> Step {
        let mut step = Step::default();
        let own: Vec<String> = self
            .store
            .pending_events()
            .into_iter()
            .filter(|event| event.origin == self.local_id)
            .map(|event| event.proof)
            .collect();
        for proof in own {
            self.check_ack_quorum(&proof, &mut step);
        }
        self.try_tally(&mut step);
        self.try_complete_barrier(&mut step);
        step
    }

    // ============ Event production ============

    /// Queues a transaction for the next sealed event.
    pub fn submit(&mut self, transaction: Transaction) {
        self.pending_trxs.push(transaction);
    }

    /// Strictly increasing millisecond clock, so two events sealed within
    /// one millisecond still get distinct proofs.
    fn next_millis(&mut self, now_millis: u64) -> u64 {
        self.last_millis = now_millis.max(self.last_millis + 1);
        self.last_millis
    }

    /// Drains the unbatched transactions into a new event and proposes it.
    pub fn seal_event(&mut self, now_millis: u64, signer: &dyn Signer) -> Result<Step, ChainError> {
        let mut step = Step::default();
        if self.pending_trxs.is_empty() {
            return Ok(step);
        }

        let timestamp = self.next_millis(now_millis);
        let transactions = std::mem::take(&mut self.pending_trxs);
        let mut event = Event::new(self.local_id.clone(), timestamp, transactions);
        let propose = propose_packet(&event, signer)?;
        event.signed_update = signer.sign(event.proof.as_bytes());
        let proof = event.proof.clone();

        debug!(
            "[Chain {}] sealed event {} with {} transactions",
            self.shard_id,
            proof,
            event.transactions.len()
        );
        self.store.insert(event);
        if !self.peers.is_empty() {
            step.broadcast(propose);
        }
        self.check_ack_quorum(&proof, &mut step);
        Ok(step)
    }

    // ============ Packet handling ============

    pub fn on_packet(&mut self, from: NodeId, packet: Packet, signer: &dyn Signer) -> Result<Step, ChainError> {
        if !self.peers.contains(&from) {
            return Err(ChainError::UnknownPeer(from));
        }
        match packet {
            Packet::Propose { event, .. } => self.on_propose(from, event, signer),
            Packet::Ack { proof } => self.on_ack(from, proof),
            Packet::Finalize { proof } => self.on_finalize(proof),
            Packet::Vote {
                round,
                signature,
                proof,
            } => self.on_vote(from, round, signature, proof),
            Packet::ElectorReady { round } => Ok(self.on_elector_ready(from, round)),
            Packet::OverwriteEvents { round, events } => Ok(self.overwrite_events(round, events, signer)),
            Packet::AppendTransactions { transactions } => {
                info!(
                    "[Chain {}] absorbing {} transactions handed over by {}",
                    self.shard_id,
                    transactions.len(),
                    from
                );
                self.absorb_transactions(transactions);
                Ok(Step::default())
            }
            other @ (Packet::Hello { .. } | Packet::Received) => Err(ChainError::UnexpectedPacket(other.name())),
        }
    }

    fn on_propose(&mut self, from: NodeId, mut event: Event, signer: &dyn Signer) -> Result<Step, ChainError> {
        if event.origin != from {
            return Err(ChainError::OriginMismatch {
                proof: event.proof,
                claimed: event.origin,
                sender: from,
            });
        }

        let proof = event.proof.clone();
        if self.finalized.contains(&proof) {
            debug!("[Chain {}] re-acking committed proposal {}", self.shard_id, proof);
        } else if !self.store.contains(&proof) {
            event.backed_responses.clear();
            event.backed_proofs.clear();
            event.signed_update = signer.sign(proof.as_bytes());
            self.store.insert(event);
        }

        let mut step = Step::default();
        step.send_to(from, Packet::Ack { proof });
        self.replay_held_votes(&mut step);
        Ok(step)
    }

    fn on_ack(&mut self, from: NodeId, proof: String) -> Result<Step, ChainError> {
        let mut step = Step::default();
        if self.finalized.contains(&proof) {
            return Ok(step);
        }
        let event = self
            .store
            .get_mut(&proof)
            .ok_or_else(|| ChainError::UnknownProof(proof.clone()))?;
        if event.origin != self.local_id {
            return Err(ChainError::UnexpectedPacket("ack"));
        }
        event.record_ack(from);
        self.check_ack_quorum(&proof, &mut step);
        Ok(step)
    }

    /// Broadcasts the finalize notice once every member holds our proposal.
    fn check_ack_quorum(&mut self, proof: &str, step: &mut Step) {
        let Some(event) = self.store.get(proof) else {
            return;
        };
        if event.origin != self.local_id || self.announced.contains(proof) {
            return;
        }
        if !self.peers.iter().all(|peer| event.backed_responses.contains(peer)) {
            return;
        }
        if !self.peers.is_empty() {
            step.broadcast(Packet::Finalize {
                proof: proof.to_string(),
            });
        }
        self.push_new_election(proof, step);
    }

    fn on_finalize(&mut self, proof: String) -> Result<Step, ChainError> {
        let mut step = Step::default();
        if self.finalized.contains(&proof) {
            return Ok(step);
        }
        if !self.store.contains(&proof) {
            return Err(ChainError::UnknownProof(proof));
        }
        self.push_new_election(&proof, &mut step);
        Ok(step)
    }

    /// Marks a proof as ready for election. Idempotent per proof.
    fn push_new_election(&mut self, proof: &str, step: &mut Step) {
        if !self.announced.insert(proof.to_string()) {
            return;
        }
        if !self.election_in_progress {
            self.election_in_progress = true;
            step.wake_election = true;
        }
    }

    fn on_vote(&mut self, from: NodeId, round: u64, signature: Vec<u8>, proof: String) -> Result<Step, ChainError> {
        let mut step = Step::default();
        self.record_vote(
            from,
            HeldVote {
                round,
                signature,
                proof,
            },
            &mut step,
        );
        Ok(step)
    }

    fn record_vote(&mut self, from: NodeId, vote: HeldVote, step: &mut Step) {
        if self.finalized.contains(&vote.proof) {
            debug!("[Chain {}] ignoring vote for committed proof {}", self.shard_id, vote.proof);
            return;
        }
        if vote.round < self.rounds_completed {
            debug!(
                "[Chain {}] ignoring vote from {} for past round {}",
                self.shard_id, from, vote.round
            );
            return;
        }
        if vote.round > self.rounds_completed || !self.store.contains(&vote.proof) {
            // Either we are still closing the previous round, or the proposal
            // travels on another link and has not arrived yet.
            debug!(
                "[Chain {}] holding round {} vote from {} for {}",
                self.shard_id, vote.round, from, vote.proof
            );
            self.hold_vote(from, vote);
            return;
        }
        if self.chosen_proof.is_some() {
            debug!("[Chain {}] ignoring repeated vote from {}", self.shard_id, from);
            return;
        }
        if !self.is_elector(&from) {
            debug!("[Chain {}] {} sits out round {}", self.shard_id, from, vote.round);
            return;
        }
        let Some(event) = self.store.get_mut(&vote.proof) else {
            return;
        };
        event.record_backed_proof(from.clone(), &vote.signature);
        self.next_event_votes.insert(from, vote.proof);
        self.try_tally(step);
    }

    /// Keeps the newest-round vote per member.
    fn hold_vote(&mut self, from: NodeId, vote: HeldVote) {
        match self.held_votes.get(&from) {
            Some(held) if held.round > vote.round => {}
            _ => {
                self.held_votes.insert(from, vote);
            }
        }
    }

    /// Re-applies held votes that belong to the current round and whose
    /// proof has become known. Votes for past rounds are dropped.
    fn replay_held_votes(&mut self, step: &mut Step) {
        let round = self.rounds_completed;
        self.held_votes.retain(|_, vote| vote.round >= round);
        let ready: Vec<NodeId> = self
            .held_votes
            .iter()
            .filter(|(_, vote)| vote.round == round && self.store.contains(&vote.proof))
            .map(|(voter, _)| voter.clone())
            .collect();
        for voter in ready {
            if let Some(vote) = self.held_votes.remove(&voter) {
                self.record_vote(voter, vote, step);
            }
        }
    }

    fn on_elector_ready(&mut self, from: NodeId, round: u64) -> Step {
        let mut step = Step::default();
        if round != self.rounds_completed {
            debug!(
                "[Chain {}] ignoring elector-ready from {} for round {} (at {})",
                self.shard_id, from, round, self.rounds_completed
            );
            return step;
        }
        self.ready_electors.insert(from);
        self.try_complete_barrier(&mut step);
        step
    }

    // ============ Election ============

    /// Announced events still waiting for a round.
    pub fn pending_elections(&self) -> usize {
        self.store
            .pending_proofs()
            .filter(|proof| self.announced.contains(*proof))
            .count()
    }

    /// Casts the local vote for the oldest announced event, unless a round
    /// is already active.
    pub fn run_election(&mut self) -> Step {
        let mut step = Step::default();
        if self.current_vote.is_some() || self.chosen_proof.is_some() {
            return step;
        }
        let candidate = self
            .store
            .pending_proofs()
            .find(|proof| self.announced.contains(*proof))
            .cloned();
        let Some(proof) = candidate else {
            self.election_in_progress = false;
            return step;
        };

        self.election_in_progress = true;
        let local_id = self.local_id.clone();
        let signature = match self.store.get_mut(&proof) {
            Some(event) => {
                let signature = event.signed_update.clone();
                event.record_backed_proof(local_id.clone(), &signature);
                signature
            }
            None => return step,
        };
        debug!("[Chain {}] voting for {}", self.shard_id, proof);
        self.next_event_votes.insert(local_id, proof.clone());
        self.current_vote = Some(proof.clone());
        if !self.peers.is_empty() {
            step.broadcast(Packet::Vote {
                round: self.rounds_completed,
                signature,
                proof,
            });
        }
        self.try_tally(&mut step);
        step
    }

    fn try_tally(&mut self, step: &mut Step) {
        if self.chosen_proof.is_some() || self.current_vote.is_none() {
            return;
        }
        let everyone_voted = self.next_event_votes.contains_key(&self.local_id)
            && self.electors().all(|peer| self.next_event_votes.contains_key(peer));
        if !everyone_voted {
            return;
        }

        let ballots: BTreeMap<NodeId, String> = self
            .next_event_votes
            .iter()
            .filter(|(voter, _)| self.is_elector(voter))
            .map(|(voter, proof)| (voter.clone(), proof.clone()))
            .collect();
        self.next_event_votes.clear();
        let Some(winner) = tally_votes(&ballots) else {
            return;
        };

        match self.store.get(&winner) {
            Some(event) => step.committed.push(event.clone()),
            None => error!("[Chain {}] elected proof {} is not stored", self.shard_id, winner),
        }
        debug!("[Chain {}] elected {}", self.shard_id, winner);
        self.chosen_proof = Some(winner);
        if !self.peers.is_empty() {
            step.broadcast(Packet::ElectorReady {
                round: self.rounds_completed,
            });
        }
        self.try_complete_barrier(step);
    }

    fn try_complete_barrier(&mut self, step: &mut Step) {
        let Some(chosen) = self.chosen_proof.clone() else {
            return;
        };
        if !self.electors().all(|peer| self.ready_electors.contains(peer)) {
            return;
        }
        self.close_round(&chosen);
        self.rounds_completed += 1;
        self.replay_held_votes(step);
        self.schedule_election(step);
    }

    fn close_round(&mut self, chosen: &str) {
        self.store.remove(chosen);
        self.announced.remove(chosen);
        self.finalized.put(chosen.to_string(), ());
        self.chosen_proof = None;
        self.current_vote = None;
        self.ready_electors.clear();
        self.next_event_votes.clear();
        self.joined_mid_round.clear();
    }

    fn schedule_election(&mut self, step: &mut Step) {
        if self.current_vote.is_some() || self.chosen_proof.is_some() {
            return;
        }
        if self.pending_elections() > 0 {
            self.election_in_progress = true;
            step.wake_election = true;
        } else {
            self.election_in_progress = false;
        }
    }

    /// Jumps to a round the members already reached. A winner chosen
    /// locally but not yet released counts as committed.
    fn fast_forward(&mut self, round: u64) {
        if round <= self.rounds_completed {
            return;
        }
        info!(
            "[Chain {}] catching up from round {} to round {}",
            self.shard_id, self.rounds_completed, round
        );
        match self.chosen_proof.clone() {
            Some(chosen) => self.close_round(&chosen),
            None => {
                self.current_vote = None;
                self.ready_electors.clear();
                self.next_event_votes.clear();
                self.joined_mid_round.clear();
            }
        }
        self.rounds_completed = round;
        self.election_in_progress = false;
    }

    /// Packets to resend when a round made no progress for a while.
    ///
    /// Only idempotent packets are repeated: own proposals still missing
    /// acks, the local vote when no tally happened, and our elector-ready
    /// while the barrier is open. Each names its round, so a late copy is
    /// never mistaken for a newer one.
    pub fn retransmit(&mut self, signer: &dyn Signer) -> Result<Step, ChainError> {
        let mut step = Step::default();
        if self.peers.is_empty() {
            return Ok(step);
        }
        for event in self.store.pending_events() {
            if event.origin == self.local_id && !self.announced.contains(&event.proof) {
                step.broadcast(propose_packet(&event, signer)?);
            }
        }
        if self.chosen_proof.is_none() {
            if let Some(proof) = &self.current_vote {
                if let Some(event) = self.store.get(proof) {
                    step.broadcast(Packet::Vote {
                        round: self.rounds_completed,
                        signature: event.signed_update.clone(),
                        proof: proof.clone(),
                    });
                }
            }
        } else {
            step.broadcast(Packet::ElectorReady {
                round: self.rounds_completed,
            });
        }
        if !step.outbound.is_empty() {
            warn!(
                "[Chain {}] round stalled in {:?}, resending {} packets",
                self.shard_id,
                self.phase(),
                step.outbound.len()
            );
        }
        Ok(step)
    }

    // ============ Shard restructuring ============

    /// Interleaves another chain's pending events with ours by timestamp and
    /// tells the members about the new order.
    pub fn merge_events(&mut self, events: Vec<Event>, signer: &dyn Signer) -> Step {
        let merged = merge_by_timestamp(self.store.pending_events(), events);
        let mut step = self.adopt_events(merged, QueueUpdate::Reorder, signer);
        if !self.peers.is_empty() {
            step.broadcast(Packet::OverwriteEvents {
                round: self.rounds_completed,
                events: self.queue_for_wire(),
            });
        }
        step
    }

    /// Applies a queue received from a member. Events we do not hold yet are
    /// appended in the sender's order; our own order is left alone.
    pub fn overwrite_events(&mut self, round: u64, events: Vec<Event>, signer: &dyn Signer) -> Step {
        info!(
            "[Chain {}] applying queue of {} events for round {}",
            self.shard_id,
            events.len(),
            round
        );
        self.fast_forward(round);
        self.adopt_events(events, QueueUpdate::Append, signer)
    }

    fn adopt_events(&mut self, events: Vec<Event>, update: QueueUpdate, signer: &dyn Signer) -> Step {
        let events: Vec<Event> = events
            .into_iter()
            .filter(|event| !self.finalized.contains(&event.proof))
            .collect();
        let proofs: Vec<String> = events.iter().map(|event| event.proof.clone()).collect();

        let added = match update {
            QueueUpdate::Reorder => self.store.replace_with(events),
            QueueUpdate::Append => self.store.append(events),
        };
        for proof in added {
            if let Some(event) = self.store.get_mut(&proof) {
                event.backed_responses.clear();
                event.backed_proofs.clear();
                event.signed_update = signer.sign(proof.as_bytes());
            }
        }

        // Merged events were already exchanged in their original shard.
        let mut step = Step::default();
        for proof in proofs {
            self.push_new_election(&proof, &mut step);
        }
        self.replay_held_votes(&mut step);
        if !self.election_in_progress {
            self.schedule_election(&mut step);
        }
        step
    }

    /// Adds handed-over transactions to the next sealed event.
    pub fn absorb_transactions(&mut self, transactions: Vec<Transaction>) {
        self.pending_trxs.extend(transactions);
    }

    /// Unbatched transactions, emptied.
    pub fn take_leftovers(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.pending_trxs)
    }

    /// Every transaction this node is responsible for re-proposing: those of
    /// its own pending events plus the unbatched ones.
    pub fn take_own_transactions(&mut self) -> Vec<Transaction> {
        let own: Vec<String> = self
            .store
            .pending_events()
            .into_iter()
            .filter(|event| event.origin == self.local_id)
            .map(|event| event.proof)
            .collect();
        let mut transactions = Vec::new();
        for proof in own {
            if let Some(event) = self.store.remove(&proof) {
                self.announced.remove(&proof);
                transactions.extend(event.transactions);
            }
        }
        transactions.extend(self.take_leftovers());
        transactions
    }

    /// Removes `response` transactions from every pending event.
    pub fn take_responses(&mut self) -> Vec<Transaction> {
        let proofs: Vec<String> = self.store.pending_proofs().cloned().collect();
        let mut responses = Vec::new();
        for proof in proofs {
            if let Some(event) = self.store.get_mut(&proof) {
                responses.extend(event.strip_responses());
            }
        }
        responses
    }

    /// Empties the store, returning the pending events in queue order.
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        self.announced.clear();
        self.chosen_proof = None;
        self.current_vote = None;
        self.ready_electors.clear();
        self.next_event_votes.clear();
        self.held_votes.clear();
        self.joined_mid_round.clear();
        self.election_in_progress = false;
        self.store.drain().into_iter().map(wire_copy).collect()
    }

    // ============ Introspection ============

    pub fn phase(&self) -> RoundPhase {
        if self.chosen_proof.is_some() {
            RoundPhase::AwaitingElectorReady
        } else if self.current_vote.is_some() {
            RoundPhase::Voting
        } else if self
            .store
            .pending_events()
            .iter()
            .any(|event| event.origin == self.local_id && !self.announced.contains(&event.proof))
        {
            RoundPhase::AwaitingQuorumAck
        } else if !self.store.is_empty() {
            RoundPhase::AwaitingAck
        } else {
            RoundPhase::Idle
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn chosen_proof(&self) -> Option<&str> {
        self.chosen_proof.as_deref()
    }

    pub fn election_in_progress(&self) -> bool {
        self.election_in_progress
    }

    pub fn ready_electors(&self) -> &BTreeSet<NodeId> {
        &self.ready_electors
    }

    pub fn next_event_votes(&self) -> &BTreeMap<NodeId, String> {
        &self.next_event_votes
    }

    pub fn pending_trxs(&self) -> &[Transaction] {
        &self.pending_trxs
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }

    pub fn is_finalized(&self, proof: &str) -> bool {
        self.finalized.contains(proof)
    }
}

#[derive(Debug, Clone, Copy)]
enum QueueUpdate {
    /// Adopt the given order, keeping unmentioned local events at the back
    Reorder,
    /// Keep the local order, append unseen events
    Append,
}

/// Copy of an event without the fields that only mean something locally.
fn wire_copy(mut event: Event) -> Event {
    event.signed_update.clear();
    event.backed_responses.clear();
    event.backed_proofs.clear();
    event
}

fn propose_packet(event: &Event, signer: &dyn Signer) -> Result<Packet, ChainError> {
    let event = wire_copy(event.clone());
    let data = serde_json::to_vec(&event).map_err(|e| ChainError::Encode(e.to_string()))?;
    Ok(Packet::Propose {
        signature: signer.sign(&data),
        event,
    })
}
