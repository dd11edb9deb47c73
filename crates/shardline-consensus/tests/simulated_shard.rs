//! Drives several `ChainState`s over an in-memory network.
//!
//! Links normally deliver in order like the acknowledged sockets they stand
//! in for, but a test may also deliver any queued packet ahead of the ones
//! before it. The order in which links and election workers get to run is up
//! to each test.

use proptest::prelude::*;
use shardline_consensus::{ChainError, ChainState, Outbound, RoundPhase, Step};
use shardline_core::{Ed25519Signer, Event, NodeId, ShardId, Transaction};
use shardline_p2p::Packet;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

struct Member {
    state: ChainState,
    signer: Ed25519Signer,
    committed: Vec<Event>,
    woken: bool,
}

enum Action {
    Deliver(NodeId, NodeId),
    /// Delivers the packet at a queue position, overtaking the ones ahead.
    DeliverAt(NodeId, NodeId, usize),
    Elect(NodeId),
}

struct Network {
    members: BTreeMap<NodeId, Member>,
    links: BTreeMap<(NodeId, NodeId), VecDeque<Packet>>,
    errors: Vec<ChainError>,
    clock: u64,
    sealed: usize,
}

impl Network {
    fn new(names: &[&str]) -> Self {
        let ids: Vec<NodeId> = names.iter().map(|name| NodeId::from(*name)).collect();
        let mut members = BTreeMap::new();
        for id in &ids {
            let mut state = ChainState::new(id.clone(), ShardId(0));
            state.set_members(ids.iter().cloned());
            members.insert(
                id.clone(),
                Member {
                    state,
                    signer: Ed25519Signer::from_node_id(id),
                    committed: Vec::new(),
                    woken: false,
                },
            );
        }
        Network {
            members,
            links: BTreeMap::new(),
            errors: Vec::new(),
            clock: 1_000,
            sealed: 0,
        }
    }

    fn ids(&self) -> Vec<NodeId> {
        self.members.keys().cloned().collect()
    }

    fn member(&self, name: &str) -> &Member {
        &self.members[&NodeId::from(name)]
    }

    fn apply(&mut self, node: &NodeId, step: Step) {
        let peers: Vec<NodeId> = self.members[node].state.peers().iter().cloned().collect();
        for outbound in step.outbound {
            match outbound {
                Outbound::Broadcast(packet) => {
                    for peer in &peers {
                        self.links
                            .entry((node.clone(), peer.clone()))
                            .or_default()
                            .push_back(packet.clone());
                    }
                }
                Outbound::SendTo(to, packet) => {
                    self.links.entry((node.clone(), to)).or_default().push_back(packet);
                }
            }
        }
        let member = self.members.get_mut(node).unwrap();
        member.committed.extend(step.committed);
        member.woken |= step.wake_election;
    }

    fn submit_and_seal(&mut self, name: &str, payload: &[u8]) {
        let node = NodeId::from(name);
        self.clock += 1;
        let now = self.clock;
        let member = self.members.get_mut(&node).unwrap();
        member.state.submit(Transaction::new("x", payload.to_vec()));
        let step = member.state.seal_event(now, &member.signer).unwrap();
        self.sealed += 1;
        self.apply(&node, step);
    }

    fn retransmit(&mut self, node: &NodeId) {
        let member = self.members.get_mut(node).unwrap();
        let step = member.state.retransmit(&member.signer).unwrap();
        self.apply(node, step);
    }

    fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .links
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|((from, to), _)| Action::Deliver(from.clone(), to.clone()))
            .collect();
        actions.extend(
            self.members
                .iter()
                .filter(|(_, member)| member.woken)
                .map(|(id, _)| Action::Elect(id.clone())),
        );
        actions
    }

    /// The first runnable action: links in order, then woken workers.
    fn oldest_first(&self) -> Option<Action> {
        self.actions().into_iter().next()
    }

    /// Woken workers first, then the newest packet of the first busy link.
    fn newest_first(&self) -> Option<Action> {
        if let Some((id, _)) = self.members.iter().find(|(_, member)| member.woken) {
            return Some(Action::Elect(id.clone()));
        }
        self.links
            .iter()
            .find(|(_, queue)| !queue.is_empty())
            .map(|((from, to), queue)| Action::DeliverAt(from.clone(), to.clone(), queue.len() - 1))
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::Deliver(from, to) => self.deliver(from, to, 0),
            Action::DeliverAt(from, to, position) => self.deliver(from, to, position),
            Action::Elect(node) => {
                let member = self.members.get_mut(&node).unwrap();
                member.woken = false;
                let step = member.state.run_election();
                self.apply(&node, step);
            }
        }
    }

    fn deliver(&mut self, from: NodeId, to: NodeId, position: usize) {
        let Some(packet) = self
            .links
            .get_mut(&(from.clone(), to.clone()))
            .and_then(|queue| queue.remove(position))
        else {
            return;
        };
        let member = self.members.get_mut(&to).unwrap();
        match member.state.on_packet(from, packet, &member.signer) {
            Ok(step) => self.apply(&to, step),
            Err(e) => self.errors.push(e),
        }
    }

    /// Runs until no packet is queued and no worker is woken.
    fn run_to_quiescence(&mut self) {
        self.run_with(Network::oldest_first);
    }

    fn run_with(&mut self, pick: fn(&Network) -> Option<Action>) {
        for _ in 0..100_000 {
            match pick(self) {
                Some(action) => self.perform(action),
                None => return,
            }
        }
        panic!("network did not quiesce");
    }

    fn settle(&mut self) {
        self.settle_with(Network::oldest_first);
    }

    /// Runs to quiescence, resending stalled packets until every store is
    /// empty or ten resend rounds went by.
    fn settle_with(&mut self, pick: fn(&Network) -> Option<Action>) {
        for _ in 0..10 {
            self.run_with(pick);
            if self.members.values().all(|m| m.state.store().is_empty()) {
                return;
            }
            for id in self.ids() {
                self.retransmit(&id);
            }
        }
    }

    fn committed_proofs(&self, name: &str) -> Vec<String> {
        self.member(name)
            .committed
            .iter()
            .map(|event| event.proof.clone())
            .collect()
    }
}

#[test]
fn test_every_member_commits_every_event_in_the_same_order() {
    let mut net = Network::new(&["a", "b", "c"]);
    net.submit_and_seal("a", b"1");
    net.submit_and_seal("b", b"2");
    net.submit_and_seal("c", b"3");
    net.submit_and_seal("a", b"4");
    net.run_to_quiescence();

    assert!(net.errors.is_empty(), "{:?}", net.errors);
    let order = net.committed_proofs("a");
    assert_eq!(order.len(), 4);
    assert_eq!(net.committed_proofs("b"), order);
    assert_eq!(net.committed_proofs("c"), order);
    for id in net.ids() {
        let member = &net.members[&id];
        assert_eq!(member.state.phase(), RoundPhase::Idle);
        assert!(member.state.store().is_consistent());
        assert!(!member.state.election_in_progress());
        assert_eq!(member.state.rounds_completed(), 4);
    }
}

#[test]
fn test_three_peer_submit_reaches_everyone() {
    let mut net = Network::new(&["a", "b", "c"]);
    net.submit_and_seal("a", b"payload");
    net.run_to_quiescence();

    for name in ["a", "b", "c"] {
        let committed = &net.member(name).committed;
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].origin, NodeId::from("a"));
        assert_eq!(committed[0].transactions, vec![Transaction::new("x", b"payload".to_vec())]);
    }
}

#[test]
fn test_concurrent_proposers_agree() {
    let mut net = Network::new(&["a", "b"]);
    net.submit_and_seal("a", b"from-a");
    net.submit_and_seal("b", b"from-b");
    net.run_to_quiescence();

    let order = net.committed_proofs("a");
    assert_eq!(order.len(), 2);
    assert_eq!(net.committed_proofs("b"), order);
    let unique: BTreeSet<&String> = order.iter().collect();
    assert_eq!(unique.len(), 2);
}

#[test]
fn test_redelivered_acks_votes_and_readies_are_harmless() {
    let mut net = Network::new(&["a", "b", "c"]);
    let (a, b, c) = (NodeId::from("a"), NodeId::from("b"), NodeId::from("c"));
    net.submit_and_seal("a", b"1");

    // Proposals reach b and c, each acks twice.
    net.perform(Action::Deliver(a.clone(), b.clone()));
    net.perform(Action::Deliver(a.clone(), c.clone()));
    let ack = Packet::Ack { proof: "1001-a".into() };
    for from in [&b, &b, &c, &c] {
        let member = net.members.get_mut(&a).unwrap();
        let step = member.state.on_packet(from.clone(), ack.clone(), &member.signer).unwrap();
        net.apply(&a, step);
    }
    let finalizes = net
        .links
        .get(&(a.clone(), b.clone()))
        .map(|queue| queue.iter().filter(|p| matches!(p, Packet::Finalize { .. })).count())
        .unwrap_or(0);
    assert_eq!(finalizes, 1);

    // Drop the acks b and c queued on their own; a already has them.
    net.links.remove(&(b.clone(), a.clone()));
    net.links.remove(&(c.clone(), a.clone()));
    net.run_to_quiescence();
    assert_eq!(net.committed_proofs("a"), vec!["1001-a".to_string()]);

    // A second event: vote twice from b and ready twice from b before c.
    net.submit_and_seal("a", b"2");
    let proof = "1002-a".to_string();
    while net.member("a").state.phase() != RoundPhase::Voting {
        let mut actions: Vec<Action> = net
            .actions()
            .into_iter()
            .filter(|action| !matches!(action, Action::Deliver(from, _) if *from != a))
            .collect();
        if actions.is_empty() {
            actions = net.actions();
        }
        let action = actions.swap_remove(0);
        net.perform(action);
    }

    let vote = Packet::Vote {
        round: 1,
        signature: vec![7; 64],
        proof: proof.clone(),
    };
    let member = net.members.get_mut(&a).unwrap();
    member.state.on_packet(b.clone(), vote.clone(), &member.signer).unwrap();
    member.state.on_packet(b.clone(), vote, &member.signer).unwrap();
    assert_eq!(member.state.next_event_votes().len(), 2);
    assert!(member.state.chosen_proof().is_none());

    let ready = Packet::ElectorReady { round: 1 };
    member.state.on_packet(b.clone(), ready.clone(), &member.signer).unwrap();
    member.state.on_packet(b.clone(), ready, &member.signer).unwrap();
    assert_eq!(member.state.ready_electors().len(), 1);
    assert_eq!(member.state.rounds_completed(), 1);
}

#[test]
fn test_newest_first_links_still_commit_every_event() {
    let mut net = Network::new(&["a", "b", "c"]);
    net.submit_and_seal("a", b"1");
    net.submit_and_seal("b", b"2");
    net.settle_with(Network::newest_first);

    assert!(net.errors.is_empty(), "{:?}", net.errors);
    let order = net.committed_proofs("a");
    assert_eq!(order.len(), 2);
    assert_eq!(net.committed_proofs("b"), order);
    assert_eq!(net.committed_proofs("c"), order);
    for id in net.ids() {
        assert_eq!(net.members[&id].state.rounds_completed(), 2);
    }
}

#[test]
fn test_next_round_vote_may_overtake_elector_ready() {
    let mut net = Network::new(&["a", "b", "c"]);
    let (a, c) = (NodeId::from("a"), NodeId::from("c"));
    net.submit_and_seal("a", b"1");
    net.submit_and_seal("b", b"2");

    // Run normally, except that c's link to a stops at c's first
    // elector-ready: c finishes round 0 and votes in round 1 while a still
    // waits for that elector-ready.
    let link = (c.clone(), a.clone());
    for _ in 0..100_000 {
        let stalled = matches!(
            net.links.get(&link).and_then(|queue| queue.front()),
            Some(Packet::ElectorReady { .. })
        );
        let action = net.actions().into_iter().find(|action| {
            !(stalled && matches!(action, Action::Deliver(from, to) if *from == c && *to == a))
        });
        match action {
            Some(action) => net.perform(action),
            None => break,
        }
    }
    assert_eq!(net.member("a").state.phase(), RoundPhase::AwaitingElectorReady);
    assert_eq!(net.member("c").state.rounds_completed(), 1);
    let held: Vec<Packet> = net.links[&link].iter().cloned().collect();
    let vote_at = held
        .iter()
        .position(|packet| matches!(packet, Packet::Vote { round: 1, .. }))
        .expect("c voted in round 1");
    assert!(held[..vote_at]
        .iter()
        .any(|packet| matches!(packet, Packet::ElectorReady { round: 0 })));

    // c's round-1 vote reaches a ahead of c's round-0 elector-ready.
    net.perform(Action::DeliverAt(c.clone(), a.clone(), vote_at));
    net.run_to_quiescence();

    assert!(net.errors.is_empty(), "{:?}", net.errors);
    let order = net.committed_proofs("a");
    assert_eq!(order.len(), 2);
    assert_eq!(net.committed_proofs("b"), order);
    assert_eq!(net.committed_proofs("c"), order);
}

#[test]
fn test_resent_proposal_after_commit_is_only_reacked() {
    let mut net = Network::new(&["a", "b"]);
    net.submit_and_seal("a", b"1");
    let propose = net.links[&(NodeId::from("a"), NodeId::from("b"))][0].clone();
    net.run_to_quiescence();
    assert_eq!(net.member("b").committed.len(), 1);

    let b = NodeId::from("b");
    let member = net.members.get_mut(&b).unwrap();
    let step = member
        .state
        .on_packet(NodeId::from("a"), propose, &member.signer)
        .unwrap();
    assert!(matches!(step.outbound.as_slice(), [Outbound::SendTo(_, Packet::Ack { .. })]));
    assert!(member.state.store().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the interleaving of links, workers and resends, and even when
    /// packets overtake each other within a link, members never commit
    /// different events at the same position, nothing commits twice, and
    /// resending eventually commits every sealed event.
    #[test]
    fn test_safety_under_arbitrary_interleavings(
        size in 2usize..5,
        submissions in proptest::collection::vec((0usize..4, any::<u8>()), 1..8),
        schedule in proptest::collection::vec(
            (any::<proptest::sample::Index>(), 0u8..20, any::<proptest::sample::Index>()),
            0..600,
        ),
    ) {
        let names = ["a", "b", "c", "d"];
        let mut net = Network::new(&names[..size]);
        let ids = net.ids();
        let mut submissions: VecDeque<(usize, u8)> = submissions.into();

        if let Some((who, byte)) = submissions.pop_front() {
            net.submit_and_seal(names[who % size], &[byte]);
        }
        for (pick, kind, position) in schedule {
            match kind {
                0 => net.retransmit(pick.get(&ids)),
                1 | 2 => {
                    if let Some((who, byte)) = submissions.pop_front() {
                        net.submit_and_seal(names[who % size], &[byte]);
                    }
                }
                3..=6 => {
                    let busy: Vec<(NodeId, NodeId, usize)> = net
                        .links
                        .iter()
                        .filter(|(_, queue)| !queue.is_empty())
                        .map(|((from, to), queue)| (from.clone(), to.clone(), queue.len()))
                        .collect();
                    if !busy.is_empty() {
                        let (from, to, len) = pick.get(&busy).clone();
                        net.perform(Action::DeliverAt(from, to, position.index(len)));
                    }
                }
                _ => {
                    let mut actions = net.actions();
                    if !actions.is_empty() {
                        let index = pick.index(actions.len());
                        let action = actions.swap_remove(index);
                        net.perform(action);
                    }
                }
            }
        }
        while let Some((who, byte)) = submissions.pop_front() {
            net.submit_and_seal(names[who % size], &[byte]);
        }
        net.settle();

        let reference = net.committed_proofs(names[0]);
        let unique: BTreeSet<&String> = reference.iter().collect();
        prop_assert_eq!(unique.len(), reference.len());
        prop_assert_eq!(reference.len(), net.sealed);
        for name in &names[..size] {
            prop_assert_eq!(&net.committed_proofs(name), &reference);
            let member = net.member(name);
            prop_assert!(member.state.store().is_consistent());
            prop_assert!(member.state.store().is_empty());
        }
        prop_assert!(
            net.errors.is_empty(),
            "unexpected protocol errors: {:?}",
            net.errors
        );
    }
}
