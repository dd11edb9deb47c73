//! Chain runtime: one consensus instance per shard.
//!
//! Wraps a [`ChainState`] with the shard's sockets and runs three tasks:
//! the tick loop sealing events, the election worker, and the delivery loop
//! feeding committed events to the pipeline.

use crate::config::ChainConfig;
use crate::error::ChainError;
use crate::state::{ChainState, Outbound, RoundPhase, Step};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use shardline_core::{Event, NodeId, Pipeline, ShardId, Signer, Transaction};
use shardline_p2p::{run_reader, FrameCodec, Packet, PacketHandler, PeerSocket, SocketReader};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

struct ChainInner {
    state: ChainState,
    sockets: HashMap<NodeId, Arc<PeerSocket>>,
}

/// Point-in-time view of a chain, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub shard_id: ShardId,
    pub phase: RoundPhase,
    pub peers: Vec<NodeId>,
    pub connected: Vec<NodeId>,
    pub pending_events: usize,
    pub pending_trxs: usize,
    pub pending_elections: usize,
    pub rounds_completed: u64,
    pub running: bool,
}

pub struct Chain {
    shard_id: ShardId,
    local_id: NodeId,
    config: ChainConfig,
    signer: Arc<dyn Signer>,
    inner: Mutex<ChainInner>,
    election_wake: Notify,
    committed_tx: mpsc::UnboundedSender<Event>,
    committed_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    pipeline: RwLock<Option<Arc<dyn Pipeline>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Chain {
    pub fn new(shard_id: ShardId, local_id: NodeId, config: ChainConfig, signer: Arc<dyn Signer>) -> Arc<Self> {
        let (committed_tx, committed_rx) = mpsc::unbounded_channel();
        Arc::new(Chain {
            shard_id,
            local_id: local_id.clone(),
            config,
            signer,
            inner: Mutex::new(ChainInner {
                state: ChainState::new(local_id, shard_id),
                sockets: HashMap::new(),
            }),
            election_wake: Notify::new(),
            committed_tx,
            committed_rx: Mutex::new(Some(committed_rx)),
            pipeline: RwLock::new(None),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.config.max_frame_len)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ============ Lifecycle ============

    /// Starts the tick loop, the election worker and the delivery loop.
    /// Calling it again is a no-op.
    pub fn run(self: &Arc<Self>) {
        if self.is_shut_down() || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(committed_rx) = self.committed_rx.lock().take() else {
            return;
        };
        info!("[Chain {}] starting on {}", self.shard_id, self.local_id);

        let handles = vec![
            tokio::spawn(Arc::clone(self).tick_loop()),
            tokio::spawn(Arc::clone(self).election_loop()),
            tokio::spawn(Arc::clone(self).delivery_loop(committed_rx)),
        ];
        self.tasks.lock().extend(handles);
    }

    /// Stops every task of the chain and closes its sockets.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.running.store(false, Ordering::SeqCst);
        let sockets: Vec<Arc<PeerSocket>> = self.inner.lock().sockets.drain().map(|(_, s)| s).collect();
        for socket in sockets {
            socket.close();
        }
        self.tasks.lock().clear();
        info!("[Chain {}] shut down", self.shard_id);
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = now_millis();
                    let signer = Arc::clone(&self.signer);
                    self.transition("seal", |state| state.seal_event(now, signer.as_ref()));
                }
            }
        }
    }

    async fn election_loop(self: Arc<Self>) {
        let round_timeout = self.config.round_timeout();
        loop {
            let woke = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                woke = tokio::time::timeout(round_timeout, self.election_wake.notified()) => woke.is_ok(),
            };
            if woke {
                self.transition("election", |state| Ok(state.run_election()));
            } else {
                let signer = Arc::clone(&self.signer);
                self.transition("retransmit", |state| state.retransmit(signer.as_ref()));
            }
        }
    }

    async fn delivery_loop(self: Arc<Self>, mut committed: mpsc::UnboundedReceiver<Event>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = committed.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.deliver(event);
        }
    }

    fn deliver(&self, event: Event) {
        let pipeline = self.pipeline.read().clone();
        match pipeline {
            Some(pipeline) => {
                debug!(
                    "[Chain {}] delivering {} ({} transactions)",
                    self.shard_id,
                    event.proof,
                    event.transactions.len()
                );
                pipeline.deliver(self.shard_id, event.transactions);
            }
            None => warn!(
                "[Chain {}] no pipeline registered, dropping committed event {}",
                self.shard_id, event.proof
            ),
        }
    }

    /// Runs one state transition and applies its effects.
    ///
    /// Outbound packets and committed events are queued while the chain
    /// lock is still held, so per-socket order and commit order both follow
    /// state order. Neither queue waits on the network.
    fn transition<F>(&self, what: &str, f: F)
    where
        F: FnOnce(&mut ChainState) -> Result<Step, ChainError>,
    {
        let wake_election = {
            let mut inner = self.inner.lock();
            let step = match f(&mut inner.state) {
                Ok(step) => step,
                Err(e) => {
                    warn!("[Chain {}] {} rejected: {}", self.shard_id, what, e);
                    return;
                }
            };
            for outbound in &step.outbound {
                dispatch(self.shard_id, &inner.sockets, outbound);
            }
            for event in step.committed {
                if self.committed_tx.send(event).is_err() {
                    warn!("[Chain {}] committed queue closed", self.shard_id);
                }
            }
            step.wake_election
        };

        if wake_election {
            self.election_wake.notify_one();
        }
    }

    // ============ Caller-facing API ============

    /// Queues a transaction for the next event. Never blocks.
    pub fn submit_trx(&self, kind: impl Into<String>, payload: Vec<u8>) {
        self.submit(Transaction::new(kind, payload));
    }

    pub fn submit(&self, transaction: Transaction) {
        self.inner.lock().state.submit(transaction);
    }

    pub fn register_pipeline(&self, pipeline: Arc<dyn Pipeline>) {
        *self.pipeline.write() = Some(pipeline);
    }

    /// Other members of the shard.
    pub fn peers(&self) -> Vec<NodeId> {
        self.inner.lock().state.peers().iter().cloned().collect()
    }

    /// Every member of the shard, the local node included.
    pub fn members(&self) -> BTreeSet<NodeId> {
        let inner = self.inner.lock();
        let mut members = inner.state.peers().clone();
        members.insert(self.local_id.clone());
        members
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.inner.lock().state.is_member(id)
    }

    /// Replaces the member set; sockets of departed members are closed.
    pub fn set_members<I>(&self, members: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        let members: BTreeSet<NodeId> = members.into_iter().collect();
        let dropped: Vec<Arc<PeerSocket>> = {
            let mut inner = self.inner.lock();
            let gone: Vec<NodeId> = inner
                .sockets
                .keys()
                .filter(|id| !members.contains(*id))
                .cloned()
                .collect();
            gone.iter().filter_map(|id| inner.sockets.remove(id)).collect()
        };
        for socket in dropped {
            socket.close();
        }
        self.transition("membership", |state| Ok(state.set_members(members)));
    }

    pub fn has_socket(&self, id: &NodeId) -> bool {
        self.inner.lock().sockets.contains_key(id)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut connected: Vec<NodeId> = self.inner.lock().sockets.keys().cloned().collect();
        connected.sort();
        connected
    }

    /// Binds a connected socket to this chain and starts its reader.
    /// An older socket for the same member is replaced.
    pub fn attach_socket(self: &Arc<Self>, socket: Arc<PeerSocket>, reader: SocketReader) -> Result<(), ChainError> {
        if self.is_shut_down() {
            socket.close();
            return Err(ChainError::ShutDown(self.shard_id));
        }
        let replaced = {
            let mut inner = self.inner.lock();
            if !inner.state.peers().contains(socket.id()) {
                socket.close();
                return Err(ChainError::UnknownPeer(socket.id().clone()));
            }
            let replaced = inner.sockets.insert(socket.id().clone(), Arc::clone(&socket));
            let sync = inner.state.take_sync_for(socket.id());
            if !sync.is_empty() {
                info!("[Chain {}] sending current queue to new member {}", self.shard_id, socket.id());
            }
            for packet in &sync {
                if let Err(e) = socket.send_packet(packet) {
                    warn!("[Chain {}] cannot encode {} for {}: {}", self.shard_id, packet.name(), socket.id(), e);
                }
            }
            replaced
        };
        if let Some(old) = replaced {
            old.close();
        }
        debug!("[Chain {}] attached socket to {}", self.shard_id, socket.id());

        let handler: Arc<dyn PacketHandler> = Arc::clone(self) as Arc<dyn PacketHandler>;
        tokio::spawn(run_reader(socket, reader, handler));
        Ok(())
    }

    /// Interleaves a dissolved chain's events with this chain's queue.
    pub fn try_merge(&self, events: Vec<Event>) {
        let signer = Arc::clone(&self.signer);
        info!("[Chain {}] merging {} events", self.shard_id, events.len());
        self.transition("merge", |state| Ok(state.merge_events(events, signer.as_ref())));
    }

    pub fn absorb_transactions(&self, transactions: Vec<Transaction>) {
        if transactions.is_empty() {
            return;
        }
        self.inner.lock().state.absorb_transactions(transactions);
    }

    /// Sends transactions to the lowest-id connected member as a single
    /// `0xA2` packet. Returns them back if no member is connected.
    pub fn hand_off_transactions(&self, transactions: Vec<Transaction>) -> Result<(), Vec<Transaction>> {
        let target = {
            let inner = self.inner.lock();
            inner
                .sockets
                .iter()
                .min_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, socket)| Arc::clone(socket))
        };
        let Some(socket) = target else {
            return Err(transactions);
        };
        let packet = Packet::AppendTransactions { transactions };
        if let Err(e) = socket.send_packet(&packet) {
            warn!("[Chain {}] failed to hand off transactions: {}", self.shard_id, e);
            if let Packet::AppendTransactions { transactions } = packet {
                return Err(transactions);
            }
        }
        Ok(())
    }

    pub fn take_leftovers(&self) -> Vec<Transaction> {
        self.inner.lock().state.take_leftovers()
    }

    pub fn take_own_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().state.take_own_transactions()
    }

    pub fn take_responses(&self) -> Vec<Transaction> {
        self.inner.lock().state.take_responses()
    }

    pub fn take_pending_events(&self) -> Vec<Event> {
        self.inner.lock().state.take_pending_events()
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        let inner = self.inner.lock();
        let mut connected: Vec<NodeId> = inner.sockets.keys().cloned().collect();
        connected.sort();
        ChainSnapshot {
            shard_id: self.shard_id,
            phase: inner.state.phase(),
            peers: inner.state.peers().iter().cloned().collect(),
            connected,
            pending_events: inner.state.store().len(),
            pending_trxs: inner.state.pending_trxs().len(),
            pending_elections: inner.state.pending_elections(),
            rounds_completed: inner.state.rounds_completed(),
            running: self.is_running(),
        }
    }
}

impl PacketHandler for Chain {
    fn handle_packet(&self, from: NodeId, packet: Packet) {
        let name = packet.name();
        let signer = Arc::clone(&self.signer);
        let sender = from.clone();
        debug!("[Chain {}] {} from {}", self.shard_id, name, from);
        self.transition(name, move |state| state.on_packet(sender, packet, signer.as_ref()));
    }

    fn connection_closed(&self, socket: &Arc<PeerSocket>) {
        let mut inner = self.inner.lock();
        let same = inner
            .sockets
            .get(socket.id())
            .map_or(false, |current| Arc::ptr_eq(current, socket));
        if same {
            inner.sockets.remove(socket.id());
            info!("[Chain {}] lost connection to {}", self.shard_id, socket.id());
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("shard_id", &self.shard_id)
            .field("local_id", &self.local_id)
            .field("running", &self.is_running())
            .finish()
    }
}

fn dispatch(shard_id: ShardId, sockets: &HashMap<NodeId, Arc<PeerSocket>>, outbound: &Outbound) {
    match outbound {
        Outbound::Broadcast(packet) => {
            let frame = match packet.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[Chain {}] cannot encode {}: {}", shard_id, packet.name(), e);
                    return;
                }
            };
            for socket in sockets.values() {
                socket.send(frame.clone());
            }
        }
        Outbound::SendTo(to, packet) => match sockets.get(to) {
            Some(socket) => {
                if let Err(e) = socket.send_packet(packet) {
                    warn!("[Chain {}] cannot encode {}: {}", shard_id, packet.name(), e);
                }
            }
            None => debug!("[Chain {}] no socket to {}, dropping {}", shard_id, to, packet.name()),
        },
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
