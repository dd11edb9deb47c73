//! Node runtime: owns the chain registry and the shard manager, accepts
//! inbound sockets, dials peers and runs periodic rebalancing.

use crate::config::NodeConfig;
use anyhow::{anyhow, Context, Result};
use shardline_consensus::{Chain, ChainRegistry};
use shardline_core::{NodeId, Pipeline, ShardId, Transaction};
use shardline_p2p::{dial_targets, FrameCodec, PeerDirectory, PeerSocket, HANDSHAKE_TIMEOUT};
use shardline_state::{Node as ShardNode, ShardManager, ShardTracker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between peer discovery sweeps.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Pipeline that only logs finalized transactions.
#[derive(Debug, Default)]
pub struct LoggingPipeline;

impl Pipeline for LoggingPipeline {
    fn deliver(&self, shard_id: ShardId, transactions: Vec<Transaction>) {
        for trx in &transactions {
            info!(shard = %shard_id, kind = %trx.kind, bytes = trx.payload.len(), "transaction finalized");
        }
    }
}

pub struct Node {
    config: NodeConfig,
    local_id: NodeId,
    chains: Arc<ChainRegistry>,
    shards: Arc<ShardManager>,
    tracker: Arc<ShardTracker>,
    directory: PeerDirectory,
    codec: FrameCodec,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        config.validate().context("invalid node configuration")?;
        let signer = Arc::new(config.signer().context("failed to build signer")?);
        let local_id = config.node_id.clone();

        let chains = Arc::new(ChainRegistry::new(local_id.clone(), config.chain.clone(), signer));
        let shards = Arc::new(ShardManager::new(config.sharding.clone(), Arc::clone(&chains)));
        let tracker = Arc::new(ShardTracker::new(&shards));
        tracker.set_downstream(Arc::new(LoggingPipeline));
        chains.register_pipeline(Arc::clone(&tracker) as Arc<dyn Pipeline>);

        Ok(Arc::new(Self {
            directory: PeerDirectory::new(config.peer_addresses()),
            codec: FrameCodec::new(config.chain.max_frame_len),
            local_id,
            chains,
            shards,
            tracker,
            config,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chains(&self) -> &Arc<ChainRegistry> {
        &self.chains
    }

    pub fn shards(&self) -> &Arc<ShardManager> {
        &self.shards
    }

    /// Places the local node and every configured peer, in id order so all
    /// nodes build the same table. Returns the shards the local node joined.
    pub fn bootstrap(&self) -> Vec<ShardId> {
        let mut nodes: Vec<ShardNode> = self
            .config
            .peers
            .iter()
            .map(|peer| ShardNode::new(peer.id.clone(), peer.power))
            .collect();
        nodes.push(ShardNode::new(self.local_id.clone(), self.config.power));
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for node in nodes {
            self.shards.handle_new_node(node);
        }
        let joined = self.shards.local_shards();
        info!(node = %self.local_id, shards = ?joined, "bootstrap complete");
        joined
    }

    /// Binds the configured address and serves until interrupted.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        tokio::select! {
            result = Arc::clone(self).serve(listener) => result,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupt received, shutting down");
                self.shutdown();
                Ok(())
            }
        }
    }

    /// Accepts peers on `listener` and runs discovery and rebalancing until
    /// the node is shut down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().context("listener has no local address")?;
        info!(node = %self.local_id, addr = %local_addr, "listening for peers");

        tokio::spawn(Arc::clone(&self).discovery_loop());
        tokio::spawn(Arc::clone(&self).maintenance_loop());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(Arc::clone(&self).handle_inbound(stream, addr));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (shard_id, socket, reader) = match PeerSocket::accept(stream, self.codec).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(%addr, error = %e, "inbound handshake failed");
                return;
            }
        };
        let peer = socket.id().clone();
        let Some(chain) = self.chains.get(shard_id) else {
            warn!(%addr, %peer, shard = %shard_id, "no chain for shard, dropping connection");
            socket.close();
            return;
        };
        match chain.attach_socket(socket, reader) {
            Ok(()) => info!(%peer, shard = %shard_id, "accepted peer"),
            Err(e) => warn!(%peer, shard = %shard_id, error = %e, "refused inbound socket"),
        }
    }

    // ============ Discovery ============

    async fn discovery_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    /// Dials every member of a running chain that this node is responsible
    /// for connecting to and is not yet connected to.
    fn sweep(self: &Arc<Self>) {
        for chain in self.chains.running() {
            let shard_id = chain.shard_id();
            let members = chain.peers();
            for peer in dial_targets(&self.local_id, &members, |id| chain.has_socket(id)) {
                let Some(address) = self.directory.address_of(&peer).map(str::to_owned) else {
                    debug!(%peer, shard = %shard_id, "no address known for peer");
                    continue;
                };
                if !self.directory.begin_dial(shard_id, &peer) {
                    continue;
                }
                tokio::spawn(Arc::clone(self).dial(Arc::clone(&chain), peer, address));
            }
        }
    }

    async fn dial(self: Arc<Self>, chain: Arc<Chain>, peer: NodeId, address: String) {
        let shard_id = chain.shard_id();
        let dialed = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            PeerSocket::dial(address.as_str(), peer.clone(), self.local_id.clone(), shard_id, self.codec),
        )
        .await;
        match dialed {
            Ok(Ok((socket, reader))) => match chain.attach_socket(socket, reader) {
                Ok(()) => info!(%peer, %address, shard = %shard_id, "connected to peer"),
                Err(e) => warn!(%peer, shard = %shard_id, error = %e, "dialed socket refused"),
            },
            Ok(Err(e)) => debug!(%peer, %address, error = %e, "dial failed"),
            Err(_) => debug!(%peer, %address, "dial timed out"),
        }
        self.directory.finish_dial(shard_id, &peer);
    }

    // ============ Rebalancing ============

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sharding.rebalance_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => self.rebalance(),
            }
        }
    }

    fn rebalance(&self) {
        for report in self.shards.check_and_split_shards() {
            info!(original = %report.original, halves = ?report.halves, "shard split");
        }
        match self.shards.check_and_merge_shards() {
            Ok(Some(report)) => info!(
                survivor = %report.survivor,
                dissolved = %report.dissolved,
                contracts = report.contracts,
                nodes = report.nodes,
                "shards merged"
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "merge check failed"),
        }
        for chain in self.chains.running() {
            let snapshot = chain.snapshot();
            debug!(
                shard = %snapshot.shard_id,
                phase = ?snapshot.phase,
                connected = snapshot.connected.len(),
                pending_events = snapshot.pending_events,
                pending_trxs = snapshot.pending_trxs,
                rounds = snapshot.rounds_completed,
                "chain status"
            );
        }
    }

    // ============ Caller API ============

    /// Submits a transaction to a shard the local node belongs to.
    pub fn submit(&self, shard_id: ShardId, kind: impl Into<String>, payload: Vec<u8>) -> Result<()> {
        self.submit_transaction(shard_id, Transaction::new(kind, payload))
    }

    fn submit_transaction(&self, shard_id: ShardId, transaction: Transaction) -> Result<()> {
        let chain = self
            .chains
            .get(shard_id)
            .filter(|chain| chain.is_running())
            .ok_or_else(|| anyhow!("node {} is not a member of shard {}", self.local_id, shard_id))?;
        chain.submit(transaction);
        Ok(())
    }

    /// Submits a transaction addressed to a contract. Every member of the
    /// contract's shard counts it against the shard's load once it commits.
    /// Returns the shard it was routed to.
    pub fn submit_for_contract(&self, contract_id: &str, kind: impl Into<String>, payload: Vec<u8>) -> Result<ShardId> {
        let shard_id = self
            .shards
            .shard_of_contract(contract_id)
            .ok_or_else(|| anyhow!("contract {} is not assigned to any shard", contract_id))?;
        self.submit_transaction(shard_id, Transaction::for_contract(contract_id, kind, payload))?;
        Ok(shard_id)
    }

    /// Requests placement of a new contract. The request is committed
    /// through the local node's first shard and every member places the
    /// contract when it commits. Returns the shard carrying the request.
    pub fn deploy_contract(&self, contract_id: &str) -> Result<ShardId> {
        if let Some(shard_id) = self.shards.shard_of_contract(contract_id) {
            return Err(anyhow!("contract {} is already in shard {}", contract_id, shard_id));
        }
        let shard_id = self
            .shards
            .local_shards()
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("node {} is not a member of any shard", self.local_id))?;
        self.submit_transaction(shard_id, Transaction::assign_contract(contract_id))?;
        info!(contract = contract_id, shard = %shard_id, "contract placement requested");
        Ok(shard_id)
    }

    /// Sets the application pipeline. The shard table sees every committed
    /// transaction first.
    pub fn register_pipeline(&self, pipeline: Arc<dyn Pipeline>) {
        self.tracker.set_downstream(pipeline);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.chains.shutdown_all();
        info!(node = %self.local_id, "node stopped");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local_id", &self.local_id)
            .field("listen_addr", &self.config.listen_addr)
            .field("peers", &self.directory.len())
            .field("chains", &self.chains.len())
            .finish()
    }
}
