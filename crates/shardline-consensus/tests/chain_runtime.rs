use shardline_consensus::{Chain, ChainConfig, RoundPhase};
use shardline_core::{CollectingPipeline, Ed25519Signer, Event, NodeId, ShardId, Transaction};
use shardline_p2p::{FrameCodec, PeerSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const SHARD: ShardId = ShardId(0);

fn config() -> ChainConfig {
    ChainConfig {
        tick_ms: 20,
        round_timeout_ms: 500,
        ..ChainConfig::default()
    }
}

fn chain(name: &str) -> Arc<Chain> {
    let id = NodeId::from(name);
    let signer = Arc::new(Ed25519Signer::from_node_id(&id));
    Chain::new(SHARD, id, config(), signer)
}

/// Connects `dialer` to `acceptor` over loopback and attaches both ends.
async fn connect(dialer: &Arc<Chain>, acceptor: &Arc<Chain>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        PeerSocket::accept(stream, FrameCodec::default()).await.unwrap()
    });
    let (socket, reader) = PeerSocket::dial(
        addr,
        acceptor.local_id().clone(),
        dialer.local_id().clone(),
        SHARD,
        FrameCodec::default(),
    )
    .await
    .unwrap();
    let (shard_id, remote, remote_reader) = accept.await.unwrap();
    assert_eq!(shard_id, SHARD);
    dialer.attach_socket(socket, reader).unwrap();
    acceptor.attach_socket(remote, remote_reader).unwrap();
}

async fn shard_of_three() -> (Vec<Arc<Chain>>, Vec<Arc<CollectingPipeline>>) {
    let chains = vec![chain("a"), chain("b"), chain("c")];
    let members: Vec<NodeId> = chains.iter().map(|c| c.local_id().clone()).collect();
    let mut pipelines = Vec::new();
    for chain in &chains {
        chain.set_members(members.clone());
        let pipeline = Arc::new(CollectingPipeline::new());
        chain.register_pipeline(pipeline.clone());
        pipelines.push(pipeline);
    }
    connect(&chains[0], &chains[1]).await;
    connect(&chains[0], &chains[2]).await;
    connect(&chains[1], &chains[2]).await;
    for chain in &chains {
        chain.run();
    }
    (chains, pipelines)
}

async fn wait_for_transactions(pipelines: &[Arc<CollectingPipeline>], count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while pipelines.iter().any(|p| p.transactions().len() < count) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipelines stuck at {:?}",
            pipelines.iter().map(|p| p.transactions().len()).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_submitted_transaction_reaches_every_pipeline() {
    let (chains, pipelines) = shard_of_three().await;
    chains[0].submit_trx("x", b"payload".to_vec());

    wait_for_transactions(&pipelines, 1).await;
    for pipeline in &pipelines {
        assert_eq!(pipeline.batches(), vec![(SHARD, vec![Transaction::new("x", b"payload".to_vec())])]);
    }
    for chain in &chains {
        chain.shutdown();
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_members_deliver_identical_sequences() {
    let (chains, pipelines) = shard_of_three().await;
    for round in 0u8..5 {
        for chain in &chains {
            chain.submit_trx("transfer", vec![round]);
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    wait_for_transactions(&pipelines, 15).await;
    let reference = pipelines[0].transactions();
    for pipeline in &pipelines[1..] {
        assert_eq!(pipeline.transactions(), reference);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for chain in &chains {
        let snapshot = chain.snapshot();
        assert_eq!(snapshot.phase, RoundPhase::Idle);
        assert_eq!(snapshot.pending_events, 0);
        assert_eq!(snapshot.connected.len(), 2);
        chain.shutdown();
    }
}

#[test_log::test(tokio::test)]
async fn test_socket_from_non_member_is_refused() {
    let a = chain("a");
    let b = chain("b");
    a.set_members(vec![NodeId::from("a")]);
    b.set_members(vec![NodeId::from("a"), NodeId::from("b")]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        PeerSocket::accept(stream, FrameCodec::default()).await.unwrap()
    });
    let (_socket, _reader) = PeerSocket::dial(addr, NodeId::from("a"), NodeId::from("b"), SHARD, FrameCodec::default())
        .await
        .unwrap();
    let (_, remote, remote_reader) = accept.await.unwrap();
    assert!(a.attach_socket(remote, remote_reader).is_err());
    assert!(!a.has_socket(&NodeId::from("b")));
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "{} never happened", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Two connected members whose loops are not running, so nothing seals or
/// elects on its own.
async fn idle_pair() -> (Arc<Chain>, Arc<Chain>) {
    let a = chain("a");
    let b = chain("b");
    for member in [&a, &b] {
        member.set_members(vec![NodeId::from("a"), NodeId::from("b")]);
    }
    connect(&a, &b).await;
    (a, b)
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_merged_queue_is_broadcast_and_adopted_by_the_other_member() {
    let (a, b) = idle_pair().await;
    let foreign = vec![
        Event::new(NodeId::from("z"), 3, vec![Transaction::new("x", vec![3])]),
        Event::new(NodeId::from("z"), 9, vec![Transaction::new("x", vec![9])]),
    ];

    a.try_merge(foreign);
    assert_eq!(a.snapshot().pending_events, 2);
    eventually("b adopting the merged queue", || {
        let snapshot = b.snapshot();
        snapshot.pending_events == 2 && snapshot.pending_elections == 2
    })
    .await;

    let adopted: Vec<String> = b.take_pending_events().into_iter().map(|e| e.proof).collect();
    assert_eq!(adopted, vec!["3-z", "9-z"]);
    a.shutdown();
    b.shutdown();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_handed_off_transactions_land_in_the_receivers_queue() {
    let (a, b) = idle_pair().await;
    let carried = vec![Transaction::new("x", vec![1]), Transaction::new("y", vec![2])];

    a.hand_off_transactions(carried.clone()).unwrap();
    eventually("b queueing the hand-off", || b.snapshot().pending_trxs == 2).await;
    assert_eq!(b.take_leftovers(), carried);
    assert_eq!(a.snapshot().pending_trxs, 0);

    let lone = chain("c");
    lone.set_members(vec![NodeId::from("c")]);
    assert_eq!(lone.hand_off_transactions(carried.clone()), Err(carried));
    a.shutdown();
    b.shutdown();
}
