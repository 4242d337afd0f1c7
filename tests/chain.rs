//! End-to-end chain scenarios on a single-node channel: election, ordering,
//! batch-timer cuts, config sequencing, restart and halt semantics. Paused
//! tokio time keeps the raft tick and batch timer deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protobuf::Message as PbMessage;
use tempfile::TempDir;
use tokio::sync::mpsc;

use orderer::consensus::chain::Chain;
use orderer::consensus::{
    BlockPuller, ClusterRpc, Configurator, ConsenterSupport, Options, StepRequest, SubmitRequest,
};
use orderer::errors::{ChainError, ChainResult};
use orderer::ledger::{ChannelSupport, MemoryLedger};
use orderer::types::metadata::{ConfigUpdate, Consenter, RaftMetadata, RemoteNode};
use orderer::types::{decode, Block, Envelope};

struct NoopRpc;

#[async_trait]
impl ClusterRpc for NoopRpc {
    async fn step(&self, _dest: u64, _request: StepRequest) -> ChainResult<()> {
        Ok(())
    }

    async fn send_submit(&self, _dest: u64, _request: SubmitRequest) -> ChainResult<()> {
        Ok(())
    }
}

struct NoopConfigurator;

impl Configurator for NoopConfigurator {
    fn configure(&self, _channel: &str, _new_nodes: Vec<RemoteNode>) {}
}

struct NoopPuller;

#[async_trait]
impl BlockPuller for NoopPuller {
    async fn pull_block(&mut self, _seq: u64) -> Option<Block> {
        None
    }

    fn close(&mut self) {}
}

const CHANNEL: &str = "test-channel";

fn consenters(ids: &[u64]) -> BTreeMap<u64, Consenter> {
    ids.iter()
        .map(|id| {
            (
                *id,
                Consenter {
                    host: format!("node{}", id),
                    port: 7050,
                    server_tls_cert: Vec::new(),
                    client_tls_cert: Vec::new(),
                },
            )
        })
        .collect()
}

fn chain_opts(dir: &TempDir, metadata: RaftMetadata, snap_interval: u64) -> Options {
    Options {
        raft_id: 1,
        wal_dir: dir.path().join("wal"),
        snap_dir: dir.path().join("snap"),
        snap_interval,
        snapshot_catch_up_entries: 0,
        tick_interval: Duration::from_millis(10),
        election_tick: 10,
        heartbeat_tick: 3,
        max_size_per_msg: 1024 * 1024,
        max_inflight_msgs: 256,
        raft_metadata: metadata,
    }
}

fn build_chain(
    dir: &TempDir,
    support: Arc<ChannelSupport>,
    metadata: RaftMetadata,
    snap_interval: u64,
) -> (Chain, mpsc::Receiver<u64>) {
    let (observer_tx, observer_rx) = mpsc::channel(1);
    let chain = Chain::new(
        support,
        chain_opts(dir, metadata, snap_interval),
        Arc::new(NoopConfigurator),
        Arc::new(NoopRpc),
        Box::new(NoopPuller),
        Some(observer_tx),
    )
    .expect("chain construction failed");
    (chain, observer_rx)
}

fn support_with(batch_size: usize) -> Arc<ChannelSupport> {
    Arc::new(ChannelSupport::new(
        CHANNEL,
        Duration::from_millis(500),
        batch_size,
    ))
}

async fn wait_for_leader(observer: &mut mpsc::Receiver<u64>) -> u64 {
    tokio::time::timeout(Duration::from_secs(60), observer.recv())
        .await
        .expect("leader election timed out")
        .expect("observer channel closed")
}

async fn wait_for_height(support: &ChannelSupport, height: u64) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while support.ledger().height() < height {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for height {}, ledger is at {}",
            height,
            support.ledger().height()
        )
    });
}

#[tokio::test(start_paused = true)]
async fn single_node_orders_envelopes_into_blocks() {
    let dir = TempDir::new().unwrap();
    let support = support_with(2);
    let (chain, mut observer) = build_chain(&dir, support.clone(), RaftMetadata::new(consenters(&[1])), 0);

    chain.start();
    assert_eq!(wait_for_leader(&mut observer).await, 1);
    chain.wait_ready().await.unwrap();

    chain
        .order(Envelope::normal(CHANNEL, b"tx1".to_vec()), 0)
        .await
        .unwrap();
    chain
        .order(Envelope::normal(CHANNEL, b"tx2".to_vec()), 0)
        .await
        .unwrap();

    wait_for_height(&support, 2).await;
    let genesis = support.ledger().block(0).unwrap();
    let block = support.ledger().block(1).unwrap();
    assert_eq!(block.header.number, 1);
    assert_eq!(block.data.len(), 2);
    assert!(!block.is_config());
    assert_eq!(block.header.previous_hash, genesis.header.hash());

    // the orderer metadata slot carries the raft index
    let metadata: RaftMetadata = decode(&block.metadata.orderer).unwrap();
    assert!(metadata.raft_index > 0);

    chain.halt().await;
}

#[tokio::test(start_paused = true)]
async fn batch_timer_cuts_pending_envelopes() {
    let dir = TempDir::new().unwrap();
    let support = support_with(10);
    let (chain, mut observer) = build_chain(&dir, support.clone(), RaftMetadata::new(consenters(&[1])), 0);

    chain.start();
    wait_for_leader(&mut observer).await;

    chain
        .order(Envelope::normal(CHANNEL, b"lonely tx".to_vec()), 0)
        .await
        .unwrap();

    // well under the batch size, so only the timer can cut this block
    wait_for_height(&support, 2).await;
    let block = support.ledger().block(1).unwrap();
    assert_eq!(block.data.len(), 1);

    chain.halt().await;
}

#[tokio::test(start_paused = true)]
async fn config_envelope_cuts_batch_and_commits_alone() {
    let dir = TempDir::new().unwrap();
    let support = support_with(10);
    let (chain, mut observer) = build_chain(&dir, support.clone(), RaftMetadata::new(consenters(&[1])), 0);

    chain.start();
    wait_for_leader(&mut observer).await;

    chain
        .order(Envelope::normal(CHANNEL, b"pending tx".to_vec()), 0)
        .await
        .unwrap();
    let config_envelope = Envelope::config(CHANNEL, &ConfigUpdate::default()).unwrap();
    chain.configure(config_envelope, 0).await.unwrap();

    wait_for_height(&support, 3).await;

    // the pending batch is cut ahead of the config block
    let normal_block = support.ledger().block(1).unwrap();
    assert!(!normal_block.is_config());
    assert_eq!(normal_block.data.len(), 1);

    let config_block = support.ledger().block(2).unwrap();
    assert!(config_block.is_config());
    assert_eq!(config_block.data.len(), 1);
    assert_eq!(support.sequence(), 1);

    // submissions are accepted again after the config block committed
    chain.wait_ready().await.unwrap();
    chain
        .order(Envelope::normal(CHANNEL, b"after config".to_vec()), support.sequence())
        .await
        .unwrap();
    wait_for_height(&support, 4).await;

    chain.halt().await;
}

#[tokio::test(start_paused = true)]
async fn submission_without_leader_fails() {
    let dir = TempDir::new().unwrap();
    let support = support_with(10);
    // two voters configured but only this node runs: no quorum, no leader
    let (chain, _observer) = build_chain(&dir, support.clone(), RaftMetadata::new(consenters(&[1, 2])), 0);

    chain.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = chain
        .order(Envelope::normal(CHANNEL, b"tx".to_vec()), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::NoLeader), "got: {}", err);
    assert_eq!(support.ledger().height(), 1);

    chain.halt().await;
}

#[tokio::test(start_paused = true)]
async fn halt_is_idempotent_and_closes_errored() {
    let dir = TempDir::new().unwrap();
    let support = support_with(10);
    let (chain, mut observer) = build_chain(&dir, support, RaftMetadata::new(consenters(&[1])), 0);

    chain.start();
    wait_for_leader(&mut observer).await;

    let errored = chain.errored();
    assert!(!*errored.borrow());

    chain.halt().await;
    chain.halt().await;
    assert!(*errored.borrow());

    let err = chain
        .order(Envelope::normal(CHANNEL, b"tx".to_vec()), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::Stopped), "got: {}", err);
}

#[tokio::test]
async fn operations_fail_before_start() {
    let dir = TempDir::new().unwrap();
    let support = support_with(10);
    let (chain, _observer) = build_chain(&dir, support, RaftMetadata::new(consenters(&[1])), 0);

    let err = chain
        .order(Envelope::normal(CHANNEL, b"tx".to_vec()), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::NotStarted));

    let err = chain.wait_ready().await.unwrap_err();
    assert!(matches!(err, ChainError::NotStarted));

    let err = chain
        .step(
            StepRequest {
                channel: CHANNEL.to_string(),
                payload: Vec::new(),
            },
            2,
        )
        .unwrap_err();
    assert!(matches!(err, ChainError::NotStarted));
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_without_rewriting_blocks() {
    let dir = TempDir::new().unwrap();
    let support = support_with(1);
    let (chain, mut observer) = build_chain(&dir, support.clone(), RaftMetadata::new(consenters(&[1])), 0);

    chain.start();
    wait_for_leader(&mut observer).await;
    chain
        .order(Envelope::normal(CHANNEL, b"tx1".to_vec()), 0)
        .await
        .unwrap();
    wait_for_height(&support, 2).await;
    chain.halt().await;

    // the host restarts the chain from the raft metadata of the last block
    // and the surviving ledger
    let first_block = support.ledger().block(1).unwrap();
    let metadata: RaftMetadata = decode(&first_block.metadata.orderer).unwrap();
    let blocks: Vec<Block> = (0..support.ledger().height())
        .map(|n| support.ledger().block(n).unwrap())
        .collect();
    let support2 = Arc::new(ChannelSupport::with_ledger(
        CHANNEL,
        MemoryLedger::with_blocks(blocks),
        Duration::from_millis(500),
        1,
    ));

    let (chain2, mut observer2) = build_chain(&dir, support2.clone(), metadata, 0);
    chain2.start();
    wait_for_leader(&mut observer2).await;

    // replayed entries must not be written again
    assert_eq!(support2.ledger().height(), 2);

    chain2
        .order(Envelope::normal(CHANNEL, b"tx2".to_vec()), 0)
        .await
        .unwrap();
    wait_for_height(&support2, 3).await;

    let second_block = support2.ledger().block(2).unwrap();
    assert_eq!(second_block.header.number, 2);
    assert_eq!(second_block.header.previous_hash, first_block.header.hash());

    chain2.halt().await;
}

#[tokio::test(start_paused = true)]
async fn snapshots_are_taken_at_interval() {
    let dir = TempDir::new().unwrap();
    let support = support_with(1);
    let (chain, mut observer) = build_chain(&dir, support.clone(), RaftMetadata::new(consenters(&[1])), 1);

    chain.start();
    wait_for_leader(&mut observer).await;

    for i in 0..3u32 {
        chain
            .order(Envelope::normal(CHANNEL, format!("tx{}", i).into_bytes()), 0)
            .await
            .unwrap();
    }
    wait_for_height(&support, 4).await;

    // the node task persists the snapshot shortly after the block commits
    let snapshot_path = dir.path().join("snap").join("snapshot");
    let snapshot_block = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if let Ok(data) = std::fs::read(&snapshot_path) {
                let mut snapshot = raft::eraftpb::Snapshot::default();
                if snapshot.merge_from_bytes(&data).is_ok() && !snapshot.get_data().is_empty() {
                    if let Ok(block) = decode::<Block>(snapshot.get_data()) {
                        break block;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no snapshot was persisted");

    assert!(snapshot_block.header.number >= 1);

    chain.halt().await;
}
