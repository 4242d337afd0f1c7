//! Raft-backed consensus for a single channel: the chain serializer, the
//! raft node adapter, persistent log storage and membership management.

pub mod blockcreator;
pub mod chain;
pub mod membership;
pub mod node;
pub mod segment;
pub mod storage;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;
use crate::types::metadata::{RaftMetadata, RemoteNode};
use crate::types::{Block, Envelope};

/// Number of log entries preserved past a snapshot so that slow followers can
/// catch up in-band instead of needing the snapshot.
pub const DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES: u64 = 500;

/// Host-side services the chain orders against: the ledger, the block cutter
/// and message re-validation.
pub trait ConsenterSupport: Send + Sync {
    fn chain_id(&self) -> String;
    fn height(&self) -> u64;
    fn block(&self, number: u64) -> Option<Block>;
    /// Current configuration sequence; advancing it invalidates client-side
    /// validation.
    fn sequence(&self) -> u64;
    fn batch_timeout(&self) -> Duration;
    /// Feeds an envelope to the block cutter, returning cut batches and
    /// whether envelopes remain pending.
    fn ordered(&self, envelope: Envelope) -> (Vec<Vec<Envelope>>, bool);
    /// Cuts the pending batch, which may be empty.
    fn cut(&self) -> Vec<Envelope>;
    fn write_block(&self, block: Block, metadata: Vec<u8>);
    fn write_config_block(&self, block: Block, metadata: Vec<u8>);
    fn process_normal_msg(&self, envelope: &Envelope) -> ChainResult<u64>;
    fn process_config_msg(&self, envelope: &Envelope) -> ChainResult<(Envelope, u64)>;
}

/// Reconfigures the communication layer when the consenter set changes.
pub trait Configurator: Send + Sync {
    fn configure(&self, channel: &str, new_nodes: Vec<RemoteNode>);
}

/// Transport to the other consenters of the channel.
#[async_trait]
pub trait ClusterRpc: Send + Sync {
    async fn step(&self, dest: u64, request: StepRequest) -> ChainResult<()>;
    async fn send_submit(&self, dest: u64, request: SubmitRequest) -> ChainResult<()>;
}

/// Pulls committed blocks from the rest of the cluster during snapshot
/// catch-up. `pull_block` returns `None` when the block cannot be fetched.
#[async_trait]
pub trait BlockPuller: Send {
    async fn pull_block(&mut self, seq: u64) -> Option<Block>;
    fn close(&mut self);
}

/// A transaction envelope on its way to the leader, together with the
/// configuration sequence it was validated at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub channel: String,
    pub last_validation_seq: u64,
    pub content: Envelope,
}

/// A serialized raft message received from a peer.
#[derive(Clone, Debug)]
pub struct StepRequest {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Chain construction parameters.
#[derive(Clone, Debug)]
pub struct Options {
    pub raft_id: u64,
    pub wal_dir: PathBuf,
    pub snap_dir: PathBuf,
    /// Blocks between snapshots; 0 disables snapshotting.
    pub snap_interval: u64,
    /// 0 selects [`DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES`].
    pub snapshot_catch_up_entries: u64,
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    pub raft_metadata: RaftMetadata,
}
