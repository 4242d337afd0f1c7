//! The chain serializer: a single task that turns submitted envelopes into a
//! totally ordered sequence of blocks on the local ledger. It multiplexes
//! submissions, committed raft entries, the batch timer, snapshot signals and
//! halt over one select loop; every piece of mutable chain state is confined
//! to that task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, Message, Snapshot};
use raft::Config as RaftConfig;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::blockcreator::BlockCreator;
use super::membership::{self, MembershipChanges};
use super::node::{node_channel, ApplyEvent, NodeHandle, RaftNode};
use super::storage::RaftStorage;
use super::{
    BlockPuller, ClusterRpc, Configurator, ConsenterSupport, Options, StepRequest, SubmitRequest,
    DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES,
};
use crate::errors::{ChainError, ChainResult};
use crate::metrics;
use crate::types::metadata::{remote_peers, ConfigUpdate, Consenter, RaftMetadata};
use crate::types::{decode, encode, Block, Envelope, EnvelopeType};

struct SubmitEvent {
    /// `None` is the wait-ready probe: the serializer replies as soon as it
    /// dequeues it.
    request: Option<SubmitRequest>,
    reply: oneshot::Sender<ChainResult<()>>,
}

/// A raft-backed ordering chain for one channel.
///
/// The handle is cheap to share across tasks; all chain state lives in the
/// serializer task spawned by [`Chain::start`].
pub struct Chain {
    channel_id: String,
    raft_id: u64,
    fresh: bool,
    started: AtomicBool,
    submit_tx: mpsc::Sender<SubmitEvent>,
    halt_tx: mpsc::Sender<()>,
    done_rx: watch::Receiver<bool>,
    node: NodeHandle,
    raft_metadata: Arc<RwLock<RaftMetadata>>,
    configurator: Arc<dyn Configurator>,
    support: Arc<dyn ConsenterSupport>,
    startup: StdMutex<Option<(ChainRunner, RaftNode)>>,
}

impl Chain {
    pub fn new(
        support: Arc<dyn ConsenterSupport>,
        opts: Options,
        configurator: Arc<dyn Configurator>,
        rpc: Arc<dyn ClusterRpc>,
        puller: Box<dyn BlockPuller>,
        observer: Option<mpsc::Sender<u64>>,
    ) -> ChainResult<Chain> {
        let channel_id = support.chain_id();

        let catch_up_entries = if opts.snapshot_catch_up_entries == 0 {
            DEFAULT_SNAPSHOT_CATCH_UP_ENTRIES
        } else {
            opts.snapshot_catch_up_entries
        };
        let storage = RaftStorage::create(&opts.wal_dir, &opts.snap_dir, catch_up_entries)
            .map_err(|e| {
                ChainError::Storage(format!("failed to restore persisted raft data: {}", e))
            })?;
        let fresh = storage.is_fresh();

        let mut applied_index = opts.raft_metadata.raft_index;
        let mut last_snap_block_num = 0;
        let mut conf_state = ConfState::default();
        let snapshot = storage.snapshot();
        if snapshot.get_metadata().index > 0 {
            if !snapshot.get_data().is_empty() {
                let block: Block = decode(snapshot.get_data())?;
                last_snap_block_num = block.header.number;
            }
            applied_index = applied_index.max(snapshot.get_metadata().index);
            conf_state = snapshot.get_metadata().get_conf_state().clone();
        }

        let raft_config = RaftConfig {
            id: opts.raft_id,
            election_tick: opts.election_tick,
            heartbeat_tick: opts.heartbeat_tick,
            max_size_per_msg: opts.max_size_per_msg,
            max_inflight_msgs: opts.max_inflight_msgs,
            // a reconnected node must not disturb a stable cluster
            pre_vote: true,
            ..Default::default()
        };

        let (submit_tx, submit_rx) = mpsc::channel(1);
        let (halt_tx, halt_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = mpsc::unbounded_channel();
        let (node, cmd_rx) = node_channel();

        let raft_metadata = Arc::new(RwLock::new(opts.raft_metadata.clone()));

        let node_task = RaftNode {
            channel_id: channel_id.clone(),
            raft_id: opts.raft_id,
            config: raft_config,
            storage: Some(storage),
            tick_interval: opts.tick_interval,
            rpc: rpc.clone(),
            cmd_rx,
            apply_tx,
            snap_tx,
            done: done_rx.clone(),
        };

        let runner = ChainRunner {
            channel_id: channel_id.clone(),
            raft_id: opts.raft_id,
            support: support.clone(),
            configurator: configurator.clone(),
            rpc,
            node: node.clone(),
            submit_rx,
            apply_rx,
            snap_rx,
            halt_rx,
            halt_tx: halt_tx.clone(),
            done_tx,
            observer,
            raft_metadata: raft_metadata.clone(),
            puller,
            applied_index,
            last_snap_block_num,
            conf_state,
            conf_change_in_progress: None,
            config_inflight: false,
            just_elected: false,
            snap_interval: opts.snap_interval,
        };

        Ok(Chain {
            channel_id,
            raft_id: opts.raft_id,
            fresh,
            started: AtomicBool::new(false),
            submit_tx,
            halt_tx,
            done_rx,
            node,
            raft_metadata,
            configurator,
            support,
            startup: StdMutex::new(Some((runner, node_task))),
        })
    }

    /// Begins serving the chain: configures the communication layer, starts
    /// the raft node and spawns the serializer.
    pub fn start(&self) {
        let Some((mut runner, node_task)) = self
            .startup
            .lock()
            .expect("startup lock is never poisoned")
            .take()
        else {
            warn!("[channel: {}] chain already started", self.channel_id);
            return;
        };

        info!("[channel: {}] starting raft node {}", self.channel_id, self.raft_id);

        if let Err(e) = self.configure_comm() {
            error!(
                "[channel: {}] failed to start chain, aborting: {}",
                self.channel_id, e
            );
            let _ = runner.done_tx.send(true);
            return;
        }

        let join = self.support.height() > 1;
        let voters: Vec<u64> = self.raft_metadata.read().consenters.keys().copied().collect();
        match node_task.start(self.fresh, join, voters) {
            Ok(Some(bootstrap_index)) => {
                runner.applied_index = runner.applied_index.max(bootstrap_index);
            }
            Ok(None) => {}
            Err(e) => {
                error!(
                    "[channel: {}] failed to start raft node: {}",
                    self.channel_id, e
                );
                let _ = runner.done_tx.send(true);
                return;
            }
        }

        tokio::spawn(runner.run());
        self.started.store(true, Ordering::SeqCst);
    }

    /// Submits a normal transaction for ordering.
    pub async fn order(&self, envelope: Envelope, config_seq: u64) -> ChainResult<()> {
        metrics::SUBMITTED_ENVELOPES.with_label_values(&["normal"]).inc();
        self.submit(SubmitRequest {
            channel: self.channel_id.clone(),
            last_validation_seq: config_seq,
            content: envelope,
        })
        .await
    }

    /// Submits a config transaction for ordering, after gating it through
    /// the config-update validity check.
    pub async fn configure(&self, envelope: Envelope, config_seq: u64) -> ChainResult<()> {
        self.check_config_update_validity(&envelope)?;
        metrics::SUBMITTED_ENVELOPES.with_label_values(&["config"]).inc();
        self.submit(SubmitRequest {
            channel: self.channel_id.clone(),
            last_validation_seq: config_seq,
            content: envelope,
        })
        .await
    }

    /// Hands the request to the serializer and waits for its verdict. On a
    /// follower the serializer forwards to the leader; with no leader the
    /// submission fails.
    pub async fn submit(&self, request: SubmitRequest) -> ChainResult<()> {
        self.is_running()?;

        let (reply, response) = oneshot::channel();
        let event = SubmitEvent {
            request: Some(request),
            reply,
        };
        tokio::select! {
            sent = self.submit_tx.send(event) => {
                if sent.is_err() {
                    return Err(ChainError::Stopped);
                }
            }
            _ = wait_done(self.done_rx.clone()) => return Err(ChainError::Stopped),
        }
        tokio::select! {
            result = response => result.map_err(|_| ChainError::Stopped)?,
            _ = wait_done(self.done_rx.clone()) => Err(ChainError::Stopped),
        }
    }

    /// Returns once the chain accepts submissions again; blocks while the
    /// chain catches up from a snapshot or a config change is in flight.
    pub async fn wait_ready(&self) -> ChainResult<()> {
        self.is_running()?;

        let (reply, response) = oneshot::channel();
        let event = SubmitEvent {
            request: None,
            reply,
        };
        tokio::select! {
            sent = self.submit_tx.send(event) => {
                if sent.is_err() {
                    return Err(ChainError::Stopped);
                }
            }
            _ = wait_done(self.done_rx.clone()) => return Err(ChainError::Stopped),
        }
        tokio::select! {
            result = response => result.map_err(|_| ChainError::Stopped)?,
            _ = wait_done(self.done_rx.clone()) => Err(ChainError::Stopped),
        }
    }

    /// Injects a raft message received from `sender`.
    pub fn step(&self, request: StepRequest, sender: u64) -> ChainResult<()> {
        self.is_running()?;

        let mut message = Message::default();
        message.merge_from_bytes(&request.payload).map_err(|e| {
            ChainError::BadMessage(format!(
                "failed to unmarshal step request payload to raft message: {}",
                e
            ))
        })?;
        debug!(
            "[channel: {}] stepping raft message from node {}",
            self.channel_id, sender
        );
        self.node.step(message)
    }

    /// A wait handle that resolves to `true` once the chain halts.
    pub fn errored(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Stops the chain; idempotent, returns after the serializer exits.
    pub async fn halt(&self) {
        if !self.started.load(Ordering::SeqCst) {
            warn!(
                "[channel: {}] attempted to halt a chain that has not started",
                self.channel_id
            );
            return;
        }
        tokio::select! {
            _ = self.halt_tx.send(()) => {}
            _ = wait_done(self.done_rx.clone()) => return,
        }
        wait_done(self.done_rx.clone()).await;
    }

    fn is_running(&self) -> ChainResult<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ChainError::NotStarted);
        }
        if *self.done_rx.borrow() {
            return Err(ChainError::Stopped);
        }
        Ok(())
    }

    /// Pre-admission check for config envelopes: orderer transactions pass
    /// unconditionally, config updates may change at most one consenter.
    fn check_config_update_validity(&self, envelope: &Envelope) -> ChainResult<()> {
        match envelope.header.envelope_type {
            EnvelopeType::OrdererTransaction => Ok(()),
            EnvelopeType::Config => {
                let update: ConfigUpdate = decode(&envelope.payload)?;
                if let Some(proposed) = update.consensus_metadata {
                    let metadata = self.raft_metadata.read();
                    let changes = MembershipChanges::compute(&metadata.consenters, &proposed);
                    if changes.total_changes() > 1 {
                        return Err(ChainError::Validation(
                            "update of more than one consenter at a time is not supported"
                                .to_string(),
                        ));
                    }
                }
                Ok(())
            }
            EnvelopeType::Normal => Err(ChainError::Validation(
                "config transaction has unknown header type".to_string(),
            )),
        }
    }

    fn configure_comm(&self) -> ChainResult<()> {
        let nodes = remote_peers(&self.raft_metadata.read(), self.raft_id)?;
        self.configurator.configure(&self.channel_id, nodes);
        Ok(())
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    loop {
        if *done.borrow() {
            return;
        }
        if done.changed().await.is_err() {
            return;
        }
    }
}

struct ChainRunner {
    channel_id: String,
    raft_id: u64,
    support: Arc<dyn ConsenterSupport>,
    configurator: Arc<dyn Configurator>,
    rpc: Arc<dyn ClusterRpc>,
    node: NodeHandle,
    submit_rx: mpsc::Receiver<SubmitEvent>,
    apply_rx: mpsc::UnboundedReceiver<ApplyEvent>,
    snap_rx: mpsc::UnboundedReceiver<Snapshot>,
    halt_rx: mpsc::Receiver<()>,
    halt_tx: mpsc::Sender<()>,
    done_tx: watch::Sender<bool>,
    observer: Option<mpsc::Sender<u64>>,
    raft_metadata: Arc<RwLock<RaftMetadata>>,
    puller: Box<dyn BlockPuller>,
    applied_index: u64,
    last_snap_block_num: u64,
    conf_state: ConfState,
    conf_change_in_progress: Option<ConfChange>,
    config_inflight: bool,
    just_elected: bool,
    snap_interval: u64,
}

impl ChainRunner {
    async fn run(mut self) {
        let mut leader = raft::INVALID_ID;
        let mut submit_open = true;
        let mut block_creator: Option<BlockCreator> = None;
        let mut timer: Option<Instant> = None;

        loop {
            tokio::select! {
                event = self.submit_rx.recv(), if submit_open => {
                    let Some(event) = event else { break };
                    let Some(request) = event.request else {
                        // polled by wait_ready
                        let _ = event.reply.send(Ok(()));
                        continue;
                    };
                    let result = self
                        .handle_submit(request, leader, &mut block_creator, &mut timer, &mut submit_open)
                        .await;
                    let _ = event.reply.send(result);
                }

                Some(apply) = self.apply_rx.recv() => {
                    if let Some(new_leader) = apply.leader {
                        if new_leader != leader {
                            info!(
                                "[channel: {}] raft leader changed: {} -> {}",
                                self.channel_id, leader, new_leader
                            );
                            metrics::LEADER_CHANGES.inc();

                            if new_leader == self.raft_id {
                                self.become_leader(&mut block_creator, &mut submit_open).await;
                            }
                            if leader == self.raft_id {
                                self.become_follower(&mut block_creator, &mut submit_open, &mut timer);
                            }
                            leader = new_leader;

                            if let Some(observer) = &self.observer {
                                // non-blocking: observers that lag drop updates
                                let _ = observer.try_send(leader);
                            }
                        }
                    }

                    if let Err(e) = self.apply(apply.entries).await {
                        error!("[channel: {}] {}", self.channel_id, e);
                        break;
                    }

                    if !self.config_inflight {
                        submit_open = true;
                    }
                }

                _ = tokio::time::sleep_until(timer.unwrap_or_else(Instant::now)), if timer.is_some() => {
                    timer = None;
                    let batch = self.support.cut();
                    if batch.is_empty() {
                        warn!(
                            "[channel: {}] batch timer expired with no pending requests",
                            self.channel_id
                        );
                        continue;
                    }
                    debug!("[channel: {}] batch timer expired, creating block", self.channel_id);
                    self.propose(&mut block_creator, vec![batch]).await;
                }

                Some(snapshot) = self.snap_rx.recv() => {
                    if let Err(e) = self.handle_snapshot(snapshot).await {
                        error!("[channel: {}] {}", self.channel_id, e);
                        break;
                    }
                }

                Some(()) = self.halt_rx.recv() => break,
            }
        }

        info!("[channel: {}] stop serving requests", self.channel_id);
        let _ = self.done_tx.send(true);
    }

    async fn handle_submit(
        &mut self,
        request: SubmitRequest,
        leader: u64,
        block_creator: &mut Option<BlockCreator>,
        timer: &mut Option<Instant>,
        submit_open: &mut bool,
    ) -> ChainResult<()> {
        if leader == raft::INVALID_ID {
            debug!(
                "[channel: {}] request is dropped because there is no raft leader",
                self.channel_id
            );
            return Err(ChainError::NoLeader);
        }

        if leader != self.raft_id {
            debug!(
                "[channel: {}] forwarding submit request to raft leader {}",
                self.channel_id, leader
            );
            return self.rpc.send_submit(leader, request).await;
        }

        match self.ordered(request) {
            Ok((batches, pending)) => {
                if pending {
                    self.start_timer(timer);
                } else {
                    *timer = None;
                }
                self.propose(block_creator, batches).await;
                if self.config_inflight {
                    // stop accepting new envelopes until the conf change lands
                    *submit_open = false;
                }
                Ok(())
            }
            Err(e) => {
                error!("[channel: {}] failed to order message: {}", self.channel_id, e);
                self.start_timer(timer);
                Err(e)
            }
        }
    }

    fn start_timer(&self, timer: &mut Option<Instant>) {
        if timer.is_none() {
            *timer = Some(Instant::now() + self.support.batch_timeout());
        }
    }

    /// Orders one submission on the leader. Config envelopes cut the pending
    /// batch and form their own singleton batch; stale submissions are
    /// re-validated against the current config sequence first.
    fn ordered(&self, mut request: SubmitRequest) -> ChainResult<(Vec<Vec<Envelope>>, bool)> {
        let seq = self.support.sequence();

        if request.content.is_config() {
            if request.last_validation_seq < seq {
                let (content, _seq) = self
                    .support
                    .process_config_msg(&request.content)
                    .map_err(|e| ChainError::BadMessage(format!("bad config message: {}", e)))?;
                request.content = content;
            }
            let mut batches = Vec::new();
            let pending_batch = self.support.cut();
            if !pending_batch.is_empty() {
                batches.push(pending_batch);
            }
            batches.push(vec![request.content]);
            return Ok((batches, false));
        }

        if request.last_validation_seq < seq {
            self.support
                .process_normal_msg(&request.content)
                .map_err(|e| ChainError::BadMessage(format!("bad normal message: {}", e)))?;
        }
        Ok(self.support.ordered(request.content))
    }

    async fn propose(&mut self, block_creator: &mut Option<BlockCreator>, batches: Vec<Vec<Envelope>>) {
        let Some(creator) = block_creator.as_mut() else {
            if !batches.is_empty() {
                error!(
                    "[channel: {}] dropping {} batches: not serving as leader",
                    self.channel_id,
                    batches.len()
                );
            }
            return;
        };

        for batch in batches {
            let block = creator.create_next_block(batch);
            let is_config = block.is_config();
            let data = match encode(&block) {
                Ok(data) => data,
                Err(e) => {
                    error!("[channel: {}] failed to serialize block: {}", self.channel_id, e);
                    return;
                }
            };
            if let Err(e) = self.node.propose(data).await {
                error!(
                    "[channel: {}] failed to propose block to raft: {}",
                    self.channel_id, e
                );
                return;
            }
            if is_config {
                // wait for the config block to commit before ordering more
                self.config_inflight = true;
            }
        }
    }

    async fn become_leader(
        &mut self,
        block_creator: &mut Option<BlockCreator>,
        submit_open: &mut bool,
    ) {
        self.just_elected = true;
        *submit_open = false;

        let height = self.support.height();
        let Some(last_block) = self.support.block(height - 1) else {
            error!(
                "[channel: {}] failed to read last block at height {}",
                self.channel_id, height
            );
            return;
        };
        *block_creator = Some(BlockCreator::new(
            last_block.header.hash(),
            last_block.header.number,
        ));

        // an unfinished membership change is resumed by the new leader and
        // blocks submissions until committed
        if let Some(cc) = self.get_in_flight_conf_change().await {
            if let Err(e) = self.node.propose_conf_change(cc.clone()).await {
                warn!(
                    "[channel: {}] failed to propose configuration update to raft node: {}",
                    self.channel_id, e
                );
            }
            self.conf_change_in_progress = Some(cc);
            self.config_inflight = true;
        }
    }

    fn become_follower(
        &mut self,
        block_creator: &mut Option<BlockCreator>,
        submit_open: &mut bool,
        timer: &mut Option<Instant>,
    ) {
        let _ = self.support.cut();
        *timer = None;
        *submit_open = true;
        *block_creator = None;
    }

    async fn apply(&mut self, entries: Vec<Entry>) -> ChainResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        if entries[0].index > self.applied_index + 1 {
            return Err(ChainError::Fatal(format!(
                "first index of committed entry {} should be <= applied index {} + 1",
                entries[0].index, self.applied_index
            )));
        }

        if self.just_elected {
            self.just_elected = false;
            debug!(
                "[channel: {}] serving requests as newly elected leader",
                self.channel_id
            );
        }

        let mut applied_block = 0u64;
        let mut position = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    // re-applying a normal entry would write the same block
                    // twice; this guard is the sole defense against replay
                    if !entry.data.is_empty() && entry.index > self.applied_index {
                        let block: Block = decode(&entry.data).map_err(|e| {
                            ChainError::Fatal(format!(
                                "failed to decode committed block at index {}: {}",
                                entry.index, e
                            ))
                        })?;
                        let number = block.header.number;
                        self.write_block(block, entry.index).await?;
                        metrics::COMMITTED_BLOCKS.inc();
                        applied_block = number;
                        position = i;
                    }
                }
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    if let Err(e) = cc.merge_from_bytes(&entry.data) {
                        warn!(
                            "[channel: {}] failed to unmarshal conf change data: {}",
                            self.channel_id, e
                        );
                    } else {
                        self.conf_state = self.node.apply_conf_change(cc.clone()).await?;

                        let resolved = self.conf_change_in_progress.as_ref().map_or(false, |pending| {
                            pending.node_id == cc.node_id
                                && pending.get_change_type() == cc.get_change_type()
                        });
                        if resolved {
                            // the conf change introduced by an earlier config
                            // block has committed; submissions may resume
                            self.configure_comm().map_err(|e| {
                                ChainError::Fatal(format!(
                                    "failed to reconfigure communication: {}",
                                    e
                                ))
                            })?;
                            self.conf_change_in_progress = None;
                            self.config_inflight = false;
                        }

                        if cc.get_change_type() == ConfChangeType::RemoveNode
                            && cc.node_id == self.raft_id
                        {
                            info!(
                                "[channel: {}] current node removed from replica set",
                                self.channel_id
                            );
                            // halt from a separate task; the serializer cannot
                            // block on its own halt channel
                            let halt_tx = self.halt_tx.clone();
                            tokio::spawn(async move {
                                let _ = halt_tx.send(()).await;
                            });
                        }
                    }
                }
                _ => {}
            }

            if entry.index > self.applied_index {
                self.applied_index = entry.index;
            }
        }

        // snapshot disabled, or no block written this round
        if self.snap_interval == 0 || applied_block == 0 {
            return Ok(());
        }

        if applied_block - self.last_snap_block_num >= self.snap_interval {
            info!(
                "[channel: {}] taking snapshot at block {}, last snapshotted block is {}",
                self.channel_id, applied_block, self.last_snap_block_num
            );
            self.node.take_snapshot(
                self.applied_index,
                self.conf_state.clone(),
                entries[position].data.to_vec(),
            );
            self.last_snap_block_num = applied_block;
        }

        Ok(())
    }

    async fn write_block(&mut self, block: Block, index: u64) -> ChainResult<()> {
        if block.is_config() {
            return self.write_config_block(block, index).await;
        }

        let metadata_bytes = {
            let mut raft_metadata = self.raft_metadata.write();
            raft_metadata.raft_index = index;
            encode(&*raft_metadata)?
        };
        self.support.write_block(block, metadata_bytes);
        Ok(())
    }

    /// Writes a config block and, when the consenter set changed, proposes
    /// the matching raft ConfChange and re-detaches submissions until it
    /// commits.
    async fn write_config_block(&mut self, block: Block, index: u64) -> ChainResult<()> {
        let proposed = self.consensus_metadata(&block)?;

        let mut raft_metadata = self.raft_metadata.read().clone();
        let conf_change = proposed.and_then(|consenters| {
            MembershipChanges::compute(&raft_metadata.consenters, &consenters)
                .update_raft_metadata_and_conf_change(&mut raft_metadata)
        });
        raft_metadata.raft_index = index;

        let metadata_bytes = encode(&raft_metadata)?;
        self.support.write_config_block(block, metadata_bytes);
        self.config_inflight = false;

        if let Some(cc) = conf_change {
            // followers drop this proposal: only the leader proposes
            if let Err(e) = self.node.propose_conf_change(cc.clone()).await {
                warn!(
                    "[channel: {}] failed to propose configuration update to raft node: {}",
                    self.channel_id, e
                );
            }
            self.conf_change_in_progress = Some(cc);
            *self.raft_metadata.write() = raft_metadata;
            self.config_inflight = true;
        }

        Ok(())
    }

    fn consensus_metadata(&self, block: &Block) -> ChainResult<Option<Vec<Consenter>>> {
        let envelope = block
            .data
            .first()
            .ok_or_else(|| ChainError::Fatal("config block carries no envelope".to_string()))?;
        if envelope.header.envelope_type != EnvelopeType::Config {
            return Ok(None);
        }
        let update: ConfigUpdate = decode(&envelope.payload).map_err(|e| {
            ChainError::Fatal(format!("failed to decode config update from block: {}", e))
        })?;
        Ok(update.consensus_metadata)
    }

    /// The ConfChange still in flight, either remembered from this term or
    /// reconstructed from the last config block when a new leader takes over
    /// an unfinished membership change.
    async fn get_in_flight_conf_change(&mut self) -> Option<ConfChange> {
        if let Some(cc) = &self.conf_change_in_progress {
            return Some(cc.clone());
        }

        if self.support.height() <= 1 {
            return None;
        }
        let last_block = self.support.block(self.support.height() - 1)?;
        if !last_block.is_config() {
            return None;
        }

        let metadata: RaftMetadata = match decode(&last_block.metadata.orderer) {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(
                    "[channel: {}] failed to decode raft metadata from last config block: {}",
                    self.channel_id, e
                );
                return None;
            }
        };

        let conf_state = self.node.conf_state().await.ok()?;
        if conf_state.voters.len() == metadata.consenters.len() {
            // one change per config block: equal cardinality means the
            // membership change has already been applied
            return None;
        }

        Some(membership::conf_change(&metadata, &conf_state))
    }

    async fn handle_snapshot(&mut self, snapshot: Snapshot) -> ChainResult<()> {
        let snap_index = snapshot.get_metadata().index;
        if snap_index <= self.applied_index {
            debug!(
                "[channel: {}] skip snapshot taken at index {}, it is behind current applied index {}",
                self.channel_id, snap_index, self.applied_index
            );
            return Ok(());
        }

        let block: Block = decode(snapshot.get_data()).map_err(|e| {
            ChainError::Fatal(format!("failed to decode snapshot data to block: {}", e))
        })?;
        self.last_snap_block_num = block.header.number;
        self.conf_state = snapshot.get_metadata().get_conf_state().clone();
        self.applied_index = snap_index;

        if let Err(e) = self.catch_up(&block).await {
            // the chain stays up; catching up again is an operator concern
            error!(
                "[channel: {}] failed to recover from snapshot taken at term {} and index {}: {}",
                self.channel_id,
                snapshot.get_metadata().term,
                snap_index,
                e
            );
        }
        Ok(())
    }

    async fn catch_up(&mut self, block: &Block) -> ChainResult<()> {
        info!(
            "[channel: {}] catching up with snapshot taken at block {}",
            self.channel_id, block.header.number
        );

        let mut next = self.support.height();
        if next > block.header.number {
            warn!(
                "[channel: {}] snapshot is at block {}, local block number is {}, no sync needed",
                self.channel_id,
                block.header.number,
                next - 1
            );
            return Ok(());
        }

        let result = loop {
            if next > block.header.number {
                break Ok(());
            }
            match self.puller.pull_block(next).await {
                Some(fetched) => {
                    if fetched.is_config() {
                        self.support.write_config_block(fetched, Vec::new());
                    } else {
                        self.support.write_block(fetched, Vec::new());
                    }
                    next += 1;
                }
                None => {
                    break Err(ChainError::Transport(format!(
                        "failed to fetch block {} from cluster",
                        next
                    )))
                }
            }
        };
        self.puller.close();

        if result.is_ok() {
            info!(
                "[channel: {}] finished syncing with cluster up to block {} (incl.)",
                self.channel_id, block.header.number
            );
        }
        result
    }

    fn configure_comm(&self) -> ChainResult<()> {
        let nodes = remote_peers(&self.raft_metadata.read(), self.raft_id)?;
        self.configurator.configure(&self.channel_id, nodes);
        Ok(())
    }
}
