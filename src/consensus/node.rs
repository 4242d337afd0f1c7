//! Raft node adapter: owns the raft state machine, drives its tick/ready
//! loop, persists entries before acknowledging them, fans outgoing messages
//! to peers and delivers committed entries, soft state and snapshots to the
//! chain serializer.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfState, Entry, Message, Snapshot};
use raft::{Config, RawNode, StateRole};
use slog::{o, Drain};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use super::storage::RaftStorage;
use super::{ClusterRpc, StepRequest};
use crate::errors::{ChainError, ChainResult};

/// Committed entries plus the leader reported by raft soft state.
pub(crate) struct ApplyEvent {
    pub entries: Vec<Entry>,
    pub leader: Option<u64>,
}

pub(crate) enum NodeRequest {
    Step(Box<Message>),
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<ChainResult<()>>,
    },
    ProposeConfChange {
        cc: ConfChange,
        reply: oneshot::Sender<ChainResult<()>>,
    },
    ApplyConfChange {
        cc: ConfChange,
        reply: oneshot::Sender<ChainResult<ConfState>>,
    },
    ConfState {
        reply: oneshot::Sender<ConfState>,
    },
    TakeSnapshot {
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    },
}

/// Cheap handle the chain uses to talk to the node task.
#[derive(Clone)]
pub(crate) struct NodeHandle {
    cmd_tx: mpsc::UnboundedSender<NodeRequest>,
}

impl NodeHandle {
    pub fn step(&self, message: Message) -> ChainResult<()> {
        self.cmd_tx
            .send(NodeRequest::Step(Box::new(message)))
            .map_err(|_| ChainError::Stopped)
    }

    pub async fn propose(&self, data: Vec<u8>) -> ChainResult<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(NodeRequest::Propose { data, reply })
            .map_err(|_| ChainError::Stopped)?;
        response.await.map_err(|_| ChainError::Stopped)?
    }

    pub async fn propose_conf_change(&self, cc: ConfChange) -> ChainResult<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(NodeRequest::ProposeConfChange { cc, reply })
            .map_err(|_| ChainError::Stopped)?;
        response.await.map_err(|_| ChainError::Stopped)?
    }

    pub async fn apply_conf_change(&self, cc: ConfChange) -> ChainResult<ConfState> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(NodeRequest::ApplyConfChange { cc, reply })
            .map_err(|_| ChainError::Stopped)?;
        response.await.map_err(|_| ChainError::Stopped)?
    }

    pub async fn conf_state(&self) -> ChainResult<ConfState> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(NodeRequest::ConfState { reply })
            .map_err(|_| ChainError::Stopped)?;
        response.await.map_err(|_| ChainError::Stopped)
    }

    pub fn take_snapshot(&self, index: u64, conf_state: ConfState, data: Vec<u8>) {
        let _ = self.cmd_tx.send(NodeRequest::TakeSnapshot {
            index,
            conf_state,
            data,
        });
    }
}

pub(crate) fn node_channel() -> (NodeHandle, mpsc::UnboundedReceiver<NodeRequest>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    (NodeHandle { cmd_tx }, cmd_rx)
}

pub(crate) struct RaftNode {
    pub channel_id: String,
    pub raft_id: u64,
    pub config: Config,
    pub storage: Option<RaftStorage>,
    pub tick_interval: Duration,
    pub rpc: Arc<dyn ClusterRpc>,
    pub cmd_rx: mpsc::UnboundedReceiver<NodeRequest>,
    pub apply_tx: mpsc::UnboundedSender<ApplyEvent>,
    pub snap_tx: mpsc::UnboundedSender<Snapshot>,
    pub done: watch::Receiver<bool>,
}

impl RaftNode {
    /// Starts the raft state machine and spawns the node loop. A fresh,
    /// non-joining node bootstraps the log with the configured voter set and
    /// reports the seed index.
    pub fn start(mut self, fresh: bool, join: bool, voters: Vec<u64>) -> ChainResult<Option<u64>> {
        let mut storage = self
            .storage
            .take()
            .ok_or_else(|| ChainError::Storage("raft storage already consumed".to_string()))?;

        let mut bootstrap_index = None;
        if fresh && !join {
            let index = storage.bootstrap(voters)?;
            info!("bootstrapping fresh raft node at index {}", index);
            bootstrap_index = Some(index);
        } else {
            info!("restarting raft node from persisted state");
        }

        let logger = raft_logger(self.raft_id);
        let raw = RawNode::new(&self.config, storage, &logger)?;
        tokio::spawn(async move { self.run(raw).await });
        Ok(bootstrap_index)
    }

    async fn run(mut self, mut raw: RawNode<RaftStorage>) {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.cmd_rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle_request(&mut raw, request);
                    while let Ok(request) = self.cmd_rx.try_recv() {
                        self.handle_request(&mut raw, request);
                    }
                }
                _ = tick.tick() => {
                    raw.tick();
                }
                changed = self.done.changed() => {
                    if changed.is_err() || *self.done.borrow() {
                        break;
                    }
                }
            }
            self.on_ready(&mut raw);
        }
        info!("raft node loop stopped");
    }

    fn handle_request(&mut self, raw: &mut RawNode<RaftStorage>, request: NodeRequest) {
        match request {
            NodeRequest::Step(message) => {
                if let Err(e) = raw.step(*message) {
                    warn!("failed to step raft message: {}", e);
                }
            }
            NodeRequest::Propose { data, reply } => {
                // followers never forward proposals to the leader
                let result = if raw.raft.state != StateRole::Leader {
                    Err(ChainError::NoLeader)
                } else {
                    raw.propose(Vec::new(), data).map_err(ChainError::from)
                };
                let _ = reply.send(result);
            }
            NodeRequest::ProposeConfChange { cc, reply } => {
                let result = if raw.raft.state != StateRole::Leader {
                    Err(ChainError::NoLeader)
                } else {
                    raw.propose_conf_change(Vec::new(), cc).map_err(ChainError::from)
                };
                let _ = reply.send(result);
            }
            NodeRequest::ApplyConfChange { cc, reply } => {
                let result = match raw.apply_conf_change(&cc) {
                    Ok(conf_state) => {
                        raw.raft.raft_log.store.set_conf_state(conf_state.clone());
                        Ok(conf_state)
                    }
                    Err(e) => Err(ChainError::from(e)),
                };
                let _ = reply.send(result);
            }
            NodeRequest::ConfState { reply } => {
                let _ = reply.send(raw.raft.raft_log.store.conf_state().clone());
            }
            NodeRequest::TakeSnapshot {
                index,
                conf_state,
                data,
            } => {
                let store = &mut raw.raft.raft_log.store;
                if let Err(e) = store.take_snapshot(index, conf_state, data) {
                    error!("failed to take snapshot at index {}: {}", index, e);
                }
            }
        }
    }

    fn on_ready(&mut self, raw: &mut RawNode<RaftStorage>) {
        if !raw.has_ready() {
            return;
        }
        let mut ready = raw.ready();

        let leader = ready.ss().map(|soft_state| soft_state.leader_id);

        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            let store = &mut raw.raft.raft_log.store;
            if let Err(e) = store.apply_snapshot(snapshot.clone()) {
                // losing a leader-sent snapshot leaves the log unusable
                panic!("failed to persist snapshot from leader: {}", e);
            }
            let _ = self.snap_tx.send(snapshot);
        }

        let committed = ready.take_committed_entries();

        {
            let store = &mut raw.raft.raft_log.store;
            if let Err(e) = store.save(ready.hs().cloned(), ready.entries()) {
                // raft must not be acknowledged past a failed WAL write
                panic!("failed to persist raft entries: {}", e);
            }
        }

        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }

        if !committed.is_empty() || leader.is_some() {
            let _ = self.apply_tx.send(ApplyEvent {
                entries: committed,
                leader,
            });
        }

        let mut light_ready = raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            raw.raft.raft_log.store.set_commit(commit);
        }
        self.send_messages(light_ready.take_messages());
        let committed = light_ready.take_committed_entries();
        if !committed.is_empty() {
            let _ = self.apply_tx.send(ApplyEvent {
                entries: committed,
                leader: None,
            });
        }
        raw.advance_apply();
    }

    fn send_messages(&self, messages: Vec<Message>) {
        for message in messages {
            let dest = message.to;
            let payload = match message.write_to_bytes() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to serialize raft message for {}: {}", dest, e);
                    continue;
                }
            };
            let rpc = self.rpc.clone();
            let channel = self.channel_id.clone();
            tokio::spawn(async move {
                if let Err(e) = rpc.step(dest, StepRequest { channel, payload }).await {
                    debug!("failed to send raft message to {}, raft will retry: {}", dest, e);
                }
            });
        }
    }
}

fn raft_logger(raft_id: u64) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!("raft_id" => raft_id))
}
