//! Cluster transport client: lazily connected per-peer gRPC channels,
//! rebuilt whenever the communication layer is reconfigured.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use tonic::transport::Channel;

use crate::cluster_service::pb;
use crate::cluster_service::pb::cluster_service_client::ClusterServiceClient;
use crate::consensus::{BlockPuller, ClusterRpc, Configurator, StepRequest, SubmitRequest};
use crate::errors::{ChainError, ChainResult};
use crate::types::metadata::RemoteNode;
use crate::types::{decode, encode, Block};

struct Peer {
    endpoint: String,
    client: Option<ClusterServiceClient<Channel>>,
}

/// Shared transport to the rest of the cluster; implements both the raft
/// message path and submission forwarding, and doubles as the communication
/// configurator.
pub struct ClusterComm {
    self_id: u64,
    peers: Mutex<HashMap<u64, Peer>>,
}

impl ClusterComm {
    pub fn new(self_id: u64) -> Self {
        ClusterComm {
            self_id,
            peers: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, dest: u64) -> ChainResult<ClusterServiceClient<Channel>> {
        let endpoint = {
            let peers = self.peers.lock();
            let peer = peers
                .get(&dest)
                .ok_or_else(|| ChainError::Transport(format!("unknown cluster peer {}", dest)))?;
            if let Some(client) = &peer.client {
                return Ok(client.clone());
            }
            peer.endpoint.clone()
        };

        let client = ClusterServiceClient::connect(format!("http://{}", endpoint))
            .await
            .map_err(|e| {
                ChainError::Transport(format!("failed to connect to peer {}: {}", dest, e))
            })?;

        if let Some(peer) = self.peers.lock().get_mut(&dest) {
            peer.client = Some(client.clone());
        }
        Ok(client)
    }

    pub async fn pull_block(
        &self,
        dest: u64,
        channel: &str,
        seq: u64,
    ) -> ChainResult<Option<Block>> {
        let mut client = self.client_for(dest).await?;
        let response = client
            .pull_block(pb::PullBlockRequest {
                channel: channel.to_string(),
                seq,
            })
            .await
            .map_err(|e| ChainError::Transport(e.message().to_string()))?
            .into_inner();
        if response.block.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode(&response.block)?))
    }
}

impl Configurator for ClusterComm {
    fn configure(&self, channel: &str, new_nodes: Vec<RemoteNode>) {
        info!(
            "configuring cluster communication for channel {} with {} remote nodes",
            channel,
            new_nodes.len()
        );
        let mut peers = self.peers.lock();
        let mut next = HashMap::new();
        for node in new_nodes {
            // keep a live connection when the endpoint is unchanged
            let client = peers
                .remove(&node.id)
                .filter(|peer| peer.endpoint == node.endpoint)
                .and_then(|peer| peer.client);
            next.insert(
                node.id,
                Peer {
                    endpoint: node.endpoint,
                    client,
                },
            );
        }
        *peers = next;
    }
}

#[async_trait]
impl ClusterRpc for ClusterComm {
    async fn step(&self, dest: u64, request: StepRequest) -> ChainResult<()> {
        let mut client = self.client_for(dest).await?;
        client
            .step(pb::StepRequest {
                channel: request.channel,
                sender: self.self_id,
                payload: request.payload,
            })
            .await
            .map_err(|e| ChainError::Transport(e.message().to_string()))?;
        Ok(())
    }

    async fn send_submit(&self, dest: u64, request: SubmitRequest) -> ChainResult<()> {
        let mut client = self.client_for(dest).await?;
        let content = encode(&request.content)?;
        client
            .submit(pb::SubmitRequest {
                channel: request.channel,
                last_validation_seq: request.last_validation_seq,
                content,
            })
            .await
            .map_err(|e| ChainError::Transport(e.message().to_string()))?;
        Ok(())
    }
}

/// Pulls missing blocks from any reachable cluster member during snapshot
/// catch-up.
pub struct RemotePuller {
    comm: Arc<ClusterComm>,
    channel: String,
    peers: Vec<u64>,
}

impl RemotePuller {
    pub fn new(comm: Arc<ClusterComm>, channel: &str, peers: Vec<u64>) -> Self {
        RemotePuller {
            comm,
            channel: channel.to_string(),
            peers,
        }
    }
}

#[async_trait]
impl BlockPuller for RemotePuller {
    async fn pull_block(&mut self, seq: u64) -> Option<Block> {
        for &peer in &self.peers {
            match self.comm.pull_block(peer, &self.channel, seq).await {
                Ok(Some(block)) => return Some(block),
                Ok(None) => continue,
                Err(e) => warn!("failed to pull block {} from node {}: {}", seq, peer, e),
            }
        }
        None
    }

    fn close(&mut self) {}
}
