//! gRPC surface for intra-cluster traffic: raft messages, forwarded
//! submissions and block pulls.

use crate::consensus;
use crate::server;
use crate::types;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("cluster");
}

use pb::cluster_service_server::ClusterService;
use pb::{
    PullBlockRequest, PullBlockResponse, StepRequest, StepResponse, SubmitRequest, SubmitResponse,
};

#[derive(Debug, Default)]
pub struct ClusterServiceSvc {}

#[tonic::async_trait]
impl ClusterService for ClusterServiceSvc {
    /// Hands a raft message from a peer to the local chain.
    async fn step(
        &self,
        request: tonic::Request<StepRequest>,
    ) -> Result<tonic::Response<StepResponse>, tonic::Status> {
        let request = request.into_inner();
        let chain = server::instance().lock().await.chain();
        chain
            .step(
                consensus::StepRequest {
                    channel: request.channel,
                    payload: request.payload,
                },
                request.sender,
            )
            .map_err(|e| tonic::Status::failed_precondition(e.to_string()))?;
        Ok(tonic::Response::new(StepResponse::default()))
    }

    /// Accepts a submission forwarded by a follower.
    async fn submit(
        &self,
        request: tonic::Request<SubmitRequest>,
    ) -> Result<tonic::Response<SubmitResponse>, tonic::Status> {
        let request = request.into_inner();
        let content: types::Envelope = types::decode(&request.content)
            .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?;
        let chain = server::instance().lock().await.chain();
        chain
            .submit(consensus::SubmitRequest {
                channel: request.channel,
                last_validation_seq: request.last_validation_seq,
                content,
            })
            .await
            .map_err(|e| tonic::Status::failed_precondition(e.to_string()))?;
        Ok(tonic::Response::new(SubmitResponse::default()))
    }

    /// Serves a committed block to a peer catching up from a snapshot.
    async fn pull_block(
        &self,
        request: tonic::Request<PullBlockRequest>,
    ) -> Result<tonic::Response<PullBlockResponse>, tonic::Status> {
        let request = request.into_inner();
        let support = server::instance().lock().await.support();
        let block = match support.ledger().block(request.seq) {
            Some(block) => types::encode(&block)
                .map_err(|e| tonic::Status::internal(e.to_string()))?,
            None => Vec::new(),
        };
        Ok(tonic::Response::new(PullBlockResponse { block }))
    }
}
