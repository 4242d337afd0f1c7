//! Node wiring: builds the channel support, the chain and the transport from
//! the runtime configuration, and runs the gRPC and metrics servers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::Mutex;

use crate::cluster_client::{ClusterComm, RemotePuller};
use crate::cluster_service::pb::cluster_service_server::ClusterServiceServer;
use crate::cluster_service::ClusterServiceSvc;
use crate::config;
use crate::consensus::chain::Chain;
use crate::consensus::Options;
use crate::ledger::ChannelSupport;
use crate::metrics;
use crate::types::metadata::{Consenter, RaftMetadata};

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();

pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::build()))
}

pub struct Server {
    chain: Arc<Chain>,
    support: Arc<ChannelSupport>,
}

impl Server {
    fn build() -> Self {
        let cfg = config::instance().lock().unwrap().clone();

        let consenters: BTreeMap<u64, Consenter> = cfg
            .node_list
            .iter()
            .map(|node| {
                (
                    node.id,
                    Consenter {
                        host: node.host.clone(),
                        port: node.port,
                        server_tls_cert: read_pem(node.server_tls_cert.as_deref()),
                        client_tls_cert: read_pem(node.client_tls_cert.as_deref()),
                    },
                )
            })
            .collect();
        let peer_ids: Vec<u64> = consenters.keys().copied().filter(|id| *id != cfg.id).collect();

        let support = Arc::new(ChannelSupport::new(
            &cfg.channel,
            Duration::from_millis(cfg.batch_timeout_ms),
            cfg.max_message_count,
        ));
        let comm = Arc::new(ClusterComm::new(cfg.id));
        let puller = Box::new(RemotePuller::new(comm.clone(), &cfg.channel, peer_ids));

        let opts = Options {
            raft_id: cfg.id,
            wal_dir: cfg.wal_path.clone().into(),
            snap_dir: cfg.snap_path.clone().into(),
            snap_interval: cfg.snap_interval,
            snapshot_catch_up_entries: 0,
            tick_interval: Duration::from_millis(cfg.tick_interval_ms),
            election_tick: cfg.election_tick,
            heartbeat_tick: cfg.heartbeat_tick,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            raft_metadata: RaftMetadata::new(consenters),
        };

        let chain = Chain::new(support.clone(), opts, comm.clone(), comm, puller, None)
            .expect("failed to construct chain from persisted raft data");

        Server {
            chain: Arc::new(chain),
            support,
        }
    }

    pub fn chain(&self) -> Arc<Chain> {
        self.chain.clone()
    }

    pub fn support(&self) -> Arc<ChannelSupport> {
        self.support.clone()
    }

    pub async fn start(&mut self) {
        self.chain.start();
        self.start_grpc_server().await;
        self.start_metrics_server().await;
    }

    pub async fn stop(&mut self) {
        log::info!("server stop");
        self.chain.halt().await;
    }

    async fn start_grpc_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .addr
            .as_str()
            .parse()
            .expect("invalid cluster listen address");
        let cluster_service = ClusterServiceSvc::default();
        let grpc_server = tonic::transport::Server::builder()
            .add_service(ClusterServiceServer::new(cluster_service))
            .serve(addr);
        tokio::spawn(async move {
            tokio::pin!(grpc_server);
            grpc_server.await.unwrap()
        });
        log::info!("grpc server started on {}", addr);
    }

    async fn start_metrics_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .metrics_addr
            .as_str()
            .parse()
            .expect("invalid metrics listen address");
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            tokio::pin!(server);
            server.await.unwrap()
        });
        log::info!("metrics server started on {}", addr);
    }
}

fn read_pem(path: Option<&str>) -> Vec<u8> {
    match path {
        Some(path) => std::fs::read(path).unwrap_or_else(|e| {
            log::warn!("failed to read TLS cert {}: {}", path, e);
            Vec::new()
        }),
        None => Vec::new(),
    }
}
