//! Runtime configuration for an ordering-service node: identity, listen
//! addresses, storage paths and the consenter set of the channel.

use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

/// Global configuration instance
static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

/// Returns a reference to the global configuration instance
pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

/// One consenter of the channel as listed in the config file. TLS cert
/// fields are paths to PEM files; omitted certs run the plaintext
/// development transport.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u64,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub server_tls_cert: Option<String>,
    #[serde(default)]
    pub client_tls_cert: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Current node's raft id
    pub id: u64,
    /// Channel this node orders for
    pub channel: String,
    /// Listen address for cluster gRPC traffic
    pub addr: String,
    /// Listen address for metrics
    pub metrics_addr: String,
    /// Write-ahead-log directory
    pub wal_path: String,
    /// Snapshot directory
    pub snap_path: String,
    /// Blocks between raft snapshots, 0 disables snapshotting
    pub snap_interval: u64,
    /// Batch timer for cutting partially filled blocks
    pub batch_timeout_ms: u64,
    /// Envelopes per block before the cutter cuts
    pub max_message_count: usize,
    pub tick_interval_ms: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    /// All consenters of the channel, this node included
    pub node_list: Vec<NodeConfig>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            channel: "defaultchannel".to_string(),
            addr: "0.0.0.0:7050".to_string(),
            metrics_addr: "0.0.0.0:7060".to_string(),
            wal_path: "./data/wal".to_string(),
            snap_path: "./data/snap".to_string(),
            snap_interval: 100,
            batch_timeout_ms: 2000,
            max_message_count: 500,
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            node_list: Vec::new(),
        }
    }

    /// Loads configuration from a TOML file, falling back to defaults when
    /// the file is missing or malformed.
    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        instance().lock().unwrap().clone_from(&config);
        Some(config)
    }
}
