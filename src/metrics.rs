//! Prometheus metrics for the ordering service.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Envelopes submitted for ordering, by envelope type
    pub static ref SUBMITTED_ENVELOPES: CounterVec = CounterVec::new(
        Opts::new("submitted_envelopes", "envelopes submitted for ordering"),
        &["type"]
    )
    .unwrap();

    /// Blocks committed to the ledger
    pub static ref COMMITTED_BLOCKS: Counter =
        Counter::new("committed_blocks", "blocks committed to the ledger").unwrap();

    /// Raft leader changes observed by the chain
    pub static ref LEADER_CHANGES: Counter =
        Counter::new("leader_changes", "raft leader changes observed").unwrap();
}

/// Registers all metric collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(SUBMITTED_ENVELOPES.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(COMMITTED_BLOCKS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(LEADER_CHANGES.clone()));
}
