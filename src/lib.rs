//! Raft-backed ordering service: a per-channel replicated state machine that
//! turns submitted transaction envelopes into a totally ordered, hash-chained
//! sequence of blocks, plus the validation guarding channel-configuration
//! changes.

pub mod blockcutter;
pub mod channelconfig;
pub mod cluster_client;
pub mod cluster_service;
pub mod config;
pub mod consensus;
pub mod errors;
pub mod ledger;
pub mod metrics;
pub mod server;
pub mod types;
