//! Raft membership metadata persisted with every block, and the wire-facing
//! remote-node descriptors derived from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

/// An orderer node participating in raft for a channel. TLS certs are stored
/// as PEM and decoded to DER when the communication layer is configured.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consenter {
    pub host: String,
    pub port: u16,
    pub server_tls_cert: Vec<u8>,
    pub client_tls_cert: Vec<u8>,
}

/// Per-channel raft metadata: the consenter set keyed by raft node id, the
/// next id to mint for an added node, and the last applied raft index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetadata {
    pub consenters: BTreeMap<u64, Consenter>,
    pub next_consenter_id: u64,
    pub raft_index: u64,
}

impl RaftMetadata {
    pub fn new(consenters: BTreeMap<u64, Consenter>) -> Self {
        let next_consenter_id = consenters.keys().max().map_or(1, |id| id + 1);
        RaftMetadata {
            consenters,
            next_consenter_id,
            raft_index: 0,
        }
    }
}

/// Payload of a config envelope. `consensus_metadata` is present when the
/// update rewrites the channel's consenter set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub consensus_metadata: Option<Vec<Consenter>>,
}

/// A peer as handed to the communication layer: endpoint plus DER certs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteNode {
    pub id: u64,
    pub endpoint: String,
    pub server_tls_cert: Vec<u8>,
    pub client_tls_cert: Vec<u8>,
}

/// Decodes a PEM TLS cert to DER. Empty input passes through empty, which the
/// plaintext development transport accepts.
pub fn pem_to_der(pem: &[u8], id: u64, cert_type: &str) -> ChainResult<Vec<u8>> {
    if pem.is_empty() {
        return Ok(Vec::new());
    }
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem).map_err(|_| {
        ChainError::Validation(format!(
            "invalid PEM block of {} TLS cert for node {}",
            cert_type, id
        ))
    })?;
    Ok(parsed.contents)
}

/// Builds the remote-node list for every consenter except `self_id`.
pub fn remote_peers(metadata: &RaftMetadata, self_id: u64) -> ChainResult<Vec<RemoteNode>> {
    let mut nodes = Vec::new();
    for (&raft_id, consenter) in &metadata.consenters {
        if raft_id == self_id {
            continue;
        }
        nodes.push(RemoteNode {
            id: raft_id,
            endpoint: format!("{}:{}", consenter.host, consenter.port),
            server_tls_cert: pem_to_der(&consenter.server_tls_cert, raft_id, "server")?,
            client_tls_cert: pem_to_der(&consenter.client_tls_cert, raft_id, "client")?,
        });
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PEM: &[u8] =
        b"-----BEGIN CERTIFICATE-----\nAAECAwQF\n-----END CERTIFICATE-----\n";

    fn consenter(host: &str, port: u16) -> Consenter {
        Consenter {
            host: host.to_string(),
            port,
            server_tls_cert: SAMPLE_PEM.to_vec(),
            client_tls_cert: SAMPLE_PEM.to_vec(),
        }
    }

    #[test]
    fn next_consenter_id_follows_largest() {
        let mut consenters = BTreeMap::new();
        consenters.insert(1, consenter("a", 7050));
        consenters.insert(5, consenter("b", 7051));
        let metadata = RaftMetadata::new(consenters);
        assert_eq!(metadata.next_consenter_id, 6);
    }

    #[test]
    fn pem_decodes_to_der() {
        let der = pem_to_der(SAMPLE_PEM, 1, "server").unwrap();
        assert_eq!(der, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn invalid_pem_is_rejected() {
        let err = pem_to_der(b"not a pem", 2, "client").unwrap_err();
        assert!(err
            .to_string()
            .contains("invalid PEM block of client TLS cert for node 2"));
    }

    #[test]
    fn remote_peers_excludes_self() {
        let mut consenters = BTreeMap::new();
        consenters.insert(1, consenter("a", 7050));
        consenters.insert(2, consenter("b", 7051));
        let metadata = RaftMetadata::new(consenters);
        let nodes = remote_peers(&metadata, 1).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, 2);
        assert_eq!(nodes[0].endpoint, "b:7051");
    }
}
