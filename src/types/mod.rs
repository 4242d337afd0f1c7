//! Core data model of the ordering service: envelopes, blocks and the
//! serialization helpers shared across the chain, the ledger and the wire.

pub mod metadata;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::ChainResult;
use self::metadata::ConfigUpdate;

/// Transaction classes carried in a channel header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    Normal,
    Config,
    OrdererTransaction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub envelope_type: EnvelopeType,
    pub channel_id: String,
}

/// Opaque transaction with a typed header. The payload of a config envelope
/// decodes to a [`ConfigUpdate`]; normal payloads are never inspected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: ChannelHeader,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn normal(channel_id: &str, payload: Vec<u8>) -> Self {
        Envelope {
            header: ChannelHeader {
                envelope_type: EnvelopeType::Normal,
                channel_id: channel_id.to_string(),
            },
            payload,
        }
    }

    pub fn config(channel_id: &str, update: &ConfigUpdate) -> ChainResult<Self> {
        Ok(Envelope {
            header: ChannelHeader {
                envelope_type: EnvelopeType::Config,
                channel_id: channel_id.to_string(),
            },
            payload: encode(update)?,
        })
    }

    pub fn orderer_transaction(channel_id: &str, payload: Vec<u8>) -> Self {
        Envelope {
            header: ChannelHeader {
                envelope_type: EnvelopeType::OrdererTransaction,
                channel_id: channel_id.to_string(),
            },
            payload,
        }
    }

    /// Config and orderer transactions both commit as config blocks.
    pub fn is_config(&self) -> bool {
        matches!(
            self.header.envelope_type,
            EnvelopeType::Config | EnvelopeType::OrdererTransaction
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub previous_hash: Vec<u8>,
    pub data_hash: Vec<u8>,
}

impl BlockHeader {
    pub fn hash(&self) -> Vec<u8> {
        let encoded = bincode::serialize(self).expect("block header is always encodable");
        Sha256::digest(&encoded).to_vec()
    }
}

/// Metadata slots appended to each block by the ledger; the orderer slot
/// carries the serialized raft metadata {consenters, raft-index}.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub orderer: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub data: Vec<Envelope>,
    pub metadata: BlockMetadata,
}

impl Block {
    pub fn new(number: u64, previous_hash: Vec<u8>, data: Vec<Envelope>) -> Self {
        Block {
            header: BlockHeader {
                number,
                previous_hash,
                data_hash: data_hash(&data),
            },
            data,
            metadata: BlockMetadata::default(),
        }
    }

    /// The genesis block is a config block, like every bootstrapped channel.
    pub fn genesis(channel_id: &str) -> Self {
        let update = ConfigUpdate::default();
        let envelope = Envelope::config(channel_id, &update)
            .expect("genesis config update is always encodable");
        Block::new(0, Vec::new(), vec![envelope])
    }

    /// A config block carries exactly one config envelope.
    pub fn is_config(&self) -> bool {
        self.data.len() == 1 && self.data[0].is_config()
    }
}

pub fn data_hash(envelopes: &[Envelope]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for envelope in envelopes {
        let encoded = bincode::serialize(envelope).expect("envelope is always encodable");
        hasher.update(&encoded);
    }
    hasher.finalize().to_vec()
}

pub fn encode<T: Serialize>(value: &T) -> ChainResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> ChainResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_config_block() {
        let genesis = Block::genesis("test-channel");
        assert_eq!(genesis.header.number, 0);
        assert!(genesis.is_config());
    }

    #[test]
    fn normal_block_is_not_config() {
        let block = Block::new(
            1,
            vec![0u8; 32],
            vec![
                Envelope::normal("ch", b"tx1".to_vec()),
                Envelope::normal("ch", b"tx2".to_vec()),
            ],
        );
        assert!(!block.is_config());
    }

    #[test]
    fn header_hash_covers_all_fields() {
        let a = BlockHeader {
            number: 3,
            previous_hash: vec![1, 2, 3],
            data_hash: vec![4, 5, 6],
        };
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.number = 4;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn block_round_trips_through_codec() {
        let block = Block::new(7, vec![9u8; 32], vec![Envelope::normal("ch", b"tx".to_vec())]);
        let bytes = encode(&block).unwrap();
        let decoded: Block = decode(&bytes).unwrap();
        assert_eq!(block, decoded);
    }
}
