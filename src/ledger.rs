//! In-memory block store plus the consenter support implementation used by
//! the node binary and the integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::blockcutter::BlockCutter;
use crate::consensus::ConsenterSupport;
use crate::errors::ChainResult;
use crate::types::{Block, Envelope};

/// Hash-chained block store, seeded with a genesis block.
pub struct MemoryLedger {
    blocks: RwLock<Vec<Block>>,
}

impl MemoryLedger {
    pub fn new(genesis: Block) -> Self {
        MemoryLedger {
            blocks: RwLock::new(vec![genesis]),
        }
    }

    /// Rebuilds a ledger from previously committed blocks.
    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        assert!(!blocks.is_empty(), "a ledger starts at its genesis block");
        MemoryLedger {
            blocks: RwLock::new(blocks),
        }
    }

    pub fn height(&self) -> u64 {
        self.blocks.read().len() as u64
    }

    pub fn block(&self, number: u64) -> Option<Block> {
        self.blocks.read().get(number as usize).cloned()
    }

    fn append(&self, block: Block) {
        self.blocks.write().push(block);
    }
}

/// Wires a channel's ledger, block cutter and configuration sequence into
/// the [`ConsenterSupport`] contract the chain orders against.
pub struct ChannelSupport {
    channel_id: String,
    ledger: MemoryLedger,
    cutter: BlockCutter,
    batch_timeout: Duration,
    sequence: AtomicU64,
}

impl ChannelSupport {
    pub fn new(channel_id: &str, batch_timeout: Duration, max_message_count: usize) -> Self {
        Self::with_ledger(
            channel_id,
            MemoryLedger::new(Block::genesis(channel_id)),
            batch_timeout,
            max_message_count,
        )
    }

    /// Restarts a channel on an existing ledger.
    pub fn with_ledger(
        channel_id: &str,
        ledger: MemoryLedger,
        batch_timeout: Duration,
        max_message_count: usize,
    ) -> Self {
        ChannelSupport {
            channel_id: channel_id.to_string(),
            ledger,
            cutter: BlockCutter::new(max_message_count),
            batch_timeout,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }
}

impl ConsenterSupport for ChannelSupport {
    fn chain_id(&self) -> String {
        self.channel_id.clone()
    }

    fn height(&self) -> u64 {
        self.ledger.height()
    }

    fn block(&self, number: u64) -> Option<Block> {
        self.ledger.block(number)
    }

    fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    fn ordered(&self, envelope: Envelope) -> (Vec<Vec<Envelope>>, bool) {
        self.cutter.ordered(envelope)
    }

    fn cut(&self) -> Vec<Envelope> {
        self.cutter.cut()
    }

    fn write_block(&self, mut block: Block, metadata: Vec<u8>) {
        block.metadata.orderer = metadata;
        self.ledger.append(block);
    }

    fn write_config_block(&self, mut block: Block, metadata: Vec<u8>) {
        block.metadata.orderer = metadata;
        self.ledger.append(block);
        // a committed config block advances the configuration sequence
        self.sequence.fetch_add(1, Ordering::SeqCst);
    }

    fn process_normal_msg(&self, _envelope: &Envelope) -> ChainResult<u64> {
        Ok(self.sequence())
    }

    fn process_config_msg(&self, envelope: &Envelope) -> ChainResult<(Envelope, u64)> {
        Ok((envelope.clone(), self.sequence()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_block_advances_sequence() {
        let support = ChannelSupport::new("ch", Duration::from_secs(1), 10);
        assert_eq!(support.sequence(), 0);

        let genesis = support.block(0).unwrap();
        let config_block = Block::new(
            1,
            genesis.header.hash(),
            vec![Envelope::config("ch", &Default::default()).unwrap()],
        );
        support.write_config_block(config_block, b"meta".to_vec());

        assert_eq!(support.sequence(), 1);
        assert_eq!(support.height(), 2);
        assert_eq!(support.block(1).unwrap().metadata.orderer, b"meta".to_vec());
    }

    #[test]
    fn normal_block_keeps_sequence() {
        let support = ChannelSupport::new("ch", Duration::from_secs(1), 10);
        let genesis = support.block(0).unwrap();
        let block = Block::new(
            1,
            genesis.header.hash(),
            vec![Envelope::normal("ch", b"tx".to_vec())],
        );
        support.write_block(block, Vec::new());
        assert_eq!(support.sequence(), 0);
        assert_eq!(support.height(), 2);
    }
}
