use crate::types::{Block, Envelope};

/// Produces consecutive blocks, chaining each header to the hash of the
/// previous one. Initialized from the last block on the ledger when a node
/// becomes leader.
pub struct BlockCreator {
    hash: Vec<u8>,
    number: u64,
}

impl BlockCreator {
    pub fn new(hash: Vec<u8>, number: u64) -> Self {
        BlockCreator { hash, number }
    }

    pub fn create_next_block(&mut self, batch: Vec<Envelope>) -> Block {
        let block = Block::new(self.number + 1, self.hash.clone(), batch);
        self.number = block.header.number;
        self.hash = block.header.hash();
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_numbered_consecutively() {
        let genesis = Block::genesis("ch");
        let mut creator = BlockCreator::new(genesis.header.hash(), genesis.header.number);

        let first = creator.create_next_block(vec![Envelope::normal("ch", b"a".to_vec())]);
        let second = creator.create_next_block(vec![Envelope::normal("ch", b"b".to_vec())]);

        assert_eq!(first.header.number, 1);
        assert_eq!(second.header.number, 2);
    }

    #[test]
    fn blocks_chain_previous_hashes() {
        let genesis = Block::genesis("ch");
        let mut creator = BlockCreator::new(genesis.header.hash(), genesis.header.number);

        let first = creator.create_next_block(vec![Envelope::normal("ch", b"a".to_vec())]);
        let second = creator.create_next_block(vec![Envelope::normal("ch", b"b".to_vec())]);

        assert_eq!(first.header.previous_hash, genesis.header.hash());
        assert_eq!(second.header.previous_hash, first.header.hash());
    }
}
