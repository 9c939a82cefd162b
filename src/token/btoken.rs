// btoken_node/src/token/btoken.rs
// Anchor-chain token. A block is accepted only once a parent-chain block has
// settled an anchor for it.

use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::anchor::AnchorRegistry;
use crate::blockchain::block::Block;
use crate::blockchain::header::Header;
use crate::blockchain::transaction::{merkle_root, OutPoint, Transaction, TxInput, TxOutput, SEQUENCE_FINAL};
use crate::chainparams::ChainParams;
use crate::error::{ChainError, Result};
use crate::token::Token;

pub struct TokenBToken {
    params: ChainParams,
    registry: Arc<RwLock<AnchorRegistry>>,
}

impl TokenBToken {
    pub fn new(params: ChainParams, registry: Arc<RwLock<AnchorRegistry>>) -> Self {
        TokenBToken { params, registry }
    }

    fn is_anchored(&self, block: &Block) -> bool {
        self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner()).contains_child(&block.hash())
    }
}

fn coinbase(height: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint { txid: [0u8; 32], index: u32::MAX },
            script_sig: height.to_le_bytes().to_vec(),
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOutput { value: 0, script_pubkey: vec![0x51] }],
        lock_time: 0,
    }
}

impl Token for TokenBToken {
    fn params(&self) -> &ChainParams {
        &self.params
    }

    fn insert_block(&mut self, block: &Block) -> Result<()> {
        block.validate_merkle_root()?;
        if !self.is_anchored(block) {
            return Err(ChainError::NotSynchronizedWithParent(block.hash()));
        }
        Ok(())
    }

    // Anchoring state lives with the parent chain's image.
    fn load_image(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn create_image(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn create_block(&mut self, tip: &Header) -> Option<Block> {
        let height = tip.height + 1;
        let tx = coinbase(height);
        let timestamp = (chrono::Utc::now().timestamp() as u32).max(tip.timestamp + 1);
        let header = Header::new(
            1,
            tip.hash,
            merkle_root(&[tx.txid()]),
            timestamp,
            self.params.pow_limit_bits,
            0,
            &self.params,
        );
        Some(Block::from_parts(header, vec![tx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorRecord;

    #[test]
    fn unanchored_block_waits_for_parent() {
        let registry = Arc::new(RwLock::new(AnchorRegistry::new()));
        let mut token = TokenBToken::new(ChainParams::btoken(), Arc::clone(&registry));
        let genesis = token.create_header_genesis();
        let block = token.create_block(&genesis).unwrap();
        assert_eq!(block.header.hash_previous, genesis.hash);
        assert!(block.header.timestamp > genesis.timestamp);

        match token.insert_block(&block) {
            Err(ChainError::NotSynchronizedWithParent(hash)) => assert_eq!(hash, block.hash()),
            other => panic!("expected NotSynchronizedWithParent, got {:?}", other),
        }

        registry.write().unwrap().push(AnchorRecord {
            height_parent: 1,
            hash_parent: [1; 32],
            hash_child: block.hash(),
            txid: [2; 32],
        });
        token.insert_block(&block).unwrap();
    }

    #[test]
    fn tampered_block_is_a_protocol_error() {
        let registry = Arc::new(RwLock::new(AnchorRegistry::new()));
        let mut token = TokenBToken::new(ChainParams::btoken(), registry);
        let genesis = token.create_header_genesis();
        let mut block = token.create_block(&genesis).unwrap();
        block.transactions[0].outputs[0].value = 1;
        assert!(token.insert_block(&block).unwrap_err().is_protocol());
    }

    #[test]
    fn anchor_chain_blocks_weigh_one() {
        let mut token = TokenBToken::new(ChainParams::btoken(), Arc::new(RwLock::new(AnchorRegistry::new())));
        let genesis = token.create_header_genesis();
        let block = token.create_block(&genesis).unwrap();
        assert_eq!(block.header.difficulty, 1.0);
        token.validate_header(&block.header, 1).unwrap();
    }
}
