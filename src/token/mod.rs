// btoken_node/src/token/mod.rs
// Consensus policy of one chain. The blockchain core holds a `Box<dyn Token>`
// and never looks into the domain database behind it.

pub mod bitcoin;
pub mod btoken;
pub mod utxo;

use std::path::Path;

use crate::blockchain::block::Block;
use crate::blockchain::header::Header;
use crate::chainparams::{ChainParams, DifficultyRule};
use crate::error::{ChainError, Result};

/// Headers may run at most this far ahead of the local clock.
pub const MAX_FUTURE_BLOCK_TIME_SECS: i64 = 2 * 60 * 60;

pub trait Token: Send {
    fn params(&self) -> &ChainParams;

    fn create_header_genesis(&self) -> Header {
        let params = self.params();
        let g = &params.genesis;
        Header::new(g.version, [0u8; 32], g.merkle_root, g.timestamp, g.bits, g.nonce, params)
    }

    fn parse_header(&self, buffer: &[u8], offset: usize) -> Result<Header> {
        Header::parse(buffer, offset, self.params())
    }

    /// Context-free rules for a header at `height`. Linkage and checkpoints
    /// are checked by the blockchain.
    fn validate_header(&self, header: &Header, height: u32) -> Result<()> {
        check_header(self.params(), header, height, chrono::Utc::now().timestamp())
    }

    /// Commits the block's payload into the domain database. Either the whole
    /// block is applied or nothing is.
    fn insert_block(&mut self, block: &Block) -> Result<()>;

    fn load_image(&mut self, path: &Path) -> Result<()>;

    fn create_image(&self, path: &Path) -> Result<()>;

    /// Drops all domain state back to genesis.
    fn reset(&mut self) -> Result<()>;

    /// Set while the chain is rebuilt from its own archive. Blocks inserted
    /// meanwhile were live once already and must not notify anyone again.
    fn set_replaying(&mut self, _replaying: bool) {}

    /// Builds a block on top of `tip`, for chains this node produces blocks for.
    fn create_block(&mut self, _tip: &Header) -> Option<Block> {
        None
    }

    fn get_seed_addresses(&self) -> Vec<String> {
        self.params().seeds.iter().map(|s| s.to_string()).collect()
    }
}

pub fn check_header(params: &ChainParams, header: &Header, height: u32, now: i64) -> Result<()> {
    if let Some(expected) = params.checkpoint_at(height) {
        if *expected != header.hash {
            return Err(ChainError::protocol(format!(
                "header {} at height {} does not match checkpoint",
                hex::encode(&header.hash[..8]),
                height
            )));
        }
    }
    if params.difficulty_rule == DifficultyRule::ProofOfWork && !header.check_proof_of_work(params) {
        return Err(ChainError::protocol(format!(
            "header {} does not meet its proof-of-work target",
            hex::encode(&header.hash[..8])
        )));
    }
    if header.timestamp as i64 > now + MAX_FUTURE_BLOCK_TIME_SECS {
        return Err(ChainError::protocol(format!(
            "header {} timestamp {} too far in the future",
            hex::encode(&header.hash[..8]),
            header.timestamp
        )));
    }
    Ok(())
}

/// Minimal token for exercising the chain machinery in tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::blockchain::transaction::{OutPoint, Transaction, TxInput, TxOutput};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct Journal {
        pub inserted: Vec<crate::util::Hash>,
        pub resets: usize,
        /// Inserts that happened during archive replay.
        pub replayed: usize,
    }

    pub struct TestToken {
        pub params: ChainParams,
        pub journal: Arc<Mutex<Journal>>,
        /// Blocks with this nonce are rejected by `insert_block`.
        pub poison_nonce: Option<u32>,
        /// Called from `insert_block` before the block is journaled.
        pub on_insert: Option<Box<dyn Fn() + Send>>,
        replaying: bool,
    }

    impl TestToken {
        pub fn new(params: ChainParams) -> Self {
            TestToken {
                params,
                journal: Arc::new(Mutex::new(Journal::default())),
                poison_nonce: None,
                on_insert: None,
                replaying: false,
            }
        }
    }

    pub fn coinbase(tag: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: [0u8; 32], index: u32::MAX },
                script_sig: tag.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { value: 50, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    /// A block on top of `tip`, timestamped one second after it.
    pub fn block_on(params: &ChainParams, tip: &Header, nonce: u32) -> Block {
        let tx = coinbase(nonce);
        let header = Header::new(1, tip.hash, tx.txid(), tip.timestamp + 1, params.pow_limit_bits, nonce, params);
        Block::from_parts(header, vec![tx])
    }

    impl Token for TestToken {
        fn params(&self) -> &ChainParams {
            &self.params
        }

        fn insert_block(&mut self, block: &Block) -> Result<()> {
            block.validate_merkle_root()?;
            if Some(block.header.nonce) == self.poison_nonce {
                return Err(ChainError::protocol("poisoned block"));
            }
            if let Some(on_insert) = &self.on_insert {
                on_insert();
            }
            let mut journal = self.journal.lock().unwrap();
            journal.inserted.push(block.hash());
            if self.replaying {
                journal.replayed += 1;
            }
            Ok(())
        }

        fn load_image(&mut self, path: &Path) -> Result<()> {
            let bytes = std::fs::read(path.join("TestJournal"))?;
            let mut journal = self.journal.lock().unwrap();
            journal.inserted = bytes
                .chunks_exact(32)
                .map(|c| {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(c);
                    hash
                })
                .collect();
            Ok(())
        }

        fn create_image(&self, path: &Path) -> Result<()> {
            let journal = self.journal.lock().unwrap();
            let bytes: Vec<u8> = journal.inserted.iter().flat_map(|h| h.iter().copied()).collect();
            std::fs::write(path.join("TestJournal"), bytes)?;
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            let mut journal = self.journal.lock().unwrap();
            journal.inserted.clear();
            journal.resets += 1;
            Ok(())
        }

        fn set_replaying(&mut self, replaying: bool) {
            self.replaying = replaying;
        }

        fn create_block(&mut self, tip: &Header) -> Option<Block> {
            Some(block_on(&self.params, tip, tip.height + 1))
        }
    }
}
