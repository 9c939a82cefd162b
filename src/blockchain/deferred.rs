// btoken_node/src/blockchain/deferred.rs
// Anchor-chain blocks that arrived before the parent block anchoring them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::blockchain::block::Block;
use crate::util::Hash;

const MAX_DEFERRED_BLOCKS: usize = 1000;
pub const DEFERRED_BLOCK_EXPIRY_SECS: u64 = 300;

pub struct DeferredBlock {
    pub block: Block,
    pub received_time: Instant,
}

#[derive(Default)]
pub struct DeferredBlocks {
    blocks: HashMap<Hash, DeferredBlock>,
}

impl DeferredBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `block` until its parent-chain anchor shows up. Returns false when full.
    pub fn insert(&mut self, block: Block) -> bool {
        self.insert_at(block, Instant::now())
    }

    fn insert_at(&mut self, block: Block, received_time: Instant) -> bool {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return true;
        }
        if self.blocks.len() >= MAX_DEFERRED_BLOCKS {
            debug!("Deferred pool full, dropping block {}", hex::encode(&hash[..8]));
            return false;
        }
        debug!("Deferring block {} until anchored", hex::encode(&hash[..8]));
        self.blocks.insert(hash, DeferredBlock { block, received_time });
        true
    }

    /// Removes and returns the blocks `is_ready` accepts, oldest first.
    pub fn take_ready<F>(&mut self, mut is_ready: F) -> Vec<Block>
    where
        F: FnMut(&Block) -> bool,
    {
        let ready: Vec<Hash> = self
            .blocks
            .iter()
            .filter(|(_, deferred)| is_ready(&deferred.block))
            .map(|(hash, _)| *hash)
            .collect();
        let mut blocks: Vec<DeferredBlock> = ready.iter().filter_map(|hash| self.blocks.remove(hash)).collect();
        blocks.sort_by_key(|deferred| deferred.received_time);
        blocks.into_iter().map(|deferred| deferred.block).collect()
    }

    /// Drops entries older than the expiry; returns how many went.
    pub fn cleanup(&mut self) -> usize {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&mut self, now: Instant) -> usize {
        let expiry = Duration::from_secs(DEFERRED_BLOCK_EXPIRY_SECS);
        let before = self.blocks.len();
        self.blocks
            .retain(|_, deferred| now.saturating_duration_since(deferred.received_time) < expiry);
        let removed = before - self.blocks.len();
        if removed > 0 {
            info!("Expired {} deferred blocks", removed);
        }
        removed
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainparams::ChainParams;
    use crate::token::testing::block_on;
    use crate::token::Token;

    fn sample(nonce: u32) -> Block {
        let params = ChainParams::btoken();
        let genesis = crate::token::testing::TestToken::new(params.clone()).create_header_genesis();
        block_on(&params, &genesis, nonce)
    }

    #[test]
    fn ready_blocks_leave_the_pool() {
        let mut deferred = DeferredBlocks::new();
        let a = sample(1);
        let b = sample(2);
        assert!(deferred.insert(a.clone()));
        assert!(deferred.insert(b.clone()));
        assert!(deferred.insert(a.clone()));
        assert_eq!(deferred.len(), 2);

        let ready = deferred.take_ready(|block| block.hash() == b.hash());
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].hash(), b.hash());
        assert!(deferred.contains(&a.hash()));
        assert!(!deferred.contains(&b.hash()));
    }

    #[test]
    fn old_entries_expire() {
        let mut deferred = DeferredBlocks::new();
        let start = Instant::now();
        deferred.insert_at(sample(1), start);
        deferred.insert_at(sample(2), start + Duration::from_secs(200));
        let removed = deferred.cleanup_at(start + Duration::from_secs(DEFERRED_BLOCK_EXPIRY_SECS + 1));
        assert_eq!(removed, 1);
        assert_eq!(deferred.len(), 1);
    }
}
