// btoken_node/src/anchor/resolver.rs
// Detection of anchors in parent-chain blocks and selection of the winner.

use std::cmp::Ordering;
use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::anchor::wallet::SpendableOutput;
use crate::anchor::{detect_anchor, AnchorRecord, AnchorRegistry, TokenAnchor};
use crate::blockchain::block::Block;
use crate::blockchain::transaction::Transaction;
use crate::util::{compare_le, sha256d, subtract_wrapping_le, Hash};

const COUNT_MINED_BLOCKS_MAX: usize = 64;

/// Score of an anchor under a parent block: `sha256d(parent) - target`,
/// wrapping, as little-endian 256-bit numbers.
pub fn anchor_distance(hash_parent: &Hash, hash_target: &Hash) -> Hash {
    subtract_wrapping_le(&sha256d(hash_parent), hash_target)
}

/// Index of the winning anchor: greatest distance, ties to the smallest txid.
pub fn select_winner(hash_parent: &Hash, anchors: &[TokenAnchor]) -> Option<usize> {
    let scored: Vec<Hash> = anchors.iter().map(|a| anchor_distance(hash_parent, &a.hash_target)).collect();
    (0..anchors.len()).max_by(|&a, &b| match compare_le(&scored[a], &scored[b]) {
        Ordering::Equal => anchors[b].txid.cmp(&anchors[a].txid),
        other => other,
    })
}

#[derive(Debug, Clone)]
pub struct UnconfirmedAnchor {
    pub anchor: TokenAnchor,
    pub transaction: Transaction,
    pub outputs_spent: Vec<SpendableOutput>,
}

/// Outcome of settling one parent block.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: AnchorRecord,
    pub anchor: TokenAnchor,
    pub block: Option<Block>,
}

pub struct AnchorResolver {
    hash_genesis_child: Hash,
    unconfirmed: Vec<UnconfirmedAnchor>,
    // Blocks this node anchored, by hash, until an anchor for them settles.
    mined_blocks: VecDeque<Block>,
    // Own anchors seen in a parent block, until the miner collects them.
    confirmed: VecDeque<Hash>,
    count_self_confirmed: u64,
}

impl AnchorResolver {
    pub fn new(hash_genesis_child: Hash) -> Self {
        AnchorResolver {
            hash_genesis_child,
            unconfirmed: Vec::new(),
            mined_blocks: VecDeque::new(),
            confirmed: VecDeque::new(),
            count_self_confirmed: 0,
        }
    }

    pub fn add_unconfirmed(&mut self, unconfirmed: UnconfirmedAnchor, block: Block) {
        info!(
            "Anchor {} for block {} awaiting confirmation (sequence {})",
            hex::encode(&unconfirmed.anchor.txid[..8]),
            hex::encode(&unconfirmed.anchor.hash_target[..8]),
            unconfirmed.anchor.sequence
        );
        self.unconfirmed.push(unconfirmed);
        if !self.mined_blocks.iter().any(|b| b.hash() == block.hash()) {
            self.mined_blocks.push_back(block);
        }
        while self.mined_blocks.len() > COUNT_MINED_BLOCKS_MAX {
            self.mined_blocks.pop_front();
        }
    }

    pub fn has_unconfirmed(&self) -> bool {
        !self.unconfirmed.is_empty()
    }

    pub fn unconfirmed(&self) -> &[UnconfirmedAnchor] {
        &self.unconfirmed
    }

    pub fn unconfirmed_transaction(&self, txid: &Hash) -> Option<&Transaction> {
        self.unconfirmed.iter().find(|u| u.anchor.txid == *txid).map(|u| &u.transaction)
    }

    /// Drops every unconfirmed anchor and hands back the outputs they spent.
    pub fn unwind_unconfirmed(&mut self) -> Vec<SpendableOutput> {
        self.unconfirmed.drain(..).flat_map(|u| u.outputs_spent).collect()
    }

    /// True once if our anchor `txid` was seen in a parent block.
    pub fn take_confirmed(&mut self, txid: &Hash) -> bool {
        match self.confirmed.iter().position(|t| t == txid) {
            Some(position) => {
                self.confirmed.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn count_self_confirmed(&self) -> u64 {
        self.count_self_confirmed
    }

    /// Anchors carried by `block`. Our own anchors leave the unconfirmed set.
    pub fn detect_block(&mut self, block: &Block) -> Vec<TokenAnchor> {
        let mut detected = Vec::new();
        for tx in &block.transactions {
            let Some(anchor) = detect_anchor(tx) else { continue };
            if let Some(position) = self.unconfirmed.iter().position(|u| u.anchor.txid == anchor.txid) {
                self.unconfirmed.remove(position);
                self.count_self_confirmed += 1;
                self.confirmed.push_back(anchor.txid);
                while self.confirmed.len() > COUNT_MINED_BLOCKS_MAX {
                    self.confirmed.pop_front();
                }
                info!("Own anchor {} confirmed in parent block {}", hex::encode(&anchor.txid[..8]), hex::encode(&block.hash()[..8]));
            } else {
                debug!("Foreign anchor {} in parent block {}", hex::encode(&anchor.txid[..8]), hex::encode(&block.hash()[..8]));
            }
            detected.push(anchor);
        }
        detected
    }

    // The anchor must build on the anchor-chain genesis or on a block some
    // earlier parent block settled.
    fn is_rooted(&self, anchor: &TokenAnchor, registry: &AnchorRegistry) -> bool {
        anchor.hash_previous == self.hash_genesis_child
            || registry.iter_back().any(|record| record.hash_child == anchor.hash_previous)
    }

    /// Settles the parent block at `height_parent`: scores the detected
    /// anchors, records the winner in `registry` and returns it.
    pub fn resolve(
        &mut self,
        height_parent: u32,
        hash_parent: &Hash,
        detected: Vec<TokenAnchor>,
        registry: &mut AnchorRegistry,
    ) -> Option<Resolution> {
        let candidates: Vec<TokenAnchor> = detected
            .into_iter()
            .filter(|anchor| {
                if registry.contains_child(&anchor.hash_target) {
                    debug!("Anchor {} targets an already anchored block", hex::encode(&anchor.txid[..8]));
                    return false;
                }
                if !self.is_rooted(anchor, registry) {
                    warn!(
                        "Anchor {} builds on unknown or orphaned block {}, rejected",
                        hex::encode(&anchor.txid[..8]),
                        hex::encode(&anchor.hash_previous[..8])
                    );
                    return false;
                }
                true
            })
            .collect();

        let winner = candidates.get(select_winner(hash_parent, &candidates)?)?.clone();
        let record = AnchorRecord {
            height_parent,
            hash_parent: *hash_parent,
            hash_child: winner.hash_target,
            txid: winner.txid,
        };
        registry.push(record.clone());

        let block = self
            .mined_blocks
            .iter()
            .position(|b| b.hash() == winner.hash_target)
            .and_then(|i| self.mined_blocks.remove(i));
        // Blocks built on the same predecessor lost the race.
        self.mined_blocks.retain(|b| b.header.hash_previous != winner.hash_previous);

        info!(
            "Parent block {} at height {} anchors block {} ({} candidates{})",
            hex::encode(&hash_parent[..8]),
            height_parent,
            hex::encode(&winner.hash_target[..8]),
            candidates.len(),
            if block.is_some() { ", mined here" } else { "" }
        );
        Some(Resolution { record, anchor: winner, block })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(target: u8, previous: Hash, txid: u8) -> TokenAnchor {
        TokenAnchor { hash_target: [target; 32], hash_previous: previous, txid: [txid; 32], value_change: 0, sequence: 0 }
    }

    #[test]
    fn winner_is_a_pure_function_of_inputs() {
        let parent = [0x11u8; 32];
        let anchors: Vec<TokenAnchor> = (1..=8).map(|i| anchor(i * 17, [0; 32], i)).collect();
        let first = select_winner(&parent, &anchors).unwrap();
        for _ in 0..10 {
            assert_eq!(select_winner(&parent, &anchors), Some(first));
        }
        let mut reversed = anchors.clone();
        reversed.reverse();
        let index = select_winner(&parent, &reversed).unwrap();
        assert_eq!(reversed[index], anchors[first]);
        let best = anchor_distance(&parent, &anchors[first].hash_target);
        assert!(anchors
            .iter()
            .all(|a| compare_le(&anchor_distance(&parent, &a.hash_target), &best) != Ordering::Greater));
    }

    #[test]
    fn distance_is_subtraction_not_absolute_difference() {
        let parent = [0x22u8; 32];
        let target = sha256d(&parent);
        // One above the target wraps around to the maximum distance.
        let mut above = target;
        for byte in above.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
        let anchors = vec![anchor(0, [0; 32], 1), TokenAnchor { hash_target: above, ..anchor(0, [0; 32], 2) }];
        let distance = anchor_distance(&parent, &above);
        assert_eq!(distance[31], 0xff);
        assert_eq!(select_winner(&parent, &anchors), Some(1));
    }

    #[test]
    fn equal_distances_go_to_smallest_txid() {
        let parent = [0x33u8; 32];
        let anchors = vec![anchor(5, [0; 32], 9), anchor(5, [0; 32], 3), anchor(5, [0; 32], 7)];
        assert_eq!(select_winner(&parent, &anchors), Some(1));
        assert_eq!(select_winner(&parent, &[]), None);
    }

    #[test]
    fn orphaned_anchors_are_rejected() {
        let genesis_child = [0xaa; 32];
        let mut resolver = AnchorResolver::new(genesis_child);
        let mut registry = AnchorRegistry::new();

        let orphan = anchor(1, [0xbb; 32], 1);
        assert!(resolver.resolve(10, &[1; 32], vec![orphan], &mut registry).is_none());
        assert!(registry.is_empty());

        let first = anchor(2, genesis_child, 2);
        let resolution = resolver.resolve(11, &[2; 32], vec![first.clone()], &mut registry).unwrap();
        assert_eq!(resolution.record.hash_child, first.hash_target);
        assert!(resolution.block.is_none());
        assert!(registry.contains_child(&[2; 32]));

        // Builds on the block settled above.
        let second = anchor(3, [2; 32], 3);
        assert!(resolver.resolve(12, &[3; 32], vec![second], &mut registry).is_some());
        // Same target twice is not anchored again.
        assert!(resolver.resolve(13, &[4; 32], vec![anchor(3, [2; 32], 4)], &mut registry).is_none());
        assert_eq!(registry.len(), 2);
    }
}
