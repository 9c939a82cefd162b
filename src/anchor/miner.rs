// btoken_node/src/anchor/miner.rs
// Anchor mining with replace-by-fee escalation.

use log::{info, warn};
use serde::Serialize;

use crate::anchor::resolver::UnconfirmedAnchor;
use crate::anchor::{anchor_script, detect_anchor, AnchorState, TokenAnchor};
use crate::blockchain::block::Block;
use crate::blockchain::transaction::Transaction;
use crate::config::AnchorConfig;
use crate::util::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    /// Nothing in flight; the next tick mines.
    Idle,
    /// Anchor `txid` was sent while the parent tip was `hash_parent_tip`.
    AwaitingConfirmation { hash_parent_tip: Hash, hash_target: Hash, txid: Hash },
    /// A replacement could not be funded; the raised fee and sequence carry
    /// over to the next attempt.
    Escalated,
}

#[derive(Debug, Clone)]
pub struct MinedAnchor {
    pub anchor: TokenAnchor,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Serialize)]
pub struct MinerStatus {
    pub fee_per_byte: f64,
    pub sequence: u32,
    pub awaiting_confirmation: bool,
    pub count_mined: u64,
}

#[derive(Debug)]
pub struct AnchorMiner {
    fee_per_byte: f64,
    fee_per_byte_initial: f64,
    fee_growth_factor: f64,
    sequence: u32,
    state: MinerState,
    count_mined: u64,
}

impl AnchorMiner {
    pub fn new(config: &AnchorConfig) -> Self {
        AnchorMiner {
            fee_per_byte: config.fee_per_byte_initial,
            fee_per_byte_initial: config.fee_per_byte_initial,
            fee_growth_factor: config.fee_growth_factor,
            sequence: 0,
            state: MinerState::Idle,
            count_mined: 0,
        }
    }

    pub fn fee_per_byte(&self) -> f64 {
        self.fee_per_byte
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn state(&self) -> MinerState {
        self.state
    }

    pub fn status(&self) -> MinerStatus {
        MinerStatus {
            fee_per_byte: self.fee_per_byte,
            sequence: self.sequence,
            awaiting_confirmation: matches!(self.state, MinerState::AwaitingConfirmation { .. }),
            count_mined: self.count_mined,
        }
    }

    /// One mining cycle against the parent tip `hash_parent_tip`.
    /// `create_block` builds the anchor-chain block to anchor.
    pub fn tick<F>(&mut self, hash_parent_tip: Hash, state: &mut AnchorState, create_block: F) -> Option<MinedAnchor>
    where
        F: FnOnce() -> Option<Block>,
    {
        if let MinerState::AwaitingConfirmation { hash_parent_tip: hash_tip_sent, hash_target, txid } = self.state {
            if state.resolver.take_confirmed(&txid) {
                self.fee_per_byte = (self.fee_per_byte / self.fee_growth_factor).max(self.fee_per_byte_initial);
                self.sequence = 0;
                self.state = MinerState::Idle;
                info!(
                    "Anchor for block {} confirmed, fee rate relaxes to {:.3}",
                    hex::encode(&hash_target[..8]),
                    self.fee_per_byte
                );
            } else if !state.resolver.has_unconfirmed() {
                // Unwound elsewhere without a confirmation: resend at the current rate.
                self.state = MinerState::Escalated;
            } else if hash_tip_sent == hash_parent_tip {
                return None;
            } else {
                let outputs = state.resolver.unwind_unconfirmed();
                if let Some(wallet) = state.wallet.as_mut() {
                    wallet.restore_outputs(outputs);
                }
                self.fee_per_byte *= self.fee_growth_factor;
                self.sequence += 1;
                self.state = MinerState::Escalated;
                info!(
                    "Parent tip moved without confirming anchor for {}, replacing at fee rate {:.3} sequence {}",
                    hex::encode(&hash_target[..8]),
                    self.fee_per_byte,
                    self.sequence
                );
            }
        }
        self.mine(hash_parent_tip, state, create_block)
    }

    fn mine<F>(&mut self, hash_parent_tip: Hash, state: &mut AnchorState, create_block: F) -> Option<MinedAnchor>
    where
        F: FnOnce() -> Option<Block>,
    {
        let wallet = state.wallet.as_mut()?;
        let block = create_block()?;
        let script = anchor_script(&block.hash(), &block.header.hash_previous);
        let Some((transaction, outputs_spent)) = wallet.create_anchor_transaction(script, self.fee_per_byte, self.sequence)
        else {
            warn!(
                "Insufficient funds for anchor: balance {} at fee rate {:.3}, retrying next cycle",
                wallet.balance(),
                self.fee_per_byte
            );
            return None;
        };
        let anchor = detect_anchor(&transaction)?;

        state.resolver.add_unconfirmed(
            UnconfirmedAnchor { anchor: anchor.clone(), transaction: transaction.clone(), outputs_spent },
            block,
        );
        self.state =
            MinerState::AwaitingConfirmation { hash_parent_tip, hash_target: anchor.hash_target, txid: anchor.txid };
        self.count_mined += 1;
        Some(MinedAnchor { anchor, transaction })
    }
}
