// btoken_node/src/token/bitcoin.rs
// Parent-chain token: proof-of-work headers, UTXO validation, and the anchor
// observers that settle which anchor-chain block each parent block binds.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use crate::anchor::{AnchorEvent, AnchorRegistry, AnchorState};
use crate::blockchain::block::Block;
use crate::chainparams::ChainParams;
use crate::error::Result;
use crate::token::utxo::UtxoStore;
use crate::token::Token;

pub struct TokenBitcoin {
    params: ChainParams,
    utxo: UtxoStore,
    anchor_state: Arc<Mutex<AnchorState>>,
    registry: Arc<RwLock<AnchorRegistry>>,
    events: Option<UnboundedSender<AnchorEvent>>,
    /// Replayed blocks rebuild the registry without announcing winners.
    replaying: bool,
}

impl TokenBitcoin {
    pub fn new(
        params: ChainParams,
        root: &Path,
        cache_max_entries: usize,
        anchor_state: Arc<Mutex<AnchorState>>,
        registry: Arc<RwLock<AnchorRegistry>>,
        events: Option<UnboundedSender<AnchorEvent>>,
    ) -> Result<Self> {
        Ok(TokenBitcoin {
            params,
            utxo: UtxoStore::open(root, cache_max_entries)?,
            anchor_state,
            registry,
            events,
            replaying: false,
        })
    }

    pub fn utxo(&self) -> &UtxoStore {
        &self.utxo
    }

    fn anchor_state(&self) -> MutexGuard<'_, AnchorState> {
        self.anchor_state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registry(&self) -> RwLockWriteGuard<'_, AnchorRegistry> {
        self.registry.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Token for TokenBitcoin {
    fn params(&self) -> &ChainParams {
        &self.params
    }

    fn insert_block(&mut self, block: &Block) -> Result<()> {
        block.validate_merkle_root()?;
        let height = block.header.height;
        self.utxo.apply_block(block, height)?;

        let resolution = {
            let mut state = self.anchor_state();
            if let Some(wallet) = state.wallet.as_mut() {
                wallet.detect_block(block);
            }
            let detected = state.resolver.detect_block(block);
            if detected.is_empty() {
                return Ok(());
            }
            let mut registry = self.registry();
            state.resolver.resolve(height, &block.hash(), detected, &mut registry)
        };

        let events = self.events.as_ref().filter(|_| !self.replaying);
        if let (Some(resolution), Some(events)) = (resolution, events) {
            let event = AnchorEvent::Winner { record: resolution.record, anchor: resolution.anchor, block: resolution.block };
            if events.send(event).is_err() {
                debug!("No listener for anchor events");
            }
        }
        Ok(())
    }

    fn load_image(&mut self, path: &Path) -> Result<()> {
        self.utxo.load_image(path)?;
        if let Some(wallet) = self.anchor_state().wallet.as_mut() {
            wallet.load_image(path)?;
        }
        self.registry().load_image(path)?;
        Ok(())
    }

    fn create_image(&self, path: &Path) -> Result<()> {
        self.utxo.create_image(path)?;
        if let Some(wallet) = self.anchor_state().wallet.as_ref() {
            wallet.create_image(path)?;
        }
        self.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner()).create_image(path)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.utxo.reset()?;
        if let Some(wallet) = self.anchor_state().wallet.as_mut() {
            wallet.clear();
        }
        self.registry().clear();
        Ok(())
    }

    fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::wallet::tests::wallet;
    use crate::anchor::{anchor_script, Wallet};
    use crate::blockchain::header::Header;
    use crate::blockchain::transaction::{merkle_root, OutPoint, Transaction, TxInput, TxOutput};
    use crate::token::testing::coinbase;

    struct Fixture {
        _dir: tempfile::TempDir,
        token: TokenBitcoin,
        state: Arc<Mutex<AnchorState>>,
        registry: Arc<RwLock<AnchorRegistry>>,
        events: tokio::sync::mpsc::UnboundedReceiver<AnchorEvent>,
        tip: Header,
    }

    const HASH_ANCHOR_GENESIS: [u8; 32] = [0x77; 32];

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::bitcoin_regtest();
        let state = Arc::new(Mutex::new(AnchorState::new(Some(Box::new(wallet())), HASH_ANCHOR_GENESIS)));
        let registry = Arc::new(RwLock::new(AnchorRegistry::new()));
        let (sender, events) = tokio::sync::mpsc::unbounded_channel();
        let token =
            TokenBitcoin::new(params, dir.path(), 64, Arc::clone(&state), Arc::clone(&registry), Some(sender)).unwrap();
        let tip = token.create_header_genesis();
        Fixture { _dir: dir, token, state, registry, events, tip }
    }

    impl Fixture {
        /// Mines a block paying its coinbase to the wallet, followed by `transactions`.
        fn insert(&mut self, transactions: Vec<Transaction>) -> Result<Block> {
            let mut coinbase = coinbase(self.tip.height + 1);
            coinbase.outputs[0] = TxOutput { value: 100_000, script_pubkey: wallet().script_pubkey().to_vec() };
            let mut all = vec![coinbase];
            all.extend(transactions);
            let txids: Vec<_> = all.iter().map(|t| t.txid()).collect();
            let params = self.token.params().clone();
            let mut header =
                Header::new(1, self.tip.hash, merkle_root(&txids), self.tip.timestamp + 1, params.pow_limit_bits, 0, &params);
            header.height = self.tip.height + 1;
            let block = Block::from_parts(header, all);
            self.token.insert_block(&block)?;
            self.tip = block.header.clone();
            Ok(block)
        }
    }

    fn foreign_anchor(funding: OutPoint, target: [u8; 32], previous: [u8; 32]) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput { previous_output: funding, script_sig: Vec::new(), sequence: 0 }],
            outputs: vec![TxOutput { value: 0, script_pubkey: anchor_script(&target, &previous) }],
            lock_time: 0,
        }
    }

    #[test]
    fn coinbase_funds_wallet_and_utxo_set() {
        let mut f = fixture();
        let block = f.insert(Vec::new()).unwrap();
        assert_eq!(f.state.lock().unwrap().wallet.as_ref().unwrap().balance(), 100_000);
        let outpoint = OutPoint { txid: block.transactions[0].txid(), index: 0 };
        assert!(f.token.utxo().get(&outpoint).unwrap().is_some());
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn winning_anchor_is_recorded_and_announced() {
        let mut f = fixture();
        let funding = f.insert(Vec::new()).unwrap();
        let outpoint = OutPoint { txid: funding.transactions[0].txid(), index: 0 };

        let block = f.insert(vec![foreign_anchor(outpoint, [0x55; 32], HASH_ANCHOR_GENESIS)]).unwrap();
        let AnchorEvent::Winner { record, block: mined, .. } = f.events.try_recv().unwrap();
        assert_eq!(record.hash_parent, block.hash());
        assert_eq!(record.height_parent, 2);
        assert_eq!(record.hash_child, [0x55; 32]);
        assert!(mined.is_none());
        assert!(f.registry.read().unwrap().contains_child(&[0x55; 32]));
    }

    #[test]
    fn replayed_anchor_is_recorded_but_not_announced_again() {
        let mut f = fixture();
        let funding = f.insert(Vec::new()).unwrap();
        let outpoint = OutPoint { txid: funding.transactions[0].txid(), index: 0 };

        f.token.set_replaying(true);
        let replayed = f.insert(vec![foreign_anchor(outpoint, [0x55; 32], HASH_ANCHOR_GENESIS)]).unwrap();
        assert!(f.registry.read().unwrap().contains_child(&[0x55; 32]));
        assert!(f.events.try_recv().is_err());

        f.token.set_replaying(false);
        let outpoint = OutPoint { txid: replayed.transactions[0].txid(), index: 0 };
        f.insert(vec![foreign_anchor(outpoint, [0x56; 32], [0x55; 32])]).unwrap();
        let AnchorEvent::Winner { record, .. } = f.events.try_recv().unwrap();
        assert_eq!(record.hash_child, [0x56; 32]);
    }

    #[test]
    fn unknown_input_rejects_block_without_side_effects() {
        let mut f = fixture();
        f.insert(Vec::new()).unwrap();
        let missing = OutPoint { txid: [9; 32], index: 0 };
        let err = f.insert(vec![foreign_anchor(missing, [0x55; 32], HASH_ANCHOR_GENESIS)]).unwrap_err();
        assert!(err.is_protocol());
        assert!(f.registry.read().unwrap().is_empty());
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn image_carries_utxo_wallet_and_anchors() {
        let mut f = fixture();
        let funding = f.insert(Vec::new()).unwrap();
        let outpoint = OutPoint { txid: funding.transactions[0].txid(), index: 0 };
        f.insert(vec![foreign_anchor(outpoint, [0x55; 32], HASH_ANCHOR_GENESIS)]).unwrap();

        let image = tempfile::tempdir().unwrap();
        f.token.create_image(image.path()).unwrap();
        f.token.reset().unwrap();
        assert!(f.registry.read().unwrap().is_empty());
        assert_eq!(f.state.lock().unwrap().wallet.as_ref().unwrap().balance(), 0);

        f.token.load_image(image.path()).unwrap();
        assert!(f.registry.read().unwrap().contains_child(&[0x55; 32]));
        // The anchor spent the first coinbase; the second one is left.
        assert_eq!(f.state.lock().unwrap().wallet.as_ref().unwrap().balance(), 100_000);
        assert_eq!(f.token.utxo().height(), 2);
    }
}
