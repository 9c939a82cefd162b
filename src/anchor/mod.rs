// btoken_node/src/anchor/mod.rs
// Cross-chain binding of anchor-chain blocks to parent-chain transactions.

pub mod miner;
pub mod resolver;
pub mod wallet;

use std::collections::HashMap;
use std::fs;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::blockchain::block::Block;
use crate::blockchain::transaction::{Transaction, OP_RETURN};
use crate::codec::read_hash;
use crate::util::{hash_to_display, Hash};

pub use resolver::AnchorResolver;
pub use wallet::{KeyWallet, SpendableOutput, Wallet};

/// Token id followed by the target and previous hashes.
pub const LENGTH_DATA_ANCHOR_TOKEN: usize = 66;
pub const ID_ANCHOR_TOKEN: [u8; 2] = *b"BT";
pub const LENGTH_SCRIPT_ANCHOR_TOKEN: usize = LENGTH_DATA_ANCHOR_TOKEN + 2;

pub const FILE_IMAGE_ANCHORS: &str = "ImageAnchors";
const SIZE_IMAGE_ANCHOR_RECORD: usize = 4 + 32 * 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAnchor {
    pub hash_target: Hash,
    pub hash_previous: Hash,
    pub txid: Hash,
    /// Summed value of the transaction's spendable outputs.
    pub value_change: i64,
    /// Replace-by-fee sequence, carried in the input sequence field.
    pub sequence: u32,
}

/// Output script carrying an anchor: `OP_RETURN <66> "BT" target previous`.
pub fn anchor_script(hash_target: &Hash, hash_previous: &Hash) -> Vec<u8> {
    let mut script = Vec::with_capacity(LENGTH_SCRIPT_ANCHOR_TOKEN);
    script.push(OP_RETURN);
    script.push(LENGTH_DATA_ANCHOR_TOKEN as u8);
    script.extend_from_slice(&ID_ANCHOR_TOKEN);
    script.extend_from_slice(hash_target);
    script.extend_from_slice(hash_previous);
    script
}

/// Target and previous hash of an anchor script. Any mismatch in opcode,
/// length byte or token id rejects the script without looking further.
pub fn parse_anchor_script(script: &[u8]) -> Option<(Hash, Hash)> {
    if script.first() != Some(&OP_RETURN) {
        return None;
    }
    if script.get(1) != Some(&(LENGTH_DATA_ANCHOR_TOKEN as u8)) || script.len() != LENGTH_SCRIPT_ANCHOR_TOKEN {
        return None;
    }
    if script[2..4] != ID_ANCHOR_TOKEN {
        return None;
    }
    let mut hash_target = [0u8; 32];
    let mut hash_previous = [0u8; 32];
    hash_target.copy_from_slice(&script[4..36]);
    hash_previous.copy_from_slice(&script[36..68]);
    Some((hash_target, hash_previous))
}

pub fn detect_anchor(tx: &Transaction) -> Option<TokenAnchor> {
    let (hash_target, hash_previous) = tx.outputs.iter().find_map(|output| parse_anchor_script(&output.script_pubkey))?;
    Some(TokenAnchor {
        hash_target,
        hash_previous,
        txid: tx.txid(),
        value_change: tx.outputs.iter().filter(|o| !o.is_data()).map(|o| o.value).sum(),
        sequence: tx.inputs.first().map(|input| input.sequence).unwrap_or(0),
    })
}

/// A parent-chain block and the anchor-chain block its winning anchor binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnchorRecord {
    pub height_parent: u32,
    #[serde(serialize_with = "serialize_hash")]
    pub hash_parent: Hash,
    #[serde(serialize_with = "serialize_hash")]
    pub hash_child: Hash,
    #[serde(serialize_with = "serialize_hash")]
    pub txid: Hash,
}

fn serialize_hash<S: serde::Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hash_to_display(hash))
}

/// Winning anchors in parent-chain order. Written by the parent chain's
/// token, read by the anchor chain to decide whether a block is anchored.
#[derive(Debug, Default)]
pub struct AnchorRegistry {
    records: Vec<AnchorRecord>,
    by_child: HashMap<Hash, usize>,
}

impl AnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: AnchorRecord) {
        self.by_child.insert(record.hash_child, self.records.len());
        self.records.push(record);
    }

    pub fn contains_child(&self, hash: &Hash) -> bool {
        self.by_child.contains_key(hash)
    }

    pub fn record_of_child(&self, hash: &Hash) -> Option<&AnchorRecord> {
        self.by_child.get(hash).map(|i| &self.records[*i])
    }

    pub fn latest(&self) -> Option<&AnchorRecord> {
        self.records.last()
    }

    /// Records from the newest backwards.
    pub fn iter_back(&self) -> impl Iterator<Item = &AnchorRecord> {
        self.records.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_child.clear();
    }

    pub fn create_image(&self, path: &Path) -> Result<(), IoError> {
        let mut bytes = Vec::with_capacity(self.records.len() * SIZE_IMAGE_ANCHOR_RECORD);
        for record in &self.records {
            bytes.write_u32::<LittleEndian>(record.height_parent)?;
            bytes.write_all(&record.hash_parent)?;
            bytes.write_all(&record.hash_child)?;
            bytes.write_all(&record.txid)?;
        }
        fs::write(path.join(FILE_IMAGE_ANCHORS), bytes)
    }

    pub fn load_image(&mut self, path: &Path) -> Result<(), IoError> {
        self.clear();
        let bytes = match fs::read(path.join(FILE_IMAGE_ANCHORS)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if bytes.len() % SIZE_IMAGE_ANCHOR_RECORD != 0 {
            return Err(IoError::new(IoErrorKind::InvalidData, "torn anchor image record"));
        }
        for mut record in bytes.chunks_exact(SIZE_IMAGE_ANCHOR_RECORD) {
            let height_parent = record.read_u32::<LittleEndian>()?;
            let hash_parent = read_hash(&mut record)?;
            let hash_child = read_hash(&mut record)?;
            let txid = read_hash(&mut record)?;
            self.push(AnchorRecord { height_parent, hash_parent, hash_child, txid });
        }
        Ok(())
    }
}

/// Raised by the parent chain when a parent block settles an anchor.
#[derive(Debug, Clone)]
pub enum AnchorEvent {
    Winner {
        record: AnchorRecord,
        anchor: TokenAnchor,
        /// The anchor-chain block, when this node mined the winning anchor.
        block: Option<Block>,
    },
}

/// Wallet and resolver, owned together by whoever holds the lock: the parent
/// chain's token during block insertion and the mining loop in between.
pub struct AnchorState {
    pub wallet: Option<Box<dyn Wallet>>,
    pub resolver: AnchorResolver,
}

impl AnchorState {
    pub fn new(wallet: Option<Box<dyn Wallet>>, hash_genesis_child: Hash) -> Self {
        AnchorState { wallet, resolver: AnchorResolver::new(hash_genesis_child) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{OutPoint, TxInput, TxOutput};

    fn transaction_with(script: Vec<u8>, sequence: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: [3u8; 32], index: 0 },
                script_sig: Vec::new(),
                sequence,
            }],
            outputs: vec![
                TxOutput { value: 0, script_pubkey: script },
                TxOutput { value: 700, script_pubkey: vec![0x51] },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn anchor_script_is_detected() {
        let script = anchor_script(&[1u8; 32], &[2u8; 32]);
        assert_eq!(script.len(), LENGTH_SCRIPT_ANCHOR_TOKEN);
        let tx = transaction_with(script, 3);
        let anchor = detect_anchor(&tx).unwrap();
        assert_eq!(anchor.hash_target, [1u8; 32]);
        assert_eq!(anchor.hash_previous, [2u8; 32]);
        assert_eq!(anchor.sequence, 3);
        assert_eq!(anchor.value_change, 700);
        assert_eq!(anchor.txid, tx.txid());
    }

    #[test]
    fn scripts_without_op_return_are_never_anchors() {
        let mut script = anchor_script(&[1u8; 32], &[2u8; 32]);
        for first in [0x00u8, 0x51, 0x6b, 0xac] {
            script[0] = first;
            assert!(parse_anchor_script(&script).is_none());
            assert!(detect_anchor(&transaction_with(script.clone(), 0)).is_none());
        }
    }

    #[test]
    fn wrong_length_or_id_is_rejected() {
        let good = anchor_script(&[1u8; 32], &[2u8; 32]);
        let mut wrong_length = good.clone();
        wrong_length[1] = 0x41;
        assert!(parse_anchor_script(&wrong_length).is_none());
        let mut wrong_id = good.clone();
        wrong_id[3] = b'X';
        assert!(parse_anchor_script(&wrong_id).is_none());
        assert!(parse_anchor_script(&good[..67]).is_none());
        assert!(parse_anchor_script(&[OP_RETURN]).is_none());
    }

    #[test]
    fn registry_image_restores_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = AnchorRegistry::new();
        registry.push(AnchorRecord { height_parent: 7, hash_parent: [1; 32], hash_child: [2; 32], txid: [3; 32] });
        registry.push(AnchorRecord { height_parent: 9, hash_parent: [4; 32], hash_child: [5; 32], txid: [6; 32] });
        registry.create_image(dir.path()).unwrap();

        let mut restored = AnchorRegistry::new();
        restored.load_image(dir.path()).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.contains_child(&[5; 32]));
        assert_eq!(restored.record_of_child(&[2; 32]).unwrap().height_parent, 7);
        assert_eq!(restored.latest().unwrap().hash_parent, [4; 32]);
    }
}
