// btoken_node/src/anchor/wallet.rs
// Spendable-output pool and signer funding anchor transactions.

use std::fs;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use serde::Serialize;

use crate::blockchain::block::Block;
use crate::blockchain::transaction::{OutPoint, Transaction, TxInput, TxOutput, OP_CHECKSIG};
use crate::codec::{read_hash, Encodable};
use crate::error::NodeError;
use crate::util::{sha256d, Hash};

pub const FILE_IMAGE_WALLET: &str = "ImageWallet";
pub const LENGTH_SCRIPT_P2PK: usize = 35;
const SIZE_IMAGE_WALLET_RECORD: usize = 32 + 4 + 8 + LENGTH_SCRIPT_P2PK;

pub const COUNT_INPUTS_MAX: usize = 25;
pub const FEE_BYTES_TRANSACTION: f64 = 44.0;
pub const FEE_BYTES_ANCHOR: f64 = 78.0;
pub const FEE_BYTES_INPUT: f64 = 148.0;
pub const VALUE_DUST: i64 = 546;

const SIGHASH_ALL: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendableOutput {
    pub outpoint: OutPoint,
    pub value: i64,
    #[serde(skip)]
    pub script_pubkey: Vec<u8>,
}

/// Fee of an anchor transaction spending `count_inputs` outputs.
pub fn anchor_fee(fee_per_byte: f64, count_inputs: usize) -> i64 {
    (fee_per_byte * (FEE_BYTES_TRANSACTION + FEE_BYTES_ANCHOR + FEE_BYTES_INPUT * count_inputs as f64)).ceil() as i64
}

/// Capability that funds and signs anchor transactions.
pub trait Wallet: Send {
    fn script_pubkey(&self) -> &[u8];

    fn outputs(&self) -> &[SpendableOutput];

    fn balance(&self) -> i64 {
        self.outputs().iter().map(|o| o.value).sum()
    }

    /// Signs a transaction carrying `script_anchor`, funded from the pool.
    /// The spent outputs leave the pool and are returned alongside. `None`
    /// when the pool cannot cover the fee.
    fn create_anchor_transaction(
        &mut self,
        script_anchor: Vec<u8>,
        fee_per_byte: f64,
        sequence: u32,
    ) -> Option<(Transaction, Vec<SpendableOutput>)>;

    /// Puts outputs of a superseded transaction back into the pool.
    fn restore_outputs(&mut self, outputs: Vec<SpendableOutput>);

    /// Tracks outputs paying this wallet and drops the ones a block spends.
    fn detect_block(&mut self, block: &Block);

    fn load_image(&mut self, path: &Path) -> Result<(), IoError>;

    fn create_image(&self, path: &Path) -> Result<(), IoError>;

    fn clear(&mut self);
}

pub struct KeyWallet {
    secret: SecretKey,
    script_pubkey: Vec<u8>,
    outputs: Vec<SpendableOutput>,
}

impl std::fmt::Debug for KeyWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyWallet")
            .field("script_pubkey", &hex::encode(&self.script_pubkey))
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl KeyWallet {
    pub fn new(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        let mut script_pubkey = Vec::with_capacity(LENGTH_SCRIPT_P2PK);
        script_pubkey.push(33);
        script_pubkey.extend_from_slice(&public.serialize());
        script_pubkey.push(OP_CHECKSIG);
        KeyWallet { secret, script_pubkey, outputs: Vec::new() }
    }

    pub fn from_hex(secret_hex: &str) -> Result<Self, NodeError> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|e| NodeError::Key(e.to_string()))?;
        let secret = SecretKey::from_slice(&bytes).map_err(|e| NodeError::Key(e.to_string()))?;
        Ok(Self::new(secret))
    }

    /// Legacy SIGHASH_ALL digest of input `index` spending `script_code`.
    pub fn signature_hash(tx: &Transaction, index: usize, script_code: &[u8]) -> Hash {
        let mut copy = tx.clone();
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            input.script_sig = if i == index { script_code.to_vec() } else { Vec::new() };
        }
        let mut bytes = copy.to_bytes();
        // Writing into a Vec cannot fail.
        let _ = bytes.write_u32::<LittleEndian>(SIGHASH_ALL);
        sha256d(&bytes)
    }

    fn sign(&self, tx: &mut Transaction, spent: &[SpendableOutput]) {
        let script_sigs: Vec<Vec<u8>> = spent
            .iter()
            .enumerate()
            .map(|(index, output)| {
                let digest = Self::signature_hash(tx, index, &output.script_pubkey);
                let signature = SECP256K1.sign_ecdsa(&Message::from_digest(digest), &self.secret);
                let mut push = signature.serialize_der().to_vec();
                push.push(SIGHASH_ALL as u8);
                let mut script_sig = Vec::with_capacity(push.len() + 1);
                script_sig.push(push.len() as u8);
                script_sig.extend_from_slice(&push);
                script_sig
            })
            .collect();
        for (input, script_sig) in tx.inputs.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
    }
}

impl Wallet for KeyWallet {
    fn script_pubkey(&self) -> &[u8] {
        &self.script_pubkey
    }

    fn outputs(&self) -> &[SpendableOutput] {
        &self.outputs
    }

    fn create_anchor_transaction(
        &mut self,
        script_anchor: Vec<u8>,
        fee_per_byte: f64,
        sequence: u32,
    ) -> Option<(Transaction, Vec<SpendableOutput>)> {
        let mut value_inputs = 0i64;
        let mut count_inputs = 0usize;
        for output in self.outputs.iter().take(COUNT_INPUTS_MAX) {
            value_inputs += output.value;
            count_inputs += 1;
            if value_inputs >= anchor_fee(fee_per_byte, count_inputs) {
                break;
            }
        }
        let fee = anchor_fee(fee_per_byte, count_inputs);
        if count_inputs == 0 || value_inputs < fee {
            debug!("Wallet holds {} in {} outputs, anchor fee needs {}", self.balance(), self.outputs.len(), fee);
            return None;
        }

        let spent: Vec<SpendableOutput> = self.outputs.drain(..count_inputs).collect();
        let mut tx = Transaction {
            version: 1,
            inputs: spent
                .iter()
                .map(|output| TxInput { previous_output: output.outpoint, script_sig: Vec::new(), sequence })
                .collect(),
            outputs: vec![TxOutput { value: 0, script_pubkey: script_anchor }],
            lock_time: 0,
        };
        let change = value_inputs - fee;
        if change >= VALUE_DUST {
            tx.outputs.push(TxOutput { value: change, script_pubkey: self.script_pubkey.clone() });
        }
        self.sign(&mut tx, &spent);
        Some((tx, spent))
    }

    fn restore_outputs(&mut self, outputs: Vec<SpendableOutput>) {
        for output in outputs {
            if !self.outputs.iter().any(|o| o.outpoint == output.outpoint) {
                self.outputs.push(output);
            }
        }
    }

    fn detect_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            let before = self.outputs.len();
            self.outputs
                .retain(|output| !tx.inputs.iter().any(|input| input.previous_output == output.outpoint));
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate() {
                if output.script_pubkey != self.script_pubkey {
                    continue;
                }
                let outpoint = OutPoint { txid, index: index as u32 };
                if !self.outputs.iter().any(|o| o.outpoint == outpoint) {
                    self.outputs.push(SpendableOutput {
                        outpoint,
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                    });
                    info!("Wallet received {} in {}:{}", output.value, hex::encode(&txid[..8]), index);
                }
            }
            if self.outputs.len() < before {
                debug!("Wallet outputs spent by {}", hex::encode(&txid[..8]));
            }
        }
    }

    fn load_image(&mut self, path: &Path) -> Result<(), IoError> {
        self.outputs.clear();
        let bytes = match fs::read(path.join(FILE_IMAGE_WALLET)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if bytes.len() % SIZE_IMAGE_WALLET_RECORD != 0 {
            return Err(IoError::new(IoErrorKind::InvalidData, "torn wallet image record"));
        }
        for mut record in bytes.chunks_exact(SIZE_IMAGE_WALLET_RECORD) {
            let txid = read_hash(&mut record)?;
            let index = record.read_u32::<LittleEndian>()?;
            let value = record.read_i64::<LittleEndian>()?;
            self.outputs.push(SpendableOutput {
                outpoint: OutPoint { txid, index },
                value,
                script_pubkey: record.to_vec(),
            });
        }
        Ok(())
    }

    fn create_image(&self, path: &Path) -> Result<(), IoError> {
        let mut bytes = Vec::with_capacity(self.outputs.len() * SIZE_IMAGE_WALLET_RECORD);
        for output in self.outputs.iter().filter(|o| o.script_pubkey.len() == LENGTH_SCRIPT_P2PK) {
            bytes.write_all(&output.outpoint.txid)?;
            bytes.write_u32::<LittleEndian>(output.outpoint.index)?;
            bytes.write_i64::<LittleEndian>(output.value)?;
            bytes.write_all(&output.script_pubkey)?;
        }
        fs::write(path.join(FILE_IMAGE_WALLET), bytes)
    }

    fn clear(&mut self) {
        self.outputs.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::anchor::anchor_script;
    use crate::blockchain::header::Header;
    use crate::chainparams::ChainParams;
    use secp256k1::ecdsa::Signature;

    pub fn wallet() -> KeyWallet {
        KeyWallet::from_hex("0101010101010101010101010101010101010101010101010101010101010101").unwrap()
    }

    /// A block paying `values` to the wallet, one output each.
    pub fn funding_block(wallet: &KeyWallet, values: &[i64]) -> Block {
        let params = ChainParams::bitcoin_regtest();
        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: [0u8; 32], index: u32::MAX },
                script_sig: vec![1],
                sequence: u32::MAX,
            }],
            outputs: values
                .iter()
                .map(|v| TxOutput { value: *v, script_pubkey: wallet.script_pubkey().to_vec() })
                .collect(),
            lock_time: 0,
        };
        let header = Header::new(1, [0u8; 32], tx.txid(), 1, params.pow_limit_bits, 0, &params);
        Block::from_parts(header, vec![tx])
    }

    #[test]
    fn funded_transaction_is_signed_and_carries_change() {
        let mut wallet = wallet();
        wallet.detect_block(&funding_block(&wallet, &[10_000, 20_000]));
        assert_eq!(wallet.balance(), 30_000);

        let (tx, spent) = wallet.create_anchor_transaction(anchor_script(&[1; 32], &[2; 32]), 1.0, 4).unwrap();
        assert_eq!(spent.len(), 1);
        assert_eq!(wallet.outputs().len(), 1);
        assert_eq!(tx.inputs[0].sequence, 4);
        assert_eq!(tx.outputs[1].value, 10_000 - anchor_fee(1.0, 1));

        let script_sig = &tx.inputs[0].script_sig;
        let der = &script_sig[1..script_sig.len() - 1];
        let digest = KeyWallet::signature_hash(&tx, 0, &spent[0].script_pubkey);
        let public = PublicKey::from_slice(&wallet.script_pubkey()[1..34]).unwrap();
        SECP256K1
            .verify_ecdsa(&Message::from_digest(digest), &Signature::from_der(der).unwrap(), &public)
            .unwrap();
    }

    #[test]
    fn insufficient_funds_produce_nothing() {
        let mut wallet = wallet();
        wallet.detect_block(&funding_block(&wallet, &[100, 100]));
        assert!(wallet.create_anchor_transaction(anchor_script(&[1; 32], &[2; 32]), 1.0, 0).is_none());
        assert_eq!(wallet.outputs().len(), 2);
    }

    #[test]
    fn dust_change_goes_to_fee() {
        let mut wallet = wallet();
        let fee = anchor_fee(1.0, 1);
        wallet.detect_block(&funding_block(&wallet, &[fee + VALUE_DUST - 1]));
        let (tx, _) = wallet.create_anchor_transaction(anchor_script(&[1; 32], &[2; 32]), 1.0, 0).unwrap();
        assert_eq!(tx.outputs.len(), 1);
    }

    #[test]
    fn spent_outputs_leave_and_restore() {
        let mut wallet = wallet();
        let funding = funding_block(&wallet, &[50_000]);
        wallet.detect_block(&funding);
        let (tx, spent) = wallet.create_anchor_transaction(anchor_script(&[1; 32], &[2; 32]), 2.0, 0).unwrap();
        assert_eq!(wallet.balance(), 0);
        wallet.restore_outputs(spent.clone());
        wallet.restore_outputs(spent);
        assert_eq!(wallet.balance(), 50_000);

        // Confirmation spends the original output and pays change back.
        let params = ChainParams::bitcoin_regtest();
        let header = Header::new(1, funding.hash(), tx.txid(), 2, params.pow_limit_bits, 0, &params);
        wallet.detect_block(&Block::from_parts(header, vec![tx.clone()]));
        assert_eq!(wallet.outputs().len(), 1);
        assert_eq!(wallet.outputs()[0].outpoint.txid, tx.txid());
    }

    #[test]
    fn image_keeps_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallet = wallet();
        wallet.detect_block(&funding_block(&wallet, &[1_000, 2_000, 3_000]));
        wallet.create_image(dir.path()).unwrap();
        assert_eq!(
            std::fs::metadata(dir.path().join(FILE_IMAGE_WALLET)).unwrap().len() as usize,
            3 * SIZE_IMAGE_WALLET_RECORD
        );
        let mut restored = self::wallet();
        restored.load_image(dir.path()).unwrap();
        assert_eq!(restored.outputs(), wallet.outputs());
    }
}
