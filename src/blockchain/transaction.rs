// btoken_node/src/blockchain/transaction.rs

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Write};

use crate::codec::{read_hash, read_var_bytes, read_var_int, write_var_bytes, write_var_int, Decodable, Encodable};
use crate::util::{sha256d, Hash};

pub const OP_RETURN: u8 = 0x6a;
pub const OP_CHECKSIG: u8 = 0xac;
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutput {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    /// Data-carrying outputs can never be spent.
    pub fn is_data(&self) -> bool {
        self.script_pubkey.first() == Some(&OP_RETURN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash {
        sha256d(&self.to_bytes())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].previous_output.txid == [0u8; 32]
            && self.inputs[0].previous_output.index == u32::MAX
    }

    pub fn value_out(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_all(&self.txid)?;
        w.write_u32::<LittleEndian>(self.index)?;
        Ok(36)
    }
}

impl Decodable for OutPoint {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        Ok(OutPoint { txid: read_hash(r)?, index: r.read_u32::<LittleEndian>()? })
    }
}

impl Encodable for TxInput {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = self.previous_output.consensus_encode(w)?;
        written += write_var_bytes(w, &self.script_sig)?;
        w.write_u32::<LittleEndian>(self.sequence)?;
        Ok(written + 4)
    }
}

impl Decodable for TxInput {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let previous_output = OutPoint::consensus_decode(r)?;
        let script_sig = read_var_bytes(r)?;
        let sequence = r.read_u32::<LittleEndian>()?;
        Ok(TxInput { previous_output, script_sig, sequence })
    }
}

impl Encodable for TxOutput {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_i64::<LittleEndian>(self.value)?;
        Ok(8 + write_var_bytes(w, &self.script_pubkey)?)
    }
}

impl Decodable for TxOutput {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let value = r.read_i64::<LittleEndian>()?;
        let script_pubkey = read_var_bytes(r)?;
        Ok(TxOutput { value, script_pubkey })
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut written = 0;
        w.write_i32::<LittleEndian>(self.version)?;
        written += 4;
        written += write_var_int(w, self.inputs.len() as u64)?;
        for input in &self.inputs {
            written += input.consensus_encode(w)?;
        }
        written += write_var_int(w, self.outputs.len() as u64)?;
        for output in &self.outputs {
            written += output.consensus_encode(w)?;
        }
        w.write_u32::<LittleEndian>(self.lock_time)?;
        Ok(written + 4)
    }
}

impl Decodable for Transaction {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        let version = r.read_i32::<LittleEndian>()?;
        let count_inputs = read_var_int(r)?;
        if count_inputs > 100_000 {
            return Err(IoError::new(IoErrorKind::InvalidData, "tx input count > max"));
        }
        let mut inputs = Vec::with_capacity(count_inputs as usize);
        for _ in 0..count_inputs {
            inputs.push(TxInput::consensus_decode(r)?);
        }
        let count_outputs = read_var_int(r)?;
        if count_outputs > 100_000 {
            return Err(IoError::new(IoErrorKind::InvalidData, "tx output count > max"));
        }
        let mut outputs = Vec::with_capacity(count_outputs as usize);
        for _ in 0..count_outputs {
            outputs.push(TxOutput::consensus_decode(r)?);
        }
        let lock_time = r.read_u32::<LittleEndian>()?;
        Ok(Transaction { version, inputs, outputs, lock_time })
    }
}

pub fn merkle_root(txids: &[Hash]) -> Hash {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut merkle_tree = txids.to_vec();
    while merkle_tree.len() > 1 {
        if merkle_tree.len() % 2 != 0 {
            if let Some(last_hash) = merkle_tree.last().cloned() {
                merkle_tree.push(last_hash);
            }
        }
        merkle_tree = merkle_tree
            .chunks_exact(2)
            .map(|pair| {
                let mut concat = Vec::with_capacity(64);
                concat.extend_from_slice(&pair[0]);
                concat.extend_from_slice(&pair[1]);
                sha256d(&concat)
            })
            .collect();
    }
    merkle_tree[0]
}
