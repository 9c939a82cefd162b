// btoken_node/src/blockchain/block.rs

use std::io::Cursor;

use crate::blockchain::header::{Header, HEADER_SIZE};
use crate::blockchain::transaction::{merkle_root, Transaction};
use crate::chainparams::ChainParams;
use crate::codec::{read_var_int, write_var_int, Decodable, Encodable};
use crate::error::ChainError;
use crate::util::Hash;

const MAX_TRANSACTIONS_PER_BLOCK: u64 = 100_000;

/// A block as it travels on the wire and sits in the archive.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: Header,
    /// Exact serialized bytes, header included.
    pub buffer: Vec<u8>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Parses one block starting at `offset`. The returned block owns a copy
    /// of exactly the bytes it spans, so `buffer.len()` is its archive length.
    pub fn parse(buffer: &[u8], offset: usize, params: &ChainParams) -> Result<Self, ChainError> {
        let header = Header::parse(buffer, offset, params)?;
        let mut cursor = Cursor::new(&buffer[offset + HEADER_SIZE..]);
        let count = read_var_int(&mut cursor)?;
        if count == 0 || count > MAX_TRANSACTIONS_PER_BLOCK {
            return Err(ChainError::protocol(format!("block transaction count {} out of bounds", count)));
        }
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(&mut cursor)?);
        }
        let length = HEADER_SIZE + cursor.position() as usize;
        Ok(Block {
            header,
            buffer: buffer[offset..offset + length].to_vec(),
            transactions,
        })
    }

    /// Assembles a block from a freshly created header and its transactions.
    pub fn from_parts(header: Header, transactions: Vec<Transaction>) -> Self {
        let mut buffer = header.serialize().to_vec();
        // Writing into a Vec cannot fail.
        let _ = write_var_int(&mut buffer, transactions.len() as u64);
        for tx in &transactions {
            let _ = tx.consensus_encode(&mut buffer);
        }
        Block { header, buffer, transactions }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }

    pub fn calculate_merkle_root(&self) -> Hash {
        merkle_root(&self.txids())
    }

    pub fn validate_merkle_root(&self) -> Result<(), ChainError> {
        if self.calculate_merkle_root() != self.header.merkle_root {
            return Err(ChainError::protocol(format!(
                "merkle root mismatch in block {}",
                hex::encode(&self.header.hash[..8])
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{OutPoint, TxInput, TxOutput};

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: [0u8; 32], index: u32::MAX },
                script_sig: vec![tag],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput { value: 50, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    #[test]
    fn parse_recovers_block_boundaries() {
        let params = ChainParams::btoken();
        let txs = vec![coinbase(1), coinbase(2)];
        let root = merkle_root(&txs.iter().map(|t| t.txid()).collect::<Vec<_>>());
        let header = Header::new(1, [0u8; 32], root, 10, 0x207fffff, 0, &params);
        let block = Block::from_parts(header, txs);

        let mut segment = block.buffer.clone();
        segment.extend_from_slice(&block.buffer);
        let first = Block::parse(&segment, 0, &params).unwrap();
        let second = Block::parse(&segment, first.buffer.len(), &params).unwrap();
        assert_eq!(first.buffer, block.buffer);
        assert_eq!(second.hash(), block.hash());
        assert!(second.validate_merkle_root().is_ok());
        assert!(second.transactions[0].is_coinbase());
    }

    #[test]
    fn truncated_block_fails_to_parse() {
        let params = ChainParams::btoken();
        let header = Header::new(1, [0u8; 32], coinbase(1).txid(), 10, 0x207fffff, 0, &params);
        let block = Block::from_parts(header, vec![coinbase(1)]);
        let cut = &block.buffer[..block.buffer.len() - 3];
        assert!(Block::parse(cut, 0, &params).is_err());
    }

    #[test]
    fn wrong_merkle_root_is_a_protocol_error() {
        let params = ChainParams::btoken();
        let header = Header::new(1, [0u8; 32], [9u8; 32], 10, 0x207fffff, 0, &params);
        let block = Block::from_parts(header, vec![coinbase(1)]);
        assert!(block.validate_merkle_root().unwrap_err().is_protocol());
    }
}
