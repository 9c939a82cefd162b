// btoken_node/src/blockchain/header.rs

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{Cursor, Error as IoError, Read, Write};

use crate::chainparams::{ChainParams, DifficultyRule};
use crate::codec::{read_hash, Decodable, Encodable};
use crate::error::ChainError;
use crate::util::{sha256d, Hash};

pub const HEADER_SIZE: usize = 80;

/// Position of a header inside the header arena.
pub type HeaderId = usize;

/// Where a block's raw bytes live in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ArchiveLocation {
    pub segment: u32,
    pub offset: u32,
    pub length: u32,
}

impl ArchiveLocation {
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub hash: Hash,
    pub hash_previous: Hash,
    pub merkle_root: Hash,
    pub version: i32,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,

    pub difficulty: f64,
    pub difficulty_accumulated: f64,
    pub height: u32,
    pub location: Option<ArchiveLocation>,

    // Arena links; `next` is only set along the active chain.
    pub previous: Option<HeaderId>,
    pub next: Option<HeaderId>,
}

impl Header {
    pub fn new(
        version: i32,
        hash_previous: Hash,
        merkle_root: Hash,
        timestamp: u32,
        bits: u32,
        nonce: u32,
        params: &ChainParams,
    ) -> Self {
        let mut header = Header {
            hash: [0u8; 32],
            hash_previous,
            merkle_root,
            version,
            timestamp,
            bits,
            nonce,
            difficulty: 0.0,
            difficulty_accumulated: 0.0,
            height: 0,
            location: None,
            previous: None,
            next: None,
        };
        header.rehash();
        header.difficulty = header_difficulty(params, bits);
        header
    }

    /// Parses the 80 header bytes at `offset`.
    pub fn parse(buffer: &[u8], offset: usize, params: &ChainParams) -> Result<Self, ChainError> {
        let end = offset + HEADER_SIZE;
        if buffer.len() < end {
            return Err(ChainError::protocol(format!(
                "header needs {} bytes at offset {}, buffer has {}",
                HEADER_SIZE,
                offset,
                buffer.len()
            )));
        }
        let raw = RawHeader::consensus_decode(&mut Cursor::new(&buffer[offset..end]))?;
        Ok(raw.into_header(params))
    }

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..36].copy_from_slice(&self.hash_previous);
        bytes[36..68].copy_from_slice(&self.merkle_root);
        bytes[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.bits.to_le_bytes());
        bytes[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    pub fn rehash(&mut self) {
        self.hash = sha256d(&self.serialize());
    }

    pub fn to_raw(&self) -> RawHeader {
        RawHeader {
            version: self.version,
            hash_previous: self.hash_previous,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// True when the hash, read as a little-endian number, does not exceed the target.
    pub fn check_proof_of_work(&self, params: &ChainParams) -> bool {
        let (target, limit) = match (target_from_compact(self.bits), target_from_compact(params.pow_limit_bits)) {
            (Some(target), Some(limit)) => (target, limit),
            _ => return false,
        };
        if target > limit || target == [0u8; 32] {
            return false;
        }
        let mut hash_be = self.hash;
        hash_be.reverse();
        hash_be <= target
    }
}

/// The six consensus fields of a header as they travel on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawHeader {
    pub version: i32,
    pub hash_previous: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl RawHeader {
    pub fn into_header(self, params: &ChainParams) -> Header {
        Header::new(self.version, self.hash_previous, self.merkle_root, self.timestamp, self.bits, self.nonce, params)
    }
}

impl Encodable for RawHeader {
    fn consensus_encode<W: Write + WriteBytesExt>(&self, w: &mut W) -> Result<usize, IoError> {
        w.write_i32::<LittleEndian>(self.version)?;
        w.write_all(&self.hash_previous)?;
        w.write_all(&self.merkle_root)?;
        w.write_u32::<LittleEndian>(self.timestamp)?;
        w.write_u32::<LittleEndian>(self.bits)?;
        w.write_u32::<LittleEndian>(self.nonce)?;
        Ok(HEADER_SIZE)
    }
}

impl Decodable for RawHeader {
    fn consensus_decode<R: Read + ReadBytesExt>(r: &mut R) -> Result<Self, IoError> {
        Ok(RawHeader {
            version: r.read_i32::<LittleEndian>()?,
            hash_previous: read_hash(r)?,
            merkle_root: read_hash(r)?,
            timestamp: r.read_u32::<LittleEndian>()?,
            bits: r.read_u32::<LittleEndian>()?,
            nonce: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Expands a compact target into a big-endian 256-bit number.
pub fn target_from_compact(bits: u32) -> Option<[u8; 32]> {
    if bits & 0x0080_0000 != 0 {
        return None;
    }
    let exponent = (bits >> 24) as usize;
    let mut mantissa = bits & 0x007f_ffff;
    let mut target = [0u8; 32];
    if exponent <= 3 {
        mantissa >>= 8 * (3 - exponent) as u32;
        target[29] = (mantissa >> 16) as u8;
        target[30] = (mantissa >> 8) as u8;
        target[31] = mantissa as u8;
        return Some(target);
    }
    if exponent > 32 {
        return None;
    }
    target[32 - exponent] = (mantissa >> 16) as u8;
    target[33 - exponent] = (mantissa >> 8) as u8;
    target[34 - exponent] = mantissa as u8;
    Some(target)
}

fn target_as_f64(bits: u32) -> f64 {
    let exponent = (bits >> 24) as i32;
    let mantissa = (bits & 0x007f_ffff) as f64;
    mantissa * 256f64.powi(exponent - 3)
}

/// Work of a target relative to the chain's easiest target.
pub fn difficulty_from_bits(bits: u32, pow_limit_bits: u32) -> f64 {
    let target = target_as_f64(bits);
    if target <= 0.0 {
        return 0.0;
    }
    target_as_f64(pow_limit_bits) / target
}

pub fn header_difficulty(params: &ChainParams, bits: u32) -> f64 {
    match params.difficulty_rule {
        DifficultyRule::ProofOfWork => difficulty_from_bits(bits, params.pow_limit_bits),
        DifficultyRule::Anchored => 1.0,
    }
}
