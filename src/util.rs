// btoken_node/src/util.rs
// Hashing and hash formatting helpers shared by both chains.

use sha2::{Sha256, Digest};
use std::cmp::Ordering;

pub type Hash = [u8; 32];

pub const HASH_ZERO: Hash = [0u8; 32];

pub fn sha256d(data: &[u8]) -> Hash {
    let hash1 = Sha256::digest(data);
    let hash2 = Sha256::digest(hash1);
    let mut result = [0u8; 32];
    result.copy_from_slice(&hash2);
    result
}

// Made public for use by peer session tasks
pub fn calculate_checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d(payload);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash[0..4]);
    checksum
}

/// Hashes are stored in wire order; block explorers print them reversed.
pub fn hash_to_display(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

pub fn hash_from_display(text: &str) -> Result<Hash, hex::FromHexError> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(text, &mut hash)?;
    hash.reverse();
    Ok(hash)
}

/// Short prefix for log lines.
pub fn hash_short(hash: &Hash) -> String {
    hash_to_display(hash)[..16].to_string()
}

/// Compares two hashes as unsigned 256-bit little-endian integers.
pub fn compare_le(a: &Hash, b: &Hash) -> Ordering {
    for i in (0..32).rev() {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// `a - b` modulo 2^256, both read as little-endian integers.
pub fn subtract_wrapping_le(a: &Hash, b: &Hash) -> Hash {
    let mut result = [0u8; 32];
    let mut borrow = 0i16;
    for i in 0..32 {
        let mut diff = a[i] as i16 - b[i] as i16 - borrow;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        result[i] = diff as u8;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip_reverses_byte_order() {
        let text = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash_from_display(text).expect("valid hex");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash_to_display(&hash), text);
    }

    #[test]
    fn subtraction_borrows_across_bytes() {
        let mut a = [0u8; 32];
        a[1] = 1; // 256
        let mut b = [0u8; 32];
        b[0] = 1; // 1
        let diff = subtract_wrapping_le(&a, &b);
        assert_eq!(diff[0], 0xff);
        assert!(diff[1..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn subtraction_wraps_below_zero() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[0] = 1;
        assert_eq!(subtract_wrapping_le(&a, &b), [0xffu8; 32]);
    }

    #[test]
    fn comparison_uses_most_significant_byte_first() {
        let mut small = [0xffu8; 32];
        small[31] = 0;
        let mut large = [0u8; 32];
        large[31] = 1;
        assert_eq!(compare_le(&small, &large), Ordering::Less);
        assert_eq!(compare_le(&large, &large), Ordering::Equal);
    }
}
