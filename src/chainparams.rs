// btoken_node/src/chainparams.rs
// Consensus constants for the parent chain and the anchor chain.

use crate::util::{hash_from_display, Hash, HASH_ZERO};

/// How a header's instantaneous difficulty is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyRule {
    /// Difficulty follows the compact target and the header must meet it.
    ProofOfWork,
    /// Every block weighs 1.0; security comes from the anchoring parent block.
    Anchored,
}

#[derive(Debug, Clone)]
pub struct GenesisParams {
    pub version: i32,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub name: &'static str,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub protocol_version: i32,
    pub pow_limit_bits: u32,
    pub difficulty_rule: DifficultyRule,
    pub checkpoints: Vec<(u32, Hash)>,
    pub genesis: GenesisParams,
    pub seeds: Vec<&'static str>,
}

// Constant hex literals only.
fn display_hash(text: &str) -> Hash {
    hash_from_display(text).expect("Failed to decode hash constant")
}

impl ChainParams {
    pub fn bitcoin_mainnet() -> Self {
        ChainParams {
            name: "bitcoin",
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            protocol_version: 70015,
            pow_limit_bits: 0x1d00ffff,
            difficulty_rule: DifficultyRule::ProofOfWork,
            checkpoints: vec![
                (11111, display_hash("0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d")),
                (33333, display_hash("000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6")),
                (74000, display_hash("0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20")),
                (105000, display_hash("00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97")),
                (134444, display_hash("00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe")),
                (168000, display_hash("000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763")),
            ],
            genesis: GenesisParams {
                version: 1,
                merkle_root: display_hash("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"),
                timestamp: 1231006505,
                bits: 0x1d00ffff,
                nonce: 2083236893,
            },
            seeds: vec![
                "seed.bitcoin.sipa.be:8333",
                "dnsseed.bluematt.me:8333",
                "seed.bitcoinstats.com:8333",
            ],
        }
    }

    /// Minimal-difficulty parent chain for local networks and tests.
    pub fn bitcoin_regtest() -> Self {
        ChainParams {
            name: "bitcoin-regtest",
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
            protocol_version: 70015,
            pow_limit_bits: 0x207fffff,
            difficulty_rule: DifficultyRule::ProofOfWork,
            checkpoints: Vec::new(),
            genesis: GenesisParams {
                version: 1,
                merkle_root: display_hash("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"),
                timestamp: 1296688602,
                bits: 0x207fffff,
                nonce: 2,
            },
            seeds: Vec::new(),
        }
    }

    pub fn btoken() -> Self {
        ChainParams {
            name: "btoken",
            magic: [0x42, 0x54, 0x4b, 0x4e],
            default_port: 8335,
            protocol_version: 70015,
            pow_limit_bits: 0x207fffff,
            difficulty_rule: DifficultyRule::Anchored,
            checkpoints: Vec::new(),
            genesis: GenesisParams {
                version: 1,
                merkle_root: HASH_ZERO,
                timestamp: 1700000000,
                bits: 0x207fffff,
                nonce: 0,
            },
            seeds: Vec::new(),
        }
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Hash> {
        self.checkpoints.iter().find(|(h, _)| *h == height).map(|(_, hash)| hash)
    }

    pub fn last_checkpoint_height(&self) -> u32 {
        self.checkpoints.iter().map(|(h, _)| *h).max().unwrap_or(0)
    }
}
