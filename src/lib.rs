// btoken_node/src/lib.rs
// Dual-chain node: a Bitcoin parent chain carrying anchor transactions for
// the BToken chain, both synchronized over their own peer-to-peer networks.

pub mod anchor;
pub mod api_service;
pub mod blockchain;
pub mod chainparams;
pub mod codec;
pub mod config;
pub mod error;
pub mod p2p;
pub mod token;
pub mod util;
