use thiserror::Error;

use crate::util::{hash_to_display, Hash};

/// Failures raised by chain validation, archiving and domain insertion.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Peer or stored data violates consensus or format rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Anchor-chain block whose anchoring parent block is not known yet.
    #[error("block {} is not anchored in the parent chain yet", hash_to_display(.0))]
    NotSynchronizedWithParent(Hash),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ChainError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ChainError::Protocol(message.into())
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, ChainError::Protocol(_))
    }
}

/// Errors that stop the node from booting.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid wallet key: {0}")]
    Key(String),
}

pub type Result<T> = std::result::Result<T, ChainError>;
