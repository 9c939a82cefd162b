// btoken_node/src/config.rs
// Node settings: built-in defaults, then an optional TOML file, then
// BTOKEN__* environment variables.

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "btoken.toml";
pub const ENV_PREFIX: &str = "BTOKEN";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub api_listen_addr: String,
    /// Parent chain network: "mainnet" or "regtest".
    pub bitcoin_network: String,
    pub archive: ArchiveConfig,
    pub bitcoin: NetworkConfig,
    pub btoken: NetworkConfig,
    pub anchor: AnchorConfig,
    /// Upper bound on cached ledger entries kept in memory by the domain database.
    pub ledger_cache_max_entries: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub segment_size: u64,
    pub image_interval_segments: u32,
    pub loader_workers: usize,
    pub io_retry_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listening port; 0 picks the chain's default port.
    pub port: u16,
    pub listen: bool,
    /// Extra peers on top of the chain's seed addresses.
    pub seeds: Vec<String>,
    pub max_peers: usize,
    pub request_timeout_secs: u64,
    pub download_capacity: usize,
    pub blocks_per_request: usize,
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnchorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub fee_per_byte_initial: f64,
    pub fee_growth_factor: f64,
    /// Hex-encoded secp256k1 secret key of the anchoring wallet.
    pub private_key_hex: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("./btoken_data"),
            api_listen_addr: "127.0.0.1:3001".to_string(),
            bitcoin_network: "mainnet".to_string(),
            archive: ArchiveConfig::default(),
            bitcoin: NetworkConfig::default(),
            btoken: NetworkConfig::default(),
            anchor: AnchorConfig::default(),
            ledger_cache_max_entries: 100_000,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            segment_size: 0x100_0000,
            image_interval_segments: 3,
            loader_workers: 4,
            io_retry_secs: 3,
        }
    }
}

impl ArchiveConfig {
    pub fn io_retry(&self) -> Duration {
        Duration::from_secs(self.io_retry_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            port: 0,
            listen: true,
            seeds: Vec::new(),
            max_peers: 8,
            request_timeout_secs: 20,
            download_capacity: 20,
            blocks_per_request: 4,
            sync_interval_secs: 30,
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        AnchorConfig {
            enabled: false,
            interval_secs: 10,
            fee_per_byte_initial: 1.0,
            fee_growth_factor: 1.2,
            private_key_hex: None,
        }
    }
}

impl NodeConfig {
    /// Reads `path` if it exists, then applies environment overrides such as
    /// `BTOKEN__ANCHOR__ENABLED=true`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let path = path.unwrap_or(DEFAULT_CONFIG_FILE);
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn from_toml(text: &str) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.archive.segment_size, 16 * 1024 * 1024);
        assert_eq!(config.bitcoin.download_capacity, 20);
        assert_eq!(config.anchor.fee_growth_factor, 1.2);
    }

    #[test]
    fn file_values_override_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            data_dir = "/tmp/node"
            [archive]
            segment_size = 4096
            [btoken]
            seeds = ["10.0.0.1:8335"]
            download_capacity = 5
            [anchor]
            enabled = true
            private_key_hex = "01"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/node"));
        assert_eq!(config.archive.segment_size, 4096);
        assert_eq!(config.archive.loader_workers, 4);
        assert_eq!(config.btoken.seeds, vec!["10.0.0.1:8335".to_string()]);
        assert_eq!(config.btoken.download_capacity, 5);
        assert_eq!(config.bitcoin.download_capacity, 20);
        assert!(config.anchor.enabled);
        assert_eq!(config.anchor.private_key_hex.as_deref(), Some("01"));
    }
}
