// btoken_node/src/token/utxo.rs
// Unspent output set of the parent chain, kept in sqlite.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};

use crate::blockchain::block::Block;
use crate::blockchain::transaction::OutPoint;
use crate::error::{ChainError, Result};

pub const FILE_DATABASE_UTXO: &str = "utxo.db";
pub const FILE_IMAGE_UTXO: &str = "UtxoSet.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
}

pub struct UtxoStore {
    path: PathBuf,
    conn: Connection,
    // Outputs created by recent blocks; cleared once it holds `cache_max_entries`.
    cache: HashMap<OutPoint, UnspentOutput>,
    cache_max_entries: usize,
    height: u32,
}

impl std::fmt::Debug for UtxoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtxoStore")
            .field("path", &self.path)
            .field("cache", &self.cache.len())
            .field("height", &self.height)
            .finish()
    }
}

fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS utxo (txid BLOB NOT NULL, vout INTEGER NOT NULL, value INTEGER NOT NULL, script BLOB NOT NULL, height INTEGER NOT NULL, PRIMARY KEY (txid, vout))",
        [],
    )?;
    conn.execute("CREATE TABLE IF NOT EXISTS utxo_metadata (key TEXT PRIMARY KEY, value INTEGER NOT NULL)", [])?;
    Ok(conn)
}

fn read_height(conn: &Connection) -> Result<u32> {
    let height: Option<u32> = conn
        .query_row("SELECT value FROM utxo_metadata WHERE key = 'height'", [], |row| row.get(0))
        .optional()?;
    Ok(height.unwrap_or(0))
}

impl UtxoStore {
    pub fn open(root: &Path, cache_max_entries: usize) -> Result<Self> {
        fs::create_dir_all(root)?;
        let path = root.join(FILE_DATABASE_UTXO);
        let conn = open(&path)?;
        let height = read_height(&conn)?;
        Ok(UtxoStore { path, conn, cache: HashMap::new(), cache_max_entries, height })
    }

    /// Height of the last block applied.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM utxo", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>> {
        if let Some(output) = self.cache.get(outpoint) {
            return Ok(Some(output.clone()));
        }
        Ok(self
            .conn
            .query_row(
                "SELECT value, script, height FROM utxo WHERE txid = ?1 AND vout = ?2",
                params![outpoint.txid.to_vec(), outpoint.index],
                |row| Ok(UnspentOutput { value: row.get(0)?, script_pubkey: row.get(1)?, height: row.get(2)? }),
            )
            .optional()?)
    }

    /// Spends the block's inputs and adds its outputs at `height`, in one
    /// sqlite transaction. A missing or overspent input rolls the block back.
    pub fn apply_block(&mut self, block: &Block, height: u32) -> Result<()> {
        let mut spent: HashSet<OutPoint> = HashSet::new();
        let mut created: Vec<(OutPoint, UnspentOutput)> = Vec::new();

        let tx_db = self.conn.transaction()?;
        for tx in &block.transactions {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                let mut value_in = 0i64;
                for input in &tx.inputs {
                    let outpoint = input.previous_output;
                    let value = if spent.contains(&outpoint) {
                        None
                    } else if let Some(output) = self.cache.get(&outpoint) {
                        Some(output.value)
                    } else {
                        tx_db
                            .query_row(
                                "SELECT value FROM utxo WHERE txid = ?1 AND vout = ?2",
                                params![outpoint.txid.to_vec(), outpoint.index],
                                |row| row.get::<_, i64>(0),
                            )
                            .optional()?
                    };
                    let Some(value) = value else {
                        return Err(ChainError::protocol(format!(
                            "transaction {} spends unknown output {}:{}",
                            hex::encode(&txid[..8]),
                            hex::encode(&outpoint.txid[..8]),
                            outpoint.index
                        )));
                    };
                    tx_db.execute(
                        "DELETE FROM utxo WHERE txid = ?1 AND vout = ?2",
                        params![outpoint.txid.to_vec(), outpoint.index],
                    )?;
                    spent.insert(outpoint);
                    value_in += value;
                }
                if value_in < tx.value_out() {
                    return Err(ChainError::protocol(format!(
                        "transaction {} spends {} but creates {}",
                        hex::encode(&txid[..8]),
                        value_in,
                        tx.value_out()
                    )));
                }
            }
            for (vout, output) in tx.outputs.iter().enumerate() {
                if output.is_data() {
                    continue;
                }
                tx_db.execute(
                    "INSERT OR REPLACE INTO utxo (txid, vout, value, script, height) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![txid.to_vec(), vout as u32, output.value, output.script_pubkey, height],
                )?;
                let outpoint = OutPoint { txid, index: vout as u32 };
                spent.remove(&outpoint);
                created.push((
                    outpoint,
                    UnspentOutput { value: output.value, script_pubkey: output.script_pubkey.clone(), height },
                ));
            }
        }
        tx_db.execute(
            "INSERT OR REPLACE INTO utxo_metadata (key, value) VALUES ('height', ?1)",
            params![height],
        )?;
        tx_db.commit()?;

        self.height = height;
        for outpoint in &spent {
            self.cache.remove(outpoint);
        }
        if self.cache_max_entries == 0 {
            return Ok(());
        }
        for (outpoint, output) in created.into_iter().filter(|(outpoint, _)| !spent.contains(outpoint)) {
            if self.cache.len() >= self.cache_max_entries {
                debug!("UTXO cache full at {} entries, cleared", self.cache.len());
                self.cache.clear();
            }
            self.cache.insert(outpoint, output);
        }
        Ok(())
    }

    /// Snapshot of the database as a standalone file in `dir`.
    pub fn create_image(&self, dir: &Path) -> Result<()> {
        let target = dir.join(FILE_IMAGE_UTXO);
        if target.exists() {
            fs::remove_file(&target)?;
        }
        let target_str = target
            .to_str()
            .ok_or_else(|| ChainError::protocol(format!("image path {} is not valid UTF-8", target.display())))?;
        self.conn.execute("VACUUM INTO ?1", params![target_str])?;
        Ok(())
    }

    /// Replaces the live database with the snapshot in `dir`.
    pub fn load_image(&mut self, dir: &Path) -> Result<()> {
        let source = dir.join(FILE_IMAGE_UTXO);
        if !source.exists() {
            return Err(ChainError::protocol(format!("image {} carries no UTXO snapshot", dir.display())));
        }
        let previous = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        previous.close().map_err(|(_, e)| ChainError::Database(e))?;
        fs::copy(&source, &self.path)?;
        self.conn = open(&self.path)?;
        self.cache.clear();
        self.height = read_height(&self.conn)?;
        info!("UTXO set loaded from {} at height {}", dir.display(), self.height);
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM utxo", [])?;
        self.conn.execute("DELETE FROM utxo_metadata", [])?;
        self.cache.clear();
        self.height = 0;
        Ok(())
    }
}
