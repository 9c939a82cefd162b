// btoken_node/src/blockchain/chain.rs
// Header chain state machine of one chain: linear extension, snapshot images,
// crash recovery from the archive, and the fork / reorganization cycle.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::blockchain::archiver::{
    load_segments, read_block, truncate_archive, BlockArchiver, ImageSource, LoadFailure, SegmentEnd, SegmentLoad,
};
use crate::blockchain::block::Block;
use crate::blockchain::header::{ArchiveLocation, Header, HEADER_SIZE};
use crate::blockchain::header_index::HeaderIndex;
use crate::blockchain::reassembly::Flow;
use crate::chainparams::ChainParams;
use crate::config::ArchiveConfig;
use crate::error::{ChainError, Result};
use crate::token::Token;
use crate::util::{hash_to_display, Hash};

pub const FILE_IMAGE_HEADERCHAIN: &str = "ImageHeaderchain";
pub const FILE_INDEX_BLOCK_ARCHIVE: &str = "IndexBlockArchive";
pub const SIZE_IMAGE_HEADER_RECORD: usize = HEADER_SIZE + 12;

/// The single chain-mutation lock. Tasks that cannot take it back off.
pub type ChainHandle = Arc<tokio::sync::Mutex<Blockchain>>;
pub type ChainGuard = tokio::sync::OwnedMutexGuard<Blockchain>;

pub fn try_lock(handle: &ChainHandle) -> Option<ChainGuard> {
    Arc::clone(handle).try_lock_owned().ok()
}

/// Runs disk-bound chain work. On a multi-thread runtime the worker hands its
/// other tasks off first; elsewhere `f` just runs inline.
pub fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub name: String,
    pub height: u32,
    pub hash_tip: String,
    pub difficulty_accumulated: f64,
    pub count_headers: usize,
}

pub fn chain_status(name: &str, index: &RwLock<HeaderIndex>) -> ChainStatus {
    let index = index.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    let tip = index.tip();
    ChainStatus {
        name: name.to_string(),
        height: tip.height,
        hash_tip: hash_to_display(&tip.hash),
        difficulty_accumulated: tip.difficulty_accumulated,
        count_headers: index.len(),
    }
}

#[derive(Debug, Clone, Copy)]
struct ForkContext {
    difficulty_old: f64,
    ancestor_height: u32,
    image_source: ImageSource,
}

pub struct Blockchain {
    token: Box<dyn Token>,
    params: ChainParams,
    index: Arc<RwLock<HeaderIndex>>,
    archiver: BlockArchiver,
    fork: Option<ForkContext>,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("name", &self.params.name)
            .field("height", &self.height())
            .field("archiver", &self.archiver)
            .field("is_fork", &self.fork.is_some())
            .finish()
    }
}

impl Blockchain {
    pub fn new(token: Box<dyn Token>, root: &Path, config: &ArchiveConfig) -> Result<Self> {
        let params = token.params().clone();
        let genesis = token.create_header_genesis();
        let archiver = BlockArchiver::new(root, config)?;
        Ok(Blockchain {
            token,
            params,
            index: Arc::new(RwLock::new(HeaderIndex::new(genesis))),
            archiver,
            fork: None,
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn name(&self) -> &'static str {
        self.params.name
    }

    /// Shared handle on the header index for readers that do not take the chain lock.
    pub fn index(&self) -> Arc<RwLock<HeaderIndex>> {
        Arc::clone(&self.index)
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, HeaderIndex> {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, HeaderIndex> {
        self.index.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn height(&self) -> u32 {
        self.read_index().height()
    }

    pub fn tip(&self) -> Header {
        self.read_index().tip().clone()
    }

    pub fn difficulty_accumulated(&self) -> f64 {
        self.read_index().tip().difficulty_accumulated
    }

    pub fn header(&self, hash: &Hash) -> Option<Header> {
        self.read_index().header(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.read_index().contains(hash)
    }

    pub fn is_fork(&self) -> bool {
        self.fork.is_some()
    }

    pub fn archiver(&self) -> &BlockArchiver {
        &self.archiver
    }

    pub fn token(&self) -> &dyn Token {
        self.token.as_ref()
    }

    pub fn seed_addresses(&self) -> Vec<String> {
        self.token.get_seed_addresses()
    }

    pub fn status(&self) -> ChainStatus {
        chain_status(self.params.name, &self.index)
    }

    /// Rules a header must meet at `height`, independent of the current tip.
    pub fn check_header(&self, header: &Header, height: u32) -> Result<()> {
        if let Some(expected) = self.params.checkpoint_at(height) {
            if *expected != header.hash {
                return Err(ChainError::protocol(format!(
                    "checkpoint mismatch at height {}: expected {}, got {}",
                    height,
                    hash_to_display(expected),
                    hash_to_display(&header.hash)
                )));
            }
        }
        self.token.validate_header(header, height)
    }

    // Validates `header` as the successor of the current tip and returns it
    // with its height filled in.
    fn validate_extension(&self, header: &Header) -> Result<Header> {
        let index = self.read_index();
        let tip = index.tip();
        if header.hash_previous != tip.hash {
            return Err(ChainError::protocol(format!(
                "header {} does not chain from tip {}",
                hex::encode(&header.hash[..8]),
                hex::encode(&tip.hash[..8])
            )));
        }
        if index.contains(&header.hash) {
            return Err(ChainError::protocol(format!("duplicate header {}", hex::encode(&header.hash[..8]))));
        }
        let height = tip.height + 1;
        let median_time = index.median_time_past(index.tip_id());
        if header.timestamp <= median_time {
            return Err(ChainError::protocol(format!(
                "header {} timestamp {} not after median time past {}",
                hex::encode(&header.hash[..8]),
                header.timestamp,
                median_time
            )));
        }
        drop(index);
        self.check_header(header, height)?;
        let mut header = header.clone();
        header.height = height;
        Ok(header)
    }

    /// Validates and appends a header behind the tip. The tip is unchanged on failure.
    pub fn insert_header(&mut self, header: Header) -> Result<()> {
        let header = self.validate_extension(&header)?;
        self.write_index().extend_tip(header);
        Ok(())
    }

    /// Live insertion: validation, domain commit, archive write, tip advance.
    /// Returns the new tip height.
    pub fn insert_block(&mut self, mut block: Block) -> Result<u32> {
        block.header = self.validate_extension(&block.header)?;
        self.token.insert_block(&block)?;

        let (location, flag_create_image) = self.archiver.archive_block_flag_create_image(&block.buffer);
        block.header.location = Some(location);
        let height = block.header.height;
        let hash = block.header.hash;
        self.write_index().extend_tip(block.header);
        debug!(
            "{} block {} inserted at height {} (segment {} offset {})",
            self.params.name,
            hex::encode(&hash[..8]),
            height,
            location.segment,
            location.offset
        );

        if flag_create_image {
            if let Err(e) = self.create_image() {
                error!("{} failed to create image at height {}: {}", self.params.name, height, e);
            }
        }
        Ok(height)
    }

    // Blocks read back from the archive already carry their location.
    fn insert_archived_block(&mut self, mut block: Block) -> Result<()> {
        let location = block.header.location;
        block.header = self.validate_extension(&block.header)?;
        block.header.location = location;
        self.token.insert_block(&block)?;
        self.write_index().extend_tip(block.header);
        Ok(())
    }

    pub fn create_block(&mut self) -> Option<Block> {
        let tip = self.tip();
        self.token.create_block(&tip)
    }

    /// Sparse locator from the tip down to the last checkpoint.
    pub fn get_locator(&self) -> Vec<Hash> {
        self.read_index().locator(self.params.last_checkpoint_height())
    }

    pub fn get_headers(&self, locator: &[Hash], count: usize, hash_stop: &Hash) -> Result<Vec<Header>> {
        self.read_index().headers_after(locator, count, hash_stop)
    }

    /// Exact archived bytes of a main-chain block.
    pub fn read_block(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        let location = {
            let index = self.read_index();
            match index.find(hash) {
                Some(id) if index.is_on_main_chain(id) => index.get(id).location,
                _ => None,
            }
        };
        let Some(location) = location else { return Ok(None) };
        let buffer = read_block(&self.archiver.directory(), &location)?;
        Ok(Some(buffer))
    }

    // --- Start images ---

    /// Writes the header chain, the resume segment and the domain snapshot
    /// into a staged directory and swaps it into place.
    pub fn create_image(&mut self) -> Result<()> {
        let staging = self.archiver.begin_image()?;
        {
            let index = self.read_index();
            let mut writer = BufWriter::new(File::create(staging.join(FILE_IMAGE_HEADERCHAIN))?);
            for height in 1..=index.height() {
                let Some(header) = index.at_height(height) else { break };
                let location = header.location.unwrap_or_default();
                writer.write_all(&header.serialize())?;
                writer.write_u32::<LittleEndian>(location.segment)?;
                writer.write_u32::<LittleEndian>(location.offset)?;
                writer.write_u32::<LittleEndian>(location.length)?;
            }
            writer.flush()?;
        }
        let mut file = File::create(staging.join(FILE_INDEX_BLOCK_ARCHIVE))?;
        file.write_u32::<LittleEndian>(self.archiver.position().0)?;
        self.token.create_image(&staging)?;
        self.archiver.commit_image()?;
        info!(
            "{} image created at height {}{}",
            self.params.name,
            self.height(),
            if self.archiver.is_fork() { " (fork)" } else { "" }
        );
        Ok(())
    }

    /// Height covered by an image directory, zero if it has none.
    pub fn image_height(path: &Path) -> u32 {
        fs::metadata(path.join(FILE_IMAGE_HEADERCHAIN))
            .map(|m| (m.len() / SIZE_IMAGE_HEADER_RECORD as u64) as u32)
            .unwrap_or(0)
    }

    // Replays an image's header chain, loads the domain snapshot and returns
    // the archive segment to resume from.
    fn load_image(&mut self, path: &Path) -> Result<u32> {
        let bytes = fs::read(path.join(FILE_IMAGE_HEADERCHAIN))?;
        if bytes.len() % SIZE_IMAGE_HEADER_RECORD != 0 {
            return Err(ChainError::protocol(format!("image {} has a torn header record", path.display())));
        }
        for record in bytes.chunks_exact(SIZE_IMAGE_HEADER_RECORD) {
            let mut header = self.token.parse_header(record, 0)?;
            let mut coordinates = &record[HEADER_SIZE..];
            header.location = Some(ArchiveLocation {
                segment: coordinates.read_u32::<LittleEndian>()?,
                offset: coordinates.read_u32::<LittleEndian>()?,
                length: coordinates.read_u32::<LittleEndian>()?,
            });
            self.insert_header(header)?;
        }
        self.token.load_image(path)?;
        let segment = File::open(path.join(FILE_INDEX_BLOCK_ARCHIVE))?.read_u32::<LittleEndian>()?;
        info!("{} loaded image {} at height {}", self.params.name, path.display(), self.height());
        Ok(segment)
    }

    // --- End images ---

    fn reset(&mut self) -> Result<()> {
        self.token.reset()?;
        *self.write_index() = HeaderIndex::new(self.token.create_header_genesis());
        Ok(())
    }

    /// Restores the chain after a restart or an aborted sync: the newest
    /// image, then the previous one, then genesis, each followed by a replay
    /// of the archive. A protocol failure while replaying truncates the
    /// archive at the failing block and the same source is retried once.
    pub fn load(&mut self) -> Result<()> {
        let mut last_error = None;
        for source in [ImageSource::Image, ImageSource::ImageOld, ImageSource::Genesis] {
            if let Some(path) = self.archiver.image_path(source) {
                if !path.exists() {
                    continue;
                }
            }
            for attempt in 0..2 {
                match self.load_from(source, None) {
                    Ok(()) => {
                        info!(
                            "{} loaded from {:?}: height {} tip {}",
                            self.params.name,
                            source,
                            self.height(),
                            hash_to_display(&self.tip().hash)
                        );
                        return Ok(());
                    }
                    Err(e) if e.is_protocol() && attempt == 0 => {
                        warn!("{} load from {:?} failed: {}. Retrying after truncation.", self.params.name, source, e);
                    }
                    Err(e) => {
                        warn!("{} load from {:?} failed: {}", self.params.name, source, e);
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ChainError::protocol("no loadable chain state")))
    }

    /// Same as `load`, after dropping any fork in progress.
    pub fn reload(&mut self) -> Result<()> {
        if self.fork.take().is_some() {
            self.archiver.discard_fork()?;
        }
        self.load()
    }

    fn load_from(&mut self, source: ImageSource, stop_height: Option<u32>) -> Result<()> {
        self.token.set_replaying(true);
        let result = self.restore_from(source, stop_height);
        self.token.set_replaying(false);
        result
    }

    fn restore_from(&mut self, source: ImageSource, stop_height: Option<u32>) -> Result<()> {
        self.reset()?;
        let segment_start = match self.archiver.image_path(source) {
            Some(path) => self.load_image(&path)?,
            None => 0,
        };
        self.load_archive(segment_start, stop_height)?;

        if stop_height.is_none() {
            let (segment, offset) = self.append_position(segment_start);
            self.archiver.truncate(segment, offset)?;
            self.archiver.open_segment(segment, offset)?;
        }
        Ok(())
    }

    fn append_position(&self, segment_start: u32) -> (u32, u64) {
        match self.read_index().tip().location {
            Some(location) if location.end() >= self.archiver.config().segment_size => (location.segment + 1, 0),
            Some(location) => (location.segment, location.end()),
            None => (segment_start, 0),
        }
    }

    fn load_archive(&mut self, segment_start: u32, stop_height: Option<u32>) -> Result<()> {
        let directory = self.archiver.main_directory();
        let workers = self.archiver.config().loader_workers;
        let params = self.params.clone();
        let mut corrupt: Option<(u32, u64)> = None;

        let result = load_segments(&directory, segment_start, workers, &params, |index, load: SegmentLoad| {
            let segment = index as u32;
            for block in load.blocks {
                if stop_height.is_some_and(|stop| self.height() >= stop) {
                    return Ok(Flow::Stop);
                }
                let offset = block.header.location.map(|l| l.offset as u64).unwrap_or(0);
                if let Err(error) = self.insert_archived_block(block) {
                    return Err(LoadFailure { segment, offset, error });
                }
            }
            match load.end {
                None => Ok(Flow::Continue),
                Some(SegmentEnd::Missing) => Ok(Flow::Stop),
                Some(SegmentEnd::Corrupt { offset }) => {
                    corrupt = Some((segment, offset));
                    Ok(Flow::Stop)
                }
            }
        });

        if let Some((segment, offset)) = corrupt {
            truncate_archive(&directory, segment, offset)?;
        }
        match result {
            Ok(()) => Ok(()),
            Err(LoadFailure { segment, offset, error }) => match error {
                ChainError::NotSynchronizedWithParent(hash) => {
                    // Kept chain state is consistent; the tail is fetched again once the parent catches up.
                    warn!(
                        "{} archive replay stops at unanchored block {}",
                        self.params.name,
                        hash_to_display(&hash)
                    );
                    truncate_archive(&directory, segment, offset)?;
                    Ok(())
                }
                error if error.is_protocol() => {
                    error!(
                        "{} invalid archived block in segment {} at offset {}: {}",
                        self.params.name, segment, offset, error
                    );
                    truncate_archive(&directory, segment, offset)?;
                    Err(error)
                }
                error => Err(error),
            },
        }
    }

    // --- Start fork handling ---

    /// Rebuilds the chain up to `hash_ancestor` from the best image at or below
    /// it, and redirects further appends into the fork namespace. On failure
    /// the main chain is reloaded and false is returned.
    pub fn try_fork(&mut self, hash_ancestor: &Hash) -> Result<bool> {
        let (ancestor_height, ancestor_location, difficulty_old) = {
            let index = self.read_index();
            let ancestor = index
                .header(hash_ancestor)
                .ok_or_else(|| ChainError::protocol("fork ancestor not in header index"))?;
            (ancestor.height, ancestor.location, index.tip().difficulty_accumulated)
        };

        let image_source = [ImageSource::Image, ImageSource::ImageOld]
            .into_iter()
            .find(|source| {
                self.archiver
                    .image_path(*source)
                    .is_some_and(|path| path.exists() && Self::image_height(&path) <= ancestor_height)
            })
            .unwrap_or(ImageSource::Genesis);

        let reached = match self.load_from(image_source, Some(ancestor_height)) {
            Ok(()) => self.tip().hash == *hash_ancestor,
            Err(e) => {
                warn!("{} fork rebuild from {:?} failed: {}", self.params.name, image_source, e);
                false
            }
        };
        if !reached {
            warn!(
                "{} could not rebuild fork ancestor at height {}, reloading main chain",
                self.params.name, ancestor_height
            );
            self.load()?;
            return Ok(false);
        }

        self.archiver.begin_fork(ancestor_location)?;
        self.fork = Some(ForkContext { difficulty_old, ancestor_height, image_source });
        info!(
            "{} fork opened at height {} (difficulty before fork {})",
            self.params.name, ancestor_height, difficulty_old
        );
        Ok(true)
    }

    /// Commits the fork if it carries more accumulated difficulty than the
    /// chain it branched from, otherwise discards it and reloads the main chain.
    /// Returns whether a reorganization happened.
    pub fn finalize_blockchain(&mut self) -> Result<bool> {
        let Some(fork) = self.fork.take() else { return Ok(false) };
        let difficulty = self.difficulty_accumulated();
        if difficulty > fork.difficulty_old {
            self.archiver.reorganize(fork.image_source)?;
            info!(
                "{} reorganized at height {}: fork difficulty {} beats {}, new tip {} at height {}",
                self.params.name,
                fork.ancestor_height,
                difficulty,
                fork.difficulty_old,
                hash_to_display(&self.tip().hash),
                self.height()
            );
            Ok(true)
        } else {
            info!(
                "{} fork from height {} discarded: difficulty {} does not beat {}",
                self.params.name, fork.ancestor_height, difficulty, fork.difficulty_old
            );
            self.archiver.discard_fork()?;
            self.load()?;
            Ok(false)
        }
    }

    // --- End fork handling ---
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::testing::{block_on, TestToken};

    fn settings(segment_size: u64, interval: u32) -> ArchiveConfig {
        ArchiveConfig { segment_size, image_interval_segments: interval, loader_workers: 3, io_retry_secs: 0 }
    }

    fn chain(dir: &Path, config: &ArchiveConfig) -> Blockchain {
        let mut chain = Blockchain::new(Box::new(TestToken::new(ChainParams::btoken())), dir, config).unwrap();
        chain.load().unwrap();
        chain
    }

    fn extend(chain: &mut Blockchain, count: u32, nonce_base: u32) -> Vec<Hash> {
        let params = chain.params().clone();
        (0..count)
            .map(|i| {
                let block = block_on(&params, &chain.tip(), nonce_base + i);
                let hash = block.hash();
                chain.insert_block(block).unwrap();
                hash
            })
            .collect()
    }

    fn block_size() -> u64 {
        let params = ChainParams::btoken();
        let genesis = TestToken::new(params.clone()).create_header_genesis();
        block_on(&params, &genesis, 1).buffer.len() as u64
    }

    #[test]
    fn simple_extension_accumulates_difficulty() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = chain(dir.path(), &settings(1 << 20, 3));
        let params = chain.params().clone();

        let a = block_on(&params, &chain.tip(), 1);
        chain.insert_header(a.header.clone()).unwrap();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.difficulty_accumulated(), 1.0);

        let b = block_on(&params, &chain.tip(), 2);
        chain.insert_header(b.header.clone()).unwrap();
        let tip = chain.tip();
        assert_eq!(tip.hash, b.hash());
        assert_eq!(tip.height, 2);
        assert_eq!(tip.difficulty_accumulated, 2.0);
        let previous = chain.header(&a.hash()).unwrap();
        assert_eq!(tip.difficulty_accumulated, previous.difficulty_accumulated + tip.difficulty);
        assert_eq!(tip.height, previous.height + 1);
    }

    #[test]
    fn checkpoint_violation_leaves_tip() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = ChainParams::btoken();
        params.checkpoints.push((2, [0xaa; 32]));
        let token = TestToken::new(params.clone());
        let mut chain = Blockchain::new(Box::new(token), dir.path(), &settings(1 << 20, 3)).unwrap();
        chain.load().unwrap();

        let a = block_on(&params, &chain.tip(), 1);
        chain.insert_block(a).unwrap();
        let b = block_on(&params, &chain.tip(), 2);
        let error = chain.insert_block(b).unwrap_err();
        assert!(error.is_protocol());
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn unlinked_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = chain(dir.path(), &settings(1 << 20, 3));
        let params = chain.params().clone();
        let mut stray = chain.tip();
        stray.hash = [9u8; 32];
        let block = block_on(&params, &stray, 1);
        assert!(chain.insert_header(block.header).unwrap_err().is_protocol());
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn archive_round_trip_with_image() {
        let dir = tempfile::tempdir().unwrap();
        let size = block_size();
        let config = settings(size * 2, 2);
        let hashes = {
            let mut chain = chain(dir.path(), &config);
            // Images are taken when segments 2 and 4 open.
            extend(&mut chain, 9, 100)
        };
        assert!(dir.path().join("Image").exists());
        assert_eq!(Blockchain::image_height(&dir.path().join("Image")), 8);

        let chain = chain(dir.path(), &config);
        assert_eq!(chain.height(), 9);
        for (height, hash) in hashes.iter().enumerate() {
            let header = chain.header(hash).unwrap();
            assert_eq!(header.height, height as u32 + 1);
        }
        let bytes = chain.read_block(&hashes[4]).unwrap().unwrap();
        assert_eq!(crate::util::sha256d(&bytes[..HEADER_SIZE]), hashes[4]);
    }

    #[test]
    fn torn_image_falls_back_to_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let size = block_size();
        let config = settings(size * 2, 2);
        let hashes = {
            let mut chain = chain(dir.path(), &config);
            extend(&mut chain, 9, 100)
        };
        assert_eq!(Blockchain::image_height(&dir.path().join("ImageOld")), 4);

        let path = dir.path().join("Image").join(FILE_IMAGE_HEADERCHAIN);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

        let chain = chain(dir.path(), &config);
        assert_eq!(chain.height(), 9);
        assert_eq!(chain.tip().hash, hashes[8]);
        assert_eq!(chain.header(&hashes[4]).unwrap().height, 5);
    }

    #[test]
    fn invalid_archived_block_truncates_replay() {
        let dir = tempfile::tempdir().unwrap();
        let size = block_size();
        let config = settings(1 << 20, 100);
        let hashes = {
            let mut chain = chain(dir.path(), &config);
            extend(&mut chain, 5, 1)
        };
        let path = dir.path().join("archive").join("0");
        assert_eq!(fs::metadata(&path).unwrap().len(), 5 * size);

        let mut token = TestToken::new(ChainParams::btoken());
        token.poison_nonce = Some(4);
        let mut chain = Blockchain::new(Box::new(token), dir.path(), &config).unwrap();
        chain.load().unwrap();
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.tip().hash, hashes[2]);
        assert_eq!(fs::metadata(&path).unwrap().len(), 3 * size);

        let appended = extend(&mut chain, 1, 50);
        drop(chain);
        let chain = self::chain(dir.path(), &config);
        assert_eq!(chain.height(), 4);
        assert_eq!(chain.tip().hash, appended[0]);
        assert!(!chain.contains(&hashes[3]));
    }

    #[test]
    fn only_archive_replay_is_flagged_as_replaying() {
        let dir = tempfile::tempdir().unwrap();
        let config = settings(1 << 20, 100);
        let mut first = chain(dir.path(), &config);
        extend(&mut first, 3, 1);
        drop(first);

        let token = TestToken::new(ChainParams::btoken());
        let journal = Arc::clone(&token.journal);
        let mut reloaded = Blockchain::new(Box::new(token), dir.path(), &config).unwrap();
        reloaded.load().unwrap();
        assert_eq!(journal.lock().unwrap().replayed, 3);

        extend(&mut reloaded, 1, 20);
        let journal = journal.lock().unwrap();
        assert_eq!(journal.inserted.len(), 4);
        assert_eq!(journal.replayed, 3);
    }

    #[test]
    fn corrupt_archive_tail_is_truncated_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = settings(1 << 20, 3);
        let hashes = {
            let mut chain = chain(dir.path(), &config);
            extend(&mut chain, 4, 1)
        };
        let path = dir.path().join("archive").join("0");
        let mut bytes = fs::read(&path).unwrap();
        let good = bytes.len();
        bytes.extend_from_slice(&[1, 2, 3]);
        fs::write(&path, &bytes).unwrap();

        let mut chain = chain(dir.path(), &config);
        assert_eq!(chain.height(), 4);
        assert_eq!(chain.tip().hash, hashes[3]);
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, good);
        extend(&mut chain, 1, 50);
        drop(chain);
        assert_eq!(self::chain(dir.path(), &config).height(), 5);
    }

    #[test]
    fn winning_fork_becomes_main_chain() {
        let dir = tempfile::tempdir().unwrap();
        let size = block_size();
        let config = settings(size * 2, 100);
        let mut chain = chain(dir.path(), &config);
        let main = extend(&mut chain, 5, 10);

        assert!(chain.try_fork(&main[1]).unwrap());
        assert!(chain.is_fork());
        assert_eq!(chain.height(), 2);
        let fork = extend(&mut chain, 4, 500);
        assert!(chain.finalize_blockchain().unwrap());
        assert!(!chain.is_fork());
        assert_eq!(chain.height(), 6);
        drop(chain);

        let chain = self::chain(dir.path(), &config);
        assert_eq!(chain.height(), 6);
        assert_eq!(chain.tip().hash, fork[3]);
        assert!(chain.contains(&main[1]));
        assert!(!chain.contains(&main[2]));
        assert!(!dir.path().join("archive_fork").exists());
    }

    #[test]
    fn losing_fork_restores_main_chain() {
        let dir = tempfile::tempdir().unwrap();
        let size = block_size();
        let config = settings(size * 2, 100);
        let mut chain = chain(dir.path(), &config);
        let main = extend(&mut chain, 5, 10);

        assert!(chain.try_fork(&main[2]).unwrap());
        extend(&mut chain, 1, 500);
        assert!(!chain.finalize_blockchain().unwrap());
        assert_eq!(chain.height(), 5);
        assert_eq!(chain.tip().hash, main[4]);
        assert!(!dir.path().join("archive_fork").exists());
    }

    #[test]
    fn locator_and_served_headers() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = chain(dir.path(), &settings(1 << 20, 3));
        let hashes = extend(&mut chain, 6, 1);
        let locator = chain.get_locator();
        assert_eq!(locator[0], hashes[5]);
        assert_eq!(*locator.last().unwrap(), chain.read_index().genesis().hash);

        let headers = chain.get_headers(&[hashes[1]], 10, &[0u8; 32]).unwrap();
        assert_eq!(headers.iter().map(|h| h.hash).collect::<Vec<_>>(), hashes[2..].to_vec());
        assert!(chain.get_headers(&[[0x55; 32]], 10, &[0u8; 32]).unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn chain_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let handle: ChainHandle = Arc::new(tokio::sync::Mutex::new(chain(dir.path(), &settings(1 << 20, 3))));
        let guard = try_lock(&handle).unwrap();
        assert!(try_lock(&handle).is_none());
        drop(guard);
        assert!(try_lock(&handle).is_some());
    }
}
