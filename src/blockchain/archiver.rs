// btoken_node/src/blockchain/archiver.rs
// Segmented append-only block store, parallel ordered loader, fork namespace
// and snapshot image directories of one chain.

use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::blockchain::block::Block;
use crate::blockchain::header::ArchiveLocation;
use crate::blockchain::reassembly::{Flow, ParkingReassembly, Submitted};
use crate::chainparams::ChainParams;
use crate::config::ArchiveConfig;
use crate::error::ChainError;

pub const DIR_ARCHIVE: &str = "archive";
pub const DIR_ARCHIVE_FORK: &str = "archive_fork";
pub const DIR_IMAGE: &str = "Image";
pub const DIR_IMAGE_OLD: &str = "ImageOld";
pub const DIR_IMAGE_FORK: &str = "ImageFork";
pub const DIR_IMAGE_STAGING: &str = "ImageStaging";

const COUNT_RETRY_RENAME: u32 = 10;

/// Which snapshot a chain state was rebuilt from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Image,
    ImageOld,
    Genesis,
}

/// How a segment scan ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEnd {
    /// No file at this index: the end of the archive.
    Missing,
    /// Bytes from `offset` on do not parse as a block.
    Corrupt { offset: u64 },
}

#[derive(Debug)]
pub struct SegmentLoad {
    pub segment: u32,
    pub blocks: Vec<Block>,
    pub end: Option<SegmentEnd>,
}

/// A block that failed insertion during a load.
#[derive(Debug)]
pub struct LoadFailure {
    pub segment: u32,
    pub offset: u64,
    pub error: ChainError,
}

pub struct BlockArchiver {
    root: PathBuf,
    config: ArchiveConfig,
    index_segment: u32,
    count_bytes: u64,
    file: Option<File>,
    is_fork: bool,
}

impl std::fmt::Debug for BlockArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockArchiver")
            .field("root", &self.root)
            .field("index_segment", &self.index_segment)
            .field("count_bytes", &self.count_bytes)
            .field("is_fork", &self.is_fork)
            .finish()
    }
}

impl BlockArchiver {
    /// Prepares the chain directory. Leftovers of an interrupted fork are removed.
    pub fn new(root: &Path, config: &ArchiveConfig) -> Result<Self, IoError> {
        fs::create_dir_all(root.join(DIR_ARCHIVE))?;
        remove_dir_if_exists(&root.join(DIR_ARCHIVE_FORK))?;
        remove_dir_if_exists(&root.join(DIR_IMAGE_FORK))?;
        remove_dir_if_exists(&root.join(DIR_IMAGE_STAGING))?;
        Ok(BlockArchiver {
            root: root.to_path_buf(),
            config: config.clone(),
            index_segment: 0,
            count_bytes: 0,
            file: None,
            is_fork: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn is_fork(&self) -> bool {
        self.is_fork
    }

    pub fn position(&self) -> (u32, u64) {
        (self.index_segment, self.count_bytes)
    }

    pub fn main_directory(&self) -> PathBuf {
        self.root.join(DIR_ARCHIVE)
    }

    /// Directory currently appended to.
    pub fn directory(&self) -> PathBuf {
        if self.is_fork {
            self.root.join(DIR_ARCHIVE_FORK)
        } else {
            self.main_directory()
        }
    }

    pub fn image_path(&self, source: ImageSource) -> Option<PathBuf> {
        match source {
            ImageSource::Image => Some(self.root.join(DIR_IMAGE)),
            ImageSource::ImageOld => Some(self.root.join(DIR_IMAGE_OLD)),
            ImageSource::Genesis => None,
        }
    }

    /// Opens `segment` for appending at `offset`, dropping anything after it.
    pub fn open_segment(&mut self, segment: u32, offset: u64) -> Result<(), IoError> {
        let path = self.directory().join(segment.to_string());
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        self.file = Some(file);
        self.index_segment = segment;
        self.count_bytes = offset;
        debug!("Archive {} open at segment {} offset {}", path.display(), segment, offset);
        Ok(())
    }

    fn append(&mut self, buffer: &[u8]) -> Result<ArchiveLocation, IoError> {
        if self.file.is_none() {
            self.open_segment(self.index_segment, self.count_bytes)?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| IoError::new(IoErrorKind::Other, "archive segment not open"))?;
        file.write_all(buffer)?;
        file.flush()?;
        let location = ArchiveLocation {
            segment: self.index_segment,
            offset: self.count_bytes as u32,
            length: buffer.len() as u32,
        };
        self.count_bytes += buffer.len() as u64;
        Ok(location)
    }

    /// Appends a block's bytes, retrying until the write lands. Returns where
    /// it was written and whether the segment roll-over is an image boundary.
    pub fn archive_block_flag_create_image(&mut self, buffer: &[u8]) -> (ArchiveLocation, bool) {
        let location = loop {
            match self.append(buffer) {
                Ok(location) => break location,
                Err(e) => {
                    error!(
                        "Failed to archive block in segment {} of {}: {}. Retrying in {}s.",
                        self.index_segment,
                        self.directory().display(),
                        e,
                        self.config.io_retry_secs
                    );
                    self.file = None;
                    std::thread::sleep(self.config.io_retry());
                }
            }
        };

        if self.count_bytes < self.config.segment_size {
            return (location, false);
        }

        let next = self.index_segment + 1;
        loop {
            match self.open_segment(next, 0) {
                Ok(()) => break,
                Err(e) => {
                    error!("Failed to open archive segment {}: {}. Retrying.", next, e);
                    std::thread::sleep(self.config.io_retry());
                }
            }
        }
        let interval = self.config.image_interval_segments.max(1);
        (location, next % interval == 0)
    }

    /// Cuts the active namespace back to `offset` in `segment`, removing later segments.
    pub fn truncate(&mut self, segment: u32, offset: u64) -> Result<(), IoError> {
        let directory = self.directory();
        truncate_archive(&directory, segment, offset)?;
        self.file = None;
        self.index_segment = segment;
        self.count_bytes = offset;
        Ok(())
    }

    /// Starts the fork namespace right behind the common ancestor.
    pub fn begin_fork(&mut self, ancestor: Option<ArchiveLocation>) -> Result<(), IoError> {
        let fork_dir = self.root.join(DIR_ARCHIVE_FORK);
        remove_dir_if_exists(&fork_dir)?;
        remove_dir_if_exists(&self.root.join(DIR_IMAGE_FORK))?;
        fs::create_dir_all(&fork_dir)?;

        let (segment, offset) = match ancestor {
            Some(location) => (location.segment, location.end()),
            None => (0, 0),
        };
        if offset > 0 {
            fs::copy(self.main_directory().join(segment.to_string()), fork_dir.join(segment.to_string()))?;
        }
        self.is_fork = true;
        if offset >= self.config.segment_size {
            self.open_segment(segment + 1, 0)?;
        } else {
            self.open_segment(segment, offset)?;
        }
        info!("Fork archive started at segment {} offset {}", self.index_segment, self.count_bytes);
        Ok(())
    }

    /// Commits the fork: its segments and images replace the main ones.
    pub fn reorganize(&mut self, source: ImageSource) -> Result<(), IoError> {
        let fork_dir = self.root.join(DIR_ARCHIVE_FORK);
        let main_dir = self.main_directory();
        let segments = list_segments(&fork_dir)?;
        let last = segments.iter().copied().max().unwrap_or(self.index_segment);

        for segment in &segments {
            let from = fork_dir.join(segment.to_string());
            let to = main_dir.join(segment.to_string());
            self.rename_with_retry(&from, &to)?;
        }
        for segment in list_segments(&main_dir)? {
            if segment > last {
                fs::remove_file(main_dir.join(segment.to_string()))?;
            }
        }

        let image = self.root.join(DIR_IMAGE);
        let image_old = self.root.join(DIR_IMAGE_OLD);
        let image_fork = self.root.join(DIR_IMAGE_FORK);
        if image_fork.exists() {
            // Images above the fork point describe the abandoned branch.
            match source {
                ImageSource::Image => {
                    remove_dir_if_exists(&image_old)?;
                    if image.exists() {
                        self.rename_with_retry(&image, &image_old)?;
                    }
                }
                ImageSource::ImageOld => remove_dir_if_exists(&image)?,
                ImageSource::Genesis => {
                    remove_dir_if_exists(&image)?;
                    remove_dir_if_exists(&image_old)?;
                }
            }
            self.rename_with_retry(&image_fork, &image)?;
        } else {
            match source {
                ImageSource::Image => {}
                ImageSource::ImageOld => {
                    remove_dir_if_exists(&image)?;
                    self.rename_with_retry(&image_old, &image)?;
                }
                ImageSource::Genesis => {
                    remove_dir_if_exists(&image)?;
                    remove_dir_if_exists(&image_old)?;
                }
            }
        }

        remove_dir_if_exists(&fork_dir)?;
        self.is_fork = false;
        self.file = None;
        info!("Reorganized archive {} onto fork, tip segment {}", main_dir.display(), self.index_segment);
        Ok(())
    }

    /// Drops the fork namespace. The caller reloads the main chain.
    pub fn discard_fork(&mut self) -> Result<(), IoError> {
        remove_dir_if_exists(&self.root.join(DIR_ARCHIVE_FORK))?;
        remove_dir_if_exists(&self.root.join(DIR_IMAGE_FORK))?;
        self.is_fork = false;
        self.file = None;
        Ok(())
    }

    /// Fresh staging directory for a new snapshot image.
    pub fn begin_image(&self) -> Result<PathBuf, IoError> {
        let staging = self.root.join(DIR_IMAGE_STAGING);
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging)?;
        Ok(staging)
    }

    /// Moves the staged image into place, keeping the previous one as fallback.
    pub fn commit_image(&self) -> Result<(), IoError> {
        let staging = self.root.join(DIR_IMAGE_STAGING);
        if self.is_fork {
            let image_fork = self.root.join(DIR_IMAGE_FORK);
            remove_dir_if_exists(&image_fork)?;
            return self.rename_with_retry(&staging, &image_fork);
        }
        let image = self.root.join(DIR_IMAGE);
        let image_old = self.root.join(DIR_IMAGE_OLD);
        remove_dir_if_exists(&image_old)?;
        if image.exists() {
            self.rename_with_retry(&image, &image_old)?;
        }
        self.rename_with_retry(&staging, &image)
    }

    fn rename_with_retry(&self, from: &Path, to: &Path) -> Result<(), IoError> {
        let mut attempt = 0;
        loop {
            #[cfg(windows)]
            if to.is_file() {
                let _ = fs::remove_file(to);
            }
            match fs::rename(from, to) {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < COUNT_RETRY_RENAME => {
                    attempt += 1;
                    warn!("Rename {} -> {} failed ({}), attempt {}", from.display(), to.display(), e, attempt);
                    std::thread::sleep(Duration::from_millis(200 * attempt as u64));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Reads back the exact bytes of an archived block.
pub fn read_block(directory: &Path, location: &ArchiveLocation) -> Result<Vec<u8>, IoError> {
    let mut file = File::open(directory.join(location.segment.to_string()))?;
    file.seek(SeekFrom::Start(location.offset as u64))?;
    let mut buffer = vec![0u8; location.length as usize];
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Splits one segment file into blocks, stamping each with its location.
pub fn parse_segment(directory: &Path, segment: u32, params: &ChainParams) -> SegmentLoad {
    let path = directory.join(segment.to_string());
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == IoErrorKind::NotFound => {
            return SegmentLoad { segment, blocks: Vec::new(), end: Some(SegmentEnd::Missing) };
        }
        Err(e) => {
            warn!("Cannot read archive segment {}: {}", path.display(), e);
            return SegmentLoad { segment, blocks: Vec::new(), end: Some(SegmentEnd::Corrupt { offset: 0 }) };
        }
    };

    let mut blocks = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        match Block::parse(&bytes, offset, params) {
            Ok(mut block) => {
                let length = block.buffer.len();
                block.header.location = Some(ArchiveLocation {
                    segment,
                    offset: offset as u32,
                    length: length as u32,
                });
                blocks.push(block);
                offset += length;
            }
            Err(e) => {
                warn!("Corrupt block in segment {} at offset {}: {}", path.display(), offset, e);
                return SegmentLoad { segment, blocks, end: Some(SegmentEnd::Corrupt { offset: offset as u64 }) };
            }
        }
    }
    SegmentLoad { segment, blocks, end: None }
}

/// Loads segments `start..` with `workers` threads. Parsing runs in parallel,
/// `sink` sees segments in ascending order. Ends when the sink stops, a
/// segment is missing, or insertion fails.
pub fn load_segments<S>(
    directory: &Path,
    start: u32,
    workers: usize,
    params: &ChainParams,
    sink: S,
) -> Result<(), LoadFailure>
where
    S: FnMut(u64, SegmentLoad) -> Result<Flow, LoadFailure> + Send,
{
    let workers = workers.max(1);
    let claim = AtomicU32::new(start);
    let failure: Mutex<Option<LoadFailure>> = Mutex::new(None);
    let reassembly = ParkingReassembly::new(start as u64, workers, sink);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if reassembly.is_exiting() {
                    break;
                }
                let segment = claim.fetch_add(1, Ordering::SeqCst);
                let load = parse_segment(directory, segment, params);
                let is_last = load.end.is_some();
                match reassembly.submit(segment as u64, load) {
                    Ok(Submitted::Exit) => break,
                    Ok(_) => {}
                    Err(e) => {
                        if let Ok(mut slot) = failure.lock() {
                            *slot = Some(e);
                        }
                        reassembly.signal_exit();
                        break;
                    }
                }
                if is_last {
                    break;
                }
            });
        }
    });

    match failure.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Sets `segment` to `offset` bytes and deletes every later segment.
pub fn truncate_archive(directory: &Path, segment: u32, offset: u64) -> Result<(), IoError> {
    let path = directory.join(segment.to_string());
    if path.exists() {
        OpenOptions::new().write(true).open(&path)?.set_len(offset)?;
    }
    for later in list_segments(directory)? {
        if later > segment {
            fs::remove_file(directory.join(later.to_string()))?;
        }
    }
    warn!("Truncated archive {} at segment {} offset {}", directory.display(), segment, offset);
    Ok(())
}

pub fn list_segments(directory: &Path) -> Result<Vec<u32>, IoError> {
    let mut segments = Vec::new();
    if !directory.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if let Some(index) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) {
            segments.push(index);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

fn remove_dir_if_exists(path: &Path) -> Result<(), IoError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
