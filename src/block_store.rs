//! On-disk block storage for one block space
//!
//! A [`BlockStore`] pairs a [`BlockAllocator`] with the directory tree its
//! indices map to. Blocks are plain files named by their decimal index inside
//! sharded subdirectories (see [`crate::block_list`]).
//!
//! ## Deduplication by hardlink
//!
//! [`link`](BlockStore::link) places a hardlink to a block of another archive's
//! store at the same index in this store. Unchanged content is never
//! rewritten, so an archive's disk usage reflects only what is new in it.
//!
//! Writes go to a temporary file in the target directory that is then renamed
//! over the block path. A block path that is a hardlink into an older archive
//! is therefore replaced, never written through.
//!
//! ## Recovery
//!
//! Allocation state is never persisted. [`reverse_alloc`](BlockStore::reverse_alloc)
//! rebuilds it by walking a block tree and marking every index found there;
//! [`scan`](BlockStore::scan) does the same walk for integrity checks.

use crate::block_list::{BlockAllocator, BlockIndex};
use crate::error::{PhatError, Result};
use crate::scheduler::TaskScheduler;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Block files of one space found on disk
#[derive(Debug, Default, Clone)]
pub struct BlockScan {
    /// Indices present
    pub present: BTreeSet<BlockIndex>,
    /// Indices found more than once, with every path they were seen at
    pub duplicates: BTreeMap<BlockIndex, Vec<PathBuf>>,
    /// Files whose name is not a decimal index
    pub stray: Vec<PathBuf>,
}

/// Reader/writer of the blocks of one space
#[derive(Debug)]
pub struct BlockStore {
    top: PathBuf,
    allocator: BlockAllocator,
    read_size: usize,
}

impl BlockStore {
    /// Store rooted at `top`; `read_size` is the unit reads are issued in
    pub fn new(top: impl Into<PathBuf>, space: &str, modulus: u64, read_size: usize) -> Self {
        Self {
            top: top.into(),
            allocator: BlockAllocator::new(space, modulus),
            read_size: read_size.max(1),
        }
    }

    /// Top directory of this space
    pub fn top(&self) -> &Path {
        &self.top
    }

    /// Allocation state of this space
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Path of block `idx`
    pub fn path(&self, idx: BlockIndex) -> PathBuf {
        self.allocator.path_under(&self.top, idx)
    }

    /// Read the whole block
    pub fn slurp(&self, idx: BlockIndex) -> Result<Vec<u8>> {
        let path = self.path(idx);
        let mut file = File::open(&path).map_err(PhatError::io_at("open block", &path))?;

        let mut buf = Vec::new();
        let mut total = 0;
        loop {
            buf.resize(total + self.read_size, 0);
            let n = file
                .read(&mut buf[total..])
                .map_err(PhatError::io_at("read block", &path))?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        trace!("slurped {} bytes from {:?}", total, path);
        Ok(buf)
    }

    /// Write `bytes` as block `idx`, creating shard directories as needed
    pub fn spit(&self, idx: BlockIndex, bytes: &[u8]) -> Result<()> {
        let dir = self.allocator.dir_under(&self.top, idx);
        fs::create_dir_all(&dir).map_err(PhatError::io_at("create block dir", &dir))?;
        let path = dir.join(idx.to_string());

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(PhatError::io_at("create temp block", &dir))?;
        tmp.write_all(bytes)
            .map_err(PhatError::io_at("write block", tmp.path()))?;
        tmp.persist(&path)
            .map_err(|e| PhatError::io_at("persist block", &path)(e.error))?;
        trace!("wrote {} bytes to {:?}", bytes.len(), path);
        Ok(())
    }

    /// Allocate an index and write `bytes` there
    pub fn spit_new(&self, bytes: &[u8]) -> Result<BlockIndex> {
        let idx = self.allocator.alloc()?;
        self.spit(idx, bytes)?;
        Ok(idx)
    }

    /// Hardlink block `idx` of the store rooted at `source_top` into this one
    pub fn link(&self, idx: BlockIndex, source_top: &Path) -> Result<()> {
        let dir = self.allocator.dir_under(&self.top, idx);
        fs::create_dir_all(&dir).map_err(PhatError::io_at("create block dir", &dir))?;
        let dest = dir.join(idx.to_string());
        let source = self.allocator.path_under(source_top, idx);

        match fs::hard_link(&source, &dest) {
            Ok(()) => {
                trace!("linked {:?} -> {:?}", dest, source);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("block {:?} already linked", dest);
                Ok(())
            }
            Err(e) => Err(PhatError::io_at("link block", &source)(e)),
        }
    }

    /// Mark every block found under `dir` as allocated
    ///
    /// Subdirectories are walked as scheduler tasks. Returns once the whole
    /// tree has been processed; must not be called from a scheduler worker.
    pub fn reverse_alloc(self: &Arc<Self>, dir: &Path, scheduler: &Arc<TaskScheduler>) -> Result<()> {
        debug!("rebuilding {} allocation from {:?}", self.allocator.space(), dir);
        reverse_alloc_dir(Arc::clone(self), dir.to_path_buf(), Arc::clone(scheduler))?;
        scheduler.wait_idle()?;
        debug!(
            "{} now has {} allocated blocks",
            self.allocator.space(),
            self.allocator.count_allocated()
        );
        Ok(())
    }

    /// Inventory of block files under this store's top directory
    pub fn scan(&self) -> Result<BlockScan> {
        let mut scan = BlockScan::default();
        let mut seen: BTreeMap<BlockIndex, PathBuf> = BTreeMap::new();

        for entry in WalkDir::new(&self.top).min_depth(1) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path().to_path_buf();
            let Some(idx) = parse_index(entry.file_name()) else {
                warn!("unexpected file in {}: {:?}", self.allocator.space(), path);
                scan.stray.push(path);
                continue;
            };
            if let Some(first) = seen.get(&idx) {
                warn!("duplicate {} block {}: {:?}", self.allocator.space(), idx, path);
                scan.duplicates
                    .entry(idx)
                    .or_insert_with(|| vec![first.clone()])
                    .push(path);
                continue;
            }
            seen.insert(idx, path);
            scan.present.insert(idx);
        }
        Ok(scan)
    }
}

fn reverse_alloc_dir(store: Arc<BlockStore>, dir: PathBuf, scheduler: Arc<TaskScheduler>) -> Result<()> {
    let entries = fs::read_dir(&dir).map_err(PhatError::io_at("read dir", &dir))?;
    for entry in entries {
        let entry = entry.map_err(PhatError::io_at("read dir", &dir))?;
        let file_type = entry.file_type().map_err(PhatError::io_at("stat", entry.path()))?;
        if file_type.is_dir() {
            let store = Arc::clone(&store);
            let sub = entry.path();
            let pool = Arc::clone(&scheduler);
            scheduler.submit(move || reverse_alloc_dir(store, sub, pool), false);
            continue;
        }
        match parse_index(&entry.file_name()) {
            Some(idx) => store.allocator.mark_allocated(idx)?,
            None => warn!("ignoring non-block file {:?}", entry.path()),
        }
    }
    Ok(())
}

fn parse_index(name: &std::ffi::OsStr) -> Option<BlockIndex> {
    let name = name.to_str()?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}
