//! Archive extraction
//!
//! Every `List` line becomes one scheduler job. A job creates its path below
//! the extraction root and restores its attributes, except for directories:
//! their attributes are applied after all jobs finish, deepest path first,
//! so creating a child cannot disturb a restored parent's modify time.
//!
//! Regular file content is decoded one task per chunk. Decoding (read,
//! decompress, verify) runs in parallel; writes go through a
//! [`WriteSequencer`] so chunk `k` is written only after chunk `k - 1`.
//! The last chunk, and every chunk on a single-worker pool, is decoded on
//! the job's own thread.
//!
//! Records sharing a descriptor id are one hardlinked file. The first to
//! reach [`HardlinkSyncMap::join`] creates it; the others wait for its path
//! and link to it.

use crate::archive::ArchiveReader;
use crate::attrs::{make_fifo, make_socket, AclHandler, AttrRestorer, NoAcl};
use crate::config::Config;
use crate::create::FileObserver;
use crate::error::{PhatError, Result};
use crate::hardlink::{HardlinkSyncMap, LinkRole};
use crate::record::{ChunkDescriptor, FileKind, ListRecord};
use crate::scheduler::TaskScheduler;
use crate::sync::{Promise, WriteSequencer};
use crate::utils::{canonize_path, create_symlink, name_matches, path_below};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Point in a chunk task a [`ChunkHook`] is called at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStage {
    /// Before the block is read and decoded
    Decode,
    /// After the write turn is granted, before writing
    Write,
}

/// Callback with the chunk ordinal and stage; used to perturb task timing
pub type ChunkHook = Arc<dyn Fn(usize, ChunkStage) + Send + Sync>;

#[derive(Debug, Default)]
struct Counters {
    records: AtomicU64,
    files: AtomicU64,
    directories: AtomicU64,
    symlinks: AtomicU64,
    special_files: AtomicU64,
    hardlinks: AtomicU64,
    filtered: AtomicU64,
    skipped: AtomicU64,
    chunks_read: AtomicU64,
    bytes_written: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// What an extract run did
#[derive(Debug, Clone, Serialize)]
pub struct ExtractSummary {
    pub archive: String,
    pub target: PathBuf,
    /// Records extracted
    pub records: u64,
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub special_files: u64,
    pub hardlinks: u64,
    /// Records excluded by the path filters
    pub filtered: u64,
    /// Records of a type that cannot be recreated
    pub skipped: u64,
    pub chunks_read: u64,
    pub bytes_written: u64,
    /// Owner, mode and ACL failures downgraded to warnings
    pub attribute_warnings: u64,
    pub duration: Duration,
}

/// Poisons the file's sequencer unless its chunk was written
///
/// Carried by every chunk task, so a task dropped unrun by a stopped
/// scheduler still releases the chunks waiting behind it.
struct ChunkTurn {
    sequencer: Arc<WriteSequencer>,
    ordinal: usize,
    written: bool,
}

impl Drop for ChunkTurn {
    fn drop(&mut self) {
        if !self.written {
            self.sequencer.poison();
        }
    }
}

/// One extraction run
pub struct Extractor {
    reader: ArchiveReader,
    target: PathBuf,
    filters: Vec<PathBuf>,
    scheduler: Arc<TaskScheduler>,
    links: HardlinkSyncMap,
    attrs: AttrRestorer,
    deferred_dirs: Mutex<Vec<(PathBuf, ListRecord)>>,
    observer: Option<FileObserver>,
    chunk_hook: Option<ChunkHook>,
    counters: Counters,
}

impl Extractor {
    /// Extract `reader` into `process.extract_target`
    ///
    /// `process.file_args`, resolved against `process.cwd`, select which
    /// records are extracted by path prefix; none selects everything.
    pub fn new(reader: ArchiveReader, process: &Config, scheduler: Arc<TaskScheduler>) -> Self {
        let filters = process
            .file_args
            .iter()
            .map(|arg| canonize_path(Path::new(arg), &process.cwd))
            .collect();
        let target = canonize_path(&process.extract_target, &process.cwd);
        Self {
            links: HardlinkSyncMap::new(scheduler.gauge()),
            attrs: AttrRestorer::new(Arc::new(NoAcl)),
            reader,
            target,
            filters,
            scheduler,
            deferred_dirs: Mutex::new(Vec::new()),
            observer: None,
            chunk_hook: None,
            counters: Counters::default(),
        }
    }

    /// Use `acl` to apply ACL text
    pub fn with_acl(mut self, acl: Arc<dyn AclHandler>) -> Self {
        self.attrs = AttrRestorer::new(acl);
        self
    }

    /// Call `observer` with each extracted path
    pub fn with_observer(mut self, observer: FileObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    #[doc(hidden)]
    pub fn with_chunk_hook(mut self, hook: ChunkHook) -> Self {
        self.chunk_hook = Some(hook);
        self
    }

    /// Extraction root
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Extract every selected record
    ///
    /// The target directory must not exist yet.
    #[instrument(skip(self))]
    pub fn run(self) -> Result<ExtractSummary> {
        let started = Instant::now();
        if fs::symlink_metadata(&self.target).is_ok() {
            return Err(PhatError::TargetExists(self.target.clone()));
        }
        fs::create_dir_all(&self.target).map_err(PhatError::io_at("create dir", &self.target))?;
        info!(
            "extracting {} into {:?}",
            self.reader.layout().name(),
            self.target
        );

        let this = Arc::new(self);
        this.reader.for_each_line(|no, line| {
            if this.scheduler.is_stopped() {
                return Ok(());
            }
            let job = Arc::clone(&this);
            this.scheduler
                .submit(move || job.extract_line(no, &line), true);
            Ok(())
        })?;
        this.scheduler.wait_idle()?;

        this.restore_directories()?;
        Ok(this.summary(started.elapsed()))
    }

    fn summary(&self, duration: Duration) -> ExtractSummary {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        ExtractSummary {
            archive: self.reader.layout().name().to_string(),
            target: self.target.clone(),
            records: get(&c.records),
            files: get(&c.files),
            directories: get(&c.directories),
            symlinks: get(&c.symlinks),
            special_files: get(&c.special_files),
            hardlinks: get(&c.hardlinks),
            filtered: get(&c.filtered),
            skipped: get(&c.skipped),
            chunks_read: get(&c.chunks_read),
            bytes_written: get(&c.bytes_written),
            attribute_warnings: self.attrs.warnings(),
            duration,
        }
    }

    fn extract_line(self: &Arc<Self>, no: usize, line: &str) -> Result<()> {
        let record = ListRecord::parse(line, &self.reader.list_origin(), no)?;
        if !self.filters.is_empty() && !self.filters.iter().any(|f| name_matches(&record.name, f)) {
            bump(&self.counters.filtered, 1);
            return Ok(());
        }

        let path = path_below(&self.target, &record.name);
        if let Some(observer) = &self.observer {
            observer(&path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(PhatError::io_at("create dir", parent))?;
        }

        let leader = match record.content.map(|r| self.links.join(r.id)) {
            Some(LinkRole::Follower(first)) => return self.link_to_first(first, &path),
            Some(LinkRole::Leader(resolver)) => Some(resolver),
            None => None,
        };
        self.materialize(&record, &path)?;
        bump(&self.counters.records, 1);
        if let Some(resolver) = leader {
            resolver.resolve(path);
        }
        Ok(())
    }

    fn link_to_first(&self, first: Promise<PathBuf>, path: &Path) -> Result<()> {
        let first = first.wait()?;
        fs::hard_link(&first, path).map_err(PhatError::io_at("link", path))?;
        bump(&self.counters.hardlinks, 1);
        bump(&self.counters.records, 1);
        trace!("linked {:?} to {:?}", path, first);
        Ok(())
    }

    /// Create one path and, unless it is a directory, restore its attributes
    fn materialize(self: &Arc<Self>, record: &ListRecord, path: &Path) -> Result<()> {
        match record.kind() {
            FileKind::Directory => {
                fs::create_dir_all(path).map_err(PhatError::io_at("create dir", path))?;
                self.deferred_dirs.lock().push((path.to_path_buf(), record.clone()));
                bump(&self.counters.directories, 1);
                return Ok(());
            }
            FileKind::Symlink => {
                let Some(target) = &record.link_target else {
                    return Err(PhatError::format(
                        self.reader.list_origin(),
                        None,
                        format!("symlink {} has no target", record.name),
                    ));
                };
                create_symlink(Path::new(target), path)?;
                bump(&self.counters.symlinks, 1);
            }
            FileKind::Fifo => {
                make_fifo(path, record.mode)?;
                bump(&self.counters.special_files, 1);
            }
            FileKind::Socket => {
                make_socket(path)?;
                bump(&self.counters.special_files, 1);
            }
            FileKind::Regular => {
                self.write_content(record, path)?;
                bump(&self.counters.files, 1);
            }
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Unknown => {
                warn!("can't recreate {} of mode {:o}", record.name, record.mode);
                bump(&self.counters.skipped, 1);
                return Ok(());
            }
        }
        self.attrs.restore(path, record)
    }

    fn write_content(self: &Arc<Self>, record: &ListRecord, path: &Path) -> Result<()> {
        let file = Arc::new(File::create(path).map_err(PhatError::io_at("create", path))?);
        let Some(reference) = record.content else {
            return Ok(());
        };
        let chunks = self.reader.read_descriptors(&reference)?;
        let count = chunks.len();
        let sequencer = Arc::new(WriteSequencer::new(self.scheduler.gauge()));
        let parallel = self.scheduler.size() > 1;

        for (ordinal, chunk) in chunks.into_iter().enumerate() {
            let turn = ChunkTurn {
                sequencer: Arc::clone(&sequencer),
                ordinal,
                written: false,
            };
            if parallel && ordinal + 1 < count {
                let this = Arc::clone(self);
                let file = Arc::clone(&file);
                let path = path.to_path_buf();
                self.scheduler.submit(
                    move || this.extract_chunk(turn, count, &chunk, &file, &path),
                    true,
                );
            } else {
                self.extract_chunk(turn, count, &chunk, &file, path)?;
            }
        }

        sequencer.wait_all(count)?;
        debug!("wrote {} chunks to {:?}", count, path);
        Ok(())
    }

    fn extract_chunk(
        &self,
        mut turn: ChunkTurn,
        count: usize,
        chunk: &ChunkDescriptor,
        file: &File,
        path: &Path,
    ) -> Result<()> {
        let ordinal = turn.ordinal;
        if let Some(hook) = &self.chunk_hook {
            hook(ordinal, ChunkStage::Decode);
        }

        let data = self.reader.read_chunk(chunk)?;
        bump(&self.counters.chunks_read, 1);
        let chunk_size = self.reader.config().chunk_size;
        if ordinal + 1 < count && data.len() != chunk_size {
            return Err(PhatError::format(
                format!("Chunks/{}", chunk.block),
                None,
                format!("chunk {} of {:?} decoded to {} bytes, expected {}", ordinal, path, data.len(), chunk_size),
            ));
        }

        turn.sequencer.wait_turn(ordinal)?;
        if let Some(hook) = &self.chunk_hook {
            hook(ordinal, ChunkStage::Write);
        }
        file.write_all_at(&data, ordinal as u64 * chunk_size as u64)
            .map_err(PhatError::io_at("write", path))?;
        bump(&self.counters.bytes_written, data.len() as u64);
        turn.sequencer.complete(ordinal)?;
        turn.written = true;
        Ok(())
    }

    /// Apply deferred directory attributes, deepest path first
    fn restore_directories(&self) -> Result<()> {
        let mut dirs = std::mem::take(&mut *self.deferred_dirs.lock());
        dirs.sort_by(|(a, _), (b, _)| b.as_os_str().len().cmp(&a.as_os_str().len()));
        for (path, record) in &dirs {
            self.attrs.restore(path, record)?;
        }
        debug!("restored attributes of {} directories", dirs.len());
        Ok(())
    }
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("archive", &self.reader.layout().name())
            .field("target", &self.target)
            .field("filters", &self.filters)
            .finish()
    }
}
