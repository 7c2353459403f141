//! Archive creation
//!
//! The main thread walks the file arguments and hands one task per path to
//! the [`TaskScheduler`]. A regular file task splits the file into
//! fixed-size chunks and submits one task per chunk that hashes it and either
//! links the base archive's identical block or compresses and writes a new
//! one.
//!
//! ## Chunk pipeline
//!
//! Chunk tasks finish in any order. Their outcomes come back through a queue
//! of [`Promise`]s in submission order: ready outcomes at the front are taken
//! after every submission without blocking, and the reader blocks on the
//! oldest outcome only once as many chunks are in flight as there are
//! workers. Descriptor lines are therefore always appended in chunk order.
//!
//! ## Reuse rules
//!
//! With a base record for the same name:
//!
//! - same size and modify time: nothing is read; every chunk block and the
//!   descriptor block are hardlinked from the base
//! - otherwise each chunk whose hash equals the base chunk at the same
//!   ordinal is linked; any other chunk frees the base's index and is
//!   written fresh
//! - the base descriptor block is linked only if every chunk matched and
//!   the chunk count is unchanged

use crate::archive::{ArchiveWriter, BaseArchive};
use crate::attrs::{AclHandler, NoAcl};
use crate::compression::CompressionStats;
use crate::config::Config;
use crate::error::{PhatError, Result};
use crate::hardlink::{InodeEntry, InodeRegistry, Registration};
use crate::live::{read_chunk, LiveFile};
use crate::record::{render_descriptors, ChunkDescriptor, DescriptorRef, FileKind, ListRecord};
use crate::repository::Repository;
use crate::scheduler::TaskScheduler;
use crate::sync::{promise, Promise};
use crate::utils::{ancestors_of, canonize_path, time_name};
use chrono::Local;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Callback invoked with each path as it is visited
pub type FileObserver = Arc<dyn Fn(&Path) + Send + Sync>;

/// Which archive a create run deduplicates against
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BaseSelection {
    /// Newest finished archive with a time-formatted name, if any
    #[default]
    Latest,
    /// None; write every block fresh
    Rebase,
    /// The named archive
    Named(String),
}

#[derive(Debug, Default)]
struct Counters {
    files: AtomicU64,
    directories: AtomicU64,
    symlinks: AtomicU64,
    special_files: AtomicU64,
    hardlinks: AtomicU64,
    skipped: AtomicU64,
    unchanged_files: AtomicU64,
    bytes_read: AtomicU64,
    chunks_written: AtomicU64,
    chunks_linked: AtomicU64,
    descriptors_written: AtomicU64,
    descriptors_linked: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// What a create run did
#[derive(Debug, Clone, Serialize)]
pub struct CreateSummary {
    /// Name of the new archive
    pub archive: String,
    /// Base archive name, if one was used
    pub base: Option<String>,
    /// Records written to `List`
    pub records: u64,
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    /// Fifos and sockets
    pub special_files: u64,
    /// Additional names of multiply-linked files
    pub hardlinks: u64,
    /// Paths skipped as unsupported
    pub skipped: u64,
    /// Files taken from the base without reading them
    pub unchanged_files: u64,
    /// Content bytes read from the live tree
    pub bytes_read: u64,
    pub chunks_written: u64,
    pub chunks_linked: u64,
    pub descriptors_written: u64,
    pub descriptors_linked: u64,
    /// Compression statistics for newly written blocks
    pub compression: CompressionStats,
    /// Wall time of the run
    pub duration: Duration,
}

#[derive(Debug, Clone)]
struct ChunkOutcome {
    descriptor: ChunkDescriptor,
    kept: bool,
}

/// Base record a file is compared against
struct Baseline<'a> {
    base: &'a BaseArchive,
    reference: DescriptorRef,
    block: u64,
    record: ListRecord,
    chunks: Vec<ChunkDescriptor>,
}

/// One archive creation run
pub struct Creator {
    archive: ArchiveWriter,
    base: Option<BaseArchive>,
    scheduler: Arc<TaskScheduler>,
    inodes: InodeRegistry,
    acl: Arc<dyn AclHandler>,
    observer: Option<FileObserver>,
    counters: Counters,
}

impl Creator {
    /// Open the base (if any) and create the new archive directory
    ///
    /// Without `archive_name` the archive is named after the current time.
    /// A base archive's chunk size, hash and codec override `config`'s.
    pub fn new(
        repo: &Repository,
        config: &Config,
        archive_name: Option<&str>,
        selection: BaseSelection,
        scheduler: Arc<TaskScheduler>,
    ) -> Result<Self> {
        let started = Local::now();
        let name = archive_name
            .map(str::to_string)
            .unwrap_or_else(|| time_name(started));

        let base_name = match selection {
            BaseSelection::Rebase => None,
            BaseSelection::Named(base) => Some(base),
            BaseSelection::Latest => repo.latest_finished()?,
        };
        let base = base_name
            .map(|b| BaseArchive::open(repo.layout(&b).dir(), config))
            .transpose()?;

        let config = match &base {
            Some(base) => config.inherit_format(base.reader().config()),
            None => config.clone(),
        };
        config.validate()?;

        match &base {
            Some(b) => info!(
                "creating archive {}::{} using base archive {}",
                repo.dir().display(),
                name,
                b.reader().layout().name()
            ),
            None => info!("creating new base archive {}::{}", repo.dir().display(), name),
        }

        let archive = ArchiveWriter::create(repo.dir(), &name, &config, base.as_ref(), started, &scheduler)?;
        Ok(Self {
            archive,
            base,
            scheduler,
            inodes: InodeRegistry::new(),
            acl: Arc::new(NoAcl),
            observer: None,
            counters: Counters::default(),
        })
    }

    /// Use `acl` to read ACL text
    pub fn with_acl(mut self, acl: Arc<dyn AclHandler>) -> Self {
        self.acl = acl;
        self
    }

    /// Call `observer` with each path as it is visited
    pub fn with_observer(mut self, observer: FileObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn archive(&self) -> &ArchiveWriter {
        &self.archive
    }

    /// Archive every file argument, then mark the archive finished
    ///
    /// Ancestors of each argument are archived first without recursion so
    /// their attributes can be restored; then each argument recursively.
    #[instrument(skip(self))]
    pub fn run(self) -> Result<CreateSummary> {
        let started = Instant::now();
        let this = Arc::new(self);
        let config = this.archive.config();
        if config.file_args.is_empty() {
            return Err(PhatError::InvalidConfiguration("no files to archive".into()));
        }

        let args: Vec<PathBuf> = config
            .file_args
            .iter()
            .map(|arg| canonize_path(Path::new(arg), &config.cwd))
            .collect();
        let roots: BTreeSet<PathBuf> = args.iter().flat_map(|arg| ancestors_of(arg)).collect();

        for root in &roots {
            this.visit(root, false)?;
        }
        for arg in &args {
            this.visit(arg, true)?;
        }

        this.scheduler.wait_idle()?;
        this.archive.finish()?;
        Ok(this.summary(started.elapsed()))
    }

    fn summary(&self, duration: Duration) -> CreateSummary {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CreateSummary {
            archive: self.archive.layout().name().to_string(),
            base: self.base.as_ref().map(|b| b.reader().layout().name().to_string()),
            records: self.archive.records_written(),
            files: get(&c.files),
            directories: get(&c.directories),
            symlinks: get(&c.symlinks),
            special_files: get(&c.special_files),
            hardlinks: get(&c.hardlinks),
            skipped: get(&c.skipped),
            unchanged_files: get(&c.unchanged_files),
            bytes_read: get(&c.bytes_read),
            chunks_written: get(&c.chunks_written),
            chunks_linked: get(&c.chunks_linked),
            descriptors_written: get(&c.descriptors_written),
            descriptors_linked: get(&c.descriptors_linked),
            compression: self.archive.engine().stats(),
            duration,
        }
    }

    /// Stat `path`, schedule its record, and descend if `recurse`
    fn visit(self: &Arc<Self>, path: &Path, recurse: bool) -> Result<()> {
        if self.scheduler.is_stopped() {
            return Ok(());
        }
        if let Some(observer) = &self.observer {
            observer(path);
        }

        let live = match LiveFile::stat(path) {
            Ok(live) => live,
            Err(PhatError::UnsupportedFileType { path }) => {
                warn!("skipping unsupported file {:?}", path);
                bump(&self.counters.skipped, 1);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let children = if recurse { live.children()? } else { Vec::new() };

        let mut inode = None;
        if let Some(key) = live.inode_key() {
            match self.inodes.register(key) {
                Registration::Follower(entry) => {
                    let this = Arc::clone(self);
                    let name = live.name().to_string();
                    self.scheduler
                        .submit(move || this.record_link(&entry, &name), false);
                    return Ok(());
                }
                Registration::First(entry) => inode = Some(entry),
            }
        }

        let this = Arc::clone(self);
        self.scheduler
            .submit(move || this.archive_file(&live, inode.as_deref()), false);

        for child in children {
            self.visit(&child, true)?;
        }
        Ok(())
    }

    /// Later name of a multiply-linked inode
    fn record_link(&self, entry: &InodeEntry, name: &str) -> Result<()> {
        if let Some(record) = entry.follow(name) {
            self.archive.push_record(&record)?;
            bump(&self.counters.hardlinks, 1);
        }
        Ok(())
    }

    /// Build and append the record for one live path
    fn archive_file(self: &Arc<Self>, live: &LiveFile, inode: Option<&InodeEntry>) -> Result<()> {
        let kind = live.kind();
        let acl = match kind {
            FileKind::Symlink => None,
            _ => self.acl.read_acl(live.path(), live.mode())?,
        };
        let mut record = live.to_record(acl);

        match kind {
            FileKind::Regular if live.size() > 0 => {
                record.content = Some(self.store_content(live)?);
            }
            FileKind::Directory | FileKind::Symlink => {}
            _ => record.content = Some(DescriptorRef::synthetic(self.archive.next_zero_len_id())),
        }

        let counter = match kind {
            FileKind::Regular => &self.counters.files,
            FileKind::Directory => &self.counters.directories,
            FileKind::Symlink => &self.counters.symlinks,
            _ => &self.counters.special_files,
        };
        bump(counter, 1);

        self.archive.push_record(&record)?;
        if let Some(entry) = inode {
            let waiting = entry.complete(&record, |r| self.archive.push_record(r))?;
            bump(&self.counters.hardlinks, waiting as u64);
        }
        trace!("archived {}", record.name);
        Ok(())
    }

    fn baseline(&self, live: &LiveFile) -> Result<Option<Baseline<'_>>> {
        let Some(base) = &self.base else {
            return Ok(None);
        };
        let Some(record) = base.claim(live.name()) else {
            return Ok(None);
        };
        let Some(reference) = record.content else {
            return Ok(None);
        };
        let Some(block) = reference.block_index() else {
            return Ok(None);
        };
        let chunks = base.reader().read_descriptors(&reference)?;
        Ok(Some(Baseline {
            base,
            reference,
            block,
            record: record.clone(),
            chunks,
        }))
    }

    /// Write or link the blocks of a non-empty regular file
    fn store_content(self: &Arc<Self>, live: &LiveFile) -> Result<DescriptorRef> {
        let baseline = self.baseline(live)?;

        if let Some(b) = &baseline {
            if b.record.size == live.size() && b.record.mtime_ns == live.mtime_ns() {
                let base_chunks = b.base.reader().chunks().top();
                for chunk in &b.chunks {
                    self.archive.chunks().link(chunk.block, base_chunks)?;
                }
                self.archive
                    .finfo()
                    .link(b.block, b.base.reader().finfo().top())?;
                bump(&self.counters.chunks_linked, b.chunks.len() as u64);
                bump(&self.counters.descriptors_linked, 1);
                bump(&self.counters.unchanged_files, 1);
                trace!("{} unchanged since base", live.name());
                return Ok(b.reference);
            }
        }

        let (descriptors, all_kept) = self.chunk_file(live, baseline.as_ref())?;

        if let Some(b) = &baseline {
            if all_kept && descriptors.len() == b.chunks.len() {
                self.archive
                    .finfo()
                    .link(b.block, b.base.reader().finfo().top())?;
                bump(&self.counters.descriptors_linked, 1);
                return Ok(b.reference);
            }
            self.archive.finfo().allocator().free(b.block)?;
            for stale in b.chunks.iter().skip(descriptors.len()) {
                self.archive.chunks().allocator().free(stale.block)?;
            }
        }

        let text = render_descriptors(&descriptors);
        let (flag, stored) = self.archive.engine().pack(text.as_bytes())?;
        let idx = self.archive.finfo().spit_new(&stored)?;
        bump(&self.counters.descriptors_written, 1);
        debug!("{}: {} chunks, descriptor block {}", live.name(), descriptors.len(), idx);
        Ok(DescriptorRef::block(flag, idx))
    }

    /// Read `live` chunk by chunk through the scheduler
    ///
    /// Returns the descriptors in chunk order and whether every chunk was
    /// reused from the baseline.
    fn chunk_file(
        self: &Arc<Self>,
        live: &LiveFile,
        baseline: Option<&Baseline<'_>>,
    ) -> Result<(Vec<ChunkDescriptor>, bool)> {
        let chunk_size = self.archive.config().chunk_size;
        let window = self.scheduler.size().max(1);
        let base_top = baseline.map(|b| b.base.reader().chunks().top().to_path_buf());

        let mut file = live.open()?;
        let mut pending: VecDeque<Promise<ChunkOutcome>> = VecDeque::new();
        let mut descriptors = Vec::new();
        let mut all_kept = true;

        let mut take_front = |pending: &mut VecDeque<Promise<ChunkOutcome>>| -> Result<()> {
            if let Some(front) = pending.pop_front() {
                let outcome = front.wait()?;
                all_kept &= outcome.kept;
                descriptors.push(outcome.descriptor);
            }
            Ok(())
        };

        for ordinal in 0.. {
            let data = read_chunk(&mut file, chunk_size, live.path())?;
            if data.is_empty() {
                break;
            }
            bump(&self.counters.bytes_read, data.len() as u64);
            let at_end = data.len() < chunk_size;

            while pending.len() >= window {
                take_front(&mut pending)?;
            }

            let base_chunk = baseline.and_then(|b| b.chunks.get(ordinal).cloned());
            let (resolver, outcome) = promise(&self.scheduler.gauge());
            pending.push_back(outcome);

            let this = Arc::clone(self);
            let base_top = base_top.clone();
            self.scheduler.submit(
                move || {
                    let outcome = this.store_chunk(&data, base_chunk, base_top.as_deref())?;
                    resolver.resolve(outcome);
                    Ok(())
                },
                false,
            );

            while pending.front().is_some_and(Promise::is_ready) {
                take_front(&mut pending)?;
            }

            if at_end {
                break;
            }
        }

        while !pending.is_empty() {
            take_front(&mut pending)?;
        }
        Ok((descriptors, all_kept))
    }

    /// Hash one chunk, then link the base block or write a new one
    fn store_chunk(
        &self,
        data: &[u8],
        base_chunk: Option<ChunkDescriptor>,
        base_top: Option<&Path>,
    ) -> Result<ChunkOutcome> {
        let hash = self.archive.config().hash_type.digest(data);
        let chunks = self.archive.chunks();

        if let Some(base_chunk) = base_chunk {
            match base_top {
                Some(top) if base_chunk.hash == hash => {
                    chunks.link(base_chunk.block, top)?;
                    bump(&self.counters.chunks_linked, 1);
                    return Ok(ChunkOutcome {
                        descriptor: base_chunk,
                        kept: true,
                    });
                }
                _ => chunks.allocator().free(base_chunk.block)?,
            }
        }

        let (flag, stored) = self.archive.engine().pack(data)?;
        let block = chunks.spit_new(&stored)?;
        bump(&self.counters.chunks_written, 1);
        Ok(ChunkOutcome {
            descriptor: ChunkDescriptor { flag, block, hash },
            kept: false,
        })
    }
}

impl std::fmt::Debug for Creator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Creator")
            .field("archive", &self.archive.layout().name())
            .field("base", &self.base.as_ref().map(|b| b.reader().layout().name()))
            .field("inodes", &self.inodes.len())
            .finish()
    }
}
