//! Archive integrity testing and live comparison
//!
//! ## Test mode
//!
//! [`ArchiveVerifier`] reads every descriptor block referenced from the
//! `List` and every chunk block those descriptors name, re-hashing chunk
//! content against the recorded hash. Damage found this way is reported, not
//! raised: a single bad chunk must not hide the state of the rest of the
//! archive. The block trees are then scanned and reconciled with the set of
//! referenced indices, which finds missing blocks as well as blocks nothing
//! refers to.
//!
//! ## Compare mode
//!
//! [`Comparator`] checks each record against the live file at the same path:
//! type, permissions, modify time, size, symlink target and, for regular
//! files, the hash of every chunk. Only descriptor blocks are read from the
//! archive; chunk content is compared by hash.
//!
//! Malformed `List` text is fatal in both modes.

use crate::archive::{ArchiveReader, CHUNKS_SPACE, FINFO_SPACE};
use crate::block_list::BlockIndex;
use crate::block_store::BlockScan;
use crate::collections::{concurrent_set, ConcurrentSet};
use crate::error::{PhatError, Result};
use crate::live::{read_chunk, LiveFile};
use crate::record::{ChunkDescriptor, DescriptorRef, FileKind, ListRecord};
use crate::scheduler::TaskScheduler;
use crate::utils::{name_matches, path_below};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// A block of one space
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BlockId {
    pub space: &'static str,
    pub index: BlockIndex,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.space, self.index)
    }
}

/// Result of testing one archive
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub archive: String,
    /// `List` records read
    pub records_checked: u64,
    /// Chunk blocks read and re-hashed
    pub chunks_checked: u64,
    /// Chunks whose content no longer matches the recorded hash
    pub hash_mismatches: u64,
    /// Blocks referenced from the archive but absent on disk
    pub missing_blocks: Vec<BlockId>,
    /// Blocks on disk that nothing references
    pub unused_blocks: Vec<BlockId>,
    /// Every problem found, in the order found
    pub warnings: Vec<String>,
    pub duration: Duration,
}

impl VerificationReport {
    /// True when nothing at all was found wrong
    pub fn is_valid(&self) -> bool {
        self.hash_mismatches == 0
            && self.missing_blocks.is_empty()
            && self.unused_blocks.is_empty()
            && self.warnings.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.is_valid() {
            return format!(
                "Archive {} is valid ({} records, {} chunks verified in {})",
                self.archive,
                self.records_checked,
                self.chunks_checked,
                humantime::format_duration(truncate_millis(self.duration))
            );
        }
        let issues = [
            (self.hash_mismatches > 0).then(|| format!("{} hash mismatches", self.hash_mismatches)),
            (!self.missing_blocks.is_empty()).then(|| format!("{} missing blocks", self.missing_blocks.len())),
            (!self.unused_blocks.is_empty()).then(|| format!("{} unused blocks", self.unused_blocks.len())),
            (!self.warnings.is_empty()).then(|| format!("{} warnings", self.warnings.len())),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
        format!(
            "Archive {} has problems: {} ({} records, {} chunks checked)",
            self.archive, issues, self.records_checked, self.chunks_checked
        )
    }
}

fn truncate_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Tests the integrity of one archive
pub struct ArchiveVerifier {
    reader: Arc<ArchiveReader>,
    scheduler: Arc<TaskScheduler>,
    descriptors: ConcurrentSet<BlockIndex>,
    chunks: ConcurrentSet<BlockIndex>,
    chunks_checked: AtomicU64,
    hash_mismatches: AtomicU64,
    warnings: Mutex<Vec<String>>,
}

impl ArchiveVerifier {
    pub fn new(reader: ArchiveReader, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            reader: Arc::new(reader),
            scheduler,
            descriptors: concurrent_set(),
            chunks: concurrent_set(),
            chunks_checked: AtomicU64::new(0),
            hash_mismatches: AtomicU64::new(0),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Check every referenced block, then reconcile the block trees
    #[instrument(skip(self))]
    pub fn verify(self) -> Result<VerificationReport> {
        let started = Instant::now();
        let this = Arc::new(self);
        let origin = this.reader.list_origin();
        let mut records_checked = 0u64;

        this.reader.for_each_line(|no, line| {
            let record = ListRecord::parse(&line, &origin, no)?;
            records_checked += 1;
            let Some(reference) = record.content else {
                return Ok(());
            };
            let Some(idx) = reference.block_index() else {
                return Ok(());
            };
            if !this.descriptors.insert(idx) {
                return Ok(());
            }
            let job = Arc::clone(&this);
            this.scheduler.submit(
                move || {
                    job.check_descriptor(&record, reference);
                    Ok(())
                },
                true,
            );
            Ok(())
        })?;
        this.scheduler.wait_idle()?;

        let finfo_scan = this.reader.finfo().scan()?;
        let chunks_scan = this.reader.chunks().scan()?;
        let mut missing = Vec::new();
        let mut unused = Vec::new();
        for (space, scan, referenced) in [
            (FINFO_SPACE, &finfo_scan, &this.descriptors),
            (CHUNKS_SPACE, &chunks_scan, &this.chunks),
        ] {
            this.reconcile(space, scan, referenced, &mut missing, &mut unused);
        }

        let report = VerificationReport {
            archive: this.reader.layout().name().to_string(),
            records_checked,
            chunks_checked: this.chunks_checked.load(Ordering::Relaxed),
            hash_mismatches: this.hash_mismatches.load(Ordering::Relaxed),
            missing_blocks: missing,
            unused_blocks: unused,
            warnings: std::mem::take(&mut *this.warnings.lock()),
            duration: started.elapsed(),
        };
        info!("{}", report.summary());
        Ok(report)
    }

    fn note(&self, message: String) {
        warn!("{}", message);
        self.warnings.lock().push(message);
    }

    fn check_descriptor(self: &Arc<Self>, record: &ListRecord, reference: DescriptorRef) {
        let chunks = match self.reader.read_descriptors(&reference) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.note(format!("descriptors of {}: {}", record.name, e));
                return;
            }
        };
        debug!("{}: {} chunks", record.name, chunks.len());
        for chunk in chunks {
            if !self.chunks.insert(chunk.block) {
                continue;
            }
            let job = Arc::clone(self);
            let name = record.name.clone();
            self.scheduler.submit(
                move || {
                    job.check_chunk(&name, &chunk);
                    Ok(())
                },
                true,
            );
        }
    }

    fn check_chunk(&self, name: &str, chunk: &ChunkDescriptor) {
        self.chunks_checked.fetch_add(1, Ordering::Relaxed);
        match self.reader.read_chunk(chunk) {
            Ok(_) => {}
            Err(e) if e.is_integrity() => {
                self.hash_mismatches.fetch_add(1, Ordering::Relaxed);
                self.note(format!("{}: {}", name, e));
            }
            Err(e) => self.note(format!("chunk {} of {}: {}", chunk.block, name, e)),
        }
    }

    fn reconcile(
        &self,
        space: &'static str,
        scan: &BlockScan,
        referenced: &ConcurrentSet<BlockIndex>,
        missing: &mut Vec<BlockId>,
        unused: &mut Vec<BlockId>,
    ) {
        for path in &scan.stray {
            self.note(format!("unexpected file in {}: {:?}", space, path));
        }
        for (index, paths) in &scan.duplicates {
            self.note(format!("{} block {} stored {} times: {:?}", space, index, paths.len(), paths));
        }

        let wanted: BTreeSet<BlockIndex> = referenced.iter().map(|idx| *idx).collect();
        for &index in wanted.difference(&scan.present) {
            warn!("{} block {} is missing", space, index);
            missing.push(BlockId { space, index });
        }
        for &index in scan.present.difference(&wanted) {
            error!("{} block {} is not referenced", space, index);
            unused.push(BlockId { space, index });
        }
    }
}

impl fmt::Debug for ArchiveVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveVerifier")
            .field("archive", &self.reader.layout().name())
            .finish()
    }
}

/// One way a live file differs from its record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DifferenceKind {
    /// No live file at the recorded path
    Missing,
    Type { archived: FileKind, live: FileKind },
    Mode { archived: u32, live: u32 },
    ModifyTime { archived_ns: i64, live_ns: i64 },
    Size { archived: u64, live: u64 },
    LinkTarget { archived: String, live: String },
    /// First chunk whose hash differs
    Content { chunk: usize },
    /// The comparison itself failed
    Unreadable { reason: String },
}

/// A difference found for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Difference {
    pub name: String,
    #[serde(flatten)]
    pub kind: DifferenceKind,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DifferenceKind::Missing => write!(f, "{}: missing", self.name),
            DifferenceKind::Type { archived, live } => {
                write!(f, "{}: type {:?} is now {:?}", self.name, archived, live)
            }
            DifferenceKind::Mode { archived, live } => {
                write!(f, "{}: mode {:o} is now {:o}", self.name, archived, live)
            }
            DifferenceKind::ModifyTime { archived_ns, live_ns } => {
                write!(f, "{}: modify time {} is now {}", self.name, archived_ns, live_ns)
            }
            DifferenceKind::Size { archived, live } => {
                write!(f, "{}: size {} is now {}", self.name, archived, live)
            }
            DifferenceKind::LinkTarget { archived, live } => {
                write!(f, "{}: link target {:?} is now {:?}", self.name, archived, live)
            }
            DifferenceKind::Content { chunk } => {
                write!(f, "{}: content differs from chunk {}", self.name, chunk)
            }
            DifferenceKind::Unreadable { reason } => write!(f, "{}: {}", self.name, reason),
        }
    }
}

/// Result of comparing an archive with the live tree
#[derive(Debug, Clone, Serialize)]
pub struct CompareReport {
    pub archive: String,
    pub records_checked: u64,
    pub differences: Vec<Difference>,
    pub duration: Duration,
}

impl CompareReport {
    pub fn is_identical(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Archive {}: {} of {} records differ",
            self.archive,
            self.differences
                .iter()
                .map(|d| d.name.as_str())
                .collect::<BTreeSet<_>>()
                .len(),
            self.records_checked
        )
    }
}

/// Compares an archive with live files
#[derive(Debug)]
pub struct Comparator {
    reader: ArchiveReader,
    root: PathBuf,
    filters: Vec<PathBuf>,
}

impl Comparator {
    /// Compare against the paths the records were taken from
    pub fn new(reader: ArchiveReader) -> Self {
        Self {
            reader,
            root: PathBuf::from("/"),
            filters: Vec::new(),
        }
    }

    /// Only compare records at or below one of `prefixes`
    pub fn with_filters(mut self, prefixes: Vec<PathBuf>) -> Self {
        self.filters = prefixes;
        self
    }

    /// Compare against a tree restored below `root` instead
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    #[instrument(skip(self))]
    pub fn compare(self) -> Result<CompareReport> {
        let started = Instant::now();
        let mut records = self.reader.records()?;
        if !self.filters.is_empty() {
            records.retain(|r| self.filters.iter().any(|f| name_matches(&r.name, f)));
        }
        let mut differences: Vec<Difference> = records
            .par_iter()
            .flat_map_iter(|record| {
                let live = path_below(&self.root, &record.name);
                self.compare_record(record, &live)
                    .into_iter()
                    .map(|kind| Difference {
                        name: record.name.clone(),
                        kind,
                    })
            })
            .collect();
        differences.sort_by(|a, b| a.name.cmp(&b.name));
        for difference in &differences {
            warn!("{}", difference);
        }

        let report = CompareReport {
            archive: self.reader.layout().name().to_string(),
            records_checked: records.len() as u64,
            differences,
            duration: started.elapsed(),
        };
        info!("{}", report.summary());
        Ok(report)
    }

    fn compare_record(&self, record: &ListRecord, path: &Path) -> Vec<DifferenceKind> {
        let live = match LiveFile::stat(path) {
            Ok(live) => live.to_record(None),
            Err(PhatError::FileIo { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return vec![DifferenceKind::Missing];
            }
            Err(e) => return vec![DifferenceKind::Unreadable { reason: e.to_string() }],
        };

        if live.kind() != record.kind() {
            return vec![DifferenceKind::Type {
                archived: record.kind(),
                live: live.kind(),
            }];
        }

        let mut found = Vec::new();
        if record.kind() != FileKind::Symlink && live.permissions() != record.permissions() {
            found.push(DifferenceKind::Mode {
                archived: record.permissions(),
                live: live.permissions(),
            });
        }
        if live.mtime_ns != record.mtime_ns {
            found.push(DifferenceKind::ModifyTime {
                archived_ns: record.mtime_ns,
                live_ns: live.mtime_ns,
            });
        }
        match record.kind() {
            FileKind::Regular => {
                if live.size != record.size {
                    found.push(DifferenceKind::Size {
                        archived: record.size,
                        live: live.size,
                    });
                }
                if let Some(kind) = self.compare_content(record, path) {
                    found.push(kind);
                }
            }
            FileKind::Symlink if live.link_target != record.link_target => {
                found.push(DifferenceKind::LinkTarget {
                    archived: record.link_target.clone().unwrap_or_default(),
                    live: live.link_target.unwrap_or_default(),
                });
            }
            _ => {}
        }
        found
    }

    fn compare_content(&self, record: &ListRecord, path: &Path) -> Option<DifferenceKind> {
        let chunks = match record.content {
            Some(reference) => match self.reader.read_descriptors(&reference) {
                Ok(chunks) => chunks,
                Err(e) => return Some(DifferenceKind::Unreadable { reason: e.to_string() }),
            },
            None => Vec::new(),
        };
        match self.first_differing_chunk(&chunks, path) {
            Ok(None) => None,
            Ok(Some(chunk)) => Some(DifferenceKind::Content { chunk }),
            Err(e) => Some(DifferenceKind::Unreadable { reason: e.to_string() }),
        }
    }

    fn first_differing_chunk(&self, chunks: &[ChunkDescriptor], path: &Path) -> Result<Option<usize>> {
        let config = self.reader.config();
        let mut file = std::fs::File::open(path).map_err(PhatError::io_at("open", path))?;
        for (ordinal, chunk) in chunks.iter().enumerate() {
            let data = read_chunk(&mut file, config.chunk_size, path)?;
            if data.is_empty() || config.hash_type.digest(&data) != chunk.hash {
                return Ok(Some(ordinal));
            }
        }
        let rest = read_chunk(&mut file, config.chunk_size, path)?;
        Ok((!rest.is_empty()).then_some(chunks.len()))
    }
}
