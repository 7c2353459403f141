//! One archive directory
//!
//! ```text
//! <repo>/<name>/
//! ├── Is_PhatBak_Archive         marker: this is an archive
//! ├── PhatBak_Archive_Finished   marker: creation completed
//! ├── List                       one record per archived path
//! ├── Options                    settings the archive was created with
//! ├── PhatBak.log                start/end time of the creation run
//! ├── FInfo/                     descriptor blocks
//! ├── Chunks/                    chunk blocks
//! └── Extra/                     reserved
//! ```
//!
//! [`ArchiveWriter`] builds a new archive, [`ArchiveReader`] opens an existing
//! one for extract, test and compare, and [`BaseArchive`] wraps a reader with
//! the name index a create run deduplicates against.

use crate::block_list::BlockIndex;
use crate::block_store::BlockStore;
use crate::collections::{concurrent_set, ConcurrentSet, HashMap, HashMapExt};
use crate::compression::CompressionEngine;
use crate::config::{Config, Options};
use crate::error::{PhatError, Result};
use crate::record::{parse_descriptors, ChunkDescriptor, DescriptorRef, FileKind, ListRecord};
use crate::scheduler::TaskScheduler;
use crate::utils::{self, time_name};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marker file present in every archive
pub const ARCHIVE_MARKER: &str = "Is_PhatBak_Archive";

/// Marker file written when creation completes
pub const FINISHED_MARKER: &str = "PhatBak_Archive_Finished";

/// Block space name of descriptor blocks
pub const FINFO_SPACE: &str = "FInfo";

/// Block space name of chunk blocks
pub const CHUNKS_SPACE: &str = "Chunks";

const BLOCK_READ_SIZE: usize = 1 << 16;

/// Paths inside one archive directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    dir: PathBuf,
    name: String,
}

impl ArchiveLayout {
    /// Layout of archive `name` in `repo_dir`
    pub fn new(repo_dir: &Path, name: &str) -> Self {
        Self {
            dir: repo_dir.join(name),
            name: name.to_string(),
        }
    }

    /// Layout of the archive at `dir`
    pub fn at(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// Archive name (its directory's name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Archive directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn id_marker(&self) -> PathBuf {
        self.dir.join(ARCHIVE_MARKER)
    }

    pub fn finished_marker(&self) -> PathBuf {
        self.dir.join(FINISHED_MARKER)
    }

    pub fn list(&self) -> PathBuf {
        self.dir.join("List")
    }

    pub fn log(&self) -> PathBuf {
        self.dir.join("PhatBak.log")
    }

    pub fn options(&self) -> PathBuf {
        self.dir.join("Options")
    }

    pub fn finfo_dir(&self) -> PathBuf {
        self.dir.join(FINFO_SPACE)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.dir.join(CHUNKS_SPACE)
    }

    pub fn extra_dir(&self) -> PathBuf {
        self.dir.join("Extra")
    }

    /// Whether the directory carries the archive marker
    pub fn is_archive(&self) -> bool {
        self.id_marker().is_file()
    }

    /// Whether creation of this archive completed
    pub fn is_finished(&self) -> bool {
        self.finished_marker().is_file()
    }

    fn block_stores(&self, config: &Config) -> (Arc<BlockStore>, Arc<BlockStore>) {
        (
            Arc::new(BlockStore::new(
                self.finfo_dir(),
                FINFO_SPACE,
                config.block_modulus,
                BLOCK_READ_SIZE,
            )),
            Arc::new(BlockStore::new(
                self.chunks_dir(),
                CHUNKS_SPACE,
                config.block_modulus,
                BLOCK_READ_SIZE,
            )),
        )
    }
}

/// Read access to an existing archive
///
/// The configuration is the process configuration with the archive's own
/// `Options` layered on top, so chunk size, hash and codec always match what
/// the archive was written with.
#[derive(Debug)]
pub struct ArchiveReader {
    layout: ArchiveLayout,
    config: Config,
    finfo: Arc<BlockStore>,
    chunks: Arc<BlockStore>,
    engine: CompressionEngine,
}

impl ArchiveReader {
    /// Open the archive at `dir`
    pub fn open(dir: &Path, process: &Config) -> Result<Self> {
        let layout = ArchiveLayout::at(dir);
        if !dir.is_dir() || !layout.is_archive() {
            return Err(PhatError::NotAnArchive(dir.to_path_buf()));
        }
        if !layout.is_finished() {
            warn!("archive {} was never finished", layout.name());
        }

        let options = Options::load(&layout.options())?;
        let config = process.with_archive_options(&options);
        config.validate()?;

        let (finfo, chunks) = layout.block_stores(&config);
        debug!(
            "opened archive {} (chunk size {}, {}, {})",
            layout.name(),
            config.chunk_size,
            config.hash_type,
            config.compression
        );
        Ok(Self {
            engine: config.compression_engine(),
            layout,
            config,
            finfo,
            chunks,
        })
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    /// Effective configuration for this archive
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn finfo(&self) -> &Arc<BlockStore> {
        &self.finfo
    }

    pub fn chunks(&self) -> &Arc<BlockStore> {
        &self.chunks
    }

    pub fn engine(&self) -> &CompressionEngine {
        &self.engine
    }

    /// Display name of the `List` file for error origins
    pub fn list_origin(&self) -> String {
        self.layout.list().display().to_string()
    }

    /// Feed every `List` line with its one-based number to `f`
    pub fn for_each_line(&self, mut f: impl FnMut(usize, String) -> Result<()>) -> Result<()> {
        let path = self.layout.list();
        let file = File::open(&path).map_err(PhatError::io_at("open", &path))?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(PhatError::io_at("read", &path))?;
            f(idx + 1, line)?;
        }
        Ok(())
    }

    /// Parse the whole `List`
    pub fn records(&self) -> Result<Vec<ListRecord>> {
        let origin = self.list_origin();
        let mut records = Vec::new();
        self.for_each_line(|no, line| {
            records.push(ListRecord::parse(&line, &origin, no)?);
            Ok(())
        })?;
        Ok(records)
    }

    /// Chunk descriptors of a record; empty for synthetic references
    pub fn read_descriptors(&self, reference: &DescriptorRef) -> Result<Vec<ChunkDescriptor>> {
        let Some(idx) = reference.block_index() else {
            return Ok(Vec::new());
        };
        let stored = self.finfo.slurp(idx)?;
        let raw = self.engine.unpack(reference.flag, &stored)?;
        let origin = format!("{FINFO_SPACE}/{idx}");
        let text = std::str::from_utf8(&raw)
            .map_err(|_| PhatError::format(origin.as_str(), None, "descriptor block is not text"))?;
        parse_descriptors(text, &origin)
    }

    /// Read a chunk, decompress it and check it against its recorded hash
    pub fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>> {
        let stored = self.chunks.slurp(chunk.block)?;
        let raw = self.engine.unpack(chunk.flag, &stored)?.into_owned();
        let actual = self.config.hash_type.digest(&raw);
        if actual != chunk.hash {
            return Err(PhatError::HashMismatch {
                block: chunk.block,
                expected: chunk.hash.clone(),
                actual,
            });
        }
        Ok(raw)
    }
}

/// Finished archive a create run deduplicates against
///
/// Each descriptor block of the base can be claimed once per run. A second
/// claim (two names that were hardlinked in the base but no longer are) gets
/// no baseline, so the base's blocks are never both reused and freed.
#[derive(Debug)]
pub struct BaseArchive {
    reader: ArchiveReader,
    files: HashMap<String, ListRecord>,
    claimed: ConcurrentSet<BlockIndex>,
}

impl BaseArchive {
    /// Open the archive at `dir` and index its records by name
    pub fn open(dir: &Path, process: &Config) -> Result<Self> {
        let reader = ArchiveReader::open(dir, process)?;
        let mut files = HashMap::new();
        for record in reader.records()? {
            files.insert(record.name.clone(), record);
        }
        info!("base archive {} has {} records", reader.layout().name(), files.len());
        Ok(Self {
            reader,
            files,
            claimed: concurrent_set(),
        })
    }

    pub fn reader(&self) -> &ArchiveReader {
        &self.reader
    }

    /// Number of records in the base
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the base has no records
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Record for `name`, whatever its type
    pub fn lookup(&self, name: &str) -> Option<&ListRecord> {
        self.files.get(name)
    }

    /// Take the base's regular-file record for `name` as a dedup baseline
    pub fn claim(&self, name: &str) -> Option<&ListRecord> {
        let record = self.files.get(name)?;
        if record.kind() != FileKind::Regular || record.size == 0 {
            return None;
        }
        let idx = record.content.as_ref()?.block_index()?;
        if !self.claimed.insert(idx) {
            debug!("base descriptor {} already claimed, not reusing for {}", idx, name);
            return None;
        }
        Some(record)
    }
}

/// Archive under construction
#[derive(Debug)]
pub struct ArchiveWriter {
    layout: ArchiveLayout,
    config: Config,
    finfo: Arc<BlockStore>,
    chunks: Arc<BlockStore>,
    engine: CompressionEngine,
    list: Mutex<BufWriter<File>>,
    started: DateTime<Local>,
    zero_len_id: AtomicI64,
    records_written: AtomicU64,
}

impl ArchiveWriter {
    /// Create archive `name` in `repo_dir`
    ///
    /// With a `base`, both block spaces start out with the base's occupied
    /// indices already allocated so reused blocks keep their numbers.
    pub fn create(
        repo_dir: &Path,
        name: &str,
        config: &Config,
        base: Option<&BaseArchive>,
        started: DateTime<Local>,
        scheduler: &Arc<TaskScheduler>,
    ) -> Result<Self> {
        let layout = ArchiveLayout::new(repo_dir, name);
        if layout.dir().exists() {
            return Err(PhatError::ArchiveExists(layout.dir().to_path_buf()));
        }
        fs::create_dir(layout.dir()).map_err(PhatError::io_at("create dir", layout.dir()))?;
        utils::touch(&layout.id_marker())?;

        let log = layout.log();
        fs::write(&log, format!("Backup Started At: {}\n", time_name(started)))
            .map_err(PhatError::io_at("write", &log))?;

        let base_dir = base.map(|b| b.reader().layout().dir());
        let options = layout.options();
        fs::write(&options, Options::render(config, name, base_dir))
            .map_err(PhatError::io_at("write", &options))?;

        for dir in [layout.finfo_dir(), layout.chunks_dir(), layout.extra_dir()] {
            fs::create_dir(&dir).map_err(PhatError::io_at("create dir", &dir))?;
        }

        let (finfo, chunks) = layout.block_stores(config);
        if let Some(base) = base {
            finfo.reverse_alloc(&base.reader().layout().finfo_dir(), scheduler)?;
            chunks.reverse_alloc(&base.reader().layout().chunks_dir(), scheduler)?;
        }

        let list_path = layout.list();
        let list = File::create(&list_path).map_err(PhatError::io_at("create", &list_path))?;
        info!("created archive {:?}", layout.dir());

        Ok(Self {
            engine: config.compression_engine(),
            config: config.clone(),
            layout,
            finfo,
            chunks,
            list: Mutex::new(BufWriter::new(list)),
            started,
            zero_len_id: AtomicI64::new(-1),
            records_written: AtomicU64::new(0),
        })
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn finfo(&self) -> &Arc<BlockStore> {
        &self.finfo
    }

    pub fn chunks(&self) -> &Arc<BlockStore> {
        &self.chunks
    }

    pub fn engine(&self) -> &CompressionEngine {
        &self.engine
    }

    /// Records appended so far
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    /// Next synthetic id for a zero-length entry: -2, -3, ...
    pub fn next_zero_len_id(&self) -> i64 {
        self.zero_len_id.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Append one record to `List`
    pub fn push_record(&self, record: &ListRecord) -> Result<()> {
        let line = record.to_line();
        let mut list = self.list.lock();
        writeln!(list, "{line}").map_err(PhatError::io_at("write", self.layout.list()))?;
        self.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush `List`, log the end time and write the finished marker
    pub fn finish(&self) -> Result<std::time::Duration> {
        let list_path = self.layout.list();
        self.list
            .lock()
            .flush()
            .map_err(PhatError::io_at("flush", &list_path))?;

        let ended = Local::now();
        let elapsed = (ended - self.started).to_std().unwrap_or_default();
        let log_path = self.layout.log();
        let mut log = OpenOptions::new()
            .append(true)
            .open(&log_path)
            .map_err(PhatError::io_at("open", &log_path))?;
        write!(
            log,
            "Backup Ended At: {}\nElapsed Time: {:.2} seconds\n",
            time_name(ended),
            elapsed.as_secs_f64()
        )
        .map_err(PhatError::io_at("write", &log_path))?;

        utils::touch(&self.layout.finished_marker())?;
        info!(
            "finished archive {} with {} records in {}",
            self.layout.name(),
            self.records_written(),
            humantime::format_duration(elapsed)
        );
        Ok(elapsed)
    }
}
