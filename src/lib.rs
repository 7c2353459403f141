//! # PhatBak - Deduplicating incremental backups
//!
//! A backup engine that stores each archive as a plain directory tree of
//! numbered block files, and makes every archive after the first cheap by
//! hardlinking the blocks of unchanged content from the previous one.
//!
//! ## Overview
//!
//! A repository holds any number of archives. Each archive has:
//! - a `List` file with one line per archived path (type, mode, owner, size,
//!   modify time, optional ACL, content reference, symlink target)
//! - an `FInfo` block space of per-file chunk descriptors
//! - a `Chunks` block space of file content, one block per fixed-size chunk
//! - an `Options` file recording the format settings it was written with
//! - a `PhatBak.log` with start and end times
//!
//! Because every block of an archive is a real file, deleting an old archive
//! is just `rm -r`; the blocks it shared with newer archives stay alive
//! through their other links.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use phatbak::{BaseSelection, Config, Creator, Extractor, Repository, TaskScheduler};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Repository::init(Path::new("/backups/home"))?;
//! let config = Config::builder()
//!     .file_args(["/home/alice"])
//!     .build()?;
//!
//! // Back up against the latest finished archive
//! let pool = Arc::new(TaskScheduler::new(config.threads)?);
//! let summary = Creator::new(&repo, &config, None, BaseSelection::Latest, pool)?.run()?;
//! println!("{} chunks written, {} linked", summary.chunks_written, summary.chunks_linked);
//!
//! // Restore it somewhere else
//! let restore = Config::builder().extract_target("/tmp/restore").build()?;
//! let reader = repo.open_archive(None, &restore)?;
//! let pool = Arc::new(TaskScheduler::new(restore.threads)?);
//! Extractor::new(reader, &restore, pool).run()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Incremental archives
//!
//! A create run opens the newest finished archive as its base. For each
//! regular file whose size and modify time are unchanged, the file's
//! descriptor block and every chunk block are hardlinked into the new
//! archive at the same indices. Changed files are chunked and hashed; chunks
//! whose hash still matches the base's chunk at the same position are linked,
//! the rest are compressed and written to freshly allocated blocks.
//!
//! ## Concurrency
//!
//! Chunk hashing, compression and block writes run as tasks on a
//! [`TaskScheduler`], a fixed pool of workers that runs a task inline on
//! the submitting thread when no worker can take it. Waits inside tasks
//! register with the pool so it never waits for a worker that is itself
//! waiting.
//!
//! ## Module Organization
//!
//! - [`repository`], [`archive`]: on-disk layout of repositories and archives
//! - [`block_list`], [`block_store`]: block index allocation and block files
//! - [`record`]: `List` lines and chunk descriptor text
//! - [`create`], [`extract`]: the two pipelines
//! - [`verification`]: integrity tests and comparison with live files
//! - [`scheduler`], [`sync`]: task pool and the waits built on it
//! - [`compression`], [`hash`]: block codecs and chunk digests
//! - [`config`]: run configuration and the archive `Options` file
//! - [`error`]: error types and handling

// Public API modules
pub mod archive;
pub mod attrs;
pub mod block_list;
pub mod block_store;
pub mod compression;
pub mod config;
pub mod create;
pub mod error;
pub mod extract;
pub mod hardlink;
pub mod hash;
pub mod live;
pub mod record;
pub mod repository;
pub mod scheduler;
pub mod sync;
pub mod utils;
pub mod verification;

// Internal modules (not part of public API)
mod collections;

// Re-export main types for convenience
pub use archive::{ArchiveLayout, ArchiveReader, ArchiveWriter, BaseArchive};
pub use attrs::{AclHandler, NoAcl};
pub use block_list::{BlockAllocator, BlockIndex};
pub use block_store::BlockStore;
pub use compression::{CompressionEngine, CompressionType};
pub use config::{Config, ConfigBuilder, Options};
pub use create::{BaseSelection, CreateSummary, Creator};
pub use error::{PhatError, Result};
pub use extract::{ExtractSummary, Extractor};
pub use hash::HashType;
pub use record::{FileKind, ListRecord};
pub use repository::Repository;
pub use scheduler::TaskScheduler;
pub use verification::{ArchiveVerifier, CompareReport, Comparator, VerificationReport};
