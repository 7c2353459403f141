//! Error types for PhatBak
//!
//! Every failure that can leave an operation is a [`PhatError`]. Variants carry
//! their origin as structured fields (path, line number, block index) so callers
//! can decide how to react without parsing messages.
//!
//! The variants fall into four families:
//!
//! - **Format**: malformed list, descriptor or options text
//! - **I/O**: open/read/write/stat/link failures with the underlying OS error
//! - **Integrity**: a recomputed hash disagrees with the stored one
//! - **Allocator corruption**: range bookkeeping inconsistent with a requested
//!   free or mark, which is always a programming error
//!
//! Format, integrity and allocator errors are fatal for a whole run. I/O errors
//! are fatal for the operation that raised them; attribute restoration on
//! extract downgrades them to warnings before they ever become a `PhatError`.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Type alias for Results in the PhatBak library
pub type Result<T> = std::result::Result<T, PhatError>;

/// Main error type for all PhatBak operations
#[derive(Debug, Error)]
pub enum PhatError {
    /// I/O errors without additional origin
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error tied to the path and operation that raised it
    #[error("{op} failed for {path:?}: {source}")]
    FileIo {
        /// Operation that failed (open, read, link, ...)
        op: &'static str,
        /// Path the operation was applied to
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Malformed list, descriptor or options text
    #[error("Format error in {origin} (line {line:?}): {detail}")]
    Format {
        /// File or block the text came from
        origin: String,
        /// One-based line number when known
        line: Option<usize>,
        /// What was wrong with it
        detail: String,
    },

    /// Hash mismatch between stored and recomputed content
    #[error("Hash mismatch in block {block} - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Chunk block index
        block: u64,
        /// Hash recorded in the descriptor
        expected: String,
        /// Hash of the bytes actually read
        actual: String,
    },

    /// Free/mark requested on an index the allocator cannot account for
    #[error("Block allocator corruption in {space}: index {index} {reason}")]
    AllocatorCorruption {
        /// Block space name (FInfo or Chunks)
        space: String,
        /// Offending index
        index: u64,
        /// Which invariant the request violated
        reason: &'static str,
    },

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unsupported file type
    #[error("Unsupported file type: {path:?}")]
    UnsupportedFileType {
        /// Path to the unsupported file
        path: PathBuf,
    },

    /// Target archive directory already present
    #[error("Archive already exists: {0:?}")]
    ArchiveExists(PathBuf),

    /// Directory lacks the archive ID marker
    #[error("Not a PhatBak archive: {0:?}")]
    NotAnArchive(PathBuf),

    /// Archive never reached its finished marker
    #[error("Archive was not finished: {0:?}")]
    ArchiveUnfinished(PathBuf),

    /// Repository directory or marker missing
    #[error("Repository not found: {0:?}")]
    RepositoryNotFound(PathBuf),

    /// No archive available for an operation that needs one
    #[error("No archive found in repository {0:?}")]
    ArchiveNotFound(PathBuf),

    /// Extraction target already present
    #[error("Extract target already exists: {0:?}")]
    TargetExists(PathBuf),

    /// A wait was abandoned because its producer went away
    #[error("Cancelled while waiting for {what}")]
    Cancelled {
        /// What the waiter was blocked on
        what: &'static str,
    },

    /// A scheduled task panicked
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error")]
    WalkDir(#[from] walkdir::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PhatError {
    /// Build a `map_err` adapter that attaches an operation and path to an I/O error
    pub fn io_at(op: &'static str, path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| PhatError::FileIo { op, path, source }
    }

    /// Create a format error
    pub fn format(origin: impl Into<String>, line: Option<usize>, detail: impl Into<String>) -> Self {
        PhatError::Format {
            origin: origin.into(),
            line,
            detail: detail.into(),
        }
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        PhatError::Compression(msg.into())
    }

    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        PhatError::Decompression(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        PhatError::Internal(msg.into())
    }

    /// Errors that mean the archive or in-memory state can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PhatError::Format { .. }
                | PhatError::AllocatorCorruption { .. }
                | PhatError::HashMismatch { .. }
                | PhatError::TaskPanicked(_)
        )
    }

    /// Check if this error is an integrity failure
    pub fn is_integrity(&self) -> bool {
        matches!(self, PhatError::HashMismatch { .. })
    }

    /// Permission-style failures that attribute restoration may downgrade
    pub fn is_advisory(&self) -> bool {
        let kind = match self {
            PhatError::Io(e) => e.kind(),
            PhatError::FileIo { source, .. } => source.kind(),
            _ => return false,
        };
        matches!(
            kind,
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::Unsupported
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            PhatError::RepositoryNotFound(path) => {
                format!("Repository {:?} not found. Run 'phatbak init {}' first.", path, path.display())
            }
            PhatError::TargetExists(path) => {
                format!("{:?} already exists. Choose another --target or remove it.", path)
            }
            PhatError::HashMismatch { block, .. } => {
                format!("{}. Chunk block {} is damaged; run 'phatbak test' for a full scan.", self, block)
            }
            _ => self.to_string(),
        }
    }
}
