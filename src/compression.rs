//! Block compression for PhatBak
//!
//! Chunk and descriptor blocks are compressed with the archive's configured
//! algorithm. A block is only kept compressed when that is strictly smaller
//! than the raw bytes; otherwise it is stored raw. Whether a block is
//! compressed is recorded next to its index (`C` or `U`), not inside the block,
//! so compressed blocks carry no header of their own.
//!
//! ## Algorithms
//!
//! - **None**: blocks are always stored raw
//! - **Zstd**: default, level 2
//! - **Lz4**: lz4_flex block format with prepended size
//!
//! ## Examples
//!
//! ```rust
//! use phatbak::compression::{CompressionEngine, CompressionType, CompFlag};
//!
//! let engine = CompressionEngine::new(CompressionType::Zstd, 2);
//! let raw = b"AAAA".repeat(256);
//! let (flag, packed) = engine.pack(&raw).unwrap();
//! assert_eq!(flag, CompFlag::Compressed);
//!
//! let unpacked = engine.unpack(flag, &packed).unwrap();
//! assert_eq!(unpacked, raw);
//! ```

use crate::error::{PhatError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Compression algorithm applied to blocks of one archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressionType {
    /// Never compress
    None,
    /// Zstandard (default)
    #[default]
    Zstd,
    /// LZ4 block format
    Lz4,
}

impl CompressionType {
    /// Name used in the `Options` file and on the command line
    pub fn name(self) -> &'static str {
        match self {
            CompressionType::None => "NONE",
            CompressionType::Zstd => "ZSTD",
            CompressionType::Lz4 => "LZ4",
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionType {
    type Err = PhatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(CompressionType::None),
            "ZSTD" => Ok(CompressionType::Zstd),
            "LZ4" => Ok(CompressionType::Lz4),
            other => Err(PhatError::InvalidConfiguration(format!(
                "unknown compression type '{other}'"
            ))),
        }
    }
}

/// Marker stored next to a block index saying how the block was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompFlag {
    /// Raw bytes (`U`)
    Uncompressed,
    /// Compressed with the archive's algorithm (`C`)
    Compressed,
}

impl CompFlag {
    /// Single-character marker used in list and descriptor text
    pub fn as_char(self) -> char {
        match self {
            CompFlag::Uncompressed => 'U',
            CompFlag::Compressed => 'C',
        }
    }

    /// Parse the single-character marker
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'U' => Some(CompFlag::Uncompressed),
            'C' => Some(CompFlag::Compressed),
            _ => None,
        }
    }
}

/// Running totals, shared by every clone of an engine
#[derive(Debug, Default)]
struct Counters {
    blocks_compressed: AtomicU64,
    blocks_stored_raw: AtomicU64,
    bytes_saved: AtomicU64,
}

/// Snapshot of compression totals
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CompressionStats {
    /// Blocks kept compressed
    pub blocks_compressed: u64,
    /// Blocks stored raw because compression did not shrink them
    pub blocks_stored_raw: u64,
    /// Total bytes saved by compression
    pub bytes_saved: u64,
}

impl CompressionStats {
    /// Fraction of blocks that were kept compressed
    pub fn compression_ratio(&self) -> f64 {
        let total = self.blocks_compressed + self.blocks_stored_raw;
        if total == 0 {
            return 0.0;
        }
        self.blocks_compressed as f64 / total as f64
    }
}

/// Block compressor bound to one algorithm and level
///
/// Cheap to clone; clones share statistics. Safe to use from every worker
/// thread at once.
#[derive(Debug, Clone)]
pub struct CompressionEngine {
    kind: CompressionType,
    level: i32,
    counters: Arc<Counters>,
}

impl CompressionEngine {
    /// Create an engine for `kind` at `level` (level is ignored by LZ4)
    pub fn new(kind: CompressionType, level: i32) -> Self {
        Self {
            kind,
            level,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Configured algorithm
    pub fn kind(&self) -> CompressionType {
        self.kind
    }

    /// Current statistics
    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            blocks_compressed: self.counters.blocks_compressed.load(Ordering::Relaxed),
            blocks_stored_raw: self.counters.blocks_stored_raw.load(Ordering::Relaxed),
            bytes_saved: self.counters.bytes_saved.load(Ordering::Relaxed),
        }
    }

    /// Compress `raw`, keeping the result only if it is strictly smaller
    pub fn pack<'a>(&self, raw: &'a [u8]) -> Result<(CompFlag, Cow<'a, [u8]>)> {
        if self.kind == CompressionType::None {
            self.counters.blocks_stored_raw.fetch_add(1, Ordering::Relaxed);
            return Ok((CompFlag::Uncompressed, Cow::Borrowed(raw)));
        }

        let packed = self.compress(raw)?;
        if packed.len() < raw.len() {
            let saved = (raw.len() - packed.len()) as u64;
            self.counters.blocks_compressed.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes_saved.fetch_add(saved, Ordering::Relaxed);
            trace!("compressed {} -> {} bytes", raw.len(), packed.len());
            Ok((CompFlag::Compressed, Cow::Owned(packed)))
        } else {
            self.counters.blocks_stored_raw.fetch_add(1, Ordering::Relaxed);
            trace!("compression not beneficial for {} bytes, storing raw", raw.len());
            Ok((CompFlag::Uncompressed, Cow::Borrowed(raw)))
        }
    }

    /// Undo [`pack`](Self::pack) given the flag recorded with the block
    pub fn unpack<'a>(&self, flag: CompFlag, stored: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        match flag {
            CompFlag::Uncompressed => Ok(Cow::Borrowed(stored)),
            CompFlag::Compressed => self.decompress_as(self.kind, stored).map(Cow::Owned),
        }
    }

    /// Compress with the configured algorithm, unconditionally
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self.kind {
            CompressionType::None => Err(PhatError::compression(
                "compression requested with compression type NONE",
            )),
            CompressionType::Lz4 => Ok(lz4_flex::compress_prepend_size(raw)),
            CompressionType::Zstd => zstd_compress(self.level, raw),
        }
    }

    /// Decompress a block, nominally as `requested`
    ///
    /// Dispatch always follows the engine's configured type; `requested` is
    /// not consulted. Callers holding a type that differs from the archive's
    /// get the archive's codec regardless.
    pub fn decompress_as(&self, requested: CompressionType, stored: &[u8]) -> Result<Vec<u8>> {
        if requested != self.kind {
            trace!(
                "decompress requested as {} but archive codec is {}",
                requested,
                self.kind
            );
        }
        match self.kind {
            CompressionType::None => Err(PhatError::decompression(
                "compressed block in archive with compression type NONE",
            )),
            CompressionType::Lz4 => lz4_flex::decompress_size_prepended(stored)
                .map_err(|e| PhatError::decompression(format!("lz4: {e}"))),
            CompressionType::Zstd => zstd::stream::decode_all(stored)
                .map_err(|e| PhatError::decompression(format!("zstd: {e}"))),
        }
    }
}

fn zstd_compress(level: i32, raw: &[u8]) -> Result<Vec<u8>> {
    thread_local! {
        static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
            const { RefCell::new(None) };
    }

    ZSTD_CX.with(|cell| {
        let mut slot = cell.borrow_mut();

        // Lazily init or reinit if the compression level changed.
        if !matches!(slot.as_ref(), Some((l, _)) if *l == level) {
            let cx = zstd::bulk::Compressor::new(level)
                .map_err(|e| PhatError::compression(format!("zstd init: {e}")))?;
            *slot = Some((level, cx));
        }
        let Some((_, cx)) = slot.as_mut() else {
            return Err(PhatError::internal("zstd compressor slot empty"));
        };
        cx.compress(raw)
            .map_err(|e| PhatError::compression(format!("zstd: {e}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_keeps_smaller_result() {
        let engine = CompressionEngine::new(CompressionType::Zstd, 2);
        let raw = b"hello world ".repeat(100);
        let (flag, packed) = engine.pack(&raw).unwrap();
        assert_eq!(flag, CompFlag::Compressed);
        assert!(packed.len() < raw.len());
        assert_eq!(engine.unpack(flag, &packed).unwrap().as_ref(), raw.as_slice());
    }

    #[test]
    fn test_pack_stores_incompressible_raw() {
        let engine = CompressionEngine::new(CompressionType::Lz4, 0);
        let raw = b"AAAA";
        let (flag, packed) = engine.pack(raw).unwrap();
        assert_eq!(flag, CompFlag::Uncompressed);
        assert_eq!(packed.as_ref(), raw);
        assert_eq!(engine.stats().blocks_stored_raw, 1);
    }

    #[test]
    fn test_none_never_compresses() {
        let engine = CompressionEngine::new(CompressionType::None, 0);
        let raw = vec![0u8; 4096];
        let (flag, _) = engine.pack(&raw).unwrap();
        assert_eq!(flag, CompFlag::Uncompressed);
        assert!(engine.unpack(CompFlag::Compressed, &raw).is_err());
    }

    #[test]
    fn test_decompress_as_ignores_requested_type() {
        let zstd = CompressionEngine::new(CompressionType::Zstd, 3);
        let raw = b"0123456789".repeat(50);
        let stored = zstd.compress(&raw).unwrap();

        // Asking for LZ4 still decodes with the engine's zstd codec.
        assert_eq!(zstd.decompress_as(CompressionType::Lz4, &stored).unwrap(), raw);
        assert_eq!(zstd.decompress_as(CompressionType::None, &stored).unwrap(), raw);

        // An LZ4 engine cannot read zstd data even when asked for zstd.
        let lz4 = CompressionEngine::new(CompressionType::Lz4, 0);
        assert!(lz4.decompress_as(CompressionType::Zstd, &stored).is_err());
    }

    #[test]
    fn test_stats_shared_between_clones() {
        let engine = CompressionEngine::new(CompressionType::Zstd, 1);
        let clone = engine.clone();
        clone.pack(&vec![7u8; 1000]).unwrap();
        assert_eq!(engine.stats().blocks_compressed, 1);
        assert!(engine.stats().bytes_saved > 0);
        assert!((engine.stats().compression_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_flag_chars() {
        assert_eq!(CompFlag::from_char('C'), Some(CompFlag::Compressed));
        assert_eq!(CompFlag::from_char('U'), Some(CompFlag::Uncompressed));
        assert_eq!(CompFlag::from_char('X'), None);
        assert_eq!(CompFlag::Compressed.as_char(), 'C');
    }
}
