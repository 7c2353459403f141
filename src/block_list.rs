//! Block index allocation
//!
//! Each archive has two block spaces (descriptor blocks under `FInfo/` and
//! chunk blocks under `Chunks/`). A [`BlockAllocator`] tracks which integer
//! indices of one space are in use as a list of closed ranges.
//!
//! ## Invariants
//!
//! The range list is kept sorted by `min`, disjoint and non-adjacent: two
//! ranges that would touch are always merged. As a consequence
//! [`count_allocated`](BlockAllocator::count_allocated) is simply the sum of
//! range widths, and [`alloc`](BlockAllocator::alloc) only ever has to look at
//! the first range to find the lowest free index.
//!
//! ## Sharded paths
//!
//! Index `n` lives at `d<a>/d<b>/.../<n>` relative to the space's top
//! directory, where `a`, `b`, ... are the successive remainders of
//! `n / modulus` divided by `modulus`. With the default modulus of 100,
//! index 12345 maps to `d23/d1/12345`, so no directory holds more than
//! `modulus` subdirectories plus `modulus` block files.

use crate::error::{PhatError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Index of a block within one block space
pub type BlockIndex = u64;

/// Closed interval of allocated indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRange {
    /// Lowest index in the range
    pub min: BlockIndex,
    /// Highest index in the range
    pub max: BlockIndex,
}

impl BlockRange {
    fn width(&self) -> u64 {
        self.max - self.min + 1
    }

    fn contains(&self, idx: BlockIndex) -> bool {
        self.min <= idx && idx <= self.max
    }
}

/// Allocation state of one block space
#[derive(Debug)]
pub struct BlockAllocator {
    space: String,
    modulus: u64,
    ranges: Mutex<Vec<BlockRange>>,
}

impl BlockAllocator {
    /// Create an empty allocator; `space` names it in errors and logs
    pub fn new(space: impl Into<String>, modulus: u64) -> Self {
        Self {
            space: space.into(),
            modulus,
            ranges: Mutex::new(Vec::new()),
        }
    }

    /// Name of the block space
    pub fn space(&self) -> &str {
        &self.space
    }

    /// Allocate the lowest unallocated index
    pub fn alloc(&self) -> Result<BlockIndex> {
        let mut ranges = self.ranges.lock();

        let Some(first) = ranges.first_mut() else {
            ranges.push(BlockRange { min: 0, max: 0 });
            return Ok(0);
        };
        if first.min > 1 {
            ranges.insert(0, BlockRange { min: 0, max: 0 });
            return Ok(0);
        }
        if first.min == 1 {
            first.min = 0;
            return Ok(0);
        }

        let idx = first.max + 1;
        first.max = idx;
        if let Some(next) = ranges.get(1).copied() {
            if idx >= next.min {
                return Err(self.corruption(idx, "overlaps the following range"));
            }
            if idx + 1 == next.min {
                ranges[0].max = next.max;
                ranges.remove(1);
            }
        }
        trace!("{}: alloc {}", self.space, idx);
        Ok(idx)
    }

    /// Return `idx` to the free pool
    pub fn free(&self, idx: BlockIndex) -> Result<()> {
        let mut ranges = self.ranges.lock();
        let pos = match search(&ranges, idx) {
            Some(pos) if ranges[pos].contains(idx) => pos,
            _ => return Err(self.corruption(idx, "freed while not allocated")),
        };

        let range = ranges[pos];
        if range.min == range.max {
            ranges.remove(pos);
        } else if range.min == idx {
            ranges[pos].min += 1;
        } else if range.max == idx {
            ranges[pos].max -= 1;
        } else {
            ranges[pos].max = idx - 1;
            ranges.insert(pos + 1, BlockRange { min: idx + 1, max: range.max });
        }
        trace!("{}: free {}", self.space, idx);
        Ok(())
    }

    /// Record `idx` as allocated without requiring it to be the lowest free
    pub fn mark_allocated(&self, idx: BlockIndex) -> Result<()> {
        let mut ranges = self.ranges.lock();

        let pos = match search(&ranges, idx) {
            None => {
                ranges.insert(0, BlockRange { min: idx, max: idx });
                0
            }
            Some(pos) => {
                let range = ranges[pos];
                if range.max >= idx {
                    return Err(self.corruption(idx, "marked while already allocated"));
                }
                if idx == range.max + 1 {
                    ranges[pos].max = idx;
                    pos
                } else {
                    ranges.insert(pos + 1, BlockRange { min: idx, max: idx });
                    pos + 1
                }
            }
        };

        if let Some(next) = ranges.get(pos + 1).copied() {
            if next.min == ranges[pos].max + 1 {
                ranges[pos].max = next.max;
                ranges.remove(pos + 1);
            }
        }
        Ok(())
    }

    /// Whether `idx` is allocated
    pub fn is_allocated(&self, idx: BlockIndex) -> bool {
        let ranges = self.ranges.lock();
        search(&ranges, idx).is_some_and(|pos| ranges[pos].contains(idx))
    }

    /// Number of allocated indices
    pub fn count_allocated(&self) -> u64 {
        self.ranges.lock().iter().map(BlockRange::width).sum()
    }

    /// Position of the range that starts at or below `idx`, if any
    ///
    /// The returned range contains `idx` only if its `max` reaches it.
    pub fn search(&self, idx: BlockIndex) -> Option<usize> {
        search(&self.ranges.lock(), idx)
    }

    /// Snapshot of the range list
    pub fn ranges(&self) -> Vec<BlockRange> {
        self.ranges.lock().clone()
    }

    /// Shard directory names for `idx`, outermost first
    pub fn sub_dirs(&self, idx: BlockIndex) -> Vec<String> {
        let mut dirs = Vec::new();
        let mut rest = idx / self.modulus;
        while rest != 0 {
            dirs.push(format!("d{}", rest % self.modulus));
            rest /= self.modulus;
        }
        dirs
    }

    /// Directory holding `idx` under `top`
    pub fn dir_under(&self, top: &Path, idx: BlockIndex) -> PathBuf {
        let mut dir = top.to_path_buf();
        dir.extend(self.sub_dirs(idx));
        dir
    }

    /// Full block file path of `idx` under `top`
    pub fn path_under(&self, top: &Path, idx: BlockIndex) -> PathBuf {
        self.dir_under(top, idx).join(idx.to_string())
    }

    fn corruption(&self, index: BlockIndex, reason: &'static str) -> PhatError {
        PhatError::AllocatorCorruption {
            space: self.space.clone(),
            index,
            reason,
        }
    }
}

/// Last range whose `min` is at or below `idx`
fn search(ranges: &[BlockRange], idx: BlockIndex) -> Option<usize> {
    ranges.partition_point(|r| r.min <= idx).checked_sub(1)
}
