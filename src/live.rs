//! Files in the live tree being archived or compared

use crate::error::{PhatError, Result};
use crate::record::{FileKind, ListRecord};
use std::fs::{self, File, Metadata};
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// `(device, inode)` identifying hardlinked names
pub type InodeKey = (u64, u64);

/// A live path with its `lstat` data
#[derive(Debug, Clone)]
pub struct LiveFile {
    path: PathBuf,
    name: String,
    meta: Metadata,
    link_target: Option<String>,
}

impl LiveFile {
    /// `lstat` a path
    ///
    /// Names that cannot be represented in a `List` line (not UTF-8, or
    /// containing a newline) are reported as unsupported, as are device files.
    pub fn stat(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).map_err(PhatError::io_at("stat", path))?;
        let unsupported = || PhatError::UnsupportedFileType {
            path: path.to_path_buf(),
        };
        let name = path
            .to_str()
            .filter(|n| !n.contains('\n'))
            .ok_or_else(unsupported)?
            .to_string();

        let link_target = match FileKind::from_mode(meta.mode()) {
            FileKind::Regular | FileKind::Directory | FileKind::Fifo | FileKind::Socket => None,
            FileKind::Symlink => {
                let target = fs::read_link(path).map_err(PhatError::io_at("readlink", path))?;
                Some(target.to_str().ok_or_else(unsupported)?.to_string())
            }
            FileKind::CharDevice | FileKind::BlockDevice | FileKind::Unknown => {
                return Err(unsupported())
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            name,
            meta,
            link_target,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path as stored in `List`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.meta.mode())
    }

    pub fn mode(&self) -> u32 {
        self.meta.mode()
    }

    pub fn size(&self) -> u64 {
        self.meta.size()
    }

    /// Modify time in nanoseconds since the epoch
    pub fn mtime_ns(&self) -> i64 {
        self.meta.mtime() * 1_000_000_000 + self.meta.mtime_nsec()
    }

    /// Key shared by every name of a multiply-linked non-directory
    pub fn inode_key(&self) -> Option<InodeKey> {
        match self.kind() {
            FileKind::Directory | FileKind::Symlink => None,
            _ if self.meta.nlink() < 2 => None,
            _ => Some((self.meta.dev(), self.meta.ino())),
        }
    }

    /// Directory entries, sorted; empty for non-directories
    pub fn children(&self) -> Result<Vec<PathBuf>> {
        if self.kind() != FileKind::Directory {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.path).map_err(PhatError::io_at("read dir", &self.path))?;
        let mut children = entries
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(PhatError::io_at("read dir", &self.path))?;
        children.sort();
        Ok(children)
    }

    /// Record for this file without content reference
    pub fn to_record(&self, acl: Option<String>) -> ListRecord {
        ListRecord {
            name: self.name.clone(),
            mode: self.meta.mode(),
            uid: self.meta.uid(),
            gid: self.meta.gid(),
            size: self.meta.size(),
            mtime_ns: self.mtime_ns(),
            acl,
            content: None,
            link_target: self.link_target.clone(),
        }
    }

    /// Open for reading content
    pub fn open(&self) -> Result<File> {
        File::open(&self.path).map_err(PhatError::io_at("open", &self.path))
    }
}

/// Read up to `size` bytes; shorter only at end of file
pub fn read_chunk(reader: &mut impl Read, size: usize, path: &Path) -> Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(size);
    reader
        .take(size as u64)
        .read_to_end(&mut chunk)
        .map_err(PhatError::io_at("read", path))?;
    Ok(chunk)
}
