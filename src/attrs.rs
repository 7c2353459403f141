//! Restoring file attributes and special files on extract
//!
//! Owner, permission and ACL failures usually mean the extracting user lacks
//! privilege rather than that anything is damaged, so [`AttrRestorer`] logs
//! them as warnings and counts them. A failure to set the modify time is an
//! error: the time is what the next create run compares against.

use crate::error::{PhatError, Result};
use crate::record::{FileKind, ListRecord};
use crate::utils::{ns_to_file_time, set_permissions};
use nix::sys::stat::Mode;
use std::fmt::Debug;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Reads and applies extended ACLs in their text form
pub trait AclHandler: Send + Sync + Debug {
    /// ACL text of `path`, or `None` when it has only the mode bits
    fn read_acl(&self, path: &Path, mode: u32) -> Result<Option<String>>;

    /// Apply ACL text to `path`
    fn apply_acl(&self, path: &Path, mode: u32, acl: &str) -> Result<()>;
}

/// Handler for systems without extended ACL support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAcl;

impl AclHandler for NoAcl {
    fn read_acl(&self, _path: &Path, _mode: u32) -> Result<Option<String>> {
        Ok(None)
    }

    fn apply_acl(&self, path: &Path, _mode: u32, acl: &str) -> Result<()> {
        if acl.is_empty() {
            return Ok(());
        }
        Err(PhatError::io_at("apply acl", path)(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "extended ACLs are not supported",
        )))
    }
}

/// Applies recorded attributes to extracted paths
#[derive(Debug)]
pub struct AttrRestorer {
    acl: Arc<dyn AclHandler>,
    warnings: AtomicU64,
}

impl AttrRestorer {
    pub fn new(acl: Arc<dyn AclHandler>) -> Self {
        Self {
            acl,
            warnings: AtomicU64::new(0),
        }
    }

    /// Non-fatal attribute failures so far
    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    /// Owner, mode, ACL, then modify time
    ///
    /// Mode and ACL are skipped for symlinks; the owner and time of a
    /// symlink are set on the link itself.
    pub fn restore(&self, path: &Path, record: &ListRecord) -> Result<()> {
        let is_link = record.kind() == FileKind::Symlink;

        let owner = if is_link {
            std::os::unix::fs::lchown(path, Some(record.uid), Some(record.gid))
        } else {
            std::os::unix::fs::chown(path, Some(record.uid), Some(record.gid))
        };
        if let Err(e) = owner {
            self.warn("set owner of", path, &e.to_string());
        }

        if !is_link {
            if let Err(e) = set_permissions(path, record.permissions()) {
                self.warn("set mode of", path, &e.to_string());
            }
            if let Some(acl) = &record.acl {
                if let Err(e) = self.acl.apply_acl(path, record.mode, acl) {
                    self.warn("set ACL of", path, &e.to_string());
                }
            }
        }

        let mtime = ns_to_file_time(record.mtime_ns);
        filetime::set_symlink_file_times(path, mtime, mtime)
            .map_err(PhatError::io_at("set modify time", path))?;
        trace!("restored attributes of {:?}", path);
        Ok(())
    }

    fn warn(&self, what: &str, path: &Path, detail: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        warn!("can't {} {:?}: {}", what, path, detail);
    }
}

/// Create a named pipe with the permission bits of `mode`
pub fn make_fifo(path: &Path, mode: u32) -> Result<()> {
    let mode = Mode::from_bits_truncate((mode & 0o7777) as nix::libc::mode_t);
    nix::unistd::mkfifo(path, mode)
        .map_err(|e| PhatError::io_at("mkfifo", path)(std::io::Error::from(e)))
}

/// Create a Unix domain socket file
pub fn make_socket(path: &Path) -> Result<()> {
    UnixListener::bind(path).map_err(PhatError::io_at("create socket", path))?;
    Ok(())
}
