//! Utility functions for PhatBak
//!
//! Small helpers shared by the archive, create and extract code:
//!
//! ### Path Manipulation
//! - Lexical canonicalization of file arguments against a working directory
//! - Mapping archived absolute names below an extraction root
//!
//! ### Time
//! - Nanosecond timestamps to and from [`SystemTime`] and [`FileTime`]
//! - The standard archive name format (`%Y_%m_%d_%H%M_%S`)
//!
//! ### File Operations
//! - Marker files (`touch`)
//! - Permission bits and symbolic links
//!
//! ### Formatting
//! - Human-readable byte counts
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use phatbak::utils::{canonize_path, format_bytes};
//! use std::path::Path;
//!
//! let abs = canonize_path(Path::new("../etc/./hosts"), Path::new("/home/me"));
//! assert_eq!(abs, Path::new("/home/etc/hosts"));
//! println!("{}", format_bytes(1536)); // "1.50 KB"
//! ```
//!
//! ## Thread Safety
//!
//! All functions here are stateless and can be called from any worker.

use crate::error::{PhatError, Result};
use chrono::{DateTime, Local};
use filetime::FileTime;
use std::fs::{self, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// `strftime` pattern of default archive names and log timestamps
pub const TIME_NAME_FORMAT: &str = "%Y_%m_%d_%H%M_%S";

/// Make `path` absolute against `cwd` and resolve `.` and `..` lexically
///
/// Symbolic links are not followed, so a file argument that is itself a
/// symlink is archived as the link rather than its target.
///
/// # Example
///
/// ```rust,ignore
/// assert_eq!(
///     canonize_path(Path::new("a/../b/./c"), Path::new("/x")),
///     PathBuf::from("/x/b/c")
/// );
/// ```
pub fn canonize_path(path: &Path, cwd: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };

    let mut out = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Every proper ancestor of `path`, outermost first, excluding `/`
pub fn ancestors_of(path: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = path
        .ancestors()
        .skip(1)
        .filter(|p| p.parent().is_some())
        .map(Path::to_path_buf)
        .collect();
    found.reverse();
    found
}

/// Location of archived absolute `name` below the extraction `root`
pub fn path_below(root: &Path, name: &str) -> PathBuf {
    root.join(name.trim_start_matches('/'))
}

/// Whether `name` equals `prefix` or starts with it as a string
///
/// Plain string prefixing, so `/data/a` also selects `/data/ab`.
pub fn name_matches(name: &str, prefix: &Path) -> bool {
    prefix
        .to_str()
        .is_some_and(|prefix| name.starts_with(prefix))
}

/// Nanoseconds since the epoch, negative before it
pub fn system_time_to_ns(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i64,
        Err(before) => -(before.duration().as_nanos() as i64),
    }
}

/// Inverse of [`system_time_to_ns`]
pub fn ns_to_system_time(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
    }
}

/// Nanosecond timestamp as a [`FileTime`]
pub fn ns_to_file_time(ns: i64) -> FileTime {
    FileTime::from_unix_time(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32)
}

/// Local time rendered in [`TIME_NAME_FORMAT`]
pub fn time_name(time: DateTime<Local>) -> String {
    time.format(TIME_NAME_FORMAT).to_string()
}

/// Whether `name` has the shape of a default archive name
///
/// That is `XXXX_XX_XX_XXXX_XX` with every `X` an ASCII digit.
pub fn is_time_name(name: &str) -> bool {
    const PATTERN: &[u8] = b"XXXX_XX_XX_XXXX_XX";
    name.len() == PATTERN.len()
        && name
            .bytes()
            .zip(PATTERN)
            .all(|(c, p)| if *p == b'X' { c.is_ascii_digit() } else { c == *p })
}

/// Create an empty file, or leave an existing one untouched
pub fn touch(path: &Path) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(PhatError::io_at("touch", path))?;
    trace!("touched {:?}", path);
    Ok(())
}

/// Set Unix permission bits
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(PhatError::io_at("chmod", path))
}

/// Create a symlink at `link` pointing to `target`
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(PhatError::io_at("symlink", link))
}

/// Read symlink target
pub fn read_symlink(path: &Path) -> Result<PathBuf> {
    fs::read_link(path).map_err(PhatError::io_at("readlink", path))
}

/// Format bytes as human-readable string
///
/// # Example
///
/// ```rust,ignore
/// assert_eq!(format_bytes(0), "0 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
///
/// Uses binary units (1024-based).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
