//! Repository directory bookkeeping
//!
//! A repository is a directory holding a marker file and one subdirectory per
//! archive. Archives created without an explicit name are named after their
//! start time (see [`crate::utils::time_name`]); the newest finished one of
//! those is what a new create run bases itself on.

use crate::archive::{ArchiveLayout, ArchiveReader};
use crate::config::Config;
use crate::error::{PhatError, Result};
use crate::utils::{self, is_time_name};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marker file present in every repository
pub const REPO_MARKER: &str = "Is_PhatBak_Repo";

/// Handle to a repository directory
#[derive(Debug, Clone)]
pub struct Repository {
    dir: PathBuf,
}

impl Repository {
    /// Create the repository directory and marker; existing ones are kept
    pub fn init(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(PhatError::io_at("create dir", dir))?;
        utils::touch(&dir.join(REPO_MARKER))?;
        info!("initialized repository {:?}", dir);
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Open an existing repository
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() || !dir.join(REPO_MARKER).is_file() {
            return Err(PhatError::RepositoryNotFound(dir.to_path_buf()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Repository directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Layout of archive `name`
    pub fn layout(&self, name: &str) -> ArchiveLayout {
        ArchiveLayout::new(&self.dir, name)
    }

    /// Names of every archive, sorted
    pub fn archives(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(PhatError::io_at("read dir", &self.dir))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(PhatError::io_at("read dir", &self.dir))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if entry.path().is_dir() && self.layout(&name).is_archive() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// `repo::archive` lines as printed by `list`
    pub fn listing(&self) -> Result<Vec<String>> {
        Ok(self
            .archives()?
            .into_iter()
            .map(|name| format!("{}::{}", self.dir.display(), name))
            .collect())
    }

    /// Newest finished archive with a time-formatted name
    pub fn latest_finished(&self) -> Result<Option<String>> {
        let latest = self
            .archives()?
            .into_iter()
            .filter(|name| is_time_name(name) && self.layout(name).is_finished())
            .max();
        debug!("latest finished archive: {:?}", latest);
        Ok(latest)
    }

    /// Open `name`, or the latest finished archive when `None`
    pub fn open_archive(&self, name: Option<&str>, config: &Config) -> Result<ArchiveReader> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self
                .latest_finished()?
                .ok_or_else(|| PhatError::ArchiveNotFound(self.dir.clone()))?,
        };
        ArchiveReader::open(self.layout(&name).dir(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ARCHIVE_MARKER, FINISHED_MARKER};
    use tempfile::TempDir;

    fn fake_archive(repo: &Path, name: &str, finished: bool) {
        let dir = repo.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(ARCHIVE_MARKER), b"").unwrap();
        if finished {
            fs::write(dir.join(FINISHED_MARKER), b"").unwrap();
        }
    }

    #[test]
    fn test_init_then_open() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("repo");
        assert!(matches!(Repository::open(&dir), Err(PhatError::RepositoryNotFound(_))));
        Repository::init(&dir).unwrap();
        Repository::init(&dir).unwrap();
        assert!(Repository::open(&dir).is_ok());
    }

    #[test]
    fn test_latest_finished_skips_unfinished_and_custom_names() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        fake_archive(tmp.path(), "2024_01_01_0000_00", true);
        fake_archive(tmp.path(), "2024_02_01_0000_00", true);
        fake_archive(tmp.path(), "2024_03_01_0000_00", false);
        fake_archive(tmp.path(), "zz_manual", true);
        fs::create_dir(tmp.path().join("2025_01_01_0000_00")).unwrap();

        assert_eq!(repo.latest_finished().unwrap().as_deref(), Some("2024_02_01_0000_00"));
        assert_eq!(repo.archives().unwrap().len(), 4);
    }

    #[test]
    fn test_listing_is_sorted() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        fake_archive(tmp.path(), "b", true);
        fake_archive(tmp.path(), "a", false);
        let prefix = tmp.path().display().to_string();
        assert_eq!(
            repo.listing().unwrap(),
            vec![format!("{prefix}::a"), format!("{prefix}::b")]
        );
    }

    #[test]
    fn test_open_archive_without_any() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        assert!(matches!(
            repo.open_archive(None, &Config::default()),
            Err(PhatError::ArchiveNotFound(_))
        ));
    }
}
