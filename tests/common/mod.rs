//! Shared fixtures: a repository and a live tree in one temporary directory

use ::phatbak::utils::path_below;
use ::phatbak::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const CHUNK: usize = 4;

pub struct Harness {
    pub tmp: TempDir,
    pub repo: Repository,
    pub live: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(&tmp.path().join("repo")).unwrap();
        let live = tmp.path().join("live");
        std::fs::create_dir(&live).unwrap();
        Self { tmp, repo, live }
    }

    pub fn config(&self, threads: usize) -> Config {
        Config::builder()
            .chunk_size(CHUNK)
            .threads(threads)
            .file_args([self.live.to_str().unwrap()])
            .build()
            .unwrap()
    }

    pub fn create(&self, name: &str, selection: BaseSelection, threads: usize) -> CreateSummary {
        self.create_with(&self.config(threads), name, selection)
    }

    pub fn create_with(&self, config: &Config, name: &str, selection: BaseSelection) -> CreateSummary {
        let pool = Arc::new(TaskScheduler::new(config.threads).unwrap());
        Creator::new(&self.repo, config, Some(name), selection, pool)
            .unwrap()
            .run()
            .unwrap()
    }

    pub fn reader(&self, name: &str) -> ArchiveReader {
        self.repo.open_archive(Some(name), &self.config(1)).unwrap()
    }

    /// Extraction root for `name`; removed first if present
    pub fn out_dir(&self, name: &str) -> PathBuf {
        let out = self.tmp.path().join(format!("out-{name}"));
        let _ = std::fs::remove_dir_all(&out);
        out
    }

    pub fn extractor(&self, name: &str, threads: usize) -> Extractor {
        let config = Config::builder()
            .threads(threads)
            .extract_target(self.out_dir(name))
            .build()
            .unwrap();
        let reader = self.repo.open_archive(Some(name), &config).unwrap();
        Extractor::new(reader, &config, Arc::new(TaskScheduler::new(threads).unwrap()))
    }

    /// Extract `name` and return where the live tree landed
    pub fn extract(&self, name: &str, threads: usize) -> PathBuf {
        self.extractor(name, threads).run().unwrap();
        self.restored(name)
    }

    pub fn restored(&self, name: &str) -> PathBuf {
        path_below(&self.tmp.path().join(format!("out-{name}")), self.live.to_str().unwrap())
    }

    /// Regular files below a block space directory
    pub fn block_files(dir: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }
}
