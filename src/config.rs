//! Run configuration and the archive `Options` file
//!
//! A [`Config`] is an immutable value built once per process (usually from the
//! command line) and passed by reference to every component. Opening an
//! archive never mutates it; instead [`Config::with_archive_options`] produces
//! a new value where the archive-scoped keys recorded in the archive's
//! `Options` file override the process defaults.
//!
//! ## Options file
//!
//! ```text
//! Options:
//!    ChunkSize       = 262144
//!    HashType        = MD5
//!    CompType        = ZSTD
//! ```
//!
//! Only the keys that shape the on-disk format are read back: chunk size,
//! hash type, compression type and level, block modulus, the original file
//! arguments and the working directory.

use crate::compression::{CompressionEngine, CompressionType};
use crate::error::{PhatError, Result};
use crate::hash::HashType;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Default chunk size (256 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 18;

/// Default fan-out of sharded block directories
pub const DEFAULT_BLOCK_MODULUS: u64 = 100;

/// Default zstd level
pub const DEFAULT_COMP_LEVEL: i32 = 2;

/// Default extraction directory
pub const DEFAULT_EXTRACT_TARGET: &str = "PhatBakExtract";

/// Resolved configuration for one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    /// Bytes per chunk; the last chunk of a file may be shorter
    pub chunk_size: usize,
    /// Chunk hash algorithm
    pub hash_type: HashType,
    /// Block compression algorithm
    pub compression: CompressionType,
    /// Compression level passed to the codec
    pub compression_level: i32,
    /// Directory fan-out of block spaces
    pub block_modulus: u64,
    /// Worker threads in the task scheduler
    pub threads: usize,
    /// Files and directories given on the command line
    pub file_args: Vec<String>,
    /// Working directory file arguments are relative to
    pub cwd: PathBuf,
    /// Where extraction writes to
    pub extract_target: PathBuf,
    /// Print each path as it is processed
    pub show_files: bool,
    /// Full command line, recorded for reference
    pub command_line: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_type: HashType::default(),
            compression: CompressionType::default(),
            compression_level: DEFAULT_COMP_LEVEL,
            block_modulus: DEFAULT_BLOCK_MODULUS,
            threads: num_cpus::get(),
            file_args: Vec::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            extract_target: PathBuf::from(DEFAULT_EXTRACT_TARGET),
            show_files: false,
            command_line: String::new(),
        }
    }
}

impl Config {
    /// Start building a configuration from defaults
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Compression engine matching this configuration
    pub fn compression_engine(&self) -> CompressionEngine {
        CompressionEngine::new(self.compression, self.compression_level)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PhatError::InvalidConfiguration("chunk size must be positive".into()));
        }
        if self.block_modulus < 2 {
            return Err(PhatError::InvalidConfiguration(format!(
                "block modulus must be at least 2, got {}",
                self.block_modulus
            )));
        }
        if self.compression == CompressionType::Zstd
            && !zstd::compression_level_range().contains(&self.compression_level)
        {
            return Err(PhatError::InvalidConfiguration(format!(
                "zstd level {} out of range",
                self.compression_level
            )));
        }
        Ok(())
    }

    /// Layer an archive's recorded options over this configuration
    pub fn with_archive_options(&self, options: &Options) -> Config {
        let mut cfg = self.clone();
        if let Some(v) = options.chunk_size {
            cfg.chunk_size = v;
        }
        if let Some(v) = options.hash_type {
            cfg.hash_type = v;
        }
        if let Some(v) = options.compression {
            cfg.compression = v;
        }
        if let Some(v) = options.compression_level {
            cfg.compression_level = v;
        }
        if let Some(v) = options.block_modulus {
            cfg.block_modulus = v;
        }
        if let Some(v) = &options.file_args {
            cfg.file_args = v.clone();
        }
        if let Some(v) = &options.cwd {
            cfg.cwd = v.clone();
        }
        cfg
    }

    /// Inherit the format-shaping settings of a base archive
    ///
    /// Chunk ordinals are only comparable between archives with the same
    /// chunk size, hash and codec, so a run based on an existing archive
    /// adopts them. File arguments and working directory stay this run's.
    pub fn inherit_format(&self, base: &Config) -> Config {
        Config {
            chunk_size: base.chunk_size,
            hash_type: base.hash_type,
            compression: base.compression,
            compression_level: base.compression_level,
            block_modulus: base.block_modulus,
            ..self.clone()
        }
    }
}

/// Builder for [`Config`]
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder seeded with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set chunk size in bytes
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set hash algorithm
    pub fn hash_type(mut self, hash: HashType) -> Self {
        self.config.hash_type = hash;
        self
    }

    /// Set compression algorithm
    pub fn compression(mut self, kind: CompressionType) -> Self {
        self.config.compression = kind;
        self
    }

    /// Set compression level
    pub fn compression_level(mut self, level: i32) -> Self {
        self.config.compression_level = level;
        self
    }

    /// Set block directory fan-out
    pub fn block_modulus(mut self, modulus: u64) -> Self {
        self.config.block_modulus = modulus;
        self
    }

    /// Set number of worker threads (0 runs everything inline)
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = threads;
        self
    }

    /// Set file arguments
    pub fn file_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.file_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set working directory
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.config.cwd = cwd.into();
        self
    }

    /// Set extraction target
    pub fn extract_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.config.extract_target = target.into();
        self
    }

    /// Print each processed path
    pub fn show_files(mut self, show: bool) -> Self {
        self.config.show_files = show;
        self
    }

    /// Record the command line
    pub fn command_line(mut self, line: impl Into<String>) -> Self {
        self.config.command_line = line.into();
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Archive-scoped values read back from an `Options` file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    /// Chunk size
    pub chunk_size: Option<usize>,
    /// Hash algorithm
    pub hash_type: Option<HashType>,
    /// Compression algorithm
    pub compression: Option<CompressionType>,
    /// Compression level
    pub compression_level: Option<i32>,
    /// Block directory fan-out
    pub block_modulus: Option<u64>,
    /// Original file arguments
    pub file_args: Option<Vec<String>>,
    /// Original working directory
    pub cwd: Option<PathBuf>,
}

impl Options {
    /// Render the `Options` file for an archive created with `config`
    pub fn render(config: &Config, archive_name: &str, base: Option<&Path>) -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = base.map(|b| b.display().to_string()).unwrap_or_default();

        let mut out = String::from("Options:\n");
        let mut line = |key: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(out, "   {key:<15} = {value}");
        };
        line("CmdLine", &config.command_line);
        line("Host", &host);
        line("FileArgs", &config.file_args.join(" "));
        line("CWD", &config.cwd.display());
        line("ArchDirName", &archive_name);
        line("BaseArchive", &base);
        line("BlockNumModulus", &config.block_modulus);
        line("ChunkSize", &config.chunk_size);
        line("HashType", &config.hash_type);
        line("CompType", &config.compression);
        line("CompLevel", &config.compression_level);
        out
    }

    /// Parse `Options` text; `origin` names the file for error messages
    pub fn parse(text: &str, origin: &str) -> Result<Options> {
        let mut opts = Options::default();
        for (idx, raw) in text.lines().enumerate() {
            let parts: Vec<&str> = raw.split('=').collect();
            if parts.len() != 2 {
                continue;
            }
            let key = parts[0].trim();
            let value = parts[1].trim();
            let bad = |what: &str| PhatError::format(origin, Some(idx + 1), format!("bad {what} '{value}'"));
            match key {
                "FileArgs" => {
                    opts.file_args = Some(value.split_whitespace().map(str::to_string).collect())
                }
                "CWD" => opts.cwd = Some(PathBuf::from(value)),
                "BlockNumModulus" => {
                    opts.block_modulus = Some(value.parse().map_err(|_| bad("BlockNumModulus"))?)
                }
                "ChunkSize" => opts.chunk_size = Some(value.parse().map_err(|_| bad("ChunkSize"))?),
                "HashType" => opts.hash_type = Some(value.parse().map_err(|_| bad("HashType"))?),
                "CompType" => opts.compression = Some(value.parse().map_err(|_| bad("CompType"))?),
                "CompLevel" => {
                    opts.compression_level = Some(value.parse().map_err(|_| bad("CompLevel"))?)
                }
                _ => {}
            }
        }
        Ok(opts)
    }

    /// Read and parse an `Options` file
    pub fn load(path: &Path) -> Result<Options> {
        let text = std::fs::read_to_string(path).map_err(PhatError::io_at("read", path))?;
        Options::parse(&text, &path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.chunk_size, 262_144);
        assert_eq!(cfg.hash_type, HashType::Md5);
        assert_eq!(cfg.compression, CompressionType::Zstd);
        assert_eq!(cfg.compression_level, 2);
        assert_eq!(cfg.block_modulus, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builder_validates() {
        assert!(Config::builder().chunk_size(0).build().is_err());
        assert!(Config::builder().block_modulus(1).build().is_err());
        let cfg = Config::builder()
            .chunk_size(4)
            .threads(0)
            .compression(CompressionType::Lz4)
            .build()
            .unwrap();
        assert_eq!(cfg.chunk_size, 4);
        assert_eq!(cfg.threads, 0);
    }

    #[test]
    fn test_options_layering() {
        let process = Config::builder().chunk_size(1024).threads(3).build().unwrap();
        let text = Options::render(
            &Config::builder()
                .chunk_size(4)
                .hash_type(HashType::Sha256)
                .compression(CompressionType::None)
                .file_args(["/a", "/b c"])
                .cwd("/work")
                .build()
                .unwrap(),
            "2024_01_01_0000_00",
            None,
        );
        let opts = Options::parse(&text, "Options").unwrap();
        let layered = process.with_archive_options(&opts);

        assert_eq!(layered.chunk_size, 4);
        assert_eq!(layered.hash_type, HashType::Sha256);
        assert_eq!(layered.compression, CompressionType::None);
        assert_eq!(layered.cwd, PathBuf::from("/work"));
        // Process-only settings survive
        assert_eq!(layered.threads, 3);
        // Process value itself is untouched
        assert_eq!(process.chunk_size, 1024);
    }

    #[test]
    fn test_options_bad_value() {
        let err = Options::parse("Options:\n   ChunkSize = lots\n", "Options").unwrap_err();
        match err {
            PhatError::Format { line, .. } => assert_eq!(line, Some(2)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_options_ignores_unknown_and_malformed() {
        let opts = Options::parse("junk\nWhatever = 1\nCmdLine = a = b\n", "Options").unwrap();
        assert_eq!(opts, Options::default());
    }
}
