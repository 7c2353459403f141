//! # PhatBak CLI - Deduplicating incremental backups
//!
//! ## Usage
//! ```bash
//! # Create a repository
//! phatbak init /backups/home
//!
//! # Archive files; the latest finished archive is the base
//! phatbak create /backups/home ~/projects ~/documents
//!
//! # Restore the latest archive into ./PhatBakExtract
//! phatbak extract /backups/home
//!
//! # Check a named archive block by block
//! phatbak test /backups/home::2024_05_01_0930_12
//! ```

use clap::{Args, Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use phatbak::create::FileObserver;
use phatbak::utils::{canonize_path, format_bytes};
use phatbak::{
    ArchiveVerifier, BaseSelection, Comparator, CompressionType, Config, ConfigBuilder, Creator,
    Extractor, HashType, PhatError, Repository, Result, TaskScheduler,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// PhatBak - deduplicating incremental backups
#[derive(Parser)]
#[command(name = "phatbak")]
#[command(version)]
#[command(about = "Deduplicating incremental backups built from hardlinked block files")]
#[command(long_about = None)]
struct Cli {
    /// Worker threads (defaults to the number of CPUs)
    #[arg(short = 'T', long, global = true)]
    threads: Option<usize>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print each path as it is processed
    #[arg(long, global = true)]
    show_files: bool,

    /// Show a spinner while running
    #[arg(long, global = true)]
    progress: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a repository
    Init {
        /// Repository directory
        repo: PathBuf,
    },

    /// Archive files into a repository
    Create {
        /// REPO or REPO::ARCHIVE; the archive name defaults to the start time
        target: String,

        /// Files and directories to archive
        #[arg(default_value = ".")]
        files: Vec<String>,

        #[command(flatten)]
        format: FormatArgs,

        /// Write every file in full instead of deduplicating against a base
        #[arg(long, conflicts_with = "base_archive")]
        rebase: bool,

        /// Base archive to deduplicate against (defaults to the latest)
        #[arg(long)]
        base_archive: Option<String>,
    },

    /// Restore an archive
    #[command(alias = "x")]
    Extract {
        /// REPO or REPO::ARCHIVE; the archive defaults to the latest
        source: String,

        /// Only restore paths at or below these
        files: Vec<String>,

        /// Directory to restore into; must not exist
        #[arg(short, long)]
        target: Option<PathBuf>,
    },

    /// Check the integrity of an archive
    Test {
        /// REPO or REPO::ARCHIVE
        source: String,
    },

    /// Compare an archive with the live files
    Compare {
        /// REPO or REPO::ARCHIVE
        source: String,

        /// Only compare paths at or below these
        files: Vec<String>,
    },

    /// List the archives of a repository, or the paths in an archive
    #[command(alias = "ls")]
    List {
        /// REPO or REPO::ARCHIVE
        source: String,
    },

    /// Print the name of the latest finished archive
    Latest {
        /// Repository directory
        repo: PathBuf,
    },
}

/// Format settings of a new archive; a base archive's settings win
#[derive(Args)]
struct FormatArgs {
    /// Bytes per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Chunk hash (MD5, CRC32, SHA256)
    #[arg(long)]
    hash_type: Option<HashType>,

    /// Block compression (NONE, ZSTD, LZ4)
    #[arg(long)]
    comp_type: Option<CompressionType>,

    /// Compression level
    #[arg(long)]
    comp_level: Option<i32>,

    /// Directory fan-out of block spaces
    #[arg(long)]
    block_num_modulus: Option<u64>,
}

impl FormatArgs {
    fn apply(&self, mut builder: ConfigBuilder) -> ConfigBuilder {
        if let Some(v) = self.chunk_size {
            builder = builder.chunk_size(v);
        }
        if let Some(v) = self.hash_type {
            builder = builder.hash_type(v);
        }
        if let Some(v) = self.comp_type {
            builder = builder.compression(v);
        }
        if let Some(v) = self.comp_level {
            builder = builder.compression_level(v);
        }
        if let Some(v) = self.block_num_modulus {
            builder = builder.block_modulus(v);
        }
        builder
    }
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e.user_message());
            std::process::exit(1);
        }
    }
}

/// Main command runner; `false` means the command found problems
fn run(cli: Cli) -> Result<bool> {
    let globals = Globals {
        threads: cli.threads,
        show_files: cli.show_files,
        progress: cli.progress,
        json: cli.json,
    };

    match cli.command {
        Commands::Init { repo } => cmd_init(&repo),
        Commands::Create {
            target,
            files,
            format,
            rebase,
            base_archive,
        } => {
            let selection = match (rebase, base_archive) {
                (true, _) => BaseSelection::Rebase,
                (false, Some(name)) => BaseSelection::Named(name),
                (false, None) => BaseSelection::Latest,
            };
            cmd_create(&globals, &target, files, &format, selection)
        }
        Commands::Extract { source, files, target } => cmd_extract(&globals, &source, files, target),
        Commands::Test { source } => cmd_test(&globals, &source),
        Commands::Compare { source, files } => cmd_compare(&globals, &source, files),
        Commands::List { source } => cmd_list(&globals, &source),
        Commands::Latest { repo } => cmd_latest(&repo),
    }
}

struct Globals {
    threads: Option<usize>,
    show_files: bool,
    progress: bool,
    json: bool,
}

impl Globals {
    fn builder(&self) -> Result<ConfigBuilder> {
        let cwd = std::env::current_dir().map_err(PhatError::Io)?;
        let mut builder = Config::builder()
            .cwd(cwd)
            .show_files(self.show_files)
            .command_line(std::env::args().collect::<Vec<_>>().join(" "));
        if let Some(threads) = self.threads {
            builder = builder.threads(threads);
        }
        Ok(builder)
    }

    fn scheduler(&self, config: &Config) -> Result<Arc<TaskScheduler>> {
        Ok(Arc::new(TaskScheduler::new(config.threads)?))
    }

    fn spinner(&self, message: &str) -> Option<ProgressBar> {
        if !self.progress {
            return None;
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(message.to_string());
        Some(pb)
    }

    /// Observer printing or displaying each processed path
    fn observer(&self, spinner: Option<&ProgressBar>) -> Option<FileObserver> {
        let spinner = spinner.cloned();
        let show = self.show_files;
        if spinner.is_none() && !show {
            return None;
        }
        Some(Arc::new(move |path: &Path| {
            match &spinner {
                Some(pb) if show => pb.println(path.display().to_string()),
                Some(pb) => pb.set_message(path.display().to_string()),
                None => println!("{}", path.display()),
            }
        }))
    }

    fn emit_json<T: Serialize>(&self, value: &T) -> Result<bool> {
        let text = serde_json::to_string_pretty(value).map_err(|e| PhatError::internal(e.to_string()))?;
        println!("{}", text);
        Ok(true)
    }
}

/// Split `REPO::ARCHIVE`
fn split_target(arg: &str) -> (PathBuf, Option<String>) {
    match arg.split_once("::") {
        Some((repo, archive)) if !archive.is_empty() => (PathBuf::from(repo), Some(archive.to_string())),
        Some((repo, _)) => (PathBuf::from(repo), None),
        None => (PathBuf::from(arg), None),
    }
}

fn cmd_init(repo: &Path) -> Result<bool> {
    let repo = Repository::init(repo)?;
    println!("{} Initialized repository", "✓".green().bold());
    println!("  Path: {}", repo.dir().display().to_string().cyan());
    Ok(true)
}

fn cmd_create(
    globals: &Globals,
    target: &str,
    files: Vec<String>,
    format: &FormatArgs,
    selection: BaseSelection,
) -> Result<bool> {
    let (repo_dir, archive) = split_target(target);
    let repo = Repository::open(&repo_dir)?;
    let config = format.apply(globals.builder()?).file_args(files).build()?;
    let pool = globals.scheduler(&config)?;

    let spinner = globals.spinner("Scanning files...");
    let mut creator = Creator::new(&repo, &config, archive.as_deref(), selection, pool)?;
    if let Some(observer) = globals.observer(spinner.as_ref()) {
        creator = creator.with_observer(observer);
    }
    let summary = creator.run();
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let summary = summary?;

    if globals.json {
        return globals.emit_json(&summary);
    }
    println!(
        "{} Created archive {}",
        "✓".green().bold(),
        summary.archive.yellow().bold()
    );
    if let Some(base) = &summary.base {
        println!("  Base: {}", base.cyan());
    }
    println!("  Records: {}", summary.records.to_string().cyan());
    println!("  Read: {}", format_bytes(summary.bytes_read).cyan());
    println!(
        "  Chunks: {} written, {} linked",
        summary.chunks_written.to_string().cyan(),
        summary.chunks_linked.to_string().cyan()
    );
    if summary.unchanged_files > 0 {
        println!("  Unchanged: {} files", summary.unchanged_files.to_string().green());
    }
    if summary.skipped > 0 {
        println!("  Skipped: {} paths", summary.skipped.to_string().yellow());
    }
    println!("  Time: {}", format_duration(summary.duration).to_string().cyan());
    Ok(true)
}

fn cmd_extract(globals: &Globals, source: &str, files: Vec<String>, target: Option<PathBuf>) -> Result<bool> {
    let (repo_dir, archive) = split_target(source);
    let repo = Repository::open(&repo_dir)?;
    let mut builder = globals.builder()?.file_args(files);
    if let Some(target) = target {
        builder = builder.extract_target(target);
    }
    let config = builder.build()?;
    let reader = repo.open_archive(archive.as_deref(), &config)?;
    let pool = globals.scheduler(&config)?;

    let spinner = globals.spinner("Restoring files...");
    let mut extractor = Extractor::new(reader, &config, pool);
    if let Some(observer) = globals.observer(spinner.as_ref()) {
        extractor = extractor.with_observer(observer);
    }
    let summary = extractor.run();
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let summary = summary?;

    if globals.json {
        return globals.emit_json(&summary);
    }
    println!(
        "{} Restored {} into {}",
        "✓".green().bold(),
        summary.archive.yellow().bold(),
        summary.target.display().to_string().cyan()
    );
    println!("  Records: {}", summary.records.to_string().cyan());
    println!("  Written: {}", format_bytes(summary.bytes_written).cyan());
    if summary.attribute_warnings > 0 {
        println!(
            "  Attribute warnings: {}",
            summary.attribute_warnings.to_string().yellow()
        );
    }
    println!("  Time: {}", format_duration(summary.duration).to_string().cyan());
    Ok(true)
}

fn cmd_test(globals: &Globals, source: &str) -> Result<bool> {
    let (repo_dir, archive) = split_target(source);
    let repo = Repository::open(&repo_dir)?;
    let config = globals.builder()?.build()?;
    let reader = repo.open_archive(archive.as_deref(), &config)?;
    let report = ArchiveVerifier::new(reader, globals.scheduler(&config)?).verify()?;

    if globals.json {
        globals.emit_json(&report)?;
        return Ok(report.is_valid());
    }
    if report.is_valid() {
        println!("{} {}", "✓".green().bold(), report.summary());
        return Ok(true);
    }
    println!("{} {}", "✗".red().bold(), report.summary());
    for warning in &report.warnings {
        println!("  {}", warning.yellow());
    }
    for block in &report.missing_blocks {
        println!("  missing {}", block.to_string().red());
    }
    for block in &report.unused_blocks {
        println!("  unused {}", block.to_string().yellow());
    }
    Ok(false)
}

fn cmd_compare(globals: &Globals, source: &str, files: Vec<String>) -> Result<bool> {
    let (repo_dir, archive) = split_target(source);
    let repo = Repository::open(&repo_dir)?;
    let config = globals.builder()?.build()?;
    let filters = files
        .iter()
        .map(|f| canonize_path(Path::new(f), &config.cwd))
        .collect();
    let reader = repo.open_archive(archive.as_deref(), &config)?;
    let report = Comparator::new(reader).with_filters(filters).compare()?;

    if globals.json {
        globals.emit_json(&report)?;
        return Ok(report.is_identical());
    }
    for difference in &report.differences {
        println!("{}", difference.to_string().yellow());
    }
    println!("{}", report.summary());
    Ok(report.is_identical())
}

fn cmd_list(globals: &Globals, source: &str) -> Result<bool> {
    let (repo_dir, archive) = split_target(source);
    let repo = Repository::open(&repo_dir)?;
    let Some(archive) = archive else {
        for line in repo.listing()? {
            println!("{}", line);
        }
        return Ok(true);
    };
    let config = globals.builder()?.build()?;
    let reader = repo.open_archive(Some(&archive), &config)?;
    for record in reader.records()? {
        println!("{}", record.name);
    }
    Ok(true)
}

fn cmd_latest(repo: &Path) -> Result<bool> {
    let repo = Repository::open(repo)?;
    let latest = repo
        .latest_finished()?
        .ok_or_else(|| PhatError::ArchiveNotFound(repo.dir().to_path_buf()))?;
    println!("{}", latest);
    Ok(true)
}
