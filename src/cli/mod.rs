//! CLI module - Command line interface definitions and handlers
//!
//! The engines are synchronous. Each handler moves its engine onto a
//! blocking thread and polls the engine's status board from the async side
//! to drive the progress bar, then prints the final snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::carve::signatures::SignatureCatalog;
use crate::carve::Carver;
use crate::config::{generate_sample_config, Config};
use crate::core::{RecoveredFile, Strategy};
use crate::hashing::ImageHasher;
use crate::recover::FilesystemRecoveryEngine;
use crate::status::{RunSnapshot, ValidationStats};
use crate::strings::StringExtractor;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}";

/// carvex - Disk image carving and deleted-file recovery
///
/// Reads images through a read-only memory map. Output directories are
/// emptied at the start of every run.
#[derive(Parser, Debug)]
#[command(name = "carvex")]
#[command(author = "Ryan Cashmoney <tunclon@proton.me>")]
#[command(version)]
#[command(about = "Disk image carving and deleted-file recovery", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbose output (debug logging)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print the final status snapshot as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file (default: platform config dir)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Carve files from a raw disk image by signature scanning
    Carve(CarveArgs),

    /// Recover deleted files through filesystem metadata
    Recover(RecoverArgs),

    /// Compute MD5, SHA-1, SHA-256 and BLAKE3 of an image
    Hash(HashArgs),

    /// Extract printable ASCII strings from an image
    Strings(StringsArgs),

    /// List the built-in signature catalog
    Signatures,

    /// Print a sample config, or write one
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
pub struct CarveArgs {
    /// Source raw disk image (dd, img, or block device)
    #[arg(required = true)]
    pub source: PathBuf,

    /// Output directory for carved files (WARNING: emptied first)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Formats to carve, e.g. JPEG,PNG,PDF (default: all)
    #[arg(long, short, value_delimiter = ',')]
    pub formats: Vec<String>,

    /// Minimum file size in bytes
    #[arg(long)]
    pub min_size: Option<u64>,

    /// Fully decode image candidates before accepting them
    #[arg(long)]
    pub decode_images: bool,
}

#[derive(Debug, Clone, Args)]
pub struct RecoverArgs {
    /// Source disk image
    #[arg(required = true)]
    pub source: PathBuf,

    /// Output directory for recovered files (WARNING: emptied first)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Strategies to run, e.g. directory_walk,inode_scan (default: all)
    #[arg(long, short, value_delimiter = ',', value_parser = parse_strategy)]
    pub strategies: Vec<Strategy>,

    /// Minimum file size in bytes
    #[arg(long)]
    pub min_size: Option<u64>,

    /// Directory depth limit
    #[arg(long)]
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, Args)]
pub struct HashArgs {
    /// Image to hash
    #[arg(required = true)]
    pub source: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct StringsArgs {
    /// Image to scan
    #[arg(required = true)]
    pub source: PathBuf,

    /// Shortest run reported
    #[arg(long, short = 'n')]
    pub min_len: Option<usize>,

    /// Number of strings to print (all are counted)
    #[arg(long)]
    pub preview: Option<usize>,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Write the sample config here instead of printing it
    #[arg(long, short)]
    pub write: Option<PathBuf>,
}

fn parse_strategy(tag: &str) -> std::result::Result<Strategy, String> {
    Strategy::parse(tag).ok_or_else(|| {
        let known: Vec<&str> = Strategy::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown strategy '{}' (expected one of {})", tag, known.join(", "))
    })
}

/// Config from `--config`, else the platform default (or built-in defaults)
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Ok(Config::load()),
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn run_carve(args: CarveArgs, config: &Config, json: bool) -> Result<()> {
    let mut options = config.carve_options()?;
    if let Some(output) = args.output {
        options.output_dir = output;
    }
    if let Some(min_size) = args.min_size {
        options.min_size = min_size;
    }
    options.decode_images |= args.decode_images;
    let formats = if args.formats.is_empty() {
        config.carve.default_formats.clone()
    } else {
        args.formats
    };

    if !json {
        println!("{}", "carvex signature carving".bright_cyan().bold());
        println!("  Image:  {}", args.source.display());
        println!("  Output: {}\n", options.output_dir.display());
    }

    let carver = Arc::new(Carver::new(options));
    let board = carver.status();
    let source = args.source.clone();
    let worker = Arc::clone(&carver);
    let bar = progress_bar(json)?;

    let status = drive(
        move || worker.carve(&source, formats),
        || {
            let snap = board.snapshot();
            bar.set_position(snap.run.progress as u64);
            bar.set_message(format!(
                "{} @ {} | {} found",
                snap.current_format, snap.current_offset, snap.run.files_found
            ));
        },
    )
    .await?;
    bar.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_run_summary(&status.run);
    }
    exit_on_error(&status.run)
}

pub async fn run_recover(args: RecoverArgs, config: &Config, json: bool) -> Result<()> {
    let mut options = config.recovery_options()?;
    if let Some(output) = args.output {
        options.output_dir = output;
    }
    if !args.strategies.is_empty() {
        options.strategies = args.strategies;
    }
    if let Some(min_size) = args.min_size {
        options.min_size = min_size;
    }
    if let Some(max_depth) = args.max_depth {
        options.max_depth = max_depth;
    }

    if !json {
        println!("{}", "carvex deleted-file recovery".bright_cyan().bold());
        println!("  Image:  {}", args.source.display());
        println!("  Output: {}\n", options.output_dir.display());
    }

    let engine = Arc::new(FilesystemRecoveryEngine::new(options)?);
    let board = engine.status();
    let source = args.source.clone();
    let worker = Arc::clone(&engine);
    let bar = progress_bar(json)?;

    let status = drive(
        move || worker.recover(&source),
        || {
            let snap = board.snapshot();
            bar.set_position(snap.run.progress as u64);
            bar.set_message(format!("{} | {} found", snap.message, snap.run.files_found));
        },
    )
    .await?;
    bar.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        if !status.partitions.is_empty() {
            println!("{}", "Volumes:".bold());
            for partition in &status.partitions {
                println!("  {}", partition);
            }
        }
        print_run_summary(&status.run);
        println!("{}", "By strategy:".bold());
        for (strategy, count) in &status.strategy_counts {
            println!("  {:<16} {}", strategy, count);
        }
        if !status.errors.is_empty() {
            println!(
                "\n{} {} candidates skipped on read errors (see --verbose)",
                "⚠".yellow(),
                status.errors.len()
            );
        }
    }
    exit_on_error(&status.run)
}

pub async fn run_hash(args: HashArgs, config: &Config, json: bool) -> Result<()> {
    let hasher = Arc::new(ImageHasher::new(config.progress.eta_refresh()?));
    let board = hasher.status();
    let source = args.source.clone();
    let worker = Arc::clone(&hasher);
    let bar = progress_bar(json)?;

    let status = drive(
        move || worker.hash(&source),
        || {
            let snap = board.snapshot(&args.source);
            bar.set_position(snap.progress as u64);
            bar.set_message(format!(
                "{} / {}",
                humansize::format_size(snap.bytes_processed, humansize::BINARY),
                humansize::format_size(snap.total_bytes, humansize::BINARY)
            ));
        },
    )
    .await?;
    bar.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else if let Some(digests) = &status.digests {
        println!("{}", status.image.display().to_string().bold());
        println!(
            "  Size:    {}",
            humansize::format_size(digests.bytes, humansize::BINARY)
        );
        println!("  MD5:     {}", digests.md5);
        println!("  SHA-1:   {}", digests.sha1);
        println!("  SHA-256: {}", digests.sha256);
        println!("  BLAKE3:  {}", digests.blake3);
    }

    if let Some(error) = status.error {
        eprintln!("{} {}", "✗".red().bold(), error);
        std::process::exit(1);
    }
    Ok(())
}

pub async fn run_strings(args: StringsArgs, config: &Config, json: bool) -> Result<()> {
    let mut options = config.strings_options()?;
    if let Some(min_len) = args.min_len {
        options.min_len = min_len;
    }
    if let Some(preview) = args.preview {
        options.preview_limit = preview;
    }

    let extractor = Arc::new(StringExtractor::new(options));
    let board = extractor.status();
    let source = args.source.clone();
    let worker = Arc::clone(&extractor);
    let bar = progress_bar(json)?;

    let status = drive(
        move || worker.extract(&source),
        || {
            let snap = board.snapshot(&args.source);
            bar.set_position(snap.progress as u64);
            bar.set_message(format!("{} strings", snap.strings_found));
        },
    )
    .await?;
    bar.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for found in &status.preview {
            println!(
                "{}  {}",
                crate::core::format_offset(found.offset).dimmed(),
                found.text
            );
        }
        let shown = status.preview.len() as u64;
        if status.strings_found > shown {
            println!("  ... and {} more", status.strings_found - shown);
        }
        println!(
            "\n{} {} strings of {}+ bytes",
            "✓".bright_green().bold(),
            status.strings_found,
            options.min_len
        );
    }

    if let Some(error) = status.error {
        eprintln!("{} {}", "✗".red().bold(), error);
        std::process::exit(1);
    }
    Ok(())
}

pub fn print_signatures(json: bool) -> Result<()> {
    let catalog = SignatureCatalog::builtin();
    if json {
        let rows: Vec<serde_json::Value> = catalog
            .descriptors()
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "extension": d.extension,
                    "type": d.file_type.label(),
                    "headers": d.headers.iter().map(hex::encode).collect::<Vec<_>>(),
                    "header_offset": d.header_offset,
                    "footer": d.footer.map(hex::encode),
                    "min_size": d.min_size,
                    "max_size": d.max_size,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<6} {:<6} {:<9} {:<28} {:>10}",
        "NAME".bold(),
        "EXT".bold(),
        "TYPE".bold(),
        "HEADERS".bold(),
        "MAX".bold()
    );
    for d in catalog.descriptors() {
        let headers: Vec<String> = d
            .headers
            .iter()
            .map(|h| {
                if d.header_offset > 0 {
                    format!("+{}:{}", d.header_offset, hex::encode(h))
                } else {
                    hex::encode(h)
                }
            })
            .collect();
        println!(
            "{:<6} {:<6} {:<9} {:<28} {:>10}",
            d.name.cyan(),
            d.extension,
            d.file_type.label(),
            headers.join(" "),
            humansize::format_size(d.max_size, humansize::BINARY)
        );
    }
    Ok(())
}

pub fn run_config(args: ConfigArgs) -> Result<()> {
    let sample = generate_sample_config();
    match args.write {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, sample)
                .with_context(|| format!("Failed to write config: {}", path.display()))?;
            println!("{} Wrote {}", "✓".bright_green().bold(), path.display());
        }
        None => print!("{}", sample),
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Run `task` on a blocking thread, calling `poll` until it finishes
async fn drive<T, F, P>(task: F, poll: P) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    P: Fn(),
{
    let handle = tokio::task::spawn_blocking(task);
    while !handle.is_finished() {
        poll();
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    poll();
    handle.await.context("Engine thread panicked")
}

/// Percent bar, hidden for JSON output or when nobody is watching
fn progress_bar(json: bool) -> Result<ProgressBar> {
    if json || !console::user_attended_stderr() {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)?
            .progress_chars("█▓▒░"),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

fn print_run_summary(run: &RunSnapshot) {
    let total: u64 = run.files.iter().map(|f| f.size).sum();
    println!("\n{}", "═".repeat(50).bright_cyan());
    match &run.error {
        None => println!(
            "  {} {} files recovered ({})",
            "✓".bright_green().bold(),
            run.files_found,
            humansize::format_size(total, humansize::BINARY)
        ),
        Some(error) => println!("  {} {}", "✗".red().bold(), error),
    }
    println!("  Elapsed: {}", run.times.elapsed);
    print_validation(&run.validation);
    println!("{}", "═".repeat(50).bright_cyan());
    for file in run.files.iter().take(20) {
        print_file(file);
    }
    if run.files.len() > 20 {
        println!("  ... and {} more", run.files.len() - 20);
    }
}

fn print_validation(stats: &ValidationStats) {
    println!(
        "  Scanned {} | empty {} | duplicate {} | invalid {} | recovered {}",
        stats.total_scanned,
        stats.rejected_empty,
        stats.rejected_duplicate.to_string().yellow(),
        stats.rejected_invalid,
        stats.valid_recovered.to_string().green()
    );
}

fn print_file(file: &RecoveredFile) {
    println!(
        "  {} {:>10}  {}",
        crate::core::format_offset(file.offset).dimmed(),
        humansize::format_size(file.size, humansize::BINARY),
        file.filename
    );
}

fn exit_on_error(run: &RunSnapshot) -> Result<()> {
    if run.error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}
