//! # framepack-restore CLI - extract or merge archived frame sets
//!
//! Offline companion to `framepack`. Reads the `.lz4` archives covering a
//! run and frame range and either writes the original frames back out or
//! merges phase-indexed frames by summation, preserving the source TIFF
//! headers.
//!
//! ```bash
//! # Extract frames 1..=500 of runs 1..=2
//! framepack-restore --input-dir /data/packed --output-dir /data/restored \
//!     --prefix scan --start-run 1 --end-run 2 --start-image 1 --end-image 500 --mode extract
//!
//! # Merge with 10 phases per output group
//! framepack-restore ... --mode merge --merge-frame-num 10
//! ```

use clap::{Parser, ValueEnum};
use colored::*;
use framepack::{restore_archives, RestoreMode, RestoreRequest};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Write every archived frame back out unchanged
    Extract,
    /// Sum phase-indexed frames into merged int32 outputs
    Merge,
}

/// Restore detector frames from framepack archives
#[derive(Parser)]
#[command(name = "framepack-restore")]
#[command(version)]
#[command(about = "Extract or merge frames from framepack LZ4 archives")]
struct Cli {
    /// Directory holding the .lz4 archives
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Directory restored frames are written to
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Filename prefix the archives were produced with
    #[arg(long)]
    prefix: Option<String>,

    /// First run (inclusive)
    #[arg(long)]
    start_run: Option<u16>,

    /// Last run (inclusive)
    #[arg(long)]
    end_run: Option<u16>,

    /// First frame number (inclusive)
    #[arg(long)]
    start_image: Option<u32>,

    /// Last frame number (inclusive)
    #[arg(long)]
    end_image: Option<u32>,

    /// Restore mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Phase count for merge mode
    #[arg(long)]
    merge_frame_num: Option<u32>,

    /// Frames per archive, as configured on the archiver side
    #[arg(long, default_value_t = 100)]
    set_size: u32,

    /// Divisor for merged-output numbering
    #[arg(long, default_value_t = 10)]
    frame_divisor: u32,

    /// Concurrent archive workers
    #[arg(long, default_value_t = 3)]
    concurrency: usize,

    /// Accept defaults without prompting for missing parameters
    #[arg(short, long)]
    yes: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> framepack::Result<()> {
    let interactive = !cli.yes;

    let input_dir = cli
        .input_dir
        .unwrap_or_else(|| PathBuf::from(prompt("Input directory", "Z:", interactive)));
    let output_dir = cli
        .output_dir
        .unwrap_or_else(|| PathBuf::from(prompt("Output directory", "Z:", interactive)));
    let prefix = cli
        .prefix
        .unwrap_or_else(|| prompt("Prefix", "test", interactive));
    let start_run = cli
        .start_run
        .unwrap_or_else(|| prompt_parse("Start run", 1u16, interactive));
    let end_run = cli
        .end_run
        .unwrap_or_else(|| prompt_parse("End run", start_run, interactive));
    let start_image = cli
        .start_image
        .unwrap_or_else(|| prompt_parse("Start image", 1u32, interactive));
    let end_image = cli
        .end_image
        .unwrap_or_else(|| prompt_parse("End image", 100u32, interactive));

    let mode = match cli.mode {
        Some(mode) => mode,
        None => {
            let choice: u8 = prompt_parse(
                "Run type (0: output tif files without merging, 1: merge)",
                0u8,
                interactive,
            );
            if choice == 1 {
                Mode::Merge
            } else {
                Mode::Extract
            }
        }
    };
    let mode = match mode {
        Mode::Extract => RestoreMode::Extract,
        Mode::Merge => RestoreMode::Merge {
            phases: cli
                .merge_frame_num
                .unwrap_or_else(|| prompt_parse("Merge frame number", 1u32, interactive)),
        },
    };

    let archives_per_run =
        (end_image.saturating_sub(start_image) / cli.set_size.max(1)) as usize + 1;
    let total = archives_per_run * (end_run.saturating_sub(start_run) + 1) as usize;
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );
    let progress_bar = bar.clone();

    let request = RestoreRequest {
        input_dir,
        output_dir,
        prefix,
        start_run,
        end_run,
        start_image,
        end_image,
        set_size: cli.set_size,
        frame_divisor: cli.frame_divisor,
        concurrency: cli.concurrency,
        mode,
        progress: Some(Arc::new(move |done, _total| {
            progress_bar.set_position(done as u64);
        })),
    };

    let start = Instant::now();
    let stats = restore_archives(&request)?;
    bar.finish_and_clear();

    println!(
        "{} {} archives processed, {} failed, {} files written in {:.1}s",
        "Done:".green().bold(),
        stats.archives_processed,
        stats.archives_failed,
        stats.files_written,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn prompt(question: &str, default: &str, interactive: bool) -> String {
    if !interactive {
        return default.to_string();
    }
    print!("{} [{}]: ", question, default);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return default.to_string();
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

fn prompt_parse<T>(question: &str, default: T, interactive: bool) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    prompt(question, &default.to_string(), interactive)
        .parse()
        .unwrap_or_else(|_| {
            println!("Invalid input. Using default value: {}", default);
            default
        })
}
