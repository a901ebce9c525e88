//! # framepack CLI - archive detector frames as they arrive
//!
//! Watches a directory for numbered TIFF frames, packs each complete set
//! into a verified LZ4 archive, and deletes the archived sources (keeping
//! one representative frame per set).
//!
//! Every parameter can be given as a flag; parameters left off the
//! command line are prompted for interactively with their defaults shown,
//! matching the tool this replaces:
//!
//! ```bash
//! # Fully scripted
//! framepack --watch-dir /data/raw --output-dir /data/packed --prefix scan --set-size 100 --yes
//!
//! # Interactive (prompts for the four main settings)
//! framepack
//! ```

use clap::Parser;
use colored::*;
use framepack::{Monitor, MonitorConfig};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Streaming batch archiver: sets of TIFF frames in, verified LZ4 archives out
#[derive(Parser)]
#[command(name = "framepack")]
#[command(version)]
#[command(about = "Archive numbered detector frames into verified LZ4 sets")]
struct Cli {
    /// Directory to monitor for incoming frames
    #[arg(long)]
    watch_dir: Option<PathBuf>,

    /// Directory for archives and preserved first frames
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Filename prefix; frames match <prefix>_##_#####.tif
    #[arg(long)]
    prefix: Option<String>,

    /// Number of frames per set
    #[arg(long)]
    set_size: Option<u32>,

    /// Reader threads per set
    #[arg(long, default_value_t = 8)]
    max_threads: usize,

    /// Concurrently processed sets
    #[arg(long, default_value_t = 1)]
    max_processes: usize,

    /// LZ4 acceleration (1 = default ratio, higher = faster)
    #[arg(long, default_value_t = 4)]
    acceleration: i32,

    /// Keep source frames after archiving
    #[arg(long)]
    keep_sources: bool,

    /// Accept defaults without prompting for missing parameters
    #[arg(short, long)]
    yes: bool,

    /// Stop the monitor when Enter is pressed
    #[arg(long)]
    stop_on_enter: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> framepack::Result<()> {
    println!("{}", "=== framepack ===".bold());
    println!("Version {}", env!("CARGO_PKG_VERSION"));
    println!("Started {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!();

    let defaults = MonitorConfig::default();
    let interactive = !cli.yes;

    let watch_dir = cli.watch_dir.unwrap_or_else(|| {
        prompt_path("Enter directory to monitor", &defaults.watch_dir, interactive)
    });
    let output_dir = cli.output_dir.unwrap_or_else(|| {
        prompt_path("Enter directory for output files", &defaults.output_dir, interactive)
    });
    let prefix = cli
        .prefix
        .unwrap_or_else(|| prompt_string("Enter filename prefix", &defaults.prefix, interactive));
    let set_size = cli.set_size.unwrap_or_else(|| {
        prompt_number("Enter number of files per set", defaults.set_size, interactive)
    });

    let config = MonitorConfig {
        watch_dir,
        output_dir,
        prefix,
        set_size,
        max_threads: cli.max_threads,
        max_processes: cli.max_processes,
        acceleration: cli.acceleration,
        delete_after: !cli.keep_sources,
        ..defaults
    };

    println!();
    println!("{}", "=== Monitor Configuration ===".bold());
    println!("Watch directory:  {}", config.watch_dir.display());
    println!("Output directory: {}", config.output_dir.display());
    println!("File pattern:     {}_##_#####.tif", config.prefix);
    println!("Set size:         {}", config.set_size);
    println!();
    println!("Starting monitor...");
    println!();

    let monitor = Monitor::spawn(config)?;

    if cli.stop_on_enter {
        println!("Press Enter to stop the monitor...");
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        monitor.shutdown();
    } else {
        // Run until killed or the scanner dies
        while monitor.is_running() {
            std::thread::sleep(Duration::from_secs(1));
        }
        monitor.shutdown();
    }
    Ok(())
}

fn prompt_line(question: &str, shown_default: &str, interactive: bool) -> Option<String> {
    if !interactive {
        return None;
    }
    print!("{} [{}]: ", question, shown_default);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return None;
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn prompt_path(question: &str, default: &std::path::Path, interactive: bool) -> PathBuf {
    prompt_line(question, &default.display().to_string(), interactive)
        .map(PathBuf::from)
        .unwrap_or_else(|| default.to_path_buf())
}

fn prompt_string(question: &str, default: &str, interactive: bool) -> String {
    prompt_line(question, default, interactive).unwrap_or_else(|| default.to_string())
}

fn prompt_number(question: &str, default: u32, interactive: bool) -> u32 {
    match prompt_line(question, &default.to_string(), interactive) {
        Some(text) => text.parse().unwrap_or_else(|_| {
            println!("Invalid input. Using default value: {}", default);
            default
        }),
        None => default,
    }
}
