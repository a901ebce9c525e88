//! # framepack - streaming batch archiver for detector frames
//!
//! A long-running, on-disk archiver for high-rate detector pipelines that
//! continually emit numbered TIFF frames into a watched directory.
//! framepack groups frames into fixed-size contiguous sets, compresses
//! each complete set into a single self-describing LZ4 archive, and
//! deletes the source frames only after the archive has survived an
//! in-memory round-trip decompression.
//!
//! ## Overview
//!
//! Frames are named `<prefix>_<RR>_<NNNNN>.tif` — a two-digit run and a
//! five-digit frame number starting at 00001. A *set* is `set_size`
//! consecutive frames of one run, keyed by `(run, set_number)` where
//! `set_number` is the first frame number of the set.
//!
//! The moving parts, in data-flow order:
//!
//! - **Scanner** ([`scanner`]): one initial parallel full scan, then
//!   incremental sweeps every poll interval, feeding the index and the
//!   task queue.
//! - **Index** ([`index`]): persistent `(run, set)` → file-set map with
//!   modification-time change detection; reconstructed from
//!   `.file_index.bin` on restart.
//! - **Scheduler** ([`scheduler`]): bounded worker pool pulling set keys
//!   from the queue, surviving worker failures by reverting the set's
//!   processed flag.
//! - **Processor** ([`processor`]): parallel read → concatenate →
//!   compress → self-check → atomic write → enqueue deletion.
//! - **Deleter** ([`deleter`]): batched unlinking behind a safety
//!   predicate; the first frame of every set is always preserved.
//! - **Reader** ([`reader`], [`merge`]): offline companion that restores
//!   frames from archives, optionally summing phase-indexed subsets while
//!   preserving the original TIFF header bytes.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use framepack::{Monitor, MonitorConfig};
//! use std::path::PathBuf;
//!
//! # fn main() -> framepack::Result<()> {
//! let config = MonitorConfig {
//!     watch_dir: PathBuf::from("/data/raw"),
//!     output_dir: PathBuf::from("/data/packed"),
//!     prefix: "scan".to_string(),
//!     set_size: 100,
//!     ..MonitorConfig::default()
//! };
//! let monitor = Monitor::spawn(config)?;
//! // ... frames arrive, archives appear ...
//! monitor.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - A source frame is never deleted while its archive is absent from the
//!   output directory.
//! - The first frame of every set survives in the source directory and is
//!   copied next to the archive.
//! - An aborted archive is simply absent; its sources remain on disk and
//!   the set is retried on a later scan.

pub mod archive;
pub mod deleter;
pub mod error;
pub mod index;
pub mod merge;
pub mod processor;
pub mod queue;
pub mod reader;
pub mod scanner;
pub mod scheduler;
pub mod tiff;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use archive::{build_archive, read_archive, read_archive_file, ArchiveEntry};
pub use error::{FramepackError, Result};
pub use index::FileIndex;
pub use reader::{restore_archives, RestoreMode, RestoreRequest, RestoreStats};
pub use scanner::FramePattern;
pub use scheduler::Monitor;
pub use types::{FileSet, MonitorConfig, TaskKey};
