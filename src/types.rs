//! Core data types shared across the framepack library
//!
//! The unit of work is a *set*: `set_size` consecutive frames of one run.
//! A [`TaskKey`] names a set by its run number and leading frame number; a
//! [`FileSet`] is the observed on-disk state of that set. [`MonitorConfig`]
//! carries everything the monitor needs to watch a directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FramepackError, Result};
use crate::utils::zero_pad;

/// Identifier of one set: `(run, set_number)`.
///
/// `set_number` is the frame number of the set's first frame. Keys order by
/// run first, then set number, which is also the order sets are enqueued in
/// during the initial scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    /// Two-digit run number from the frame filename
    pub run: u16,
    /// Frame number of the first frame in the set
    pub set_number: u32,
}

impl TaskKey {
    /// Compute the key owning `frame_number` within `run`.
    ///
    /// Frame numbers start at 1; `set_number = ((n-1)/set_size)*set_size + 1`.
    pub fn for_frame(run: u16, frame_number: u32, set_size: u32) -> Self {
        debug_assert!(frame_number >= 1);
        debug_assert!(set_size >= 1);
        let set_number = ((frame_number - 1) / set_size) * set_size + 1;
        TaskKey { run, set_number }
    }

    /// Filename stem shared by the set's archive and its first frame,
    /// e.g. `test_01_00301`.
    pub fn archive_stem(&self, prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            zero_pad(self.run as u32, 2),
            zero_pad(self.set_number, 5)
        )
    }

    /// Path of the archive this set produces under `output_dir`.
    pub fn archive_path(&self, output_dir: &Path, prefix: &str) -> PathBuf {
        output_dir.join(format!("{}.lz4", self.archive_stem(prefix)))
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {:02} set {:05}", self.run, self.set_number)
    }
}

/// Observed on-disk state of one set.
///
/// Frames are kept ordered by frame number. Every path in `files` maps to
/// this set's [`TaskKey`]; the index upholds that invariant on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSet {
    /// Key of this set
    pub key: TaskKey,
    /// Frame number → absolute path, ordered by frame number
    pub files: BTreeMap<u32, PathBuf>,
    /// Set-level processed flag (flipped optimistically on dispatch)
    pub processed: bool,
}

impl FileSet {
    /// Create an empty set for `key`.
    pub fn new(key: TaskKey) -> Self {
        FileSet {
            key,
            files: BTreeMap::new(),
            processed: false,
        }
    }

    /// The frame whose number equals `set_number`, if observed yet.
    ///
    /// This frame is copied next to the archive and exempted from deletion.
    pub fn first_file(&self) -> Option<&PathBuf> {
        self.files.get(&self.key.set_number)
    }

    /// True once all `set_size` frames have been observed.
    pub fn is_complete(&self, set_size: u32) -> bool {
        self.files.len() as u32 >= set_size
    }

    /// Paths in ascending frame order.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.values()
    }
}

/// Configuration for a directory monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Directory the detector writes frames into
    pub watch_dir: PathBuf,
    /// Directory archives and preserved first frames are written to
    pub output_dir: PathBuf,
    /// Fixed filename prefix; frames match `<prefix>_<RR>_<NNNNN>.tif`
    pub prefix: String,
    /// Number of consecutive frames per set
    pub set_size: u32,
    /// Delay between incremental scans
    pub poll_interval: Duration,
    /// Reader threads used per set while building an archive
    pub max_threads: usize,
    /// Maximum sets processed concurrently
    pub max_processes: usize,
    /// LZ4 acceleration: 1 = default ratio, higher = faster and weaker
    pub acceleration: i32,
    /// Delete source frames once their archive is verified on disk
    pub delete_after: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            watch_dir: PathBuf::from("Z:"),
            output_dir: PathBuf::from("Z:"),
            prefix: "test".to_string(),
            set_size: 100,
            poll_interval: Duration::from_millis(300),
            max_threads: 8,
            max_processes: 1,
            acceleration: 4,
            delete_after: true,
        }
    }
}

impl MonitorConfig {
    /// Validate the configuration before the monitor starts.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(FramepackError::InvalidConfiguration(
                "filename prefix must not be empty".into(),
            ));
        }
        if self.set_size == 0 {
            return Err(FramepackError::InvalidConfiguration(
                "set size must be at least 1".into(),
            ));
        }
        if self.max_threads == 0 || self.max_processes == 0 {
            return Err(FramepackError::InvalidConfiguration(
                "thread and process counts must be at least 1".into(),
            ));
        }
        if self.acceleration < 1 {
            return Err(FramepackError::InvalidConfiguration(
                "acceleration must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
