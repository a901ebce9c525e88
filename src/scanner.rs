//! Directory scanner feeding the set index
//!
//! Two phases on one dedicated thread: an initial full scan that fans the
//! directory listing out across the rayon pool, then single-threaded
//! incremental sweeps every poll interval. Both phases funnel matching
//! frames into the index through `has_file_changed`, so unchanged files
//! cost one map lookup and no I/O.
//!
//! Per-file stat errors (a frame vanishing mid-iteration, permission
//! hiccups on network shares) are swallowed; the next cleanup pass removes
//! anything that is really gone.

use crate::index::FileIndex;
use crate::queue::TaskQueue;
use crate::types::MonitorConfig;
use crate::utils::modified_millis;
use parking_lot::Mutex;
use rayon::prelude::*;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Incremental passes between cleanup sweeps of the index.
const CLEANUP_EVERY: u32 = 32;

/// Compiled filename pattern for `<prefix>_<RR>_<NNNNN>.tif`
pub struct FramePattern {
    regex: Regex,
}

impl FramePattern {
    /// Compile the pattern for `prefix`.
    pub fn new(prefix: &str) -> crate::error::Result<Self> {
        let regex = Regex::new(&format!(
            r"^{}_([0-9]{{2}})_([0-9]{{5}})\.tif$",
            regex::escape(prefix)
        ))?;
        Ok(FramePattern { regex })
    }

    /// Parse `(run, frame_number)` out of a filename, if it matches.
    ///
    /// Frame numbers start at 1; a literal `00000` is not a frame.
    pub fn parse(&self, file_name: &str) -> Option<(u16, u32)> {
        let captures = self.regex.captures(file_name)?;
        let run: u16 = captures.get(1)?.as_str().parse().ok()?;
        let frame: u32 = captures.get(2)?.as_str().parse().ok()?;
        if frame == 0 {
            return None;
        }
        Some((run, frame))
    }
}

/// Scanner state shared with the monitor
pub(crate) struct Scanner {
    pub config: MonitorConfig,
    pub pattern: FramePattern,
    pub index: Arc<Mutex<FileIndex>>,
    pub queue: Arc<TaskQueue>,
    pub running: Arc<AtomicBool>,
}

impl Scanner {
    /// Scanner thread body: one full scan, then incremental sweeps until
    /// shutdown.
    pub fn run(self) {
        if let Err(e) = self.full_scan() {
            warn!("initial scan failed: {}", e);
        }
        self.sweep_pending();
        self.save_index();
        self.queue.mark_initial_scan_done();
        info!("initial full scan completed, switching to incremental scanning");

        let mut pass = 0u32;
        while self.running.load(Ordering::Relaxed) {
            std::thread::sleep(self.config.poll_interval);
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.incremental_scan() {
                warn!("incremental scan failed: {}", e);
                continue;
            }
            pass = pass.wrapping_add(1);
            if pass % CLEANUP_EVERY == 0 {
                self.index.lock().cleanup();
            }
            self.sweep_pending();
            self.save_index();
        }
        debug!("scanner thread exited");
    }

    /// Enumerate the whole directory and index every matching frame in
    /// parallel.
    pub(crate) fn full_scan(&self) -> crate::error::Result<()> {
        let start = Instant::now();
        info!("performing full scan of {:?}", self.config.watch_dir);

        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(&self.config.watch_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                entries.push(entry.into_path());
            }
        }
        info!("found {} files, matching in parallel", entries.len());

        let processed = AtomicUsize::new(0);
        let matched = AtomicUsize::new(0);
        let total = entries.len();
        let progress_step = total / 10 + 1;

        entries.par_iter().for_each(|path| {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some((run, frame)) = self.pattern.parse(name) {
                    // Stat outside the lock; vanished files are skipped
                    if let Ok(mtime) = modified_millis(path) {
                        let mut index = self.index.lock();
                        if index.has_file_changed(path, mtime) {
                            index.add_file(path, run, frame, mtime, false);
                        }
                    }
                    matched.fetch_add(1, Ordering::Relaxed);
                }
            }
            let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
            if total > 10_000 && done % progress_step == 0 {
                info!("scan progress: {}% ({}/{} files)", done * 100 / total, done, total);
            }
        });

        self.index.lock().cleanup();

        info!(
            "full scan completed: {} files seen, {} matched, {} ms",
            processed.load(Ordering::Relaxed),
            matched.load(Ordering::Relaxed),
            start.elapsed().as_millis()
        );
        Ok(())
    }

    /// Single-threaded sweep for new or modified frames.
    pub(crate) fn incremental_scan(&self) -> crate::error::Result<()> {
        let mut new_files = 0usize;
        for entry in std::fs::read_dir(&self.config.watch_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let (run, frame) = match self.pattern.parse(name) {
                Some(parsed) => parsed,
                None => continue,
            };
            // The file may vanish between listing and stat
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let mtime = match meta.modified() {
                Ok(t) => crate::utils::system_time_millis(t),
                Err(_) => continue,
            };

            let path = entry.path();
            let mut index = self.index.lock();
            if index.has_file_changed(&path, mtime) {
                index.add_file(&path, run, frame, mtime, false);
                new_files += 1;
            }
        }
        if new_files > 0 {
            trace!("incremental scan indexed {} files", new_files);
        }
        Ok(())
    }

    /// Offer every complete, unprocessed set to the task queue.
    ///
    /// The queue suppresses duplicates, so sweeping the whole index each
    /// pass is cheap and also re-offers sets whose worker failed and was
    /// reverted.
    pub(crate) fn sweep_pending(&self) {
        let pending: Vec<_> = {
            let index = self.index.lock();
            index
                .all_file_sets(false)
                .into_iter()
                .filter(|set| set.is_complete(self.config.set_size))
                .map(|set| set.key)
                .collect()
        };
        for key in pending {
            if self.queue.push(key) {
                debug!("queued complete {}", key);
            }
        }
    }

    fn save_index(&self) {
        if let Err(e) = self.index.lock().save() {
            // The index is rebuildable; a failed save is not fatal
            warn!("failed to save index: {}", e);
        }
    }
}
