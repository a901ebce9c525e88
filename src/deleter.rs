//! Asynchronous batched deletion of archived source frames
//!
//! Deletion is the only irreversible step in the pipeline, so it runs
//! behind two guards: tasks are enqueued strictly after the archive has
//! been verified and written, and every candidate path must pass
//! [`is_safe_to_delete`] — it exists, is a regular file, carries a `.tif`
//! extension, and its name matches the frame grammar. The set's first
//! frame is excluded outright so one representative raw frame per set
//! stays in the source directory.
//!
//! A single worker thread drains the queue; on shutdown it finishes every
//! pending task before exiting.

use parking_lot::{Condvar, Mutex};
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Batches at or above this size get a single summary log line instead of
/// per-file lines.
const BATCH_THRESHOLD: usize = 10;

/// One deletion request: the files of an archived set, minus the frame to
/// keep.
struct DeleteTask {
    files: Vec<PathBuf>,
    keep: Option<PathBuf>,
}

struct DeleteState {
    tasks: VecDeque<DeleteTask>,
    running: bool,
}

struct Inner {
    state: Mutex<DeleteState>,
    cv: Condvar,
}

/// Cloneable producer side of the delete queue
#[derive(Clone)]
pub struct DeleteHandle {
    inner: Arc<Inner>,
}

impl DeleteHandle {
    /// Enqueue a deletion task. `keep` is never deleted even if listed in
    /// `files`.
    pub fn push(&self, files: Vec<PathBuf>, keep: Option<PathBuf>) {
        let mut state = self.inner.state.lock();
        state.tasks.push_back(DeleteTask { files, keep });
        drop(state);
        self.inner.cv.notify_one();
    }
}

/// Owner of the delete worker thread
pub struct DeleteQueue {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl DeleteQueue {
    /// Start the worker thread.
    pub fn start() -> crate::error::Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(DeleteState {
                tasks: VecDeque::new(),
                running: true,
            }),
            cv: Condvar::new(),
        });
        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("framepack-delete".into())
            .spawn(move || delete_worker(worker_inner))?;
        Ok(DeleteQueue {
            inner,
            worker: Some(worker),
        })
    }

    /// Producer handle for workers.
    pub fn handle(&self) -> DeleteHandle {
        DeleteHandle {
            inner: self.inner.clone(),
        }
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Stop the worker. Pending tasks are drained before this returns.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.running = false;
        }
        self.inner.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DeleteQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn delete_worker(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            while state.tasks.is_empty() && state.running {
                // Timed wait so a missed notify cannot stall shutdown
                let _ = inner.cv.wait_for(&mut state, Duration::from_secs(1));
            }
            match state.tasks.pop_front() {
                Some(task) => task,
                None if !state.running => break,
                None => continue,
            }
        };
        run_task(task);
    }
    debug!("delete worker exited");
}

fn run_task(task: DeleteTask) {
    let candidates: Vec<PathBuf> = task
        .files
        .into_iter()
        .filter(|path| Some(path) != task.keep.as_ref())
        .filter(|path| {
            let safe = is_safe_to_delete(path);
            if !safe {
                warn!("refusing to delete {:?}", path);
            }
            safe
        })
        .collect();

    if candidates.is_empty() {
        debug!("no files to delete after filtering");
        return;
    }

    if candidates.len() >= BATCH_THRESHOLD {
        let start = Instant::now();
        let mut deleted = 0usize;
        for path in &candidates {
            if delete_single(path) {
                deleted += 1;
            }
        }
        info!(
            "deleted {}/{} files in {} ms",
            deleted,
            candidates.len(),
            start.elapsed().as_millis()
        );
    } else {
        for path in &candidates {
            if delete_single(path) {
                debug!("deleted {:?}", path);
            }
        }
    }
}

/// Unlink one file, treating "already gone" as success.
fn delete_single(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("failed to delete {:?}: {}", path, e);
            false
        }
    }
}

fn safety_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r".*_[0-9]{2}_[0-9]{5}\.tif$").unwrap())
}

/// Deletion safety predicate.
///
/// Accepts only an existing regular file whose extension is `.tif` and
/// whose filename ends in the `_RR_NNNNN.tif` frame grammar. Anything
/// else — directories, foreign files, unparseable names — is preserved.
pub fn is_safe_to_delete(path: &Path) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    if !meta.is_file() {
        return false;
    }
    if path.extension().and_then(|e| e.to_str()) != Some("tif") {
        return false;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => safety_pattern().is_match(name),
        None => false,
    }
}
