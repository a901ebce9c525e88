//! Monitor: scanner + bounded worker pool + safe deleter, wired together
//!
//! [`Monitor::spawn`] starts three long-lived threads — the directory
//! scanner, the scheduler loop, and the delete worker — and returns a
//! handle whose [`Monitor::shutdown`] drains them in dependency order:
//! no new dispatches, join in-flight workers (reverting failures), save
//! the index, and only then stop the delete queue so every archive that
//! reached disk also gets its sources cleaned up.
//!
//! The scheduler marks a set processed *before* handing it to a worker.
//! That keeps rescans from re-queueing a set mid-flight, at the price of a
//! crash window where the on-disk index claims success without an archive;
//! the reconciliation pass in `spawn` closes that window on the next start.

use crate::deleter::{DeleteHandle, DeleteQueue};
use crate::error::{FramepackError, Result};
use crate::index::FileIndex;
use crate::processor;
use crate::queue::{Pop, TaskQueue};
use crate::scanner::{FramePattern, Scanner};
use crate::types::{FileSet, MonitorConfig, TaskKey};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause when a scheduler iteration neither reaped nor dispatched.
const IDLE_SLEEP: Duration = Duration::from_millis(50);

struct SchedulerCtx {
    config: MonitorConfig,
    index: Arc<Mutex<FileIndex>>,
    queue: Arc<TaskQueue>,
    running: Arc<AtomicBool>,
    deleter: DeleteHandle,
}

/// Running directory monitor
pub struct Monitor {
    index: Arc<Mutex<FileIndex>>,
    queue: Arc<TaskQueue>,
    running: Arc<AtomicBool>,
    scanner: Option<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
    delete_queue: Option<DeleteQueue>,
}

impl Monitor {
    /// Validate the configuration, reconcile the persistent index against
    /// the output directory, and start all monitor threads.
    pub fn spawn(config: MonitorConfig) -> Result<Monitor> {
        config.validate()?;
        if !config.watch_dir.is_dir() {
            return Err(FramepackError::InvalidConfiguration(format!(
                "watch directory {:?} does not exist",
                config.watch_dir
            )));
        }
        std::fs::create_dir_all(&config.output_dir)?;
        let pattern = FramePattern::new(&config.prefix)?;

        info!(
            "starting monitor on {:?} -> {:?} (prefix {:?}, set size {})",
            config.watch_dir, config.output_dir, config.prefix, config.set_size
        );

        let mut index = FileIndex::open(&config.watch_dir, config.set_size);
        let reopened = index.reconcile(&config.output_dir, &config.prefix);
        if reopened > 0 {
            info!("reconciliation re-opened {} sets with missing archives", reopened);
        }

        let index = Arc::new(Mutex::new(index));
        let queue = Arc::new(TaskQueue::new());
        let running = Arc::new(AtomicBool::new(true));
        let delete_queue = DeleteQueue::start()?;

        let scanner = Scanner {
            config: config.clone(),
            pattern,
            index: index.clone(),
            queue: queue.clone(),
            running: running.clone(),
        };
        let scanner_running = running.clone();
        let scanner_queue = queue.clone();
        let scanner_handle = std::thread::Builder::new()
            .name("framepack-scan".into())
            .spawn(move || {
                if std::panic::catch_unwind(AssertUnwindSafe(|| scanner.run())).is_err() {
                    error!("scanner thread died unexpectedly, stopping monitor");
                    scanner_running.store(false, Ordering::SeqCst);
                    scanner_queue.shutdown();
                }
            })?;

        let ctx = SchedulerCtx {
            config,
            index: index.clone(),
            queue: queue.clone(),
            running: running.clone(),
            deleter: delete_queue.handle(),
        };
        let scheduler_handle = std::thread::Builder::new()
            .name("framepack-sched".into())
            .spawn(move || scheduler_loop(ctx))?;

        Ok(Monitor {
            index,
            queue,
            running,
            scanner: Some(scanner_handle),
            scheduler: Some(scheduler_handle),
            delete_queue: Some(delete_queue),
        })
    }

    /// False once shutdown was requested or the scanner died.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Number of files currently tracked by the index.
    pub fn index_len(&self) -> usize {
        self.index.lock().len()
    }

    /// Number of sets waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// True once the initial full scan has completed.
    pub fn initial_scan_done(&self) -> bool {
        self.queue.initial_scan_done()
    }

    /// Stop all threads, draining in-flight work first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst)
            && self.scanner.is_none()
            && self.scheduler.is_none()
        {
            return;
        }
        info!("stopping monitor");
        self.queue.shutdown();

        if let Some(handle) = self.scanner.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.index.lock().save() {
            warn!("failed to save index on shutdown: {}", e);
        }
        // Joined last: archives already on disk still get their sources
        // cleaned up before the process exits.
        if let Some(queue) = self.delete_queue.take() {
            info!("waiting for delete queue to finish");
            queue.stop();
        }
        info!("monitor stopped");
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scheduler_loop(ctx: SchedulerCtx) {
    let mut workers: Vec<(TaskKey, JoinHandle<Result<()>>)> = Vec::new();

    while ctx.running.load(Ordering::Relaxed) {
        let mut progressed = reap_workers(&mut workers, &ctx, false);

        // Fill the pool from the queue
        let mut shutdown = false;
        while workers.len() < ctx.config.max_processes {
            match ctx.queue.try_pop() {
                Pop::Task(key) => {
                    if dispatch(&ctx, key, &mut workers) {
                        progressed = true;
                    }
                }
                Pop::Shutdown => {
                    shutdown = true;
                    break;
                }
                Pop::Idle => break,
            }
        }
        if shutdown {
            break;
        }

        if !progressed {
            if workers.is_empty() {
                // Nothing in flight: block on the queue instead of spinning
                match ctx.queue.pop_timeout(IDLE_SLEEP) {
                    Pop::Task(key) => {
                        dispatch(&ctx, key, &mut workers);
                    }
                    Pop::Shutdown => break,
                    Pop::Idle => {}
                }
            } else {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    // Drain everything still in flight before returning
    if !workers.is_empty() {
        info!("waiting for {} in-flight sets to finish", workers.len());
        reap_workers(&mut workers, &ctx, true);
    }
    debug!("scheduler thread exited");
}

/// Double-check the popped key against the index and, if it still needs
/// work, optimistically mark it processed and start a worker. Returns
/// whether the iteration made progress.
fn dispatch(
    ctx: &SchedulerCtx,
    key: TaskKey,
    workers: &mut Vec<(TaskKey, JoinHandle<Result<()>>)>,
) -> bool {
    let set: FileSet = {
        let mut index = ctx.index.lock();
        let set = match index.get_file_set(key) {
            Some(set) => set.clone(),
            None => {
                debug!("{} vanished from the index before dispatch", key);
                return true;
            }
        };
        if set.processed {
            debug!("{} already dispatched, skipping duplicate", key);
            return true;
        }
        if !set.is_complete(ctx.config.set_size) {
            warn!(
                "incomplete set received: {} ({}/{} files)",
                key,
                set.files.len(),
                ctx.config.set_size
            );
            return true;
        }
        if key
            .archive_path(&ctx.config.output_dir, &ctx.config.prefix)
            .exists()
        {
            info!("set already archived: {}", key);
            index.mark_file_set_processed(key, true);
            return true;
        }

        // Marked before dispatch so rescans leave the set alone mid-flight
        index.mark_file_set_processed(key, true);
        set
    };

    info!("processing {} ({} files)", key, set.files.len());
    let config = ctx.config.clone();
    let deleter = ctx.deleter.clone();
    let spawned = std::thread::Builder::new()
        .name("framepack-worker".into())
        .spawn(move || processor::process_file_set(&set, &config, &deleter));
    match spawned {
        Ok(handle) => {
            workers.push((key, handle));
        }
        Err(e) => {
            error!("failed to spawn worker for {}: {}", key, e);
            ctx.index.lock().mark_file_set_processed(key, false);
        }
    }
    true
}

/// Collect finished workers; with `blocking` set, join all of them.
/// Failed sets get their processed flag reverted for a later retry.
fn reap_workers(
    workers: &mut Vec<(TaskKey, JoinHandle<Result<()>>)>,
    ctx: &SchedulerCtx,
    blocking: bool,
) -> bool {
    let mut progressed = false;
    let mut i = 0;
    while i < workers.len() {
        if blocking || workers[i].1.is_finished() {
            let (key, handle) = workers.remove(i);
            let ok = match handle.join() {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("set {} failed: {}", key, e);
                    false
                }
                Err(_) => {
                    error!("worker for {} panicked", key);
                    false
                }
            };
            if !ok {
                warn!("reverting processed flag for {}", key);
                ctx.index.lock().mark_file_set_processed(key, false);
            }
            progressed = true;
        } else {
            i += 1;
        }
    }
    progressed
}
