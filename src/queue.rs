//! Task queue between the scanner and the scheduler
//!
//! FIFO of [`TaskKey`]s with duplicate suppression: because incremental
//! scans re-enumerate the directory every few hundred milliseconds, the
//! same completed set would otherwise be offered many times before its
//! worker finishes and flips the processed flag. The `enqueued` set is
//! consulted under the queue lock; a key leaves it when popped.

use crate::types::TaskKey;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::trace;

/// Outcome of a queue pop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop {
    /// A key is ready for dispatch
    Task(TaskKey),
    /// Nothing queued before the timeout (or the initial scan finished
    /// with an empty queue)
    Idle,
    /// Shutdown was requested; no more keys will be handed out
    Shutdown,
}

struct QueueState {
    tasks: VecDeque<TaskKey>,
    enqueued: HashSet<TaskKey>,
    initial_scan_done: bool,
    shutdown: bool,
}

/// FIFO of set keys with duplicate suppression
pub struct TaskQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                enqueued: HashSet::new(),
                initial_scan_done: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Enqueue `key` unless it is already waiting. Returns whether the key
    /// was actually added.
    pub fn push(&self, key: TaskKey) -> bool {
        let mut state = self.state.lock();
        if state.shutdown || !state.enqueued.insert(key) {
            return false;
        }
        state.tasks.push_back(key);
        drop(state);
        self.cv.notify_one();
        trace!("enqueued {}", key);
        true
    }

    /// Pop the next key, waiting while the queue is empty.
    ///
    /// Before the initial scan completes the wait is unbounded (there is
    /// nothing to poll for yet); afterwards it is bounded by `timeout`.
    /// Either way the wait ends early when a key arrives or on shutdown.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let mut state = self.state.lock();
        if state.tasks.is_empty() && !state.shutdown && !timeout.is_zero() {
            if state.initial_scan_done {
                let deadline = Instant::now() + timeout;
                while state.tasks.is_empty() && !state.shutdown {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            } else {
                while state.tasks.is_empty() && !state.shutdown && !state.initial_scan_done {
                    self.cv.wait(&mut state);
                }
            }
        }
        if state.shutdown {
            return Pop::Shutdown;
        }
        match state.tasks.pop_front() {
            Some(key) => {
                state.enqueued.remove(&key);
                Pop::Task(key)
            }
            None => Pop::Idle,
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Pop {
        self.pop_timeout(Duration::ZERO)
    }

    /// Record that the initial full scan completed; wakes all waiters.
    pub fn mark_initial_scan_done(&self) {
        let mut state = self.state.lock();
        state.initial_scan_done = true;
        drop(state);
        self.cv.notify_all();
    }

    /// True once the initial full scan has completed.
    pub fn initial_scan_done(&self) -> bool {
        self.state.lock().initial_scan_done
    }

    /// Stop handing out keys and wake all waiters.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Number of keys currently waiting.
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
