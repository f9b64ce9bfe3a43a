// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline timer that enforces task timeouts.
//!
//! One thread per scheduler sleeps until the earliest deadline and runs its
//! action. Cancelled entries are skipped when they surface, and purged in
//! bulk once they make up most of the heap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cell::CompletionCell;
use crate::error::ConfigError;

/// Heap size below which cancelled entries are left for lazy removal.
const PURGE_FLOOR: usize = 64;

type Action = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and we want the earliest deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ReaperShared {
    heap: Mutex<BinaryHeap<Entry>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
    cancelled: AtomicUsize,
}

/// Cancels a scheduled deadline.
#[derive(Debug, Clone)]
pub struct DeadlineHandle {
    cancelled: Arc<AtomicBool>,
    shared: Arc<ReaperShared>,
}

impl DeadlineHandle {
    /// Prevent the action from running. No effect once it has fired.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.shared.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ReaperShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaperShared")
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

/// Timer thread owned by one scheduler.
pub struct Reaper {
    shared: Arc<ReaperShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Reaper {
    /// Start the timer thread.
    pub fn start(name: &str) -> Result<Self, ConfigError> {
        let shared = Arc::new(ReaperShared {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            cancelled: AtomicUsize::new(0),
        });

        let thread_name = format!("{}-reaper", name);
        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || reaper_loop(&shared))
                .map_err(|source| ConfigError::Spawn {
                    name: thread_name,
                    source,
                })?
        };

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `action` on the reaper thread at or after `deadline`.
    pub fn schedule<F>(&self, deadline: Instant, action: F) -> DeadlineHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            deadline,
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            action: Box::new(action),
        };

        let mut heap = self.shared.heap.lock();
        self.purge_if_stale(&mut heap);
        let earliest = heap.peek().map_or(true, |top| deadline < top.deadline);
        heap.push(entry);
        drop(heap);
        if earliest {
            self.shared.wakeup.notify_one();
        }

        DeadlineHandle {
            cancelled,
            shared: self.shared.clone(),
        }
    }

    /// Number of entries still queued, cancelled ones included.
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().len()
    }

    /// Stop the thread. Queued deadlines are dropped unfired.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _heap = self.shared.heap.lock();
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.shared.heap.lock().clear();
    }

    fn purge_if_stale(&self, heap: &mut BinaryHeap<Entry>) {
        let cancelled = self.shared.cancelled.load(Ordering::Relaxed);
        if heap.len() < PURGE_FLOOR || cancelled * 2 < heap.len() {
            return;
        }
        heap.retain(|entry| !entry.cancelled.load(Ordering::Acquire));
        self.shared.cancelled.store(0, Ordering::Relaxed);
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("pending", &self.pending())
            .finish()
    }
}

fn reaper_loop(shared: &ReaperShared) {
    let mut heap = shared.heap.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let now = Instant::now();
        match heap.peek() {
            None => {
                shared.wakeup.wait(&mut heap);
            }
            Some(top) if top.deadline > now => {
                let deadline = top.deadline;
                shared.wakeup.wait_until(&mut heap, deadline);
            }
            Some(_) => {
                let Some(entry) = heap.pop() else {
                    continue;
                };
                if entry.cancelled.swap(true, Ordering::AcqRel) {
                    // Counted when it was cancelled; it's gone now.
                    let _ = shared.cancelled.fetch_update(
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                        |n| n.checked_sub(1),
                    );
                    continue;
                }
                // Run without the lock so actions may schedule more deadlines.
                drop(heap);
                if catch_unwind(AssertUnwindSafe(entry.action)).is_err() {
                    tracing::error!("deadline action panicked");
                }
                heap = shared.heap.lock();
            }
        }
    }
    tracing::trace!("reaper thread exiting");
}

/// Couple `cell` to a deadline `timeout` from now.
///
/// When the deadline passes first the cell resolves as timed out (raising
/// its interrupt token if `interrupt`); when the cell resolves first the
/// deadline is cancelled. `None` for an unrepresentable deadline means no
/// timeout.
pub(crate) fn arm<T>(reaper: &Reaper, cell: &CompletionCell<T>, timeout: Duration, interrupt: bool)
where
    T: Send + Sync + 'static,
{
    let Some(deadline) = Instant::now().checked_add(timeout) else {
        return;
    };
    let target = cell.downgrade();
    let handle = reaper.schedule(deadline, move || {
        if let Some(cell) = target.upgrade() {
            cell.time_out(timeout, interrupt);
        }
    });
    cell.on_finished(move |_| handle.cancel());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Promise;
    use std::sync::mpsc;

    #[test]
    fn fires_in_deadline_order() {
        let reaper = Reaper::start("test").unwrap();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        for (i, ms) in [30u64, 10, 20].into_iter().enumerate() {
            let tx = tx.clone();
            reaper.schedule(now + Duration::from_millis(ms), move || {
                tx.send(i).unwrap();
            });
        }
        let order: Vec<_> = (0..3).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn never_fires_early() {
        let reaper = Reaper::start("test").unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        reaper.schedule(start + Duration::from_millis(25), move || {
            tx.send(Instant::now()).unwrap();
        });
        let fired = rx.recv().unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(25));
    }

    #[test]
    fn cancelled_entries_do_not_fire() {
        let reaper = Reaper::start("test").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = reaper.schedule(Instant::now() + Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        });
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn purge_drops_cancelled_backlog() {
        let reaper = Reaper::start("test").unwrap();
        let far = Instant::now() + Duration::from_secs(3600);
        let handles: Vec<_> = (0..PURGE_FLOOR * 2)
            .map(|_| reaper.schedule(far, || {}))
            .collect();
        for h in &handles {
            h.cancel();
        }
        reaper.schedule(far, || {});
        assert_eq!(reaper.pending(), 1);
    }

    #[test]
    fn arm_times_out_pending_cell() {
        let reaper = Reaper::start("test").unwrap();
        let promise: Promise<i32> = Promise::new();
        let cell = promise.cell();
        arm(&reaper, &cell, Duration::from_millis(10), true);
        let res = cell.get();
        assert!(matches!(res, Err(crate::TaskError::TimedOut(_))));
        assert!(promise.token().is_cancelled());
    }

    #[test]
    fn arm_is_disarmed_by_resolution() {
        let reaper = Reaper::start("test").unwrap();
        let promise = Promise::new();
        let cell = promise.cell();
        arm(&reaper, &cell, Duration::from_millis(10), false);
        promise.complete(4);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cell.get().unwrap(), 4);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let reaper = Reaper::start("test").unwrap();
        reaper.schedule(Instant::now() + Duration::from_secs(60), || {});
        reaper.shutdown();
        reaper.shutdown();
        assert_eq!(reaper.pending(), 0);
    }
}
