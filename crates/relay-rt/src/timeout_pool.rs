// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded-growth thread pool with per-task timeouts.
//!
//! Growth policy: below `core_size` every submission starts a worker with
//! the task as its first job. At core size the task goes through the
//! hand-off queue; if the queue refuses it (a synchronous queue with no
//! waiting worker, or a full bounded one) a worker is added up to
//! `max_size`, and past that the submission is rejected. Workers above
//! core size exit after `idle_reap_delay` without work.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use crate::config::{TimeoutPoolBuilder, TimeoutPoolOptions, WorkQueue};
use crate::error::{ConfigError, RejectReason};
use crate::reaper::Reaper;
use crate::scheduler::{Task, TaskScheduler};

const RUNNING: u8 = 0;
/// Not accepting; workers drain the queue.
const SHUTDOWN: u8 = 1;
/// Not accepting; queued tasks are dropped.
const STOP: u8 = 2;

struct PoolShared {
    options: TimeoutPoolOptions,
    state: AtomicU8,
    /// Cleared on shutdown so workers see the queue disconnect once empty.
    sender: ArcSwapOption<Sender<Task>>,
    receiver: Receiver<Task>,
    workers: AtomicUsize,
    next_id: AtomicUsize,
    completed: AtomicU64,
    reaper: Reaper,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
}

impl PoolShared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    fn run(&self, task: Task) {
        if self.state() == STOP {
            task.abandon();
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            tracing::error!("task panicked outside its completion cell");
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one worker slot if that leaves the count above core size.
    fn try_retire(&self) -> bool {
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > self.options.core_size).then(|| n - 1)
            })
            .is_ok()
    }

    fn finish(&self) {
        let mut abandoned = 0usize;
        while let Ok(task) = self.receiver.try_recv() {
            task.abandon();
            abandoned += 1;
        }
        if abandoned > 0 {
            tracing::debug!(abandoned, "dropped tasks left without workers");
        }
        let mut done = self.terminated.lock();
        if !*done {
            *done = true;
            self.terminated_cv.notify_all();
            tracing::debug!(name = %self.options.thread_name, "timeout pool terminated");
        }
    }
}

/// Decrements the worker count on exit unless the worker already retired
/// its own slot.
struct ExitGuard<'a> {
    shared: &'a PoolShared,
    counted: bool,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let remaining = if self.counted {
            self.shared.workers.fetch_sub(1, Ordering::SeqCst) - 1
        } else {
            self.shared.workers.load(Ordering::SeqCst)
        };
        if remaining == 0 && self.shared.state() != RUNNING {
            self.shared.finish();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, first: Arc<Mutex<Option<Task>>>) {
    let mut guard = ExitGuard {
        shared: &shared,
        counted: true,
    };
    tracing::trace!("pool worker started");

    if let Some(task) = first.lock().take() {
        shared.run(task);
    }

    loop {
        let above_core = shared.workers.load(Ordering::SeqCst) > shared.options.core_size;
        let task = if above_core {
            match shared.receiver.recv_timeout(shared.options.idle_reap_delay) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => {
                    if shared.try_retire() {
                        guard.counted = false;
                        tracing::trace!("idle pool worker reaped");
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match shared.receiver.recv() {
                Ok(task) => task,
                Err(_) => break,
            }
        };
        shared.run(task);
    }
    tracing::trace!("pool worker exiting");
}

/// Thread pool that enforces a timeout on every submission.
pub struct TimeoutEnforcingPool {
    shared: Arc<PoolShared>,
}

impl TimeoutEnforcingPool {
    /// Pool with default options and the given sizes.
    pub fn new(core_size: usize, max_size: usize) -> Result<Self, ConfigError> {
        Self::with_options(TimeoutPoolOptions {
            core_size,
            max_size,
            ..Default::default()
        })
    }

    pub fn builder() -> TimeoutPoolBuilder {
        TimeoutPoolBuilder::default()
    }

    pub fn with_options(options: TimeoutPoolOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let (sender, receiver) = match options.work_queue {
            WorkQueue::Synchronous => crossbeam_channel::bounded(0),
            WorkQueue::Bounded(n) => crossbeam_channel::bounded(n),
            WorkQueue::Unbounded => crossbeam_channel::unbounded(),
        };
        let reaper = Reaper::start(&options.thread_name)?;
        tracing::debug!(
            core = options.core_size,
            max = options.max_size,
            queue = ?options.work_queue,
            "timeout pool started"
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                options,
                state: AtomicU8::new(RUNNING),
                sender: ArcSwapOption::from_pointee(sender),
                receiver,
                workers: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                reaper,
                handles: Mutex::new(Vec::new()),
                terminated: Mutex::new(false),
                terminated_cv: Condvar::new(),
            }),
        })
    }

    /// Start a worker if fewer than `limit` exist. Hands `first` back if
    /// not.
    fn add_worker(&self, first: Option<Task>, limit: usize) -> Result<(), Option<Task>> {
        let shared = &self.shared;
        if shared
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            return Err(first);
        }

        let slot = Arc::new(Mutex::new(first));
        let name = format!(
            "{}-{}",
            shared.options.thread_name,
            shared.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let spawned = {
            let shared = shared.clone();
            let slot = slot.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(shared, slot))
        };
        match spawned {
            Ok(handle) => {
                let mut handles = shared.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(err) => {
                shared.workers.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(thread = %name, error = %err, "failed to spawn pool worker");
                Err(slot.lock().take())
            }
        }
    }

    /// Stop accepting work. Queued tasks still run.
    pub fn shutdown(&self) {
        if self
            .shared
            .state
            .compare_exchange(RUNNING, SHUTDOWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::debug!(name = %self.shared.options.thread_name, "timeout pool shutting down");
            self.close_queue();
        }
    }

    /// Stop accepting work and drop queued tasks; their cells fail as
    /// cancelled. Running tasks finish.
    pub fn shutdown_now(&self) {
        let prev = self.shared.state.swap(STOP, Ordering::SeqCst);
        if prev == STOP {
            return;
        }
        tracing::debug!(name = %self.shared.options.thread_name, "timeout pool stopping");
        while let Ok(task) = self.shared.receiver.try_recv() {
            task.abandon();
        }
        self.close_queue();
    }

    fn close_queue(&self) {
        self.shared.sender.store(None);
        if self.shared.workers.load(Ordering::SeqCst) == 0 {
            self.shared.finish();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state() != RUNNING
    }

    pub fn is_terminated(&self) -> bool {
        *self.shared.terminated.lock()
    }

    /// Wait up to `timeout` for every worker to exit. True once they have.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        {
            let mut done = self.shared.terminated.lock();
            while !*done {
                match deadline {
                    Some(deadline) => {
                        if self
                            .shared
                            .terminated_cv
                            .wait_until(&mut done, deadline)
                            .timed_out()
                            && !*done
                        {
                            return false;
                        }
                    }
                    None => self.shared.terminated_cv.wait(&mut done),
                }
            }
        }
        self.join_workers();
        true
    }

    fn join_workers(&self) {
        let current = thread::current().id();
        let handles: Vec<_> = self.shared.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    pub fn active_workers(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the hand-off queue.
    pub fn queued(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Tasks run to completion (including ones that failed or panicked).
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn options(&self) -> &TimeoutPoolOptions {
        &self.shared.options
    }
}

impl TaskScheduler for TimeoutEnforcingPool {
    fn dispatch(&self, task: Task) -> Result<(), (Task, RejectReason)> {
        if self.shared.state() != RUNNING {
            return Err((task, RejectReason::Shutdown));
        }
        let Some(sender) = self.shared.sender.load_full() else {
            return Err((task, RejectReason::Shutdown));
        };
        let opts = &self.shared.options;

        let task = if self.shared.workers.load(Ordering::SeqCst) < opts.core_size {
            match self.add_worker(Some(task), opts.core_size) {
                Ok(()) => return Ok(()),
                Err(Some(task)) => task,
                Err(None) => return Ok(()),
            }
        } else {
            task
        };

        match sender.try_send(task) {
            Ok(()) => {
                if self.shared.workers.load(Ordering::SeqCst) == 0 {
                    // Queued with nobody to take it.
                    let _ = self.add_worker(None, opts.max_size);
                }
                Ok(())
            }
            Err(TrySendError::Full(task)) => match self.add_worker(Some(task), opts.max_size) {
                Ok(()) => Ok(()),
                Err(Some(task)) => Err((task, RejectReason::Capacity)),
                Err(None) => Ok(()),
            },
            Err(TrySendError::Disconnected(task)) => Err((task, RejectReason::Shutdown)),
        }
    }

    fn reaper(&self) -> &Reaper {
        &self.shared.reaper
    }

    fn interrupt_on_timeout(&self) -> bool {
        self.shared.options.interrupt_on_timeout
    }
}

impl Drop for TimeoutEnforcingPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join_workers();
    }
}

impl std::fmt::Debug for TimeoutEnforcingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutEnforcingPool")
            .field("workers", &self.active_workers())
            .field("queued", &self.queued())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::interrupted;
    use crate::error::TaskError;
    use std::sync::atomic::AtomicBool;

    const LONG: Duration = Duration::from_secs(10);

    struct Gate(Arc<AtomicBool>);

    impl Gate {
        fn new() -> Self {
            Gate(Arc::new(AtomicBool::new(false)))
        }

        fn waiter(&self) -> impl FnOnce() + Send + 'static {
            let open = self.0.clone();
            move || {
                while !open.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        fn open(&self) {
            self.0.store(true, Ordering::Release);
        }
    }

    #[test]
    fn runs_tasks_within_core() {
        let pool = TimeoutEnforcingPool::new(2, 4).unwrap();
        let cells = pool.submit_all((0..50).map(|i| move || i + 1), LONG);
        let total: i32 = cells.iter().map(|c| c.get().unwrap()).sum();
        assert_eq!(total, (1..=50).sum::<i32>());
        assert!(pool.active_workers() <= 2);
    }

    #[test]
    fn synchronous_queue_rejects_beyond_max() {
        let pool = TimeoutEnforcingPool::builder()
            .core_size(1)
            .max_size(2)
            .work_queue(WorkQueue::Synchronous)
            .build()
            .unwrap();
        let gate = Gate::new();
        let a = pool.submit(gate.waiter(), LONG);
        let b = pool.submit(gate.waiter(), LONG);
        let c = pool.submit(|| (), LONG);
        assert!(matches!(
            c.get(),
            Err(TaskError::Rejected(RejectReason::Capacity))
        ));
        assert_eq!(pool.active_workers(), 2);
        gate.open();
        a.get().unwrap();
        b.get().unwrap();
    }

    #[test]
    fn bounded_queue_absorbs_then_rejects() {
        let pool = TimeoutEnforcingPool::builder()
            .core_size(1)
            .max_size(1)
            .work_queue(WorkQueue::Bounded(2))
            .build()
            .unwrap();
        let gate = Gate::new();
        let running = pool.submit(gate.waiter(), LONG);
        let q1 = pool.submit(|| 1, LONG);
        let q2 = pool.submit(|| 2, LONG);
        let rejected = pool.submit(|| 3, LONG);
        assert!(rejected.get().unwrap_err().is_rejected());
        assert_eq!(pool.queued(), 2);
        gate.open();
        running.get().unwrap();
        assert_eq!(q1.get().unwrap() + q2.get().unwrap(), 3);
    }

    #[test]
    fn workers_above_core_are_reaped() {
        let pool = TimeoutEnforcingPool::builder()
            .core_size(1)
            .max_size(3)
            .idle_reap_delay(Duration::from_millis(20))
            .work_queue(WorkQueue::Synchronous)
            .build()
            .unwrap();
        let gate = Gate::new();
        let cells: Vec<_> = (0..3).map(|_| pool.submit(gate.waiter(), LONG)).collect();
        assert_eq!(pool.active_workers(), 3);
        gate.open();
        for c in &cells {
            c.get().unwrap();
        }
        let deadline = Instant::now() + LONG;
        while pool.active_workers() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.active_workers(), 1);
    }

    #[test]
    fn timeout_interrupts_cooperative_task() {
        let pool = TimeoutEnforcingPool::builder()
            .core_size(1)
            .max_size(1)
            .interrupt_on_timeout(true)
            .build()
            .unwrap();
        let saw_interrupt = Arc::new(AtomicBool::new(false));
        let flag = saw_interrupt.clone();
        let start = Instant::now();
        let cell = pool.submit(
            move || {
                while !interrupted() {
                    thread::sleep(Duration::from_millis(1));
                }
                flag.store(true, Ordering::SeqCst);
            },
            Duration::from_millis(30),
        );
        assert!(matches!(cell.get(), Err(TaskError::TimedOut(_))));
        assert!(start.elapsed() >= Duration::from_millis(30));
        pool.shutdown();
        assert!(pool.await_termination(LONG));
        assert!(saw_interrupt.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_drains_queue() {
        let pool = TimeoutEnforcingPool::new(2, 2).unwrap();
        let cells: Vec<_> = (0..20)
            .map(|i| {
                pool.submit(
                    move || {
                        thread::sleep(Duration::from_millis(1));
                        i
                    },
                    LONG,
                )
            })
            .collect();
        pool.shutdown();
        assert!(pool.submit(|| 0, LONG).get().unwrap_err().is_rejected());
        assert!(pool.await_termination(LONG));
        for (i, c) in cells.iter().enumerate() {
            assert_eq!(c.get().unwrap(), i);
        }
        assert_eq!(pool.active_workers(), 0);
        assert_eq!(pool.completed(), 20);
    }

    #[test]
    fn shutdown_now_cancels_queued() {
        let pool = TimeoutEnforcingPool::new(1, 1).unwrap();
        let gate = Gate::new();
        let running = pool.submit(gate.waiter(), LONG);
        let queued: Vec<_> = (0..5).map(|i| pool.submit(move || i, LONG)).collect();
        pool.shutdown_now();
        gate.open();
        assert!(pool.await_termination(LONG));
        running.get().unwrap();
        for c in &queued {
            assert!(c.is_cancelled());
        }
    }

    #[test]
    fn shutdown_with_no_workers_terminates_immediately() {
        let pool = TimeoutEnforcingPool::new(0, 1).unwrap();
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_millis(10)));
    }

    #[test]
    fn default_values_replace_failures() {
        let pool = TimeoutEnforcingPool::new(4, 4).unwrap();
        let works: Vec<Box<dyn FnOnce() -> i32 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| panic!("bad item")),
            Box::new(|| {
                thread::sleep(Duration::from_millis(200));
                3
            }),
        ];
        let cells = pool.submit_all_with_default_value(works, Duration::from_millis(50), -1);
        let values: Vec<_> = cells.iter().map(|c| c.get().unwrap()).collect();
        assert_eq!(values, vec![1, -1, -1]);
    }
}
