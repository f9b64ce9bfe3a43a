// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Work-stealing pool: placement, worker loop and drain-then-terminate
//! shutdown.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::deque::{Steal, Stealer, Worker};
use super::idle::{IdleRegistry, IdleSlot};
use crate::config::{StealingPoolBuilder, StealingPoolOptions};
use crate::error::{ConfigError, RejectReason};
use crate::reaper::Reaper;
use crate::scheduler::{Task, TaskScheduler};

const RUNNING: u8 = 0;
/// No new submissions; queued work still runs.
const DRAINING: u8 = 1;
/// No new submissions; queued work is dropped unexecuted.
const STOPPING: u8 = 2;
const TERMINATED: u8 = 3;

/// Timed parks before a worker registers as idle.
const SPIN_ROUNDS: u32 = 2;

enum Job {
    Run(Task),
    /// One per worker, seeded by shutdown.
    Shutdown,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub executed: u64,
    pub stolen: u64,
    pub handoffs: u64,
    pub global_pushes: u64,
    pub local_pushes: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    stolen: AtomicU64,
    handoffs: AtomicU64,
    global_pushes: AtomicU64,
    local_pushes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct PoolShared {
    options: StealingPoolOptions,
    state: AtomicU8,
    global: SegQueue<Job>,
    stealers: Vec<Stealer<Task>>,
    idle: IdleRegistry,
    reaper: Reaper,
    /// Workers that have not exited yet.
    live: AtomicUsize,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
    counters: Counters,
}

/// Identity of a pool for the worker context.
fn pool_id(shared: &Arc<PoolShared>) -> usize {
    Arc::as_ptr(shared) as usize
}

impl PoolShared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn push_global(&self, task: Task) {
        self.global.push(Job::Run(task));
        bump(&self.counters.global_pushes);
        // Pairs with the fence in `park_idle`: either we see the worker's
        // registration or it sees our push.
        fence(Ordering::SeqCst);
        self.idle.wake_one();
    }

    /// Enqueue an off-worker submission. One that passed the state check
    /// just as the last worker left would sit in the queue forever, so it
    /// is abandoned here instead.
    fn push_submitted(&self, task: Task) {
        self.push_global(task);
        // Pairs with the fence in `finish`: either the last worker's drain
        // sees our push or we see it gone.
        if self.live.load(Ordering::SeqCst) == 0 {
            let abandoned = self.abandon_global();
            if abandoned > 0 {
                tracing::debug!(abandoned, "dropped task submitted during termination");
            }
        }
    }

    /// Pop every queued job, abandoning tasks. Returns how many were tasks.
    fn abandon_global(&self) -> usize {
        let mut abandoned = 0usize;
        while let Some(job) = self.global.pop() {
            if let Job::Run(task) = job {
                task.abandon();
                abandoned += 1;
            }
        }
        abandoned
    }

    fn has_visible_work(&self, local: &Worker<Task>) -> bool {
        !local.is_empty()
            || !self.global.is_empty()
            || self.stealers.iter().any(|s| !s.is_empty())
    }

    fn execute(&self, task: Task) {
        if self.state() == STOPPING {
            task.abandon();
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            tracing::error!("task panicked outside its completion cell");
        }
        bump(&self.counters.executed);
    }
}

struct WorkerContext {
    pool: usize,
    local: Rc<Worker<Task>>,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Installs the worker context for the life of the worker loop.
struct ContextGuard;

impl ContextGuard {
    fn install(pool: usize, local: Rc<Worker<Task>>) -> Self {
        CURRENT.with(|c| *c.borrow_mut() = Some(WorkerContext { pool, local }));
        ContextGuard
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.borrow_mut().take());
    }
}

/// Work-stealing `TaskScheduler`.
///
/// A task submitted from one of this pool's own workers lands on that
/// worker's local deque; anything else is handed straight to a parked
/// worker when one is registered, or queued on the shared queue.
pub struct WorkStealingPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkStealingPool {
    /// Pool with `workers` threads (0 = one per core) and default options.
    pub fn new(workers: usize) -> Result<Self, ConfigError> {
        Self::with_options(StealingPoolOptions {
            workers,
            ..Default::default()
        })
    }

    pub fn builder() -> StealingPoolBuilder {
        StealingPoolBuilder::default()
    }

    pub fn with_options(options: StealingPoolOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let count = options.worker_count();

        let locals: Vec<Worker<Task>> = (0..count)
            .map(|_| Worker::new(options.initial_queue_capacity, options.max_local_capacity))
            .collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        let reaper = Reaper::start(&options.thread_name)?;

        let shared = Arc::new(PoolShared {
            options,
            state: AtomicU8::new(RUNNING),
            global: SegQueue::new(),
            stealers,
            idle: IdleRegistry::new(),
            reaper,
            live: AtomicUsize::new(count),
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
            counters: Counters::default(),
        });

        let pool = Self {
            shared: shared.clone(),
            handles: Mutex::new(Vec::with_capacity(count)),
        };

        for (index, local) in locals.into_iter().enumerate() {
            let name = format!("{}-{}", shared.options.thread_name, index);
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(index, local, worker_shared));
            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(source) => {
                    // Workers never started can't take a sentinel.
                    shared.live.fetch_sub(count - index, Ordering::AcqRel);
                    pool.shutdown();
                    return Err(ConfigError::Spawn { name, source });
                }
            }
        }

        tracing::debug!(
            workers = count,
            name = %shared.options.thread_name,
            "work-stealing pool started"
        );
        Ok(pool)
    }

    /// Stop accepting work. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        if self
            .shared
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.seed_sentinels();
            tracing::debug!("work-stealing pool draining");
        }
    }

    /// Stop accepting work and drop queued tasks unexecuted; their cells
    /// fail as cancelled. Tasks already running finish.
    pub fn shutdown_now(&self) {
        let prev = self.shared.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (s == RUNNING || s == DRAINING).then_some(STOPPING)
        });
        if prev == Ok(RUNNING) {
            self.seed_sentinels();
        }
        if prev.is_ok() {
            tracing::debug!("work-stealing pool stopping");
        }
    }

    fn seed_sentinels(&self) {
        let live = self.shared.live.load(Ordering::Acquire);
        for _ in 0..live {
            self.shared.global.push(Job::Shutdown);
        }
        self.shared.idle.wake_all();
        if live == 0 {
            finish(&self.shared);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state() != RUNNING
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.state() == TERMINATED
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
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    pub fn workers(&self) -> usize {
        self.shared.stealers.len()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            workers: self.shared.live.load(Ordering::Acquire),
            executed: c.executed.load(Ordering::Relaxed),
            stolen: c.stolen.load(Ordering::Relaxed),
            handoffs: c.handoffs.load(Ordering::Relaxed),
            global_pushes: c.global_pushes.load(Ordering::Relaxed),
            local_pushes: c.local_pushes.load(Ordering::Relaxed),
        }
    }

    /// Place on the calling worker's own deque if it belongs to this pool.
    fn push_local(&self, task: Task) -> Result<(), Task> {
        let pool = pool_id(&self.shared);
        CURRENT.with(|c| {
            let ctx = c.borrow();
            let Some(ctx) = ctx.as_ref().filter(|ctx| ctx.pool == pool) else {
                return Err(task);
            };
            match ctx.local.push(task) {
                Ok(()) => {
                    bump(&self.shared.counters.local_pushes);
                    // Same pairing as `push_global`.
                    fence(Ordering::SeqCst);
                    if !self.shared.idle.is_empty() {
                        self.shared.idle.wake_one();
                    }
                }
                Err(task) => self.shared.push_global(task),
            }
            Ok(())
        })
    }
}

impl TaskScheduler for WorkStealingPool {
    fn dispatch(&self, task: Task) -> Result<(), (Task, RejectReason)> {
        if self.shared.state() != RUNNING {
            return Err((task, RejectReason::Shutdown));
        }
        let task = match self.push_local(task) {
            Ok(()) => return Ok(()),
            Err(task) => task,
        };
        match self.shared.idle.offer(task) {
            Ok(worker) => {
                bump(&self.shared.counters.handoffs);
                tracing::trace!(worker, "handed task to idle worker");
            }
            Err(task) => self.shared.push_submitted(task),
        }
        Ok(())
    }

    fn reaper(&self) -> &Reaper {
        &self.shared.reaper
    }

    fn interrupt_on_timeout(&self) -> bool {
        self.shared.options.interrupt_on_timeout
    }
}

impl Drop for WorkStealingPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join_workers();
    }
}

impl std::fmt::Debug for WorkStealingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingPool")
            .field("state", &self.shared.state())
            .field("idle", &self.shared.idle.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Simple xorshift64 for random victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn steal_from_peers(index: usize, shared: &PoolShared, rng: &mut u64) -> Option<Task> {
    let n = shared.stealers.len();
    if n <= 1 {
        return None;
    }
    let start = (xorshift64(rng) as usize) % n;
    for offset in 0..n {
        let victim = (start + offset) % n;
        if victim == index {
            continue;
        }
        let backoff = Backoff::new();
        loop {
            match shared.stealers[victim].steal() {
                Steal::Success(task) => {
                    bump(&shared.counters.stolen);
                    return Some(task);
                }
                Steal::Empty => break,
                Steal::Retry => backoff.spin(),
            }
        }
    }
    None
}

/// What a scan of the non-local sources found.
enum Found {
    Task(Task),
    Shutdown,
    Nothing,
}

fn scan(index: usize, shared: &PoolShared, rng: &mut u64) -> Found {
    match shared.global.pop() {
        Some(Job::Run(task)) => return Found::Task(task),
        Some(Job::Shutdown) => return Found::Shutdown,
        None => {}
    }
    match steal_from_peers(index, shared, rng) {
        Some(task) => Found::Task(task),
        None => Found::Nothing,
    }
}

/// Register as idle and park until handed a task, woken, or `idle_recheck`
/// elapses. Returns a handed task if there was one.
fn park_idle(slot: &Arc<IdleSlot>, local: &Worker<Task>, shared: &PoolShared) -> Option<Task> {
    slot.open();
    shared.idle.register(slot);
    fence(Ordering::SeqCst);
    if shared.has_visible_work(local) || shared.state() != RUNNING {
        return slot.close();
    }
    thread::park_timeout(shared.options.idle_recheck);
    slot.close()
}

fn worker_loop(index: usize, local: Worker<Task>, shared: Arc<PoolShared>) {
    tracing::trace!(worker = index, "worker started");
    let local = Rc::new(local);
    let _ctx = ContextGuard::install(pool_id(&shared), local.clone());
    let slot = Arc::new(IdleSlot::new(index, thread::current()));
    let mut rng = (index as u64).wrapping_add(0x9E3779B97F4A7C15); // Golden ratio hash
    let mut misses = 0u32;

    loop {
        // 1. Own deque, newest first.
        if let Some(task) = local.pop() {
            misses = 0;
            shared.execute(task);
            continue;
        }

        // 2. Shared queue, then peers.
        match scan(index, &shared, &mut rng) {
            Found::Task(task) => {
                misses = 0;
                shared.execute(task);
                continue;
            }
            Found::Shutdown => break,
            Found::Nothing => {}
        }

        // 3. Short timed park to absorb in-flight submissions.
        if misses < SPIN_ROUNDS {
            misses += 1;
            thread::park_timeout(shared.options.spin_park);
            continue;
        }

        // 4. Park as idle.
        if let Some(task) = park_idle(&slot, &local, &shared) {
            misses = 0;
            shared.execute(task);
        }
    }

    // Took a sentinel: finish our own work, then let peers see theirs.
    while let Some(task) = local.pop() {
        shared.execute(task);
    }
    if let Some(task) = slot.close() {
        shared.execute(task);
    }
    shared.idle.wake_all();
    tracing::trace!(worker = index, "worker exiting");

    if shared.live.fetch_sub(1, Ordering::SeqCst) == 1 {
        finish(&shared);
    }
}

/// Last worker out: abandon anything submitted behind the sentinels and
/// publish termination.
fn finish(shared: &PoolShared) {
    fence(Ordering::SeqCst);
    let abandoned = shared.abandon_global();
    if abandoned > 0 {
        tracing::debug!(abandoned, "dropped tasks queued after shutdown");
    }
    shared.state.store(TERMINATED, Ordering::Release);
    let mut done = shared.terminated.lock();
    *done = true;
    shared.terminated_cv.notify_all();
    drop(done);
    tracing::debug!("work-stealing pool terminated");
}
