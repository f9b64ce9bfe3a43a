// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Write-once completion cell and its producer handle.
//!
//! State word: PENDING → COMPLETING → DONE. The CAS out of PENDING elects
//! the single writer; the outcome is written while in COMPLETING and
//! published by the store of DONE. Every reader loads DONE with at least
//! Acquire ordering before touching the outcome, which gives the
//! happens-before edge from resolution to all later reads.
//!
//! Callbacks and blocked waiters are kept in persistent stacks swapped
//! atomically. Registration races resolution through a CAS loop: either the
//! callback lands in the open list (and the resolver fires it) or it sees
//! the list already closed (and fires itself).

use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use relay_collections::{AtomicStack, ImmutableStack};

use crate::cancel::CancelToken;
use crate::error::TaskError;

/// Result stored in a resolved cell.
pub type Outcome<T> = Result<T, TaskError>;

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const DONE: u8 = 2;

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

/// One registered callback. Taken exactly once, by whoever fires it.
struct CallbackSlot<T> {
    f: Mutex<Option<Callback<T>>>,
}

impl<T> CallbackSlot<T> {
    fn fire(&self, outcome: &Outcome<T>) {
        let Some(f) = self.f.lock().take() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| f(outcome))).is_err() {
            tracing::warn!("completion callback panicked; remaining callbacks still run");
        }
    }
}

enum Callbacks<T> {
    Open(ImmutableStack<Arc<CallbackSlot<T>>>),
    Fired,
}

struct Shared<T> {
    state: AtomicU8,
    outcome: UnsafeCell<Option<Outcome<T>>>,
    callbacks: ArcSwap<Callbacks<T>>,
    waiters: AtomicStack<Thread>,
    token: Arc<CancelToken>,
}

// SAFETY: `outcome` is written only by the thread that won the
// PENDING→COMPLETING CAS, before DONE is published, and read only after
// DONE is observed. All other fields are thread-safe.
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            outcome: UnsafeCell::new(None),
            callbacks: ArcSwap::from_pointee(Callbacks::Open(ImmutableStack::empty())),
            waiters: AtomicStack::new(),
            token: Arc::new(CancelToken::new()),
        }
    }

    fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    fn outcome(&self) -> Option<&Outcome<T>> {
        if !self.is_done() {
            return None;
        }
        // SAFETY: DONE observed with Acquire; the write happened-before it
        // and no further writes occur.
        unsafe { (*self.outcome.get()).as_ref() }
    }

    /// First caller wins. Returns whether this call resolved the cell.
    fn resolve(&self, outcome: Outcome<T>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, COMPLETING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // SAFETY: we own the COMPLETING state; nobody reads until DONE.
        unsafe { *self.outcome.get() = Some(outcome) };
        // SeqCst pairs with the waiter's SeqCst recheck in `wait`.
        self.state.store(DONE, Ordering::SeqCst);

        for waiter in self.waiters.take_all().iter() {
            waiter.unpark();
        }
        self.fire_callbacks();
        true
    }

    fn fire_callbacks(&self) {
        let prev = self.callbacks.swap(Arc::new(Callbacks::Fired));
        let Callbacks::Open(pending) = &*prev else {
            return;
        };
        let Some(outcome) = self.outcome() else {
            return;
        };
        // Stack order is newest first; fire in registration order.
        let pending: Vec<_> = pending.iter().collect();
        for slot in pending.into_iter().rev() {
            slot.fire(outcome);
        }
    }

    fn register(&self, f: Callback<T>) {
        let slot = Arc::new(CallbackSlot {
            f: Mutex::new(Some(f)),
        });
        let prev = self.callbacks.rcu(|current| match &**current {
            Callbacks::Open(list) => Arc::new(Callbacks::Open(list.push(slot.clone()))),
            Callbacks::Fired => Arc::clone(current),
        });
        if let Callbacks::Fired = &*prev {
            // Closed before we got in: the outcome is already published.
            if let Some(outcome) = self.outcome() {
                slot.fire(outcome);
            }
        }
    }

    /// Block until DONE or `deadline`. Returns whether the cell is done.
    fn wait(&self, deadline: Option<Instant>) -> bool {
        if self.is_done() {
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        self.waiters.push(thread::current());
        loop {
            // Recheck after registering: a resolver that stored DONE before
            // our push may already have drained the waiter list.
            if self.state.load(Ordering::SeqCst) == DONE {
                return true;
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.forget_waiter();
                        return self.state.load(Ordering::SeqCst) == DONE;
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    /// Drop the calling thread's entry after a bounded wait gave up.
    fn forget_waiter(&self) {
        let me = thread::current().id();
        self.waiters.update(|list| list.retain(|t| t.id() != me));
    }
}

/// Read side of an eventually available value.
///
/// Cheap to clone; every clone observes the same single outcome.
pub struct CompletionCell<T> {
    shared: Arc<Shared<T>>,
}

/// Write side of a `CompletionCell`.
///
/// Dropping a promise that never resolved fails its cell with
/// `TaskError::Cancelled`, so an abandoned task never leaves waiters hanging.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn cell(&self) -> CompletionCell<T> {
        CompletionCell {
            shared: self.shared.clone(),
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.shared.resolve(Ok(value))
    }

    pub fn fail(&self, err: TaskError) -> bool {
        self.shared.resolve(Err(err))
    }

    pub fn resolve(&self, outcome: Outcome<T>) -> bool {
        self.shared.resolve(outcome)
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Token raised when the cell is cancelled or timed out with interruption.
    pub fn token(&self) -> &Arc<CancelToken> {
        &self.shared.token
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.shared.state.load(Ordering::Acquire) == PENDING {
            self.shared.resolve(Err(TaskError::Cancelled));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.shared.is_done())
            .finish()
    }
}

impl<T: Send + Sync + 'static> CompletionCell<T> {
    /// A cell already holding `value`.
    pub fn completed(value: T) -> Self {
        let promise = Promise::new();
        promise.complete(value);
        promise.cell()
    }

    /// A cell already failed with `err`.
    pub fn failed(err: TaskError) -> Self {
        let promise = Promise::new();
        promise.fail(err);
        promise.cell()
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.outcome(), Some(Err(TaskError::Cancelled)))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self.shared.outcome(), Some(Err(TaskError::TimedOut(_))))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.shared.outcome(), Some(Err(_)))
    }

    /// Resolve as cancelled unless already resolved.
    ///
    /// With `interrupt`, also raise the task's token so a running task that
    /// polls `interrupted()` can stop early. A queued task is skipped when a
    /// worker reaches it.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let won = self.shared.resolve(Err(TaskError::Cancelled));
        if won && interrupt {
            self.shared.token.cancel();
        }
        won
    }

    /// Reaper path: resolve as timed out.
    pub(crate) fn time_out(&self, budget: Duration, interrupt: bool) -> bool {
        let won = self.shared.resolve(Err(TaskError::TimedOut(budget)));
        if won && interrupt {
            self.shared.token.cancel();
        }
        won
    }

    /// Resolve from the scheduler side (rejections, abandoned work).
    pub(crate) fn resolve(&self, outcome: Outcome<T>) -> bool {
        self.shared.resolve(outcome)
    }

    /// Borrow the outcome if resolved.
    pub fn with_outcome<R>(&self, f: impl FnOnce(&Outcome<T>) -> R) -> Option<R> {
        self.shared.outcome().map(f)
    }

    /// Block until resolved, then borrow the outcome.
    pub fn wait_with<R>(&self, f: impl FnOnce(&Outcome<T>) -> R) -> R {
        self.shared.wait(None);
        match self.shared.outcome() {
            Some(outcome) => f(outcome),
            // `wait(None)` only returns once DONE is visible.
            None => unreachable!("cell woke without an outcome"),
        }
    }

    pub fn on_finished<F>(&self, f: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.shared.register(Box::new(f));
    }

    pub fn on_success<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.on_finished(move |outcome| {
            if let Ok(value) = outcome {
                f(value);
            }
        });
    }

    pub fn on_failure<F>(&self, f: F)
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.on_finished(move |outcome| {
            if let Err(err) = outcome {
                f(err);
            }
        });
    }

    pub(crate) fn downgrade(&self) -> WeakCell<T> {
        WeakCell {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> CompletionCell<T> {
    /// Non-blocking snapshot of the outcome.
    pub fn try_get(&self) -> Option<Outcome<T>> {
        self.shared.outcome().cloned()
    }

    /// Block until resolved.
    pub fn get(&self) -> Outcome<T> {
        self.wait_with(|outcome| outcome.clone())
    }

    /// Block for at most `timeout`. Elapsing yields `TaskError::WaitTimeout`
    /// and leaves the cell pending.
    pub fn get_timeout(&self, timeout: Duration) -> Outcome<T> {
        let deadline = Instant::now().checked_add(timeout);
        if !self.shared.wait(deadline) {
            return Err(TaskError::WaitTimeout);
        }
        self.shared
            .outcome()
            .cloned()
            .unwrap_or(Err(TaskError::WaitTimeout))
    }
}

impl<T> Clone for CompletionCell<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CompletionCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.outcome() {
            Some(outcome) => f.debug_tuple("CompletionCell").field(outcome).finish(),
            None => f.write_str("CompletionCell(<pending>)"),
        }
    }
}

/// Non-owning cell reference held by the reaper.
pub(crate) struct WeakCell<T> {
    shared: Weak<Shared<T>>,
}

impl<T> WeakCell<T> {
    pub(crate) fn upgrade(&self) -> Option<CompletionCell<T>> {
        self.shared.upgrade().map(|shared| CompletionCell { shared })
    }
}
