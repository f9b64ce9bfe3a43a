// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cells derived from other cells.
//!
//! Every combinator wires a fresh promise to its sources through
//! `on_finished`, so nothing blocks except `fold`/`collect`, which own their
//! blocking by design. Failures pass through opaquely; only the
//! default-value adapter swallows them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cell::{CompletionCell, Outcome, Promise};
use crate::error::TaskError;
use crate::scheduler::TaskScheduler;

impl<T: Send + Sync + 'static> CompletionCell<T> {
    /// Transform the value on the resolving thread.
    ///
    /// `f` runs inline in the source's completion path, so it should be
    /// cheap. A panic in `f` fails the new cell.
    pub fn map_sync<U, F>(&self, f: F) -> CompletionCell<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let promise = Promise::new();
        let cell = promise.cell();
        self.on_finished(move |outcome| {
            let mapped = match outcome {
                Ok(value) => catch_unwind(AssertUnwindSafe(|| f(value)))
                    .map_err(TaskError::from_panic),
                Err(err) => Err(err.clone()),
            };
            promise.resolve(mapped);
        });
        cell
    }
}

impl<T: Clone + Send + Sync + 'static> CompletionCell<T> {
    /// Run `f` as a fresh task on `scheduler` once this cell succeeds.
    ///
    /// The new task gets its own `timeout`, counted from re-submission. A
    /// failed source fails the new cell without submitting anything.
    pub fn map_async<U, F, S>(&self, f: F, scheduler: &Arc<S>, timeout: Duration) -> CompletionCell<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
        S: TaskScheduler + 'static,
    {
        let promise = Promise::new();
        let cell = promise.cell();
        let scheduler = Arc::clone(scheduler);
        self.on_finished(move |outcome| match outcome {
            Ok(value) => {
                let value = value.clone();
                scheduler.submit_to(promise, move || Ok(f(value)), timeout);
            }
            Err(err) => {
                promise.fail(err.clone());
            }
        });
        cell
    }

    /// Cell that always succeeds: the source value, or `default` on any
    /// failure (including timeout and cancellation).
    pub fn with_default_value(&self, default: T) -> CompletionCell<T> {
        let promise = Promise::new();
        let cell = promise.cell();
        self.on_finished(move |outcome| {
            let value = match outcome {
                Ok(value) => value.clone(),
                Err(_) => default,
            };
            promise.complete(value);
        });
        cell
    }
}

/// Both values once both succeed; the first failure otherwise.
pub fn zip<A, B>(a: &CompletionCell<A>, b: &CompletionCell<B>) -> CompletionCell<(A, B)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    let promise = Arc::new(Promise::new());
    let cell = promise.cell();
    let slots: Arc<Mutex<(Option<A>, Option<B>)>> = Arc::new(Mutex::new((None, None)));

    {
        let promise = promise.clone();
        let slots = slots.clone();
        a.on_finished(move |outcome| match outcome {
            Ok(value) => {
                slots.lock().0 = Some(value.clone());
                complete_pair(&promise, &slots);
            }
            Err(err) => {
                promise.fail(err.clone());
            }
        });
    }

    b.on_finished(move |outcome| match outcome {
        Ok(value) => {
            slots.lock().1 = Some(value.clone());
            complete_pair(&promise, &slots);
        }
        Err(err) => {
            promise.fail(err.clone());
        }
    });

    cell
}

/// Complete once both halves are present. Whichever side lands second
/// finds the pair full and takes it.
fn complete_pair<A, B>(promise: &Promise<(A, B)>, slots: &Mutex<(Option<A>, Option<B>)>)
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    let pair = {
        let mut guard = slots.lock();
        if guard.0.is_none() || guard.1.is_none() {
            return;
        }
        (guard.0.take(), guard.1.take())
    };
    if let (Some(a), Some(b)) = pair {
        promise.complete((a, b));
    }
}

/// Three-way `zip`.
pub fn zip3<A, B, C>(
    a: &CompletionCell<A>,
    b: &CompletionCell<B>,
    c: &CompletionCell<C>,
) -> CompletionCell<(A, B, C)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    zip(&zip(a, b), c).map_sync(|((a, b), c)| (a.clone(), b.clone(), c.clone()))
}

struct LiftState<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

/// All values, in input order, once every source succeeds. Fails fast on
/// the first failure. An empty input succeeds with an empty vector.
pub fn lift<T>(cells: &[CompletionCell<T>]) -> CompletionCell<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    if cells.is_empty() {
        return CompletionCell::completed(Vec::new());
    }

    let promise = Arc::new(Promise::new());
    let out = promise.cell();
    let state = Arc::new(Mutex::new(LiftState {
        values: vec![None; cells.len()],
        remaining: cells.len(),
    }));

    for (idx, cell) in cells.iter().enumerate() {
        let promise = promise.clone();
        let state = state.clone();
        cell.on_finished(move |outcome| match outcome {
            Ok(value) => {
                let mut guard = state.lock();
                guard.values[idx] = Some(value.clone());
                guard.remaining -= 1;
                if guard.remaining == 0 {
                    let values: Vec<T> = guard.values.drain(..).flatten().collect();
                    drop(guard);
                    promise.complete(values);
                }
            }
            Err(err) => {
                promise.fail(err.clone());
            }
        });
    }

    out
}

/// First success wins. Fails with the last failure only once every source
/// has failed.
///
/// Near-simultaneous successes are settled by the cell's own CAS: whichever
/// resolution publishes first is the value.
pub fn any_of<T>(cells: &[CompletionCell<T>]) -> CompletionCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    if cells.is_empty() {
        return CompletionCell::failed(TaskError::NoSources);
    }

    let promise = Arc::new(Promise::new());
    let out = promise.cell();
    let remaining = Arc::new(AtomicUsize::new(cells.len()));

    for cell in cells {
        let promise = promise.clone();
        let remaining = remaining.clone();
        cell.on_finished(move |outcome| match outcome {
            Ok(value) => {
                promise.complete(value.clone());
            }
            Err(err) => {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    promise.fail(err.clone());
                }
            }
        });
    }

    out
}

/// Thread `initial` through every cell's value in order, blocking on each.
///
/// The first failure aborts the fold and is returned.
pub fn fold<T, A, F>(cells: &[CompletionCell<T>], initial: A, mut f: F) -> Outcome<A>
where
    T: Send + Sync + 'static,
    F: FnMut(A, &T) -> A,
{
    let mut acc = initial;
    for cell in cells {
        acc = cell.wait_with(|outcome| match outcome {
            Ok(value) => Ok(f(acc, value)),
            Err(err) => Err(err.clone()),
        })?;
    }
    Ok(acc)
}

/// Every value in order, blocking on each.
pub fn collect<T>(cells: &[CompletionCell<T>]) -> Outcome<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    fold(cells, Vec::with_capacity(cells.len()), |mut acc, value| {
        acc.push(value.clone());
        acc
    })
}

/// `fold` run as a task on `scheduler`, so the blocking happens on a worker
/// rather than the caller.
pub fn fold_async<T, A, F, S>(
    scheduler: &S,
    cells: Vec<CompletionCell<T>>,
    initial: A,
    f: F,
    timeout: Duration,
) -> CompletionCell<A>
where
    T: Send + Sync + 'static,
    A: Send + Sync + 'static,
    F: FnMut(A, &T) -> A + Send + 'static,
    S: TaskScheduler,
{
    scheduler.submit_outcome(move || fold(&cells, initial, f), timeout)
}
