// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler contract shared by both pools.
//!
//! Engines implement `dispatch` (placement and execution of an opaque
//! `Task`). Submission, the batch forms and timeout coupling are provided
//! on top of it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::cancel;
use crate::cell::{CompletionCell, Outcome, Promise};
use crate::error::{BoxError, RejectReason, TaskError};
use crate::reaper::{self, Reaper};

/// Unit of work owned by a scheduler from submission until it runs.
///
/// Dropping a task without running it drops the promise it carries, which
/// fails the cell with `TaskError::Cancelled`.
pub struct Task {
    job: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { job: Box::new(f) }
    }

    /// Task that resolves `promise` with the outcome of `work`.
    ///
    /// Skips `work` entirely if the cell was resolved while queued
    /// (cancelled, timed out). Panics become `TaskError::Panicked`. If the
    /// cell is resolved while `work` runs, its result is discarded.
    pub fn bound<T, F>(promise: Promise<T>, work: F) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        Self::new(move || {
            if promise.is_done() {
                return;
            }
            let outcome = cancel::with_token(promise.token().clone(), || {
                match catch_unwind(AssertUnwindSafe(work)) {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(TaskError::from_panic(payload)),
                }
            });
            promise.resolve(outcome);
        })
    }

    pub fn run(self) {
        (self.job)()
    }

    /// Give up on the task without running it. A bound cell fails with
    /// `TaskError::Cancelled` unless it already resolved.
    pub fn abandon(self) {
        drop(self.job);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task { .. }")
    }
}

/// Submit-with-timeout contract.
///
/// `submit` never blocks beyond enqueueing and never fails synchronously:
/// rejection, like every other failure, arrives as an already-failed cell.
pub trait TaskScheduler: Send + Sync {
    /// Hand `task` to the engine. A refused task comes back with the reason.
    fn dispatch(&self, task: Task) -> Result<(), (Task, RejectReason)>;

    /// Timer used to enforce submission timeouts.
    fn reaper(&self) -> &Reaper;

    /// Whether a timeout also raises the task's interrupt token.
    fn interrupt_on_timeout(&self) -> bool {
        false
    }

    /// Run `work` into an existing promise. Every other submit form ends here.
    fn submit_to<T, F>(&self, promise: Promise<T>, work: F, timeout: Duration)
    where
        Self: Sized,
        T: Send + Sync + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let cell = promise.cell();
        reaper::arm(self.reaper(), &cell, timeout, self.interrupt_on_timeout());
        if let Err((task, reason)) = self.dispatch(Task::bound(promise, work)) {
            // Resolve before the task drops so the cause reads as a rejection.
            cell.resolve(Err(TaskError::Rejected(reason)));
            task.abandon();
        }
    }

    /// Submit work whose outcome is already a `Result<T, TaskError>`.
    fn submit_outcome<T, F>(&self, work: F, timeout: Duration) -> CompletionCell<T>
    where
        Self: Sized,
        T: Send + Sync + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let promise = Promise::new();
        let cell = promise.cell();
        self.submit_to(promise, work, timeout);
        cell
    }

    /// Submit infallible work. A panic fails the cell.
    fn submit<T, F>(&self, work: F, timeout: Duration) -> CompletionCell<T>
    where
        Self: Sized,
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_outcome(move || Ok(work()), timeout)
    }

    /// Submit work returning `Result`; its error becomes `TaskError::Failed`.
    fn submit_fallible<T, E, F>(&self, work: F, timeout: Duration) -> CompletionCell<T>
    where
        Self: Sized,
        T: Send + Sync + 'static,
        E: Into<BoxError>,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.submit_outcome(move || work().map_err(TaskError::failed), timeout)
    }

    /// Submit each item with the same timeout.
    fn submit_all<T, F, I>(&self, works: I, timeout: Duration) -> Vec<CompletionCell<T>>
    where
        Self: Sized,
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        works
            .into_iter()
            .map(|work| self.submit(work, timeout))
            .collect()
    }

    /// Like `submit_all`, but every cell succeeds: failures, timeouts and
    /// rejections resolve to a clone of `default`.
    fn submit_all_with_default_value<T, F, I>(
        &self,
        works: I,
        timeout: Duration,
        default: T,
    ) -> Vec<CompletionCell<T>>
    where
        Self: Sized,
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        works
            .into_iter()
            .map(|work| self.submit(work, timeout).with_default_value(default.clone()))
            .collect()
    }
}

impl<S: TaskScheduler> TaskScheduler for std::sync::Arc<S> {
    fn dispatch(&self, task: Task) -> Result<(), (Task, RejectReason)> {
        (**self).dispatch(task)
    }

    fn reaper(&self) -> &Reaper {
        (**self).reaper()
    }

    fn interrupt_on_timeout(&self) -> bool {
        (**self).interrupt_on_timeout()
    }

    fn submit_to<T, F>(&self, promise: Promise<T>, work: F, timeout: Duration)
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        (**self).submit_to(promise, work, timeout)
    }
}
