// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Circuit breaker over any `TaskScheduler`.
//!
//! Closed: everything passes and consecutive failures are counted. At
//! `failure_threshold` the breaker opens and submissions fail fast with
//! `RejectReason::CircuitOpen`. After `recovery_delay` the next submission
//! is let through as a probe (half-open); its success closes the breaker,
//! its failure reopens it. Other submissions that finish while the breaker
//! is open or half-open do not change its state.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cell::{Outcome, Promise};
use crate::config::BreakerOptions;
use crate::error::{ConfigError, RejectReason, TaskError};
use crate::reaper::Reaper;
use crate::scheduler::{Task, TaskScheduler};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    /// Rejecting. Stays reported as open until a submission after the
    /// recovery delay turns it half-open.
    Open,
    /// One probe in flight; everything else is rejected.
    HalfOpen,
}

struct Core {
    options: BreakerOptions,
    state: AtomicU8,
    failures: AtomicU32,
    /// Nanoseconds since `epoch` at the last opening.
    opened_at: AtomicU64,
    /// Bumped every time the breaker closes. Outcomes admitted under an
    /// older generation are ignored.
    generation: AtomicU64,
    epoch: Instant,
}

/// What `admit` handed out to one submission.
#[derive(Clone, Copy)]
struct Ticket {
    generation: u64,
    probe: bool,
}

impl Core {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn admit(&self) -> Option<Ticket> {
        let generation = self.generation.load(Ordering::Acquire);
        loop {
            match self.state.load(Ordering::Acquire) {
                CLOSED => {
                    return Some(Ticket {
                        generation,
                        probe: false,
                    })
                }
                HALF_OPEN => return None,
                _ => {
                    let opened = self.opened_at.load(Ordering::Acquire);
                    let waited = Duration::from_nanos(self.now().saturating_sub(opened));
                    if waited < self.options.recovery_delay {
                        return None;
                    }
                    if self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::debug!("circuit half-open, letting probe through");
                        return Some(Ticket {
                            generation,
                            probe: true,
                        });
                    }
                }
            }
        }
    }

    fn record<T>(&self, ticket: Ticket, outcome: &Outcome<T>) {
        if ticket.generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        if ticket.probe {
            if outcome.is_ok() {
                self.close();
            } else {
                self.trip(HALF_OPEN);
            }
            return;
        }
        // Stragglers admitted before the breaker opened leave it alone.
        if self.state.load(Ordering::Acquire) != CLOSED {
            return;
        }
        if outcome.is_ok() {
            self.failures.store(0, Ordering::Release);
            return;
        }
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.options.failure_threshold {
            self.trip(CLOSED);
        }
    }

    fn close(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.failures.store(0, Ordering::Release);
        if self
            .state
            .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("circuit closed after successful probe");
        }
    }

    fn trip(&self, from: u8) {
        self.opened_at.store(self.now(), Ordering::Release);
        if self
            .state
            .compare_exchange(from, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(
                failures = self.failures.load(Ordering::Relaxed),
                recovery_ms = self.options.recovery_delay.as_millis() as u64,
                "circuit opened"
            );
        }
    }
}

/// `TaskScheduler` that fails fast after repeated failures of `S`.
pub struct CircuitBreaker<S> {
    inner: S,
    core: Arc<Core>,
}

impl<S: TaskScheduler> CircuitBreaker<S> {
    pub fn new(inner: S, options: BreakerOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            inner,
            core: Arc::new(Core {
                options,
                state: AtomicU8::new(CLOSED),
                failures: AtomicU32::new(0),
                opened_at: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        })
    }

    pub fn state(&self) -> BreakerState {
        match self.core.state.load(Ordering::Acquire) {
            CLOSED => BreakerState::Closed,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Open,
        }
    }

    /// Consecutive failures seen while closed.
    pub fn failures(&self) -> u32 {
        self.core.failures.load(Ordering::Acquire)
    }

    /// Force the breaker closed and clear the failure count. Outcomes of
    /// submissions admitted before the reset, including an in-flight
    /// probe, no longer affect the breaker.
    pub fn reset(&self) {
        self.core.generation.fetch_add(1, Ordering::AcqRel);
        self.core.failures.store(0, Ordering::Release);
        self.core.state.store(CLOSED, Ordering::Release);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: TaskScheduler> TaskScheduler for CircuitBreaker<S> {
    /// Raw tasks carry no outcome to count, so they pass only while closed.
    fn dispatch(&self, task: Task) -> Result<(), (Task, RejectReason)> {
        if self.core.state.load(Ordering::Acquire) != CLOSED {
            return Err((task, RejectReason::CircuitOpen));
        }
        self.inner.dispatch(task)
    }

    fn reaper(&self) -> &Reaper {
        self.inner.reaper()
    }

    fn interrupt_on_timeout(&self) -> bool {
        self.inner.interrupt_on_timeout()
    }

    fn submit_to<T, F>(&self, promise: Promise<T>, work: F, timeout: Duration)
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let Some(ticket) = self.core.admit() else {
            promise.fail(TaskError::Rejected(RejectReason::CircuitOpen));
            return;
        };
        let core = self.core.clone();
        promise
            .cell()
            .on_finished(move |outcome| core.record(ticket, outcome));
        self.inner.submit_to(promise, work, timeout);
    }
}

impl<S> std::fmt::Debug for CircuitBreaker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.core.state.load(Ordering::Relaxed))
            .field("failures", &self.core.failures.load(Ordering::Relaxed))
            .finish()
    }
}
