// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Relay task runtime.
//!
//! Submit closures with a timeout, get back a `CompletionCell` that resolves
//! exactly once with a value or a `TaskError`. Two engines implement the
//! same `TaskScheduler` contract:
//!
//! - `TimeoutEnforcingPool`: core/max sized pool over a pluggable hand-off
//!   queue, growing on demand and reaping idle extra workers
//! - `WorkStealingPool`: one lock-free deque per worker, a shared queue,
//!   and direct hand-off to parked workers
//!
//! Components:
//! - cell: write-once completion cell, promise, callbacks, blocking reads
//! - combinators: map/zip/lift/any_of/fold over cells
//! - scheduler: `Task` and the submit contract
//! - reaper: per-scheduler deadline thread enforcing timeouts
//! - breaker: circuit breaker over any scheduler
//! - config: option structs (serde) and builders

pub mod breaker;
pub mod cancel;
pub mod cell;
pub mod combinators;
pub mod config;
pub mod error;
pub mod reaper;
pub mod scheduler;
pub mod stealing;
pub mod timeout_pool;

pub use breaker::{BreakerState, CircuitBreaker};
pub use cancel::{interrupted, CancelToken};
pub use cell::{CompletionCell, Outcome, Promise};
pub use combinators::{any_of, collect, fold, fold_async, lift, zip, zip3};
pub use config::{
    BreakerBuilder, BreakerOptions, StealingPoolBuilder, StealingPoolOptions, TimeoutPoolBuilder,
    TimeoutPoolOptions, WorkQueue,
};
pub use error::{BoxError, ConfigError, RejectReason, TaskError};
pub use reaper::{DeadlineHandle, Reaper};
pub use scheduler::{Task, TaskScheduler};
pub use stealing::{PoolStats, WorkStealingPool};
pub use timeout_pool::TimeoutEnforcingPool;
