// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Work-stealing scheduler.
//!
//! N worker threads each own a local deque. Idle workers take from the
//! shared queue, then steal from peers, then park in the idle registry
//! where submitters can hand them work directly.

pub mod deque;
mod idle;
mod pool;

pub use deque::{Steal, Stealer, Worker};
pub use pool::{PoolStats, WorkStealingPool};
