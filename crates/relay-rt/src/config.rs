// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pool and breaker options, and the builders that validate them.
//!
//! Every option struct deserializes with missing fields taken from
//! `Default`; durations are plain milliseconds on the wire.

use std::thread;
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::CircuitBreaker;
use crate::error::ConfigError;
use crate::scheduler::TaskScheduler;
use crate::stealing::WorkStealingPool;
use crate::timeout_pool::TimeoutEnforcingPool;

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Hand-off queue between submitters and timeout-pool workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkQueue {
    /// Zero-capacity rendezvous: a task is accepted only if a worker is
    /// waiting for it or the pool may grow.
    Synchronous,
    /// At most `n` queued tasks before growth beyond core size.
    Bounded(usize),
    /// Never full; the pool stays at core size.
    #[default]
    Unbounded,
}

/// `TimeoutEnforcingPool` options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutPoolOptions {
    pub core_size: usize,
    pub max_size: usize,
    /// How long a worker above core size waits for work before exiting.
    #[serde(with = "millis")]
    pub idle_reap_delay: Duration,
    /// Raise the task's interrupt token when its timeout fires.
    pub interrupt_on_timeout: bool,
    pub work_queue: WorkQueue,
    /// Prefix for worker and reaper thread names.
    pub thread_name: String,
}

impl Default for TimeoutPoolOptions {
    fn default() -> Self {
        let cores = available_parallelism();
        Self {
            core_size: cores,
            max_size: cores * 2,
            idle_reap_delay: Duration::from_secs(60),
            interrupt_on_timeout: false,
            work_queue: WorkQueue::default(),
            thread_name: "relay-pool".to_string(),
        }
    }
}

impl TimeoutPoolOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Zero("max_size"));
        }
        if self.core_size > self.max_size {
            return Err(ConfigError::CoreExceedsMax {
                core: self.core_size,
                max: self.max_size,
            });
        }
        if self.work_queue == WorkQueue::Bounded(0) {
            return Err(ConfigError::Zero("bounded work queue capacity"));
        }
        Ok(())
    }
}

/// `WorkStealingPool` options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StealingPoolOptions {
    /// Worker count. 0 means one per available core.
    pub workers: usize,
    /// Timed park between the last failed scan and registering as idle.
    #[serde(with = "millis")]
    pub spin_park: Duration,
    /// Upper bound on an idle park before the worker rescans on its own.
    #[serde(with = "millis")]
    pub idle_recheck: Duration,
    pub initial_queue_capacity: usize,
    /// Local queue size past which pushes overflow to the shared queue.
    pub max_local_capacity: usize,
    pub interrupt_on_timeout: bool,
    pub thread_name: String,
}

impl Default for StealingPoolOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            spin_park: Duration::from_millis(1),
            idle_recheck: Duration::from_millis(50),
            initial_queue_capacity: 64,
            max_local_capacity: 1 << 16,
            interrupt_on_timeout: false,
            thread_name: "relay-worker".to_string(),
        }
    }
}

impl StealingPoolOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_queue_capacity == 0 {
            return Err(ConfigError::Zero("initial_queue_capacity"));
        }
        if self.initial_queue_capacity > self.max_local_capacity {
            return Err(ConfigError::QueueCapacity {
                initial: self.initial_queue_capacity,
                max: self.max_local_capacity,
            });
        }
        Ok(())
    }

    /// `workers`, with 0 resolved to the core count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            available_parallelism()
        } else {
            self.workers
        }
    }
}

/// `CircuitBreaker` options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BreakerOptions {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a probe is let through.
    #[serde(with = "millis")]
    pub recovery_delay: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_delay: Duration::from_secs(30),
        }
    }
}

impl BreakerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        Ok(())
    }
}

/// Builder returned by `TimeoutEnforcingPool::builder()`.
#[derive(Debug, Clone, Default)]
pub struct TimeoutPoolBuilder {
    options: TimeoutPoolOptions,
}

impl TimeoutPoolBuilder {
    pub fn from_options(options: TimeoutPoolOptions) -> Self {
        Self { options }
    }

    pub fn core_size(mut self, n: usize) -> Self {
        self.options.core_size = n;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.options.max_size = n;
        self
    }

    pub fn idle_reap_delay(mut self, delay: Duration) -> Self {
        self.options.idle_reap_delay = delay;
        self
    }

    pub fn interrupt_on_timeout(mut self, yes: bool) -> Self {
        self.options.interrupt_on_timeout = yes;
        self
    }

    pub fn work_queue(mut self, queue: WorkQueue) -> Self {
        self.options.work_queue = queue;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.options.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<TimeoutEnforcingPool, ConfigError> {
        TimeoutEnforcingPool::with_options(self.options)
    }
}

/// Builder returned by `WorkStealingPool::builder()`.
#[derive(Debug, Clone, Default)]
pub struct StealingPoolBuilder {
    options: StealingPoolOptions,
}

impl StealingPoolBuilder {
    pub fn from_options(options: StealingPoolOptions) -> Self {
        Self { options }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.options.workers = n;
        self
    }

    pub fn spin_park(mut self, park: Duration) -> Self {
        self.options.spin_park = park;
        self
    }

    pub fn idle_recheck(mut self, recheck: Duration) -> Self {
        self.options.idle_recheck = recheck;
        self
    }

    pub fn initial_queue_capacity(mut self, n: usize) -> Self {
        self.options.initial_queue_capacity = n;
        self
    }

    pub fn max_local_capacity(mut self, n: usize) -> Self {
        self.options.max_local_capacity = n;
        self
    }

    pub fn interrupt_on_timeout(mut self, yes: bool) -> Self {
        self.options.interrupt_on_timeout = yes;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.options.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<WorkStealingPool, ConfigError> {
        WorkStealingPool::with_options(self.options)
    }
}

/// Builder for `CircuitBreaker`.
#[derive(Debug, Clone, Default)]
pub struct BreakerBuilder {
    options: BreakerOptions,
}

impl BreakerBuilder {
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.options.failure_threshold = n;
        self
    }

    pub fn recovery_delay(mut self, delay: Duration) -> Self {
        self.options.recovery_delay = delay;
        self
    }

    /// Wrap `inner` with the configured breaker.
    pub fn wrap<S: TaskScheduler>(self, inner: S) -> Result<CircuitBreaker<S>, ConfigError> {
        CircuitBreaker::new(inner, self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_options_parse_with_defaults() {
        let opts: TimeoutPoolOptions = serde_json::from_str(
            r#"{ "core_size": 2, "max_size": 4, "idle_reap_delay": 250,
                 "work_queue": { "bounded": 16 } }"#,
        )
        .unwrap();
        assert_eq!(opts.core_size, 2);
        assert_eq!(opts.max_size, 4);
        assert_eq!(opts.idle_reap_delay, Duration::from_millis(250));
        assert_eq!(opts.work_queue, WorkQueue::Bounded(16));
        assert!(!opts.interrupt_on_timeout);
        assert_eq!(opts.thread_name, "relay-pool");
        opts.validate().unwrap();
    }

    #[test]
    fn work_queue_unit_variants() {
        let q: WorkQueue = serde_json::from_str(r#""synchronous""#).unwrap();
        assert_eq!(q, WorkQueue::Synchronous);
        let q: WorkQueue = serde_json::from_str(r#""unbounded""#).unwrap();
        assert_eq!(q, WorkQueue::Unbounded);
    }

    #[test]
    fn timeout_options_reject_bad_sizes() {
        let opts = TimeoutPoolOptions {
            core_size: 5,
            max_size: 2,
            ..Default::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::CoreExceedsMax { core: 5, max: 2 })
        ));

        let opts = TimeoutPoolOptions {
            core_size: 0,
            max_size: 0,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(ConfigError::Zero("max_size"))));

        let opts = TimeoutPoolOptions {
            work_queue: WorkQueue::Bounded(0),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn stealing_options_parse_and_resolve_workers() {
        let opts: StealingPoolOptions =
            serde_json::from_str(r#"{ "workers": 3, "spin_park": 2, "idle_recheck": 20 }"#)
                .unwrap();
        assert_eq!(opts.worker_count(), 3);
        assert_eq!(opts.spin_park, Duration::from_millis(2));
        assert_eq!(opts.idle_recheck, Duration::from_millis(20));
        assert_eq!(opts.initial_queue_capacity, 64);

        assert!(StealingPoolOptions::default().worker_count() >= 1);
    }

    #[test]
    fn stealing_options_reject_inverted_capacity() {
        let opts = StealingPoolOptions {
            initial_queue_capacity: 128,
            max_local_capacity: 16,
            ..Default::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::QueueCapacity { initial: 128, max: 16 })
        ));
    }

    #[test]
    fn breaker_options() {
        let opts: BreakerOptions =
            serde_json::from_str(r#"{ "failure_threshold": 3, "recovery_delay": 1500 }"#).unwrap();
        assert_eq!(opts.failure_threshold, 3);
        assert_eq!(opts.recovery_delay, Duration::from_millis(1500));
        assert!(BreakerOptions {
            failure_threshold: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
