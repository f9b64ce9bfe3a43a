// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task and configuration error types.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error accepted from fallible work.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Why a submission was refused without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Pool at max size and the hand-off queue has no room.
    Capacity,
    /// Pool is shutting down or terminated.
    Shutdown,
    /// Circuit breaker is open.
    CircuitOpen,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Capacity => write!(f, "scheduler at capacity"),
            RejectReason::Shutdown => write!(f, "scheduler shut down"),
            RejectReason::CircuitOpen => write!(f, "circuit breaker open"),
        }
    }
}

/// Failure cause stored in a resolved `CompletionCell`.
///
/// Cancellation and timeout are separate variants even though the reaper
/// implements timeout through the same resolution path as `cancel()`.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Work returned an error.
    #[error("task failed: {0}")]
    Failed(Arc<dyn StdError + Send + Sync + 'static>),
    /// Work panicked with the given message.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// Work did not finish within its budget.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),
    /// Explicit `cancel()`, or the task was dropped unexecuted.
    #[error("task was cancelled")]
    Cancelled,
    /// Refused at submission.
    #[error("task rejected: {0}")]
    Rejected(RejectReason),
    /// A bounded wait elapsed first. The cell itself is still pending.
    #[error("timed out waiting for task result")]
    WaitTimeout,
    /// `any_of` was given nothing to wait on.
    #[error("no source cells to wait on")]
    NoSources,
}

impl TaskError {
    pub fn failed<E: Into<BoxError>>(err: E) -> Self {
        TaskError::Failed(Arc::from(err.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::TimedOut(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, TaskError::Rejected(_))
    }

    /// Convert a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        TaskError::Panicked(msg)
    }
}

/// Invalid pool or breaker options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("core size {core} exceeds max size {max}")]
    CoreExceedsMax { core: usize, max: usize },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("local queue capacity {initial} exceeds its limit {max}")]
    QueueCapacity { initial: usize, max: usize },
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
