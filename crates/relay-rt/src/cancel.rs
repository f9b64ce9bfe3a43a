// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative interruption.
//!
//! Each cell carries a `CancelToken`. Cancelling or timing out with
//! interruption raises the token; the running task sees it through
//! `interrupted()`. Nothing stops a task that never checks.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Interruption flag shared between a cell and the task resolving it.
#[derive(Debug)]
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Set the interruption flag.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Check if interruption was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT_TOKEN: RefCell<Option<Arc<CancelToken>>> = const { RefCell::new(None) };
}

/// True when the task running on this thread has been asked to stop.
///
/// Always false outside a scheduler-run task.
pub fn interrupted() -> bool {
    CURRENT_TOKEN.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    })
}

/// Run `f` with `token` installed as the current task's token.
///
/// The previous token is restored afterwards, including on unwind, so a
/// task running nested work inline keeps its own flag.
pub(crate) fn with_token<R>(token: Arc<CancelToken>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Arc<CancelToken>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            CURRENT_TOKEN.with(|cell| *cell.borrow_mut() = prev);
        }
    }

    let prev = CURRENT_TOKEN.with(|cell| cell.borrow_mut().replace(token));
    let _restore = Restore(prev);
    f()
}
