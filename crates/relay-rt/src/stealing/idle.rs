// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Registry of parked workers, with direct task hand-off.
//!
//! A parked worker publishes an `IdleSlot` whose hand-off pointer is null
//! while it accepts work. A submitter pops a slot, CASes its task into the
//! pointer and unparks the thread, skipping the global queue entirely. The
//! worker closes its slot on wake, which either collects a handed task or
//! shuts out late offers.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread::Thread;

use relay_collections::AtomicStack;

use crate::scheduler::Task;

fn closed() -> *mut Task {
    NonNull::dangling().as_ptr()
}

/// Hand-off point of one worker.
pub(crate) struct IdleSlot {
    index: usize,
    thread: Thread,
    /// null: accepting; `closed()`: not accepting; otherwise a boxed task.
    handoff: AtomicPtr<Task>,
}

impl IdleSlot {
    pub(crate) fn new(index: usize, thread: Thread) -> Self {
        Self {
            index,
            thread,
            handoff: AtomicPtr::new(closed()),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Start accepting hand-offs. Owner only, on a closed slot.
    pub(crate) fn open(&self) {
        self.handoff.store(ptr::null_mut(), Ordering::SeqCst);
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.handoff.load(Ordering::Acquire).is_null()
    }

    /// Try to hand `task` to this worker and wake it.
    fn offer(&self, task: Box<Task>) -> Result<(), Box<Task>> {
        let raw = Box::into_raw(task);
        match self.handoff.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.thread.unpark();
                Ok(())
            }
            // SAFETY: the CAS failed, so `raw` was never published.
            Err(_) => Err(unsafe { Box::from_raw(raw) }),
        }
    }

    /// Stop accepting. Returns the task handed over meanwhile, if any.
    pub(crate) fn close(&self) -> Option<Task> {
        let prev = self.handoff.swap(closed(), Ordering::AcqRel);
        if prev.is_null() || prev == closed() {
            return None;
        }
        // SAFETY: a non-sentinel pointer was installed by `offer` from
        // `Box::into_raw` and the swap made us its only owner.
        Some(*unsafe { Box::from_raw(prev) })
    }

    pub(crate) fn unpark(&self) {
        self.thread.unpark();
    }
}

impl Drop for IdleSlot {
    fn drop(&mut self) {
        drop(self.close());
    }
}

impl std::fmt::Debug for IdleSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleSlot")
            .field("index", &self.index)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// Stack of parked workers' slots.
#[derive(Debug, Default)]
pub(crate) struct IdleRegistry {
    slots: AtomicStack<Arc<IdleSlot>>,
}

impl IdleRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publish `slot`, dropping stale entries (closed slots, earlier
    /// registrations of the same worker) on the way.
    pub(crate) fn register(&self, slot: &Arc<IdleSlot>) {
        self.slots.update(|current| {
            current
                .retain(|s| s.is_accepting() && !Arc::ptr_eq(s, slot))
                .push(slot.clone())
        });
    }

    /// Hand `task` to the most recently parked accepting worker. Returns the
    /// worker's index, or the task if nobody took it.
    pub(crate) fn offer(&self, task: Task) -> Result<usize, Task> {
        let mut task = Box::new(task);
        while let Some(slot) = self.slots.pop() {
            match slot.offer(task) {
                Ok(()) => return Ok(slot.index()),
                Err(back) => task = back,
            }
        }
        Err(*task)
    }

    /// Wake one parked worker without handing it anything.
    pub(crate) fn wake_one(&self) -> bool {
        while let Some(slot) = self.slots.pop() {
            if slot.is_accepting() {
                slot.unpark();
                return true;
            }
        }
        false
    }

    pub(crate) fn wake_all(&self) {
        for slot in self.slots.take_all().iter() {
            slot.unpark();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.snapshot().len()
    }
}
