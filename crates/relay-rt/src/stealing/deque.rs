// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Growable single-owner work-stealing deque (Chase-Lev).
//!
//! The owner pushes and pops at `top`; stealers take from `base` by CAS on
//! the index. Slots hold boxed values as raw pointers so a stealer's read
//! is a single atomic load. When the ring fills, the owner copies the live
//! window `[base, top)` into a ring twice the size and publishes it; old
//! rings are retired, not freed, until the deque itself drops, since a
//! stealer may still be reading one.
//!
//! Ownership is in the types: `Worker` is the only handle that can push or
//! pop, is `Send` but not `Sync`, and cannot be cloned. `Stealer` is the
//! shareable, steal-only side.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

struct Ring<T> {
    slots: Box<[AtomicPtr<T>]>,
    mask: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            slots,
            mask: capacity - 1,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: isize) -> &AtomicPtr<T> {
        &self.slots[(index as usize) & self.mask]
    }

    fn read(&self, index: isize) -> *mut T {
        self.slot(index).load(Ordering::Relaxed)
    }

    fn write(&self, index: isize, value: *mut T) {
        self.slot(index).store(value, Ordering::Relaxed);
    }
}

struct Inner<T> {
    /// Steal end. Advanced only by CAS.
    base: CachePadded<AtomicIsize>,
    /// Owner end. Written only by the owner.
    top: CachePadded<AtomicIsize>,
    ring: AtomicPtr<Ring<T>>,
    retired: Mutex<Vec<*mut Ring<T>>>,
    max_capacity: usize,
}

// SAFETY: values move between threads only through the CAS protocol; the
// raw ring pointers are owned by `Inner` and freed once, in `Drop`.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn len(&self) -> usize {
        let top = self.top.load(Ordering::Acquire);
        let base = self.base.load(Ordering::Acquire);
        (top - base).max(0) as usize
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let base = *self.base.get_mut();
        let top = *self.top.get_mut();
        let ring = *self.ring.get_mut();
        // SAFETY: exclusive access; every slot in [base, top) holds a live box
        // and each ring pointer came from `Box::into_raw` exactly once.
        unsafe {
            for i in base..top {
                let value = (*ring).read(i);
                if !value.is_null() {
                    drop(Box::from_raw(value));
                }
            }
            drop(Box::from_raw(ring));
            for old in self.retired.get_mut().drain(..) {
                drop(Box::from_raw(old));
            }
        }
    }
}

/// Result of a steal attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// Nothing to take.
    Empty,
    Success(T),
    /// Lost a race with another consumer; worth trying again.
    Retry,
}

impl<T> Steal<T> {
    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Owner handle of a deque.
pub struct Worker<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> Worker<T> {
    /// New deque starting at `initial_capacity` slots and growing up to
    /// `max_capacity`. Both are rounded up to a power of two.
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        let initial = initial_capacity.max(1).next_power_of_two();
        let max = max_capacity.max(initial).next_power_of_two();
        let ring = Box::into_raw(Box::new(Ring::new(initial)));
        Self {
            inner: Arc::new(Inner {
                base: CachePadded::new(AtomicIsize::new(0)),
                top: CachePadded::new(AtomicIsize::new(0)),
                ring: AtomicPtr::new(ring),
                retired: Mutex::new(Vec::new()),
                max_capacity: max,
            }),
            _not_sync: PhantomData,
        }
    }

    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Push at the owner end. Gives the value back when the deque is at
    /// its maximum capacity.
    pub fn push(&self, value: T) -> Result<(), T> {
        let inner = &*self.inner;
        let top = inner.top.load(Ordering::Relaxed);
        let base = inner.base.load(Ordering::Acquire);
        let mut ring = inner.ring.load(Ordering::Relaxed);

        // SAFETY: only the owner replaces `ring`, and we are the owner.
        let capacity = unsafe { (*ring).capacity() };
        if (top - base) as usize >= capacity {
            if capacity >= inner.max_capacity {
                return Err(value);
            }
            ring = self.grow(ring, base, top);
        }

        let value = Box::into_raw(Box::new(value));
        // SAFETY: `ring` is the current ring and slot `top` is outside the
        // window any stealer can claim.
        unsafe { (*ring).write(top, value) };
        inner.top.store(top + 1, Ordering::Release);
        Ok(())
    }

    /// Pop at the owner end (most recent push first).
    pub fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let top = inner.top.load(Ordering::Relaxed) - 1;
        inner.top.store(top, Ordering::Relaxed);
        // Publish the claim on `top` before looking at `base`; pairs with
        // the fence in `steal`.
        fence(Ordering::SeqCst);
        let base = inner.base.load(Ordering::Relaxed);

        if top < base {
            inner.top.store(top + 1, Ordering::Relaxed);
            return None;
        }

        let ring = inner.ring.load(Ordering::Relaxed);
        // SAFETY: owner-side read of a slot inside the live window.
        let value = unsafe { (*ring).read(top) };

        if top > base {
            // SAFETY: more than one element left, so no stealer can reach
            // this slot; the box is ours.
            return Some(unsafe { *Box::from_raw(value) });
        }

        // Last element: race the stealers for it through `base`.
        let won = inner
            .base
            .compare_exchange(base, base + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        inner.top.store(top + 1, Ordering::Relaxed);
        if won {
            // SAFETY: the CAS made us the unique consumer of this slot.
            Some(unsafe { *Box::from_raw(value) })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current ring size.
    pub fn capacity(&self) -> usize {
        // SAFETY: owner-side read of the ring it alone replaces.
        unsafe { (*self.inner.ring.load(Ordering::Relaxed)).capacity() }
    }

    fn grow(&self, old: *mut Ring<T>, base: isize, top: isize) -> *mut Ring<T> {
        // SAFETY: `old` is the current ring and stays alive in `retired`.
        let old_ref = unsafe { &*old };
        let next = Ring::new(old_ref.capacity() * 2);
        for i in base..top {
            next.write(i, old_ref.read(i));
        }
        let next = Box::into_raw(Box::new(next));
        self.inner.ring.store(next, Ordering::Release);
        self.inner.retired.lock().push(old);
        tracing::trace!(capacity = old_ref.capacity() * 2, "local queue grew");
        next
    }
}

impl<T> std::fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("len", &self.len()).finish()
    }
}

/// Steal-only handle of a deque.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Stealer<T> {
    /// Take the oldest element.
    pub fn steal(&self) -> Steal<T> {
        let inner = &*self.inner;
        let base = inner.base.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let top = inner.top.load(Ordering::Acquire);

        if top - base <= 0 {
            return Steal::Empty;
        }

        // Loaded after `top`, so a ring published before the push we saw is
        // visible here.
        let ring = inner.ring.load(Ordering::Acquire);
        // SAFETY: rings are only freed when `Inner` drops, and we hold an Arc.
        let value = unsafe { (*ring).read(base) };

        if inner
            .base
            .compare_exchange(base, base + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }
        // SAFETY: winning the CAS on `base` makes this the only consumer of
        // slot `base`, and the owner never overwrites a slot before `base`
        // has moved past it.
        Steal::Success(unsafe { *Box::from_raw(value) })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stealer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    #[test]
    fn owner_pops_lifo() {
        let q = Worker::new(4, 64);
        for i in 0..10 {
            q.push(i).unwrap();
        }
        let popped: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(popped, (0..10).rev().collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn stealer_takes_fifo() {
        let q = Worker::new(4, 64);
        let s = q.stealer();
        for i in 0..3 {
            q.push(i).unwrap();
        }
        assert_eq!(s.steal(), Steal::Success(0));
        assert_eq!(s.steal(), Steal::Success(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(s.steal(), Steal::Empty);
    }

    #[test]
    fn grows_until_max_then_refuses() {
        let q = Worker::new(2, 8);
        for i in 0..8 {
            q.push(i).unwrap();
        }
        assert_eq!(q.capacity(), 8);
        assert_eq!(q.push(99), Err(99));
        assert_eq!(q.len(), 8);
    }

    #[test]
    fn growth_keeps_window_after_steals() {
        let q = Worker::new(2, 64);
        let s = q.stealer();
        q.push(0).unwrap();
        q.push(1).unwrap();
        assert_eq!(s.steal().success(), Some(0));
        for i in 2..6 {
            q.push(i).unwrap();
        }
        let mut seen: Vec<_> = std::iter::from_fn(|| s.steal().success()).collect();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn dropping_deque_drops_remaining_values() {
        let live = Arc::new(AtomicUsize::new(0));
        #[derive(Debug)]
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        {
            let q = Worker::new(2, 64);
            for _ in 0..10 {
                live.fetch_add(1, Ordering::SeqCst);
                q.push(Tracked(live.clone())).unwrap();
            }
            drop(q.pop());
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_steal_no_loss_no_duplicates() {
        const N: usize = 20_000;
        const THIEVES: usize = 3;

        let q = Worker::new(8, 1 << 16);
        let done = Arc::new(AtomicBool::new(false));
        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let s = q.stealer();
                let done = done.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    loop {
                        match s.steal() {
                            Steal::Success(v) => got.push(v),
                            Steal::Retry => {}
                            Steal::Empty => {
                                if done.load(Ordering::Acquire) && s.is_empty() {
                                    break;
                                }
                                thread::yield_now();
                            }
                        }
                    }
                    got
                })
            })
            .collect();

        let mut owned = Vec::new();
        for i in 0..N {
            q.push(i).unwrap();
            if i % 3 == 0 {
                if let Some(v) = q.pop() {
                    owned.push(v);
                }
            }
        }
        while let Some(v) = q.pop() {
            owned.push(v);
        }
        done.store(true, Ordering::Release);

        let mut all = owned;
        for t in thieves {
            all.extend(t.join().unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..N).collect::<Vec<_>>());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u32),
        Pop,
        Steal,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => any::<u32>().prop_map(Op::Push),
            1 => Just(Op::Pop),
            1 => Just(Op::Steal),
        ]
    }

    proptest! {
        #[test]
        fn matches_sequential_model(ops in proptest::collection::vec(op(), 0..200)) {
            let q = Worker::new(2, 32);
            let s = q.stealer();
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Op::Push(v) => {
                        let res = q.push(v);
                        if model.len() >= 32 {
                            prop_assert_eq!(res, Err(v));
                        } else {
                            prop_assert_eq!(res, Ok(()));
                            model.push_back(v);
                        }
                    }
                    Op::Pop => prop_assert_eq!(q.pop(), model.pop_back()),
                    Op::Steal => prop_assert_eq!(s.steal().success(), model.pop_front()),
                }
                prop_assert_eq!(q.len(), model.len());
            }
        }
    }
}
