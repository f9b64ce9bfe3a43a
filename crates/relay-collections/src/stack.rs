// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Persistent stack and its lock-free shared cell.
//!
//! Nodes are reference counted, so `push` shares the existing tail and a
//! clone of the whole stack costs one refcount bump. `AtomicStack` swaps
//! the head pointer with a load/compute/CAS loop (`ArcSwap::rcu`); readers
//! never block writers.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

struct Node<T> {
    value: T,
    next: Option<Arc<Node<T>>>,
}

/// Persistent singly-linked list used as a stack.
///
/// Every mutating operation returns a new stack; the receiver is left
/// untouched and keeps sharing nodes with the result.
pub struct ImmutableStack<T> {
    head: Option<Arc<Node<T>>>,
    len: usize,
}

impl<T> ImmutableStack<T> {
    pub fn empty() -> Self {
        Self { head: None, len: 0 }
    }

    /// New stack with `value` on top. O(1).
    pub fn push(&self, value: T) -> Self {
        Self {
            head: Some(Arc::new(Node {
                value,
                next: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    pub fn peek(&self) -> Option<&T> {
        self.head.as_ref().map(|node| &node.value)
    }

    /// Top value plus the stack below it.
    pub fn pop(&self) -> Option<(&T, Self)> {
        self.head.as_ref().map(|node| {
            let rest = Self {
                head: node.next.clone(),
                len: self.len - 1,
            };
            (&node.value, rest)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Iterate from top to bottom.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.as_deref(),
        }
    }
}

impl<T: Clone> ImmutableStack<T> {
    /// Same elements, bottom first. O(n).
    pub fn reversed(&self) -> Self {
        self.iter()
            .fold(Self::empty(), |acc, value| acc.push(value.clone()))
    }

    /// Stack keeping only the elements `keep` accepts, order preserved.
    pub fn retain<F: FnMut(&T) -> bool>(&self, mut keep: F) -> Self {
        let kept: Vec<&T> = self.iter().filter(|value| keep(value)).collect();
        if kept.len() == self.len {
            return self.clone();
        }
        kept.into_iter()
            .rev()
            .fold(Self::empty(), |acc, value| acc.push(value.clone()))
    }
}

impl<T> Clone for ImmutableStack<T> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for ImmutableStack<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for ImmutableStack<T> {
    // Unlink uniquely owned nodes one at a time; the default drop would
    // recurse once per node.
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(Node { next: tail, .. }) => next = tail,
                Err(_) => break,
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ImmutableStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> FromIterator<T> for ImmutableStack<T> {
    /// The last item yielded ends up on top.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |acc, value| acc.push(value))
    }
}

impl<'a, T> IntoIterator for &'a ImmutableStack<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Top-to-bottom iterator over an `ImmutableStack`.
pub struct Iter<'a, T> {
    next: Option<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.next.map(|node| {
            self.next = node.next.as_deref();
            &node.value
        })
    }
}

/// Shared, lock-free handle to an `ImmutableStack`.
///
/// All updates replace the whole list through a CAS retry loop, so a
/// concurrent reader always sees some complete version of the stack.
pub struct AtomicStack<T> {
    head: ArcSwap<ImmutableStack<T>>,
}

impl<T> AtomicStack<T> {
    pub fn new() -> Self {
        Self {
            head: ArcSwap::from_pointee(ImmutableStack::empty()),
        }
    }

    /// Current version of the stack. Later updates don't affect it.
    pub fn snapshot(&self) -> Arc<ImmutableStack<T>> {
        self.head.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load().is_empty()
    }

    /// Detach the whole list, leaving an empty stack behind.
    pub fn take_all(&self) -> ImmutableStack<T> {
        let prev = self.head.swap(Arc::new(ImmutableStack::empty()));
        match Arc::try_unwrap(prev) {
            Ok(stack) => stack,
            Err(shared) => (*shared).clone(),
        }
    }

    /// Replace the list with `f(current)`, retrying on contention.
    ///
    /// `f` may run more than once and must not have side effects.
    /// Returns the version that was replaced.
    pub fn update<F>(&self, mut f: F) -> Arc<ImmutableStack<T>>
    where
        F: FnMut(&ImmutableStack<T>) -> ImmutableStack<T>,
    {
        self.head.rcu(|current| f(current))
    }
}

impl<T: Clone> AtomicStack<T> {
    pub fn push(&self, value: T) {
        self.update(|current| current.push(value.clone()));
    }

    pub fn pop(&self) -> Option<T> {
        loop {
            let current = self.head.load_full();
            let (top, rest) = current.pop()?;
            let top = top.clone();
            let prev = self.head.compare_and_swap(&current, Arc::new(rest));
            if Arc::ptr_eq(&prev, &current) {
                return Some(top);
            }
        }
    }
}

impl<T> Default for AtomicStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for AtomicStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicStack")
            .field(&*self.head.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn push_is_persistent() {
        let empty = ImmutableStack::empty();
        let one = empty.push(1);
        let two = one.push(2);
        assert!(empty.is_empty());
        assert_eq!(one.peek(), Some(&1));
        assert_eq!(two.peek(), Some(&2));
        assert_eq!(two.len(), 2);
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn pop_leaves_receiver_intact() {
        let stack: ImmutableStack<i32> = (1..=3).collect();
        let (top, rest) = stack.pop().unwrap();
        assert_eq!(*top, 3);
        assert_eq!(rest.iter().copied().collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(stack.len(), 3);
    }

    #[test]
    fn reversed_and_retain() {
        let stack: ImmutableStack<i32> = (1..=5).collect();
        let rev = stack.reversed();
        assert_eq!(rev.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        let odd = stack.retain(|v| v % 2 == 1);
        assert_eq!(odd.iter().copied().collect::<Vec<_>>(), vec![5, 3, 1]);
        assert_eq!(odd.len(), 3);
        assert_eq!(stack.len(), 5);
    }

    #[test]
    fn long_list_drops_without_overflow() {
        let mut stack = ImmutableStack::empty();
        for i in 0..500_000 {
            stack = stack.push(i);
        }
        drop(stack);
    }

    #[test]
    fn atomic_push_pop_lifo() {
        let stack = AtomicStack::new();
        stack.push("a");
        stack.push("b");
        assert_eq!(stack.pop(), Some("b"));
        assert_eq!(stack.pop(), Some("a"));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn take_all_empties() {
        let stack = AtomicStack::new();
        stack.push(1);
        stack.push(2);
        let taken = stack.take_all();
        assert_eq!(taken.len(), 2);
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_push_pop_loses_nothing() {
        let stack = Arc::new(AtomicStack::new());
        let mut handles = vec![];
        for t in 0..4 {
            let s = stack.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    s.push(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut popped = vec![];
        let mut handles = vec![];
        for _ in 0..4 {
            let s = stack.clone();
            handles.push(thread::spawn(move || {
                let mut got = vec![];
                while let Some(v) = s.pop() {
                    got.push(v);
                }
                got
            }));
        }
        for h in handles {
            popped.extend(h.join().unwrap());
        }
        popped.sort();
        assert_eq!(popped, (0..4000).collect::<Vec<_>>());
    }
}
