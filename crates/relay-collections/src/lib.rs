// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Persistent collections used by the relay runtime.
//!
//! Only the pieces the runtime actually needs live here:
//! - `ImmutableStack`: persistent singly-linked list, O(1) prepend
//! - `AtomicStack`: an `ImmutableStack` behind an atomic pointer, updated
//!   by whole-list compare-and-swap

mod stack;

pub use stack::{AtomicStack, ImmutableStack, Iter};
