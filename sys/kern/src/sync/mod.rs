// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives: counting/bitmask semaphores, bounded
//! message queues with multi-queue select, and the recursive
//! priority-inheriting mutex.
//!
//! All of these are built on the same two scheduler transitions --
//! announce-block and wake -- plus the waiter lists threaded through
//! the kernel's link arena. Operations marked ISR-safe in their docs
//! rely on interrupt masking only and never touch a mutex or the
//! allocator.

pub mod mutex;
pub mod queue;
pub mod sem;
