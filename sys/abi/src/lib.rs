// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application
//! threads.
//!
//! Everything here is plain data: ids are typed indexes into the
//! kernel's fixed tables, states are small enums, and errors are a
//! closed set of kinds reported by return value. There is deliberately
//! no wire format -- applications link against the kernel directly.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Indicates importance of a thread.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement
/// `PartialOrd`/`Ord`, to keep us from confusing ourselves on whether
/// `>` means numerically greater / less important, or more important /
/// numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Checks if `self` is at least as important as `other`.
    pub fn is_at_least_as_important_as(self, other: Self) -> bool {
        self.0 <= other.0
    }
}

macro_rules! table_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        #[repr(transparent)]
        pub struct $name(pub u16);

        impl $name {
            /// Index form, for dereferencing the corresponding kernel
            /// table.
            pub fn index(self) -> usize {
                usize::from(self.0)
            }
        }
    };
}

table_id! {
    /// Names a slot in the kernel's thread table.
    ThreadId
}
table_id! {
    /// Names a slot in the kernel's mutex table.
    MutexId
}
table_id! {
    /// Names a slot in the kernel's semaphore table. Signals are
    /// semaphores used through the bitmask operations.
    SemId
}
table_id! {
    /// Names a slot in the kernel's message-queue table.
    QueueId
}
table_id! {
    /// Names a slot in the kernel's software-timer table.
    TimerId
}

/// What a blocked thread is blocked *on*. This is the thread's half of
/// the thread <-> blocking-object relationship; the object's half is the
/// waiter list that links through the thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitRef {
    /// Pure timed sleep; nothing can signal it early except kill.
    Sleep,
    /// Waiting to acquire a mutex.
    Mutex(MutexId),
    /// Waiting on a semaphore count.
    Sem(SemId),
    /// Waiting on signal bits matching the thread's recorded mask.
    Signal(SemId),
    /// Waiting for another thread to reach the stopped state.
    Join(ThreadId),
}

/// Scheduling state of a thread table slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ThreadState {
    /// Slot is free; no code or stack is associated with it.
    #[default]
    Uninit,
    /// Thread has code, a stack, and an initial frame, but is not
    /// schedulable. Both "initialized but never run" and "ran to
    /// completion" land here; `exited` distinguishes them.
    Stopped,
    /// On a ready queue (or currently executing).
    Runnable,
    /// Parked on the waiter list of the referenced object.
    Blocked(WaitRef),
}

impl ThreadState {
    pub fn is_runnable(&self) -> bool {
        matches!(self, ThreadState::Runnable)
    }
}

/// Why a blocked thread came back to life. Read by the operation the
/// thread was suspended in, after the scheduler resumes it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Wake {
    /// The thing waited for happened.
    #[default]
    Normal,
    /// The wait's deadline expired first.
    Timeout,
    /// The thread was forcibly terminated while waiting. The thread
    /// never observes this itself; it is consumed by the termination
    /// pipeline.
    Killed,
}

bitflags! {
    /// Assorted per-thread flag bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct ThreadFlags: u8 {
        /// Another thread asked this one to stop; observed
        /// cooperatively via `is_stop_requested`.
        const STOP_REQUESTED = 1 << 0;
        /// The stack was allocated from the kernel heap and must be
        /// returned when the last reference is dropped.
        const HEAP_STACK = 1 << 1;
        /// The thread's next dispatch enters its termination handler
        /// rather than resuming where it left off.
        const TERMINATING = 1 << 2;
        /// The entry function has returned (as opposed to never having
        /// started).
        const EXITED = 1 << 3;
    }
}

/// The error kinds the kernel reports. All of these come back by return
/// value; none are fatal. Fatal conditions (asserts, CPU faults, kill)
/// never return to the caller at all.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// A non-blocking variant found its resource unavailable.
    WouldBlock,
    /// A blocking-with-timeout variant timed out.
    Timeout,
    /// The request was malformed: priority out of range,
    /// re-initializing a live thread, unknown id, and so on. Rejected
    /// at the API boundary with no state change.
    InvalidParam,
    /// The heap, a pool, or a kernel table cannot satisfy the request.
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_polarity() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(1).is_more_important_than(Priority(1)));
        assert!(Priority(1).is_at_least_as_important_as(Priority(1)));
        assert!(!Priority(3).is_at_least_as_important_as(Priority(2)));
    }

    #[test]
    fn default_state_is_free_slot() {
        assert_eq!(ThreadState::default(), ThreadState::Uninit);
        assert!(!ThreadState::default().is_runnable());
        assert!(ThreadState::Runnable.is_runnable());
    }
}
