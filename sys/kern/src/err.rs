// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Application-visible error kinds live in `abi::KernelError` and are
//! always reported by return value. What lives here is the kernel's
//! internal bookkeeping for *scheduling consequences*: most operations
//! that can unblock a thread return a [`NextThread`] hint that the
//! caller must discharge, usually by pending the context-switch trap.

use abi::ThreadId;

/// Shorthand for the usual fallible-operation signature.
pub type Result<T> = core::result::Result<T, abi::KernelError>;

/// Return value for operations that can have scheduling implications.
/// This is marked `must_use` because forgetting to actually update the
/// scheduler after performing an operation that requires it would be
/// Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextThread {
    /// It's fine to keep running whatever thread we were just running.
    Same,
    /// We need to switch threads, but this routine has not concluded
    /// which one should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch threads, and we already know which one should
    /// run next. This is an optimization available when an operation
    /// wakes a single specific thread.
    Specific(ThreadId),
}

impl NextThread {
    /// Merges the hints from two operations performed back to back,
    /// producing the hint for the pair. A concrete target survives the
    /// merge only as long as nothing contradicts it.
    pub fn combine(self, other: Self) -> Self {
        use NextThread::*;

        match (self, other) {
            // Same carries no information; the other side decides.
            (Same, x) | (x, Same) => x,
            (Specific(a), Specific(b)) if a == b => Specific(a),
            // Two operations each nominated a different thread, so
            // neither nomination can stand; punt to a full pass.
            (Specific(_), Specific(_)) => Other,
            // A nomination refines a bare "switch somewhere".
            (Specific(t), Other) | (Other, Specific(t)) => Specific(t),
            (Other, Other) => Other,
        }
    }

    /// Whether this hint calls for a trip through the scheduler.
    pub fn must_switch(self) -> bool {
        self != NextThread::Same
    }
}
