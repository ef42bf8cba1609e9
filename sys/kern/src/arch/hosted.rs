// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the architecture layer.
//!
//! The hosted "machine" has no interrupts, no trap, and no way to
//! actually run a thread; what it provides is enough surface for the
//! kernel state machine to compile and be driven by tests, which play
//! the role of the context-switch glue themselves (advance time, call
//! [`crate::Kernel::schedule`], act as the chosen thread).

use crate::thread::Thread;

macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

/// Hosted saved state: just a stand-in stack pointer slot so the
/// structure has the same shape as the real thing.
#[derive(Debug, Default)]
#[repr(C)]
pub struct SavedState {
    psp: u32,
}

impl SavedState {
    pub const fn new() -> Self {
        SavedState { psp: 0 }
    }

    pub fn stack_pointer(&self) -> u32 {
        self.psp
    }
}

/// On hardware this fabricates the initial exception frame; here the
/// stack is just bounds, so there's nothing to write.
pub fn initialize_frame(thread: &mut Thread) {
    thread.save = SavedState {
        psp: thread.stack().top() as u32,
    };
}

/// Hardware re-targets the thread at its termination handler; the
/// hosted harness reads the TERMINATING flag instead and calls the
/// handler itself.
pub fn initialize_termination_frame(thread: &mut Thread) {
    thread.save = SavedState {
        psp: thread.stack().top() as u32,
    };
}

/// No paint, no high water.
#[cfg(feature = "stack-monitor")]
pub fn stack_high_water(_thread: &Thread) -> usize {
    0
}

/// No interrupts on the host; the closure just runs.
pub fn with_interrupts_masked<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// There is no trap to pend. Hosted tests call
/// [`crate::Kernel::schedule`] themselves at the points where hardware
/// would take the trap.
pub fn pend_context_switch() {}

/// Calibrated spin on hardware; a plain spin here.
pub fn busy_wait_us(us: u32) {
    for _ in 0..us {
        core::hint::spin_loop();
    }
}

/// What the idle thread does between interrupts.
pub fn idle_wait() {
    core::hint::spin_loop();
}

/// Hosted builds have nothing to dispatch to.
pub fn start_first_thread(_tick_divisor: u32, _thread: &Thread) -> ! {
    panic!("hosted build cannot enter thread context")
}
