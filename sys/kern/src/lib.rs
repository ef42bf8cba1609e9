// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! moxie kernel.
//!
//! This is the application-independent core of the operating system: a
//! preemptive, priority-scheduled microkernel for single-core 32-bit
//! microcontrollers, providing threads, a recursive priority-inheriting
//! mutex, counting/bitmask semaphores, bounded message queues, one-shot
//! software timers, and a mutex-serialized first-fit heap with a slab
//! pool on top.
//!
//! # Design principles
//!
//! 1. Static configuration. The kernel's tables are sized at compile
//!    time ([`config`]); applications claim slots at runtime but nothing
//!    is ever allocated behind the application's back.
//! 2. A strong preference for safe code. Kernel objects live in fixed
//!    tables and refer to each other by typed index; the intrusive lists
//!    threading through them are index-valued too. Unsafe code is
//!    confined to the architecture layer and the heap's pointer
//!    boundary.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms.
//! 4. Everything that can run on the host does. The whole scheduling and
//!    synchronization state machine is exercised by hosted tests; only
//!    the code in `arch/arm_m.rs` needs hardware.
//!
//! The code outside the `arch` module is intended to be portable to any
//! 32-bit machine with an ARM-M-like exception model (independent
//! main/process stacks, a pendable supervisor trap, a periodic
//! down-counting tick timer).

#![cfg_attr(not(test), no_std)]

/// Kernel invariant check. Panics without dragging in formatting
/// machinery, which matters for text size on small flash parts.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        if !($cond1 == $cond2) {
            panic!("Assertion failed!");
        }
    };
}

#[macro_use]
pub mod arch;

pub mod api;
pub mod config;
pub mod err;
pub mod fail;
pub mod heap;
pub mod hooks;
pub mod kernel;
pub mod pool;
pub mod sched;
pub mod startup;
pub mod sync;
pub mod thread;
pub mod time;
pub mod timer;

pub use kernel::Kernel;

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared scaffolding for the hosted unit tests: a kernel with a
    //! few runnable threads and a scheduler pass already taken, so
    //! individual tests can get straight to the point.

    use abi::{Priority, ThreadId};

    use crate::thread::StackRef;
    use crate::Kernel;

    pub fn nop_entry(_arg: usize) -> usize {
        0
    }

    /// Fake stack bounds; the hosted arch never dereferences them.
    pub fn stack(i: usize) -> StackRef {
        StackRef {
            base: 0x2000_0000 + i * 0x1000,
            size: 0x1000,
        }
    }

    /// A kernel with one runnable thread per entry of `prios`, plus a
    /// scheduler pass so `current` is the most important of them.
    pub fn kernel_with(prios: &[u8]) -> (Kernel, Vec<ThreadId>) {
        let mut k = Kernel::new();
        let ids = prios
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let (t, _hint) = k
                    .thread_init_and_run(
                        Priority(p),
                        nop_entry,
                        0,
                        stack(i),
                    )
                    .expect("test thread");
                t
            })
            .collect();
        let _ = k.schedule();
        (k, ids)
    }

    /// Advances time and takes a scheduler pass, like one tick of the
    /// real system.
    pub fn tick(k: &mut Kernel) -> ThreadId {
        k.advance_time(1);
        k.schedule()
    }
}
