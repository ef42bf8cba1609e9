// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What happens when the *kernel itself* is broken.
//!
//! Kernel invariant violations (`uassert!`, slice panics, explicit
//! [`die`]) are not application errors: there is nobody sensible to
//! return an error to, and limping on would corrupt thread state. The
//! kernel records the failure where a debugger can find it and parks
//! the CPU.
//!
//! The debugger contract is three words of memory:
//!
//! - `KERNEL_FAILED`: nonzero once the kernel has given up.
//! - `FAIL_REASON_ADDR` / `FAIL_REASON_LEN`: address and length of a
//!   static UTF-8 string naming the reason, or zero if none was
//!   recorded. Two plain words, so a probe doesn't need to know how
//!   Rust lays out `&str`.
//!
//! There is deliberately no formatting here: reasons are static
//! strings, so the failure path can't itself fault in `core::fmt` and
//! costs nothing in flash. (Thread faults don't come through this
//! module at all; they take the termination pipeline in the
//! architecture layer, or park via [`die`] only under the
//! `halt-on-fault` feature.)

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Set exactly once, on the way down. The M-profile targets this
/// kernel supports all have real atomic swap, so no special-casing is
/// needed to make "exactly once" true even for racing failures.
#[no_mangle]
static KERNEL_FAILED: AtomicBool = AtomicBool::new(false);

/// Address of the recorded reason string; zero until a failure.
#[no_mangle]
static FAIL_REASON_ADDR: AtomicUsize = AtomicUsize::new(0);

/// Length of the recorded reason string in bytes.
#[no_mangle]
static FAIL_REASON_LEN: AtomicUsize = AtomicUsize::new(0);

/// Records `reason` for the debugger and parks the CPU. The first
/// failure wins; a failure raised while already failing (say, a panic
/// inside this path) keeps the original reason and just parks.
pub fn die(reason: &'static str) -> ! {
    if !KERNEL_FAILED.swap(true, Ordering::SeqCst) {
        FAIL_REASON_ADDR.store(reason.as_ptr() as usize, Ordering::SeqCst);
        FAIL_REASON_LEN.store(reason.len(), Ordering::SeqCst);
    }
    park()
}

/// Spins forever with interrupts left however they were; the system is
/// wedged on purpose and only a debugger or reset gets it back.
fn park() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
    // The panic message would need core::fmt to capture; the location
    // of the wreck is what a debugger gets from the parked PC and the
    // call stack.
    die("kernel panic")
}
