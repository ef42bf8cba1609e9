// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The expected bring-up sequence, from the application's reset
//! handler:
//!
//! 1. Do board-level hardware setup (clocks, memories).
//! 2. Create threads and kernel objects through [`with_kernel`] -- the
//!    kernel tables are fully usable before the scheduler starts.
//! 3. Call [`start_kernel`], handing over the heap region if the
//!    application wants one. It does not return: the idle thread is
//!    created, the scheduler picks the most important runnable thread,
//!    and the architecture layer drops into it with the tick running.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use abi::Priority;

use crate::config::{IDLE_STACK_SIZE, NUM_PRIORITIES};
use crate::kernel::Kernel;
use crate::thread::StackRef;

/// The kernel singleton.
///
/// Interior mutability with a hand-rolled `Sync` wrapper: the exclusion
/// mechanism is the interrupt mask (see [`with_kernel`]) plus
/// single-core execution, not a lock.
struct KernelCell(UnsafeCell<Kernel>);

// Safety: all access goes through with_kernel, which masks interrupts,
// and there is one core.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

/// Runs `f` against the kernel with interrupts masked.
///
/// Kernel-invoked callbacks (software timers, event hooks) already hold
/// the `&mut Kernel` they were handed and must use *that*, never call
/// back in here; re-entry would alias the exclusive reference.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    crate::arch::with_interrupts_masked(|| {
        // Safety: interrupts are masked and there is one core, so no
        // other reference can be live (see the callback rule above).
        unsafe { f(&mut *KERNEL.0.get()) }
    })
}

/// Heap region handed to [`start_kernel`].
pub struct HeapRegion {
    pub base: NonNull<u8>,
    pub len: usize,
    pub align: usize,
}

static mut IDLE_STACK: [u8; IDLE_STACK_SIZE] = [0; IDLE_STACK_SIZE];

fn idle_main(_arg: usize) -> usize {
    loop {
        crate::arch::idle_wait();
    }
}

/// Finishes bring-up and hands the CPU to the application's threads.
///
/// # Safety
///
/// Call exactly once per boot, from thread mode on the main stack, with
/// any `heap` region valid, unused, and suitably aligned.
pub unsafe fn start_kernel(heap: Option<HeapRegion>) -> ! {
    klog!("starting: laziness");

    with_kernel(|k| {
        if let Some(r) = heap {
            let m = match k.mutex_create() {
                Ok(m) => m,
                Err(_) => panic!("no mutex slot for heap"),
            };
            // Safety: pre-scheduler, single-threaded; the region is the
            // caller's problem per our own contract.
            unsafe {
                crate::heap::with_heap(|h| {
                    // Safety: same argument as the outer block.
                    unsafe {
                        h.init(r.base, r.len, r.align);
                    }
                    h.set_mutex(m);
                })
            }
        }

        // Safety: taking the address only; the idle thread is the sole
        // user of this memory.
        let base = unsafe { core::ptr::addr_of_mut!(IDLE_STACK) } as usize;
        let stack = StackRef {
            base,
            size: IDLE_STACK_SIZE,
        };
        let idle = match k.thread_init_and_run(
            Priority((NUM_PRIORITIES - 1) as u8),
            idle_main,
            0,
            stack,
        ) {
            Ok((t, _hint)) => t,
            Err(_) => panic!("no thread slot for idle"),
        };
        k.idle = Some(idle);
    });

    klog!("starting: impatience");

    // Run the first scheduler pass on the bring-up stack so the first
    // thread and the first tick interval are chosen before anything
    // executes.
    let (thread, interval) = with_kernel(|k| {
        let first = k.schedule();
        (
            &k.threads[first.index()] as *const crate::thread::Thread,
            k.tick_interval(),
        )
    });

    klog!("starting: moxie");
    // Safety: the pointer targets the kernel's static thread table,
    // which lives forever; nothing mutates it until the first kernel
    // entry, by which point the architecture layer owns the handoff.
    crate::arch::start_first_thread(interval, &*thread)
}
