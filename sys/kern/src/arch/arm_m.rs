// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M / ARMv8-M mainline.
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the kernel tick source. It's a
//! 24-bit down-counter with a programmable reload, which is exactly the
//! "interval" contract the scheduler's tickless logic wants: on every
//! expiry the ISR folds the finished interval into the 64-bit
//! accumulator, and when the scheduler picks a different interval we
//! reprogram the reload, crediting the partial interval that already
//! elapsed so time never goes missing.
//!
//! # Notes on ARM-M interrupts
//!
//! Three service routines matter here:
//!
//! - `SVCall` is used exactly once, to hop from the bring-up code
//!   (thread mode, main stack) into the first thread. Kernel entry
//!   points are ordinary function calls in this system, so SVC is not a
//!   syscall gate.
//! - `SysTick` maintains kernel time and pends the switch.
//! - `PendSV` does every context switch.
//!
//! The split exists for interrupt latency: an ISR that merely wakes a
//! thread shouldn't pay for a full register-file save. Anything that
//! might cause a switch instead sets the PendSV pending bit; PendSV is
//! configured at the lowest priority, so it runs after the ISR (and any
//! tail-chained friends) and performs the full save, scheduler pass,
//! and restore -- possibly into a different thread. This is the
//! standard Cortex-M arrangement; we didn't invent it.
//!
//! All kernel-touching handlers run at one (lowest) priority, so the
//! kernel is never preempted by itself; `with_interrupts_masked` is
//! what thread-level code uses to join that club for a moment.

use core::arch::global_asm;
use core::sync::atomic::{AtomicPtr, Ordering};

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{CYCLES_PER_MICROSECOND, CYCLES_PER_TICK};
use crate::thread::Thread;

#[cfg(not(any(feature = "klog-itm", feature = "klog-semihosting")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR.cast_mut()).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR.cast_mut()).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

/// On ARMvx-M we have to use a global to record the current thread
/// pointer, since we don't have a scratch register. The assembly below
/// relies on the saved-state area sitting at offset 0 of `Thread`.
#[no_mangle]
static CURRENT_THREAD_PTR: AtomicPtr<Thread> =
    AtomicPtr::new(core::ptr::null_mut());

/// ARMvx-M volatile registers that must be saved across context
/// switches.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous!
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,

    #[cfg(feature = "fp-context")]
    s16: u32,
    #[cfg(feature = "fp-context")]
    s17: u32,
    #[cfg(feature = "fp-context")]
    s18: u32,
    #[cfg(feature = "fp-context")]
    s19: u32,
    #[cfg(feature = "fp-context")]
    s20: u32,
    #[cfg(feature = "fp-context")]
    s21: u32,
    #[cfg(feature = "fp-context")]
    s22: u32,
    #[cfg(feature = "fp-context")]
    s23: u32,
    #[cfg(feature = "fp-context")]
    s24: u32,
    #[cfg(feature = "fp-context")]
    s25: u32,
    #[cfg(feature = "fp-context")]
    s26: u32,
    #[cfg(feature = "fp-context")]
    s27: u32,
    #[cfg(feature = "fp-context")]
    s28: u32,
    #[cfg(feature = "fp-context")]
    s29: u32,
    #[cfg(feature = "fp-context")]
    s30: u32,
    #[cfg(feature = "fp-context")]
    s31: u32,
    // NOTE: the above fields must be kept contiguous!
}

impl SavedState {
    pub fn stack_pointer(&self) -> u32 {
        self.psp
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "fp-context")] {
        impl SavedState {
            pub const fn new() -> Self {
                SavedState {
                    r4: 0, r5: 0, r6: 0, r7: 0,
                    r8: 0, r9: 0, r10: 0, r11: 0,
                    psp: 0, exc_return: 0,
                    s16: 0, s17: 0, s18: 0, s19: 0,
                    s20: 0, s21: 0, s22: 0, s23: 0,
                    s24: 0, s25: 0, s26: 0, s27: 0,
                    s28: 0, s29: 0, s30: 0, s31: 0,
                }
            }
        }
    } else {
        impl SavedState {
            pub const fn new() -> Self {
                SavedState {
                    r4: 0, r5: 0, r6: 0, r7: 0,
                    r8: 0, r9: 0, r10: 0, r11: 0,
                    psp: 0, exc_return: 0,
                }
            }
        }
    }
}

/// Stuff the hardware stacks at exception entry whether or not an FPU
/// is present.
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Default)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "fp-context")] {
        /// Extended version for FPU.
        #[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Default)]
        #[repr(C)]
        struct ExtendedExceptionFrame {
            base: BaseExceptionFrame,
            fpu_regs: [u32; 16],
            fpscr: u32,
            reserved: u32,
        }
    } else {
        /// Wee version for non-FPU configurations.
        #[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Default)]
        #[repr(C)]
        struct ExtendedExceptionFrame {
            base: BaseExceptionFrame,
        }
    }
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

#[cfg(feature = "fp-context")]
const INITIAL_FPSCR: u32 = 0;

/// EXC_RETURN choosing "thread mode, process stack, standard frame."
/// We assume TrustZone has not been carved up underneath us.
const EXC_RETURN_CONST: u32 = 0xFFFFFFED;

/// Builds the initial exception frame on `thread`'s stack such that
/// resuming it enters the thread entry trampoline, and (under
/// `stack-monitor`) paints the rest of the stack.
pub fn initialize_frame(thread: &mut Thread) {
    fabricate_frame(thread, thread_entry_trampoline as usize as u32);
}

/// Re-targets `thread` at the termination trampoline; used by kill and
/// the fault path.
pub fn initialize_termination_frame(thread: &mut Thread) {
    fabricate_frame(thread, termination_trampoline as usize as u32);
}

fn fabricate_frame(thread: &mut Thread, pc: u32) {
    let stack = thread.stack();
    // Modern ARMvX-M machines require 8-byte stack alignment.
    let top = stack.top() & !0x7;
    let frame_size = core::mem::size_of::<ExtendedExceptionFrame>();
    uassert!(stack.size >= frame_size + 64);
    let frame_addr = top - frame_size;

    #[cfg(feature = "stack-monitor")]
    paint_stack(stack.base, frame_addr);

    let mut frame = ExtendedExceptionFrame::default();
    frame.base.pc = pc | 1; // for thumb
    frame.base.xpsr = INITIAL_PSR;
    frame.base.lr = 0xFFFF_FFFF; // trap on return, which must not happen
    #[cfg(feature = "fp-context")]
    {
        frame.fpscr = INITIAL_FPSCR;
    }

    // Safety: the frame lands inside the stack region the creator gave
    // us, which the bounds check above established is big enough.
    unsafe {
        core::ptr::write(frame_addr as *mut ExtendedExceptionFrame, frame);
    }

    *thread.save_mut() = SavedState::new();
    thread.save_mut().psp = frame_addr as u32;
    thread.save_mut().exc_return = EXC_RETURN_CONST;
}

#[cfg(feature = "stack-monitor")]
fn paint_stack(base: usize, limit: usize) {
    let mut at = (base + 3) & !0x3;
    while at + 4 <= limit {
        // Safety: still inside the thread's stack region.
        unsafe {
            core::ptr::write(at as *mut u32, crate::config::STACK_PAINT);
        }
        at += 4;
    }
}

/// Bytes of `thread`'s stack that have ever been used, judged by how
/// much paint survives.
#[cfg(feature = "stack-monitor")]
pub fn stack_high_water(thread: &Thread) -> usize {
    let stack = thread.stack();
    let mut at = (stack.base + 3) & !0x3;
    let top = stack.top() & !0x7;
    while at + 4 <= top {
        // Safety: reads within the thread's stack region.
        let w = unsafe { core::ptr::read(at as *const u32) };
        if w != crate::config::STACK_PAINT {
            break;
        }
        at += 4;
    }
    top - at
}

extern "C" fn thread_entry_trampoline() -> ! {
    let (entry, arg) = crate::startup::with_kernel(|k| {
        let t = k.current();
        k.thread(t).entry_point()
    });
    let value = entry(arg);
    crate::api::exit(value)
}

/// Where a killed or faulted thread comes back to life: runs the
/// termination handler and exits with its result.
extern "C" fn termination_trampoline() -> ! {
    let (handler, arg) = crate::startup::with_kernel(|k| {
        let t = k.current();
        k.thread(t).termination_entry()
    });
    let value = handler(arg);
    crate::api::exit(value)
}

/// Runs `f` with interrupts masked; the kernel's critical section
/// primitive for thread-level code.
pub fn with_interrupts_masked<R>(f: impl FnOnce() -> R) -> R {
    cortex_m::interrupt::free(|_| f())
}

/// Requests a context switch after the current handler (or critical
/// section) unwinds.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Short calibrated busy-wait. Safe from any context, including
/// interrupt handlers; doesn't touch the tick machinery at all.
pub fn busy_wait_us(us: u32) {
    cortex_m::asm::delay(us.saturating_mul(CYCLES_PER_MICROSECOND));
}

/// What the idle thread does between interrupts.
pub fn idle_wait() {
    cortex_m::asm::wfi();
}

/// Hands the CPU to `thread` and starts the tick. Called exactly once,
/// from `startup`, with the scheduler already having chosen `thread`.
pub fn start_first_thread(tick_interval: u32, thread: &Thread) -> ! {
    klog!("starting first thread");
    // Set fault/exception priorities: faults high, kernel entry points
    // (SVCall, PendSV, SysTick) at the lowest priority so the kernel
    // never preempts itself.
    //
    // Safety: purely lowering priorities from their reset defaults.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Enable MEMFAULT/BUSFAULT/USGFAULT as distinct from HardFault.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // Usage, Bus, MemManage to highest configurable.
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall, SysTick, PendSV to lowest.
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // Trap on divide-by-zero rather than silently producing zero.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);

        // Park all external interrupts at the kernel's priority too.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let irq_block_count = (icb.ictr.read() as usize & 0xF) + 1;
        for i in 0..irq_block_count * 32 {
            nvic.ipr[i].write(0xFFu8);
        }
    }

    // Program the tick.
    //
    // Safety: safe in practice, unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(tick_interval * CYCLES_PER_TICK - 1);
        syst.cvr.write(0);
        // Enable counter, interrupt, processor clock.
        syst.csr.modify(|v| v | 0b111);
    }

    CURRENT_THREAD_PTR.store(thread as *const _ as *mut _, Ordering::Relaxed);

    // Safety: setting the process stack pointer has no effect while we
    // run on the main stack, which we do until the SVC below.
    unsafe {
        cortex_m::register::psp::write(thread.save().stack_pointer());
    }

    // Flip into handler mode via SVC so the return drops us into the
    // thread with the frame fabricated above. The SVCall handler
    // detects the from-main-stack case and performs the startup return.
    unsafe {
        core::arch::asm!(
            "
            @ Restore callee-save registers from the first thread.
            ldm {thread}, {{r4-r11}}
            @ Trap into the kernel.
            svc #0xFF
            @ noreturn generates a UDF here in case that should return.
            ",
            thread = in(reg) thread.save() as *const SavedState,
            options(noreturn),
        )
    }
}

// Handler for the SVC instruction. Only the startup hop is expected;
// anything else is a bug, since kernel services are plain calls here.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Thread mode + main stack means the kernel startup routine.
        cmp r0, #0x8
        beq 1f
        bl unexpected_svcall
    1:  @ Starting the first thread: return into thread mode on the
        @ process stack.
        mov lr, {exc_return}
        bx lr
    ",
    exc_return = const EXC_RETURN_CONST,
}

#[no_mangle]
extern "C" fn unexpected_svcall() {
    panic!("unexpected SVC");
}

/// Handler that gets linked into the vector table for the System Tick
/// Timer interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::startup::with_kernel(|k| {
        k.tick();
    });
    // The scheduler pass (timeout drain included) happens in PendSV,
    // which tail-chains after us.
    pend_context_switch();
}

cfg_if::cfg_if! {
    if #[cfg(feature = "fp-context")] {
        global_asm! {"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                @ Store volatile state into the current thread.
                movw r0, #:lower16:CURRENT_THREAD_PTR
                movt r0, #:upper16:CURRENT_THREAD_PTR
                ldr r1, [r0]
                mrs r12, PSP
                stm r1!, {{r4-r12, lr}}
                vstm r1, {{s16-s31}}

                bl pendsv_entry

                @ We're returning into *some* thread, maybe another one.
                movw r0, #:lower16:CURRENT_THREAD_PTR
                movt r0, #:upper16:CURRENT_THREAD_PTR
                ldr r0, [r0]
                ldm r0!, {{r4-r12, lr}}
                vldm r0, {{s16-s31}}
                msr PSP, r12
                bx lr
            ",
        }
    } else {
        global_asm! {"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                @ Store volatile state into the current thread.
                movw r0, #:lower16:CURRENT_THREAD_PTR
                movt r0, #:upper16:CURRENT_THREAD_PTR
                ldr r1, [r0]
                mrs r12, PSP
                stm r1!, {{r4-r12, lr}}

                bl pendsv_entry

                @ We're returning into *some* thread, maybe another one.
                movw r0, #:lower16:CURRENT_THREAD_PTR
                movt r0, #:upper16:CURRENT_THREAD_PTR
                ldr r0, [r0]
                ldm r0!, {{r4-r12, lr}}
                msr PSP, r12
                bx lr
            ",
        }
    }
}

/// The Rust side of the PendSV handler, after all volatile registers
/// have been saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    crate::startup::with_kernel(|k| {
        let before = k.tick_interval();
        let next = k.schedule();
        let after = k.tick_interval();
        if after != before {
            reprogram_tick(k, after);
        }
        let thread = &k.threads[next.index()] as *const Thread;
        CURRENT_THREAD_PTR.store(thread.cast_mut(), Ordering::Relaxed);
    });
}

/// Atomically (under the kernel mask) retargets the tick for a new
/// interval, crediting whatever part of the old interval already
/// elapsed so the accumulator never loses time.
fn reprogram_tick(k: &mut crate::Kernel, interval: u32) {
    // Safety: register pokes with no memory-safety consequences.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // If the counter wrapped since the last ISR, leave accounting
        // to the pending SysTick; folding here would double-count.
        let wrapped = syst.csr.read() & (1 << 16) != 0;
        if !wrapped {
            let reload = syst.rvr.read();
            let cvr = syst.cvr.read();
            let elapsed_ticks = (reload + 1 - cvr) / CYCLES_PER_TICK;
            k.advance_time(u64::from(elapsed_ticks));
        }
        syst.rvr.write(interval * CYCLES_PER_TICK - 1);
        syst.cvr.write(0);
    }
}

// Faults: save context like PendSV would, let the kernel apply the
// fault policy (terminate the offending thread, or halt), and restore
// into whatever thread is current afterwards.
global_asm! {"
    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    configurable_fault:
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r1, [r0]
        mrs r12, PSP
        stm r1!, {{r4-r12, lr}}

        bl fault_entry

        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]
        ldm r0!, {{r4-r12, lr}}
        msr PSP, r12
        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        b configurable_fault
    ",
}

/// Applies the build-time fault policy to the current thread.
#[no_mangle]
unsafe extern "C" fn fault_entry() {
    if cfg!(feature = "halt-on-fault") {
        crate::fail::die("thread fault");
    }
    crate::startup::with_kernel(|k| {
        let t = k.current();
        klog!("fault in thread {}", t.0);
        // Converts the fault to termination: the thread restarts into
        // its termination handler with the termination argument as its
        // eventual exit status.
        let _ = k.thread_kill(t);
        let next = k.schedule();
        let thread = &k.threads[next.index()] as *const Thread;
        CURRENT_THREAD_PTR.store(thread.cast_mut(), Ordering::Relaxed);
    });
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn DefaultHandler() {
    panic!("unexpected interrupt");
}
