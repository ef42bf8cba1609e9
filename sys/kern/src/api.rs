// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The blocking, thread-facing face of the kernel.
//!
//! Everything in this module runs in thread context on the target. The
//! pattern is uniform: enter a critical section, perform the state
//! transition, and if the operation either announced a block or woke
//! somebody more important, pend the context-switch trap on the way
//! out. For a blocked caller, execution resumes here after the wake,
//! and the wake status distinguishes success from timeout.
//!
//! Interrupt handlers must stick to the operations documented ISR-safe
//! ([`sem_post`], [`signal_raise`], [`queue_try_send`],
//! [`queue_try_recv`], the try-variants generally, and
//! [`busy_wait_us`]); everything else may suspend and is thread-only.
//!
//! Hosted builds compile this module but cannot actually suspend --
//! the architecture stand-in has no trap -- so hosted tests drive the
//! kernel state machine directly instead.

use core::ptr::NonNull;

use abi::{KernelError, MutexId, Priority, QueueId, SemId, ThreadId, Wake};

use crate::err::{NextThread, Result};
use crate::startup::with_kernel;
use crate::thread::{Entry, StackRef};

pub use crate::arch::busy_wait_us;
pub use crate::thread::get_unique_id;

fn switch(hint: NextThread) {
    if hint.must_switch() {
        crate::arch::pend_context_switch();
    }
}

/// Why the current thread last woke. Valid right after a resume.
fn current_wake() -> Wake {
    with_kernel(|k| k.thread(k.current()).last_wake())
}

/// Suspends until the wake committed by the last announce arrives, then
/// reports it. On hardware the pend takes effect the instant interrupts
/// unmask, so the "loop" is a single suspension.
fn block_here() -> Wake {
    crate::arch::pend_context_switch();
    current_wake()
}

// -- scheduling ------------------------------------------------------

/// Hands the rest of the time slice to the next thread of equal
/// priority, if any.
pub fn yield_now() {
    let hint = with_kernel(|k| k.yield_now());
    switch(hint);
}

/// Suspends the calling thread for `ticks` kernel ticks.
pub fn delay(ticks: u64) {
    with_kernel(|k| k.sleep_prepare(ticks));
    // Waking at the deadline is this wait's success case.
    let _ = block_here();
}

/// Current kernel time in ticks.
pub fn now() -> u64 {
    with_kernel(|k| k.now())
}

// -- threads ---------------------------------------------------------

/// Creates and starts a thread on caller-provided stack memory.
pub fn spawn(
    pri: Priority,
    entry: Entry,
    arg: usize,
    stack: &'static mut [u8],
) -> Result<ThreadId> {
    let stack = StackRef {
        base: stack.as_mut_ptr() as usize,
        size: stack.len(),
    };
    let (t, hint) =
        with_kernel(|k| k.thread_init_and_run(pri, entry, arg, stack))?;
    switch(hint);
    Ok(t)
}

/// Creates and starts a thread whose stack comes from the kernel heap.
/// The thread slot and stack are reclaimed when the last reference
/// drops ([`dec_ref`]) after the thread stops.
pub fn spawn_dyn(
    pri: Priority,
    entry: Entry,
    arg: usize,
    stack_size: usize,
) -> Result<ThreadId> {
    let p = heap_alloc(stack_size).ok_or(KernelError::Exhausted)?;
    let stack = StackRef {
        base: p.as_ptr() as usize,
        size: stack_size,
    };
    let spawned = with_kernel(|k| {
        let (t, hint) = k.thread_init_and_run(pri, entry, arg, stack)?;
        k.mark_heap_stack(t)?;
        Ok((t, hint))
    });
    match spawned {
        Ok((t, hint)) => {
            switch(hint);
            Ok(t)
        }
        Err(e) => {
            heap_free(Some(p));
            Err(e)
        }
    }
}

/// Terminates the calling thread with `value` as its exit value.
pub fn exit(value: usize) -> ! {
    let hint = with_kernel(|k| k.thread_exit(value));
    let _ = hint; // stopping always forces a switch
    crate::arch::pend_context_switch();
    // Not reached on hardware: the pending trap fires as soon as the
    // mask drops and never restores this context.
    loop {
        crate::arch::idle_wait();
    }
}

/// Asks `t` to stop; cooperative, observed via [`is_stop_requested`].
pub fn request_stop(t: ThreadId) -> Result<()> {
    with_kernel(|k| k.request_stop(t))
}

/// Whether someone asked the calling thread to stop.
pub fn is_stop_requested() -> bool {
    with_kernel(|k| {
        let t = k.current();
        k.is_stop_requested(t)
    })
}

/// Forcibly terminates `t` (see [`crate::Kernel::thread_kill`]). A
/// self-kill does not return.
pub fn kill(t: ThreadId) -> Result<()> {
    let hint = with_kernel(|k| k.thread_kill(t))?;
    switch(hint);
    Ok(())
}

/// Blocks until `t` stops and returns its exit value.
pub fn wait_for_stop(t: ThreadId) -> Result<usize> {
    wait_for_stop_inner(t, None)
}

/// Timeout variant of [`wait_for_stop`].
pub fn wait_for_stop_or_timeout(t: ThreadId, ticks: u64) -> Result<usize> {
    let dl = with_kernel(|k| k.deadline_in(ticks));
    wait_for_stop_inner(t, Some(dl))
}

fn wait_for_stop_inner(t: ThreadId, deadline: Option<u64>) -> Result<usize> {
    if let Some(v) = with_kernel(|k| k.join_prepare(t, deadline))? {
        return Ok(v);
    }
    match block_here() {
        Wake::Timeout => Err(KernelError::Timeout),
        _ => Ok(with_kernel(|k| k.thread(t).exit_value())),
    }
}

/// Changes `t`'s nominal priority.
pub fn change_priority(t: ThreadId, pri: Priority) -> Result<()> {
    let hint = with_kernel(|k| k.change_priority(t, pri))?;
    switch(hint);
    Ok(())
}

/// Installs a termination handler and argument for `t`.
pub fn set_termination(
    t: ThreadId,
    handler: Option<Entry>,
    arg: usize,
) -> Result<()> {
    with_kernel(|k| k.set_termination(t, handler, arg))
}

/// Takes an extra reference on `t`.
pub fn add_ref(t: ThreadId) -> Result<()> {
    with_kernel(|k| k.thread_add_ref(t))
}

/// Drops a reference on `t`, returning its heap stack if this was the
/// last one.
pub fn dec_ref(t: ThreadId) -> Result<()> {
    let stack = with_kernel(|k| k.thread_dec_ref(t))?;
    if let Some(s) = stack {
        heap_free(NonNull::new(s.base as *mut u8));
    }
    Ok(())
}

// -- thread-local storage --------------------------------------------

/// Stores a value under `key` for the calling thread.
pub fn tls_set(key: u32, value: usize, dtor: Option<fn(usize)>) -> Result<()> {
    with_kernel(|k| {
        let t = k.current();
        k.tls_set(t, key, value, dtor)
    })
}

/// Reads the calling thread's value under `key`.
pub fn tls_get(key: u32) -> Option<usize> {
    with_kernel(|k| {
        let t = k.current();
        k.tls_get(t, key)
    })
}

// -- semaphores ------------------------------------------------------

/// Takes a token, suspending until one is available.
pub fn sem_wait(s: SemId) -> Result<()> {
    sem_wait_inner(s, None)
}

/// Takes a token or times out after `ticks`.
pub fn sem_wait_or_timeout(s: SemId, ticks: u64) -> Result<()> {
    let dl = with_kernel(|k| k.deadline_in(ticks));
    sem_wait_inner(s, Some(dl))
}

fn sem_wait_inner(s: SemId, deadline: Option<u64>) -> Result<()> {
    if with_kernel(|k| k.sem_wait_prepare(s, deadline))? {
        return Ok(());
    }
    match block_here() {
        Wake::Timeout => Err(KernelError::Timeout),
        // A normal wake hands the token over directly.
        _ => Ok(()),
    }
}

/// Takes a token only if one is free. ISR-safe.
pub fn sem_try_wait(s: SemId) -> Result<()> {
    if with_kernel(|k| k.sem_try_wait(s))? {
        Ok(())
    } else {
        Err(KernelError::WouldBlock)
    }
}

/// Releases a token, waking the most important waiter. ISR-safe.
pub fn sem_post(s: SemId) -> Result<()> {
    let hint = with_kernel(|k| k.sem_post(s))?;
    switch(hint);
    Ok(())
}

// -- signals ---------------------------------------------------------

/// Blocks until any bit in `mask` is raised; consumes and returns the
/// matched bits.
pub fn signal_wait(s: SemId, mask: u32) -> Result<u32> {
    signal_wait_inner(s, mask, None)
}

/// Timeout variant of [`signal_wait`].
pub fn signal_wait_or_timeout(s: SemId, mask: u32, ticks: u64) -> Result<u32> {
    let dl = with_kernel(|k| k.deadline_in(ticks));
    signal_wait_inner(s, mask, Some(dl))
}

fn signal_wait_inner(
    s: SemId,
    mask: u32,
    deadline: Option<u64>,
) -> Result<u32> {
    if let Some(bits) = with_kernel(|k| k.signal_wait_prepare(s, mask, deadline))?
    {
        return Ok(bits);
    }
    match block_here() {
        Wake::Timeout => Err(KernelError::Timeout),
        _ => Ok(with_kernel(|k| {
            let t = k.current();
            k.thread(t).taken_signals()
        })),
    }
}

/// Consumes and returns pending bits in `mask` without blocking.
/// ISR-safe.
pub fn signal_try_wait(s: SemId, mask: u32) -> Result<u32> {
    let bits = with_kernel(|k| k.signal_try_wait(s, mask))?;
    if bits == 0 {
        Err(KernelError::WouldBlock)
    } else {
        Ok(bits)
    }
}

/// Raises bits, waking one matching waiter. ISR-safe.
pub fn signal_raise(s: SemId, flags: u32) -> Result<()> {
    let hint = with_kernel(|k| k.signal_raise(s, flags))?;
    switch(hint);
    Ok(())
}

// -- queues ----------------------------------------------------------

/// Sends `value`, suspending while the queue is full.
pub fn queue_send(q: QueueId, value: usize) -> Result<()> {
    let free = with_kernel(|k| k.queue_free_sem(q))?;
    sem_wait(free)?;
    let hint = with_kernel(|k| k.queue_send_commit(q, value));
    switch(hint);
    Ok(())
}

/// Timeout variant of [`queue_send`].
pub fn queue_send_or_timeout(
    q: QueueId,
    value: usize,
    ticks: u64,
) -> Result<()> {
    let free = with_kernel(|k| k.queue_free_sem(q))?;
    sem_wait_or_timeout(free, ticks)?;
    let hint = with_kernel(|k| k.queue_send_commit(q, value));
    switch(hint);
    Ok(())
}

/// Non-blocking send. ISR-safe.
pub fn queue_try_send(q: QueueId, value: usize) -> Result<()> {
    let hint = with_kernel(|k| k.queue_try_send(q, value))?;
    switch(hint);
    Ok(())
}

/// Receives an element, suspending while the queue is empty.
pub fn queue_recv(q: QueueId) -> Result<usize> {
    let used = with_kernel(|k| k.queue_used_sem(q))?;
    sem_wait(used)?;
    let (value, hint) = with_kernel(|k| k.queue_recv_commit(q));
    switch(hint);
    Ok(value)
}

/// Timeout variant of [`queue_recv`].
pub fn queue_recv_or_timeout(q: QueueId, ticks: u64) -> Result<usize> {
    let used = with_kernel(|k| k.queue_used_sem(q))?;
    sem_wait_or_timeout(used, ticks)?;
    let (value, hint) = with_kernel(|k| k.queue_recv_commit(q));
    switch(hint);
    Ok(value)
}

/// Non-blocking receive. ISR-safe.
pub fn queue_try_recv(q: QueueId) -> Result<usize> {
    let (value, hint) = with_kernel(|k| k.queue_try_recv(q))?;
    switch(hint);
    Ok(value)
}

/// Blocks until any queue bound to `sig` is nonempty; returns the
/// channel index of one of them.
pub fn wait_on_multi(sig: SemId) -> Result<u32> {
    loop {
        let flags =
            match with_kernel(|k| k.multi_wait_prepare(sig, None))? {
                Some(f) => f,
                None => match block_here() {
                    Wake::Timeout => return Err(KernelError::Timeout),
                    _ => with_kernel(|k| {
                        let t = k.current();
                        k.thread(t).taken_signals()
                    }),
                },
            };
        if let Some(ch) = with_kernel(|k| k.multi_resolve(sig, flags))? {
            return Ok(ch);
        }
        // Every flagged queue was already drained; wait again.
    }
}

/// Timeout variant of [`wait_on_multi`]. The deadline covers the whole
/// wait, including retries after stale flags.
pub fn wait_on_multi_or_timeout(sig: SemId, ticks: u64) -> Result<u32> {
    let dl = with_kernel(|k| k.deadline_in(ticks));
    loop {
        let flags =
            match with_kernel(|k| k.multi_wait_prepare(sig, Some(dl)))? {
                Some(f) => f,
                None => match block_here() {
                    Wake::Timeout => return Err(KernelError::Timeout),
                    _ => with_kernel(|k| {
                        let t = k.current();
                        k.thread(t).taken_signals()
                    }),
                },
            };
        if let Some(ch) = with_kernel(|k| k.multi_resolve(sig, flags))? {
            return Ok(ch);
        }
    }
}

/// Tells the kernel the caller saw `channel` flagged but chose not to
/// receive from it, so the stale flag won't wake anyone again.
pub fn clear_channel_flag(sig: SemId, channel: u32) -> Result<()> {
    if channel >= 32 {
        return Err(KernelError::InvalidParam);
    }
    with_kernel(|k| k.signal_clear(sig, 1 << channel))
}

// -- mutexes ---------------------------------------------------------

/// Acquires `m`, suspending while another thread owns it. Re-entrant.
pub fn mutex_lock(m: MutexId) -> Result<()> {
    if with_kernel(|k| k.mutex_lock_prepare(m))? {
        return Ok(());
    }
    // Ownership is transferred to us by the unlock that wakes us.
    let _ = block_here();
    Ok(())
}

/// Acquires `m` only if free or already ours.
pub fn mutex_try_lock(m: MutexId) -> Result<()> {
    if with_kernel(|k| k.mutex_try_lock(m))? {
        Ok(())
    } else {
        Err(KernelError::WouldBlock)
    }
}

/// Releases one level of `m`.
pub fn mutex_unlock(m: MutexId) -> Result<()> {
    let hint = with_kernel(|k| k.mutex_unlock(m))?;
    switch(hint);
    Ok(())
}

/// Termination-handler form: drops `m` entirely if the caller owns it.
pub fn mutex_restore(m: MutexId) -> Result<()> {
    let hint = with_kernel(|k| k.mutex_restore(m))?;
    switch(hint);
    Ok(())
}

// -- heap and pools --------------------------------------------------

/// Runs `f` with the system heap, bracketed by the heap mutex.
fn with_locked_heap<R>(
    f: impl FnOnce(&mut crate::heap::KernelHeap) -> R,
) -> R {
    // Reading the mutex id unlocked is fine: it's written once during
    // bring-up, before any contention can exist.
    let m = unsafe { crate::heap::with_heap(|h| h.mutex()) };
    if let Some(m) = m {
        let _ = mutex_lock(m);
    }
    // Safety: we hold the heap mutex (or are pre-scheduler).
    let r = unsafe { crate::heap::with_heap(f) };
    if let Some(m) = m {
        let _ = mutex_unlock(m);
    }
    r
}

/// Allocates from the system heap. May suspend on the heap mutex;
/// never blocks for memory -- exhaustion is `None`.
pub fn heap_alloc(size: usize) -> Option<NonNull<u8>> {
    with_locked_heap(|h| h.alloc(size))
}

/// Returns memory to the system heap. Freeing `None` is a no-op.
pub fn heap_free(ptr: Option<NonNull<u8>>) {
    with_locked_heap(|h| h.free(ptr))
}

/// Resizes a system-heap allocation (see
/// [`crate::heap::KernelHeap::realloc`] for the edge conventions).
pub fn heap_realloc(
    ptr: Option<NonNull<u8>>,
    size: usize,
) -> Option<NonNull<u8>> {
    with_locked_heap(|h| h.realloc(ptr, size))
}

/// Adds up to `n` slabs to `pool` from the system heap. Thread context
/// only (takes the heap mutex).
pub fn pool_add_slabs(pool: &mut crate::pool::Pool, n: usize) -> usize {
    with_locked_heap(|h| match h.raw() {
        Some(raw) => pool.add_slabs(raw, n),
        None => 0,
    })
}

/// Returns up to `n` fully-free slabs from `pool` to the system heap.
/// Thread context only.
pub fn pool_reclaim(pool: &mut crate::pool::Pool, n: usize) -> usize {
    with_locked_heap(|h| match h.raw() {
        Some(raw) => pool.free_unallocated_slabs(raw, n),
        None => 0,
    })
}

/// Takes a block from `pool`. ISR-safe: touches only the pool's own
/// blocks, under the interrupt mask.
pub fn pool_alloc(pool: &mut crate::pool::Pool) -> Option<NonNull<u8>> {
    crate::arch::with_interrupts_masked(|| {
        // Safety: masked, single core, and the pool only dereferences
        // bytes inside blocks it owns, so it cannot collide with an
        // allocator operation elsewhere in the region.
        unsafe {
            crate::heap::with_heap(|h| {
                let off = pool.alloc(h.raw()?)?;
                h.ptr_at(off)
            })
        }
    })
}

/// Returns a block to `pool`. ISR-safe.
pub fn pool_free(pool: &mut crate::pool::Pool, ptr: NonNull<u8>) {
    crate::arch::with_interrupts_masked(|| {
        // Safety: as in pool_alloc.
        unsafe {
            crate::heap::with_heap(|h| {
                if let Some(off) = h.offset_at(ptr) {
                    if let Some(raw) = h.raw() {
                        pool.free(raw, off);
                    }
                }
            })
        }
    })
}
