// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of threads.
//!
//! The fields of [`Thread`] are private to the kernel so that the
//! lifecycle invariants hold: a thread is on at most one ready or
//! waiter list, its saved machine state is only meaningful while it
//! isn't executing, and its effective priority never drops below its
//! nominal one.
//!
//! A thread slot moves `Uninit -> Stopped` on init, `Stopped ->
//! Runnable` on run, bounces between `Runnable` and `Blocked(_)` while
//! alive, and lands back in `Stopped` when its entry function returns,
//! it asserts or faults, or it is killed. `Uninit` is reached again
//! only when the last reference to a heap-backed thread is dropped.

use core::sync::atomic::{AtomicU32, Ordering};

use abi::{
    KernelError, Priority, ThreadFlags, ThreadId, ThreadState, Wake, WaitRef,
};

use crate::config::{MAX_THREADS, NUM_PRIORITIES, TLS_SLOTS};
use crate::err::{NextThread, Result};
use crate::kernel::{join_head, Kernel};

/// Thread entry functions take the creation argument and produce the
/// thread's exit value. Termination handlers have the same shape,
/// taking the termination argument instead.
pub type Entry = fn(usize) -> usize;

/// A thread's stack region, by bounds. The kernel doesn't touch the
/// memory itself outside the architecture layer; on the host the base
/// is just a number.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StackRef {
    pub base: usize,
    pub size: usize,
}

impl StackRef {
    pub const fn empty() -> Self {
        StackRef { base: 0, size: 0 }
    }

    /// Top-of-stack address; stacks grow down.
    pub fn top(&self) -> usize {
        self.base + self.size
    }
}

/// Key marking a free TLS slot.
const TLS_EMPTY: u32 = u32::MAX;

/// One thread-local storage entry: an opaque word keyed by a
/// process-wide unique id, with an optional destructor run when the
/// thread ends.
#[derive(Copy, Clone, Debug)]
pub(crate) struct TlsSlot {
    key: u32,
    value: usize,
    dtor: Option<fn(usize)>,
}

impl TlsSlot {
    const EMPTY: TlsSlot = TlsSlot {
        key: TLS_EMPTY,
        value: 0,
        dtor: None,
    };
}

/// Source of process-wide unique ids, used for TLS keys (and available
/// to applications for their own tagging needs). Monotonic, never
/// recycled.
static NEXT_UNIQUE_ID: AtomicU32 = AtomicU32::new(1);

/// Returns a fresh process-wide unique integer.
pub fn get_unique_id() -> u32 {
    NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Internal representation of a thread.
#[repr(C)] // so location of SavedState is predictable
#[derive(Debug)]
pub struct Thread {
    /// Saved machine state; valid only while the thread isn't the one
    /// executing.
    // NOTE: it is critical that this field appear first! The context
    // switch assembly finds it at offset zero of the thread pointer.
    pub(crate) save: crate::arch::SavedState,
    /// Priority assigned by the creator.
    pub(crate) nominal: Priority,
    /// Priority used for scheduling; may be raised above nominal by
    /// priority inheritance while the thread holds contended mutexes.
    pub(crate) effective: Priority,
    pub(crate) state: ThreadState,
    /// Why the last wait ended; read by the operation that blocked.
    pub(crate) wake: Wake,
    /// Deadline of the wait in progress, if it has one.
    pub(crate) wake_at: Option<u64>,
    /// Signal bits this thread is waiting for (valid while blocked on a
    /// signal wait).
    pub(crate) wait_mask: u32,
    /// Signal bits handed over by the raise that woke this thread.
    pub(crate) sig_taken: u32,
    pub(crate) flags: ThreadFlags,
    pub(crate) entry: Option<Entry>,
    pub(crate) arg: usize,
    /// Termination handler; `None` means the default (return the
    /// termination argument).
    pub(crate) term_fn: Option<Entry>,
    pub(crate) term_arg: usize,
    pub(crate) exit_value: usize,
    /// Reference count; meaningful for heap-backed threads, whose slot
    /// and stack are reclaimed when it reaches zero.
    pub(crate) refs: u32,
    pub(crate) stack: StackRef,
    pub(crate) tls: [TlsSlot; TLS_SLOTS],
}

impl Thread {
    pub const fn new() -> Self {
        Thread {
            save: crate::arch::SavedState::new(),
            nominal: Priority(0),
            effective: Priority(0),
            state: ThreadState::Uninit,
            wake: Wake::Normal,
            wake_at: None,
            wait_mask: 0,
            sig_taken: 0,
            flags: ThreadFlags::empty(),
            entry: None,
            arg: 0,
            term_fn: None,
            term_arg: 0,
            exit_value: 0,
            refs: 0,
            stack: StackRef::empty(),
            tls: [TlsSlot::EMPTY; TLS_SLOTS],
        }
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn priority(&self) -> Priority {
        self.nominal
    }

    pub fn effective_priority(&self) -> Priority {
        self.effective
    }

    pub fn exit_value(&self) -> usize {
        self.exit_value
    }

    /// Why the last wait ended. Operations that block consult this
    /// after being resumed.
    pub fn last_wake(&self) -> Wake {
        self.wake
    }

    /// Signal bits consumed on this thread's behalf by the raise that
    /// woke it.
    pub fn taken_signals(&self) -> u32 {
        self.sig_taken
    }

    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }

    pub fn stack(&self) -> StackRef {
        self.stack
    }

    pub(crate) fn entry_point(&self) -> (Entry, usize) {
        match self.entry {
            Some(e) => (e, self.arg),
            None => panic!("dispatching uninitialized thread"),
        }
    }

    /// Whether this thread's next dispatch must enter its termination
    /// handler. Consumed by the dispatch glue (trap trampoline on
    /// hardware, the harness on the host).
    pub fn is_terminating(&self) -> bool {
        self.flags.contains(ThreadFlags::TERMINATING)
    }

    /// Entry point and argument for the termination pipeline: the
    /// handler if one was installed, else the default no-op that just
    /// returns the termination argument. Public for the same dispatch
    /// glue as [`Thread::is_terminating`].
    pub fn termination_entry(&self) -> (Entry, usize) {
        fn default_handler(arg: usize) -> usize {
            arg
        }
        (self.term_fn.unwrap_or(default_handler), self.term_arg)
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Initializes the thread slot `t` with the given priority, entry
    /// function, argument, and stack, leaving it in `Stopped` (ready to
    /// `thread_run`).
    ///
    /// Re-initializing is allowed only for free or stopped slots; a
    /// runnable or blocked thread is rejected with `InvalidParam`, as
    /// is an out-of-range priority.
    pub fn thread_init_at(
        &mut self,
        t: ThreadId,
        pri: Priority,
        entry: Entry,
        arg: usize,
        stack: StackRef,
    ) -> Result<()> {
        if t.index() >= MAX_THREADS || pri.0 as usize >= NUM_PRIORITIES {
            return Err(KernelError::InvalidParam);
        }
        let thread = &mut self.threads[t.index()];
        match thread.state {
            ThreadState::Uninit => {
                thread.refs = 1;
                thread.flags = ThreadFlags::empty();
            }
            ThreadState::Stopped => {
                // Reuse keeps the reference count and the heap-stack
                // marker; everything else resets.
                thread.flags &= ThreadFlags::HEAP_STACK;
            }
            _ => return Err(KernelError::InvalidParam),
        }
        thread.nominal = pri;
        thread.effective = pri;
        thread.entry = Some(entry);
        thread.arg = arg;
        thread.term_fn = None;
        thread.term_arg = 0;
        thread.exit_value = 0;
        thread.wake = Wake::Normal;
        thread.wake_at = None;
        thread.wait_mask = 0;
        thread.sig_taken = 0;
        thread.stack = stack;
        thread.tls = [TlsSlot::EMPTY; TLS_SLOTS];
        thread.state = ThreadState::Stopped;
        crate::arch::initialize_frame(thread);
        Ok(())
    }

    /// Claims a free thread slot and initializes it.
    pub fn thread_init(
        &mut self,
        pri: Priority,
        entry: Entry,
        arg: usize,
        stack: StackRef,
    ) -> Result<ThreadId> {
        let slot = self
            .threads
            .iter()
            .position(|th| th.state == ThreadState::Uninit)
            .ok_or(KernelError::Exhausted)?;
        let t = ThreadId(slot as u16);
        self.thread_init_at(t, pri, entry, arg, stack)?;
        Ok(t)
    }

    /// Makes a stopped thread runnable.
    pub fn thread_run(&mut self, t: ThreadId) -> Result<NextThread> {
        if !self.thread_live(t)
            || self.threads[t.index()].state != ThreadState::Stopped
            || self.threads[t.index()].flags.contains(ThreadFlags::EXITED)
        {
            return Err(KernelError::InvalidParam);
        }
        self.threads[t.index()].state = ThreadState::Runnable;
        self.ready_insert(t);
        Ok(self.preempt_hint(t))
    }

    /// `thread_init` immediately followed by `thread_run`.
    pub fn thread_init_and_run(
        &mut self,
        pri: Priority,
        entry: Entry,
        arg: usize,
        stack: StackRef,
    ) -> Result<(ThreadId, NextThread)> {
        let t = self.thread_init(pri, entry, arg, stack)?;
        let hint = self.thread_run(t)?;
        Ok((t, hint))
    }

    /// Installs a termination handler and argument for `t`. The handler
    /// runs (in `t`'s own context) when `t` is killed, asserts, or
    /// faults; its return value becomes `t`'s exit value.
    pub fn set_termination(
        &mut self,
        t: ThreadId,
        handler: Option<Entry>,
        arg: usize,
    ) -> Result<()> {
        if !self.thread_live(t) {
            return Err(KernelError::InvalidParam);
        }
        let thread = &mut self.threads[t.index()];
        thread.term_fn = handler;
        thread.term_arg = arg;
        Ok(())
    }

    /// Terminates the current thread with `value`. Runs TLS
    /// destructors, force-releases any mutexes still held, and wakes
    /// every thread joined on this one. The caller must context-switch
    /// away; this thread's slot no longer schedules.
    pub fn thread_exit(&mut self, value: usize) -> NextThread {
        let t = self.current;
        uassert!(self.thread_live(t));
        self.run_tls_dtors(t);
        let mut hint = self.release_all_owned(t);
        self.run_unlink(t);
        self.tmo_unlink(t.0 as u32);
        if self.pending_block == Some(t) {
            self.pending_block = None;
        }
        let thread = &mut self.threads[t.index()];
        thread.state = ThreadState::Stopped;
        thread.flags |= ThreadFlags::EXITED;
        thread.flags -= ThreadFlags::TERMINATING;
        thread.exit_value = value;
        // Everyone waiting for this thread to stop gets the news.
        while let Some(j) = self.first_waiter(join_head(t.index())) {
            hint = hint.combine(self.wake_thread(j, Wake::Normal));
        }
        hint.combine(NextThread::Other)
    }

    /// Asks `t` to stop, cooperatively. `t` finds out by calling
    /// [`Kernel::is_stop_requested`].
    pub fn request_stop(&mut self, t: ThreadId) -> Result<()> {
        if !self.thread_live(t) {
            return Err(KernelError::InvalidParam);
        }
        self.threads[t.index()].flags |= ThreadFlags::STOP_REQUESTED;
        Ok(())
    }

    pub fn is_stop_requested(&self, t: ThreadId) -> bool {
        self.thread_live(t)
            && self.threads[t.index()]
                .flags
                .contains(ThreadFlags::STOP_REQUESTED)
    }

    /// Forcibly terminates `t`.
    ///
    /// The victim is cleanly removed from every ready, waiter, and
    /// timeout queue it is on, any mutexes it holds are released (with
    /// ownership handed to their head waiters), and it is
    /// re-initialized so that its next dispatch enters its termination
    /// handler. Killing a stopped thread is a no-op; the idle thread
    /// cannot be killed.
    ///
    /// When `t` is the caller itself, control must not return to the
    /// interrupted flow: the caller discharges the hint by entering the
    /// scheduler and is never resumed at the kill site.
    pub fn thread_kill(&mut self, t: ThreadId) -> Result<NextThread> {
        if !self.thread_live(t) || self.idle == Some(t) {
            return Err(KernelError::InvalidParam);
        }
        if self.threads[t.index()].state == ThreadState::Stopped {
            return Ok(NextThread::Same);
        }
        // Release ownerships first: the priority deflation may reshuffle
        // the victim's queue position, and we want to unlink it exactly
        // once, afterwards.
        let mut hint = self.release_all_owned(t);
        self.run_unlink(t);
        self.tmo_unlink(t.0 as u32);
        if self.pending_block == Some(t) {
            self.pending_block = None;
        }
        self.mark_killed(t);
        let thread = &mut self.threads[t.index()];
        thread.state = ThreadState::Runnable;
        thread.wake_at = None;
        crate::arch::initialize_termination_frame(thread);
        self.ready_insert(t);
        hint = hint.combine(self.preempt_hint(t));
        if t == self.current {
            // Self-kill: the caller must not resume.
            hint = hint.combine(NextThread::Other);
        }
        Ok(hint)
    }

    /// First half of waiting for `t` to stop: returns the exit value
    /// right away if `t` is already stopped, otherwise records the
    /// block intent (with optional deadline) and returns `None`. The
    /// resumed caller checks its wake status and reads
    /// [`Thread::exit_value`].
    pub fn join_prepare(
        &mut self,
        t: ThreadId,
        deadline: Option<u64>,
    ) -> Result<Option<usize>> {
        if !self.thread_live(t) || t == self.current {
            return Err(KernelError::InvalidParam);
        }
        if self.threads[t.index()].state == ThreadState::Stopped {
            return Ok(Some(self.threads[t.index()].exit_value));
        }
        self.block_current(WaitRef::Join(t), deadline);
        Ok(None)
    }

    /// Changes `t`'s nominal priority and recomputes everything that
    /// depends on it: its effective priority, its position in whatever
    /// queue holds it, and any priority inheritance flowing through a
    /// mutex it is blocked on.
    pub fn change_priority(
        &mut self,
        t: ThreadId,
        pri: Priority,
    ) -> Result<NextThread> {
        if !self.thread_live(t) || pri.0 as usize >= NUM_PRIORITIES {
            return Err(KernelError::InvalidParam);
        }
        self.threads[t.index()].nominal = pri;
        self.recompute_effective(t);
        self.refresh_inheritance_from(t);
        if t == self.current {
            // Lowering the current thread may mean someone else should
            // run; raising it never does. Let the scheduler sort it out.
            Ok(NextThread::Other)
        } else if self.threads[t.index()].state.is_runnable() {
            Ok(self.preempt_hint(t))
        } else {
            Ok(NextThread::Same)
        }
    }

    // -- reference counting ------------------------------------------

    /// Takes an additional reference on `t`.
    pub fn thread_add_ref(&mut self, t: ThreadId) -> Result<()> {
        if !self.thread_live(t) {
            return Err(KernelError::InvalidParam);
        }
        self.threads[t.index()].refs += 1;
        Ok(())
    }

    /// Drops a reference on `t`. When the last reference to a stopped
    /// heap-backed thread goes away, the slot is freed and the stack
    /// bounds are returned so the caller can release the memory (the
    /// kernel's tables never hold onto a dead stack).
    pub fn thread_dec_ref(&mut self, t: ThreadId) -> Result<Option<StackRef>> {
        if !self.thread_live(t) {
            return Err(KernelError::InvalidParam);
        }
        let thread = &mut self.threads[t.index()];
        uassert!(thread.refs > 0);
        thread.refs -= 1;
        if thread.refs == 0 {
            uassert_eq!(thread.state, ThreadState::Stopped);
            let give_back = if thread.flags.contains(ThreadFlags::HEAP_STACK) {
                Some(thread.stack)
            } else {
                None
            };
            *thread = Thread::new();
            return Ok(give_back);
        }
        Ok(None)
    }

    /// Marks `t`'s stack as heap-backed, so `thread_dec_ref` reports it
    /// for reclamation.
    pub fn mark_heap_stack(&mut self, t: ThreadId) -> Result<()> {
        if !self.thread_live(t) {
            return Err(KernelError::InvalidParam);
        }
        self.threads[t.index()].flags |= ThreadFlags::HEAP_STACK;
        Ok(())
    }

    // -- thread-local storage ----------------------------------------

    /// Stores `value` under `key` for thread `t`, with an optional
    /// destructor run when the thread ends. Overwriting an existing key
    /// replaces value and destructor without running the old one.
    pub fn tls_set(
        &mut self,
        t: ThreadId,
        key: u32,
        value: usize,
        dtor: Option<fn(usize)>,
    ) -> Result<()> {
        if !self.thread_live(t) || key == TLS_EMPTY {
            return Err(KernelError::InvalidParam);
        }
        let tls = &mut self.threads[t.index()].tls;
        let slot = match tls.iter_mut().find(|s| s.key == key) {
            Some(s) => s,
            None => tls
                .iter_mut()
                .find(|s| s.key == TLS_EMPTY)
                .ok_or(KernelError::Exhausted)?,
        };
        *slot = TlsSlot { key, value, dtor };
        Ok(())
    }

    /// Fetches the value stored under `key` for thread `t`.
    pub fn tls_get(&self, t: ThreadId, key: u32) -> Option<usize> {
        if !self.thread_live(t) {
            return None;
        }
        self.threads[t.index()]
            .tls
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value)
    }

    fn run_tls_dtors(&mut self, t: ThreadId) {
        for i in 0..TLS_SLOTS {
            let slot = self.threads[t.index()].tls[i];
            self.threads[t.index()].tls[i] = TlsSlot::EMPTY;
            if slot.key != TLS_EMPTY {
                if let Some(d) = slot.dtor {
                    d(slot.value);
                }
            }
        }
    }

    // -- stack accounting --------------------------------------------

    /// High-water stack usage of `t` in bytes, from the paint pattern
    /// laid down at init.
    #[cfg(feature = "stack-monitor")]
    pub fn stack_usage(&self, t: ThreadId) -> Result<usize> {
        if !self.thread_live(t) {
            return Err(KernelError::InvalidParam);
        }
        Ok(crate::arch::stack_high_water(&self.threads[t.index()]))
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use abi::{KernelError, Priority, ThreadState, Wake};

    use super::*;
    use crate::test_support::{kernel_with, nop_entry, stack};

    #[test]
    fn init_validates_priority_and_slot_state() {
        let (mut k, t) = kernel_with(&[1]);
        assert_eq!(
            k.thread_init(Priority(200), nop_entry, 0, stack(5)),
            Err(KernelError::InvalidParam)
        );
        // Re-initializing the running thread is rejected.
        assert_eq!(
            k.thread_init_at(t[0], Priority(1), nop_entry, 0, stack(5)),
            Err(KernelError::InvalidParam)
        );
    }

    #[test]
    fn unique_ids_are_distinct() {
        let a = get_unique_id();
        let b = get_unique_id();
        assert_ne!(a, b);
    }

    #[test]
    fn exit_stops_and_wakes_joiners_with_value() {
        let (mut k, t) = kernel_with(&[1, 2, 7]);
        // The pri-1 thread joins on the pri-2 thread.
        assert_eq!(k.current(), t[0]);
        assert_eq!(k.join_prepare(t[1], None).unwrap(), None);
        assert_eq!(k.schedule(), t[1]);
        let _ = k.thread_exit(42);
        assert_eq!(*k.thread(t[1]).state(), ThreadState::Stopped);
        assert_eq!(k.schedule(), t[0]);
        assert_eq!(k.thread(t[0]).last_wake(), Wake::Normal);
        assert_eq!(k.thread(t[1]).exit_value(), 42);
        // Joining an already-stopped thread is immediate.
        assert_eq!(k.join_prepare(t[1], None).unwrap(), Some(42));
    }

    #[test]
    fn join_can_time_out() {
        let (mut k, t) = kernel_with(&[1, 2, 7]);
        let dl = k.deadline_in(5);
        assert_eq!(k.join_prepare(t[1], Some(dl)).unwrap(), None);
        assert_eq!(k.schedule(), t[1]);
        k.advance_time(5);
        let _ = k.schedule();
        assert_eq!(k.thread(t[0]).last_wake(), Wake::Timeout);
    }

    #[test]
    fn stop_request_is_cooperative_and_sticky() {
        let (mut k, t) = kernel_with(&[1]);
        assert!(!k.is_stop_requested(t[0]));
        k.request_stop(t[0]).unwrap();
        assert!(k.is_stop_requested(t[0]));
        assert!(k.thread(t[0]).state().is_runnable(), "stop is a flag only");
    }

    #[test]
    fn kill_cleans_timeout_membership() {
        let (mut k, t) = kernel_with(&[1, 7]);
        let dl = k.deadline_in(10);
        k.block_current(abi::WaitRef::Sleep, Some(dl));
        assert_eq!(k.schedule(), t[1]);

        let _ = k.thread_kill(t[0]).unwrap();
        assert!(k.thread(t[0]).state().is_runnable());
        // The old deadline must not produce a second wake.
        k.advance_time(10);
        let _ = k.schedule();
        assert_eq!(k.thread(t[0]).last_wake(), Wake::Killed);
    }

    #[test]
    fn tls_round_trip_and_destructor_on_exit() {
        static DTOR_SUM: AtomicUsize = AtomicUsize::new(0);
        fn dtor(v: usize) {
            DTOR_SUM.fetch_add(v, Ordering::Relaxed);
        }

        let (mut k, t) = kernel_with(&[1, 7]);
        let key = get_unique_id();
        let other = get_unique_id();
        k.tls_set(t[0], key, 17, Some(dtor)).unwrap();
        k.tls_set(t[0], other, 5, None).unwrap();
        assert_eq!(k.tls_get(t[0], key), Some(17));
        assert_eq!(k.tls_get(t[0], other), Some(5));
        assert_eq!(k.tls_get(t[0], 0xFFFF), None);

        // Overwrite replaces without running the destructor.
        k.tls_set(t[0], key, 21, Some(dtor)).unwrap();
        assert_eq!(DTOR_SUM.load(Ordering::Relaxed), 0);

        let _ = k.thread_exit(0);
        assert_eq!(DTOR_SUM.load(Ordering::Relaxed), 21);
        assert_eq!(k.tls_get(t[0], key), None);
    }

    #[test]
    fn tls_slots_exhaust_cleanly() {
        let (mut k, t) = kernel_with(&[1]);
        for i in 0..crate::config::TLS_SLOTS {
            k.tls_set(t[0], 1000 + i as u32, i, None).unwrap();
        }
        assert_eq!(
            k.tls_set(t[0], 9999, 0, None),
            Err(KernelError::Exhausted)
        );
    }

    #[test]
    fn change_priority_moves_between_bands() {
        let (mut k, t) = kernel_with(&[2, 2]);
        let first = k.current();
        let other = if first == t[0] { t[1] } else { t[0] };
        let _ = k.change_priority(other, Priority(1)).unwrap();
        assert_eq!(k.schedule(), other);
        // And back down again.
        let _ = k.change_priority(other, Priority(3)).unwrap();
        assert_eq!(k.schedule(), first);
    }

    #[test]
    fn dec_ref_frees_slot_for_reuse() {
        let (mut k, t) = kernel_with(&[1, 7]);
        // Stop the thread, then drop the only reference.
        assert_eq!(k.current(), t[0]);
        let _ = k.thread_exit(9);
        assert_eq!(k.thread_dec_ref(t[0]).unwrap(), None);
        assert_eq!(*k.thread(t[0]).state(), ThreadState::Uninit);
        // The slot is reclaimable by the next init.
        let fresh = k
            .thread_init(Priority(1), nop_entry, 0, stack(3))
            .unwrap();
        assert_eq!(fresh, t[0]);
    }

    #[test]
    fn dec_ref_reports_heap_stack() {
        let (mut k, t) = kernel_with(&[1, 7]);
        k.mark_heap_stack(t[0]).unwrap();
        let _ = k.thread_exit(0);
        let got = k.thread_dec_ref(t[0]).unwrap();
        assert_eq!(got, Some(stack(0)));
    }

    #[test]
    fn termination_default_handler_returns_argument() {
        let (mut k, t) = kernel_with(&[1]);
        k.set_termination(t[0], None, 55).unwrap();
        let (handler, arg) = k.thread(t[0]).termination_entry();
        assert_eq!(handler(arg), 55);
    }
}
