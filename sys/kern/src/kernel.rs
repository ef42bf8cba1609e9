// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel state container and the list plumbing every subsystem
//! shares.
//!
//! All kernel state lives in one [`Kernel`] value: the thread table,
//! the sync-object tables, the clock, and the two link arenas that hold
//! every list in the system. On hardware there is exactly one `Kernel`,
//! owned by `startup` and only ever touched with interrupts masked; on
//! the host, tests build as many as they like and drive them directly.
//!
//! # Link arenas
//!
//! Two index spaces cover all list memberships:
//!
//! * the *run* space: one link per thread (its ready-queue / waiter-list
//!   membership) followed by the anchors -- per-priority ready-queue
//!   heads, per-mutex and per-semaphore waiter heads, and per-thread
//!   join heads;
//! * the *timeout* space: one link per thread and per software timer,
//!   plus the single sorted timeout queue head.
//!
//! A thread is on at most one run-space list and at most one
//! timeout-space list, which is exactly the invariant the intrusive
//! list primitive enforces by construction.

use abi::{
    Priority, SemId, ThreadFlags, ThreadId, ThreadState, Wake, WaitRef,
};
use linkq::Link;

use crate::config::{
    MAX_MUTEXES, MAX_QUEUES, MAX_SEMS, MAX_THREADS, MAX_TIMERS,
    NUM_PRIORITIES,
};
use crate::err::NextThread;
use crate::hooks::Hooks;
use crate::sync::mutex::Mutex;
use crate::sync::queue::Queue;
use crate::sync::sem::Sem;
use crate::thread::Thread;
use crate::time::Clock;
use crate::timer::KTimer;

/// Run-space size: element links for threads, then the anchors.
pub(crate) const RUN_LINKS: usize =
    MAX_THREADS + NUM_PRIORITIES + MAX_MUTEXES + MAX_SEMS + MAX_THREADS;

/// Timeout-space size: threads, timers, queue head.
pub(crate) const TMO_LINKS: usize = MAX_THREADS + MAX_TIMERS + 1;

/// Head of the single sorted timeout queue.
pub(crate) const TMO_HEAD: u32 = (MAX_THREADS + MAX_TIMERS) as u32;

pub(crate) const fn ready_head(p: usize) -> u32 {
    (MAX_THREADS + p) as u32
}

pub(crate) const fn mutex_head(m: usize) -> u32 {
    (MAX_THREADS + NUM_PRIORITIES + m) as u32
}

pub(crate) const fn sem_head(s: usize) -> u32 {
    (MAX_THREADS + NUM_PRIORITIES + MAX_MUTEXES + s) as u32
}

pub(crate) const fn join_head(t: usize) -> u32 {
    (MAX_THREADS + NUM_PRIORITIES + MAX_MUTEXES + MAX_SEMS + t) as u32
}

pub(crate) const fn timer_node(t: usize) -> u32 {
    (MAX_THREADS + t) as u32
}

/// The whole kernel.
pub struct Kernel {
    pub(crate) threads: [Thread; MAX_THREADS],
    pub(crate) mutexes: [Mutex; MAX_MUTEXES],
    pub(crate) sems: [Sem; MAX_SEMS],
    pub(crate) queues: [Queue; MAX_QUEUES],
    pub(crate) timers: [KTimer; MAX_TIMERS],
    /// Ready-queue / waiter-list links and their anchors.
    pub(crate) run_links: [Link; RUN_LINKS],
    /// Timeout-queue links and head.
    pub(crate) tmo_links: [Link; TMO_LINKS],
    pub(crate) clock: Clock,
    pub(crate) hooks: Hooks,
    /// The thread whose context is (conceptually) on the CPU.
    pub(crate) current: ThreadId,
    /// A thread that has announced a wait but whose queue memberships
    /// haven't been committed yet; consumed at the next scheduler entry.
    pub(crate) pending_block: Option<ThreadId>,
    /// The kernel-created idle thread, once startup has made one. It
    /// never blocks and cannot be killed.
    pub(crate) idle: Option<ThreadId>,
}

impl Kernel {
    pub const fn new() -> Self {
        const THREAD: Thread = Thread::new();
        const MUTEX: Mutex = Mutex::new();
        const SEM: Sem = Sem::new();
        const QUEUE: Queue = Queue::new();
        const TIMER: KTimer = KTimer::new();

        let mut run_links = [Link { prev: 0, next: 0 }; RUN_LINKS];
        let mut i = 0;
        while i < RUN_LINKS {
            run_links[i] = Link::detached(i as u32);
            i += 1;
        }
        let mut tmo_links = [Link { prev: 0, next: 0 }; TMO_LINKS];
        let mut i = 0;
        while i < TMO_LINKS {
            tmo_links[i] = Link::detached(i as u32);
            i += 1;
        }

        Kernel {
            threads: [THREAD; MAX_THREADS],
            mutexes: [MUTEX; MAX_MUTEXES],
            sems: [SEM; MAX_SEMS],
            queues: [QUEUE; MAX_QUEUES],
            timers: [TIMER; MAX_TIMERS],
            run_links,
            tmo_links,
            clock: Clock::new(),
            hooks: Hooks::new(),
            current: ThreadId(0),
            pending_block: None,
            idle: None,
        }
    }

    /// The thread currently on the CPU.
    pub fn current(&self) -> ThreadId {
        self.current
    }

    /// Read access to a thread slot, for inspection.
    pub fn thread(&self, t: ThreadId) -> &Thread {
        &self.threads[t.index()]
    }

    // -- ready queues ------------------------------------------------

    /// Appends `t` to the tail of the ready queue for its effective
    /// priority.
    pub(crate) fn ready_insert(&mut self, t: ThreadId) {
        let p = self.threads[t.index()].effective.0 as usize;
        uassert!(p < NUM_PRIORITIES);
        linkq::insert_before(
            &mut self.run_links[..],
            ready_head(p),
            t.0 as u32,
        );
    }

    /// Detaches `t` from whatever run-space list holds it (ready queue
    /// or waiter list). Harmless if it's on none.
    pub(crate) fn run_unlink(&mut self, t: ThreadId) {
        linkq::remove(&mut self.run_links[..], t.0 as u32);
    }

    // -- waiter lists ------------------------------------------------

    /// Inserts `t` into the waiter list anchored at `head`, keeping the
    /// list sorted most-important-first with FIFO order among equals.
    pub(crate) fn insert_waiter(&mut self, head: u32, t: ThreadId) {
        let pri = self.threads[t.index()].effective;
        let mut at = linkq::next(&self.run_links[..], head);
        while at != head {
            let other = &self.threads[at as usize];
            if pri.is_more_important_than(other.effective) {
                break;
            }
            at = linkq::next(&self.run_links[..], at);
        }
        linkq::insert_before(&mut self.run_links[..], at, t.0 as u32);
    }

    /// Most important waiter on the list anchored at `head`, if any.
    pub(crate) fn first_waiter(&self, head: u32) -> Option<ThreadId> {
        linkq::first(&self.run_links[..], head).map(|ix| ThreadId(ix as u16))
    }

    /// Re-sorts `t` within the waiter list anchored at `head` after an
    /// effective-priority change.
    pub(crate) fn resort_waiter(&mut self, head: u32, t: ThreadId) {
        self.run_unlink(t);
        self.insert_waiter(head, t);
    }

    /// Run-space anchor for whatever `t` is blocked on, if it's the
    /// kind of wait that has a waiter list.
    pub(crate) fn wait_anchor(&self, w: WaitRef) -> Option<u32> {
        match w {
            WaitRef::Sleep => None,
            WaitRef::Mutex(m) => Some(mutex_head(m.index())),
            WaitRef::Sem(s) | WaitRef::Signal(s) => Some(sem_head(s.index())),
            WaitRef::Join(t) => Some(join_head(t.index())),
        }
    }

    // -- blocking and waking -----------------------------------------

    /// Announces that the current thread is entering a wait. The thread
    /// leaves its ready queue immediately; its waiter-list and
    /// timeout-queue memberships are committed at the next scheduler
    /// entry, which re-checks the wait condition to close the window
    /// against interrupt-context wakes.
    pub(crate) fn block_current(
        &mut self,
        w: WaitRef,
        deadline: Option<u64>,
    ) {
        let t = self.current;
        let thread = &mut self.threads[t.index()];
        uassert!(thread.state.is_runnable());
        uassert!(self.pending_block.is_none());
        thread.state = ThreadState::Blocked(w);
        thread.wake = Wake::Normal;
        thread.wake_at = deadline;
        self.run_unlink(t);
        self.pending_block = Some(t);
    }

    /// Takes `t` out of every wait bookkeeping structure and puts it
    /// back on its ready queue, recording why it woke. Returns a
    /// scheduling hint.
    pub(crate) fn wake_thread(&mut self, t: ThreadId, wake: Wake) -> NextThread {
        self.run_unlink(t);
        linkq::remove(&mut self.tmo_links[..], t.0 as u32);
        if self.pending_block == Some(t) {
            self.pending_block = None;
        }
        let thread = &mut self.threads[t.index()];
        thread.state = ThreadState::Runnable;
        thread.wake = wake;
        thread.wake_at = None;
        self.ready_insert(t);
        self.preempt_hint(t)
    }

    /// Whether waking `t` should displace the current thread.
    pub(crate) fn preempt_hint(&self, t: ThreadId) -> NextThread {
        if t == self.current {
            return NextThread::Same;
        }
        let cur = &self.threads[self.current.index()];
        let woken = &self.threads[t.index()];
        // A current thread that is on its way out (blocked or stopping)
        // always yields the CPU.
        if !cur.state.is_runnable()
            || woken.effective.is_more_important_than(cur.effective)
        {
            NextThread::Specific(t)
        } else {
            NextThread::Same
        }
    }

    /// Raises `t`'s effective priority to `pri` (no-op if `t` is
    /// already at least that important) and fixes up whichever queue
    /// position depends on it. Used by priority inheritance.
    pub(crate) fn raise_effective(&mut self, t: ThreadId, pri: Priority) {
        let thread = &mut self.threads[t.index()];
        if !pri.is_more_important_than(thread.effective) {
            return;
        }
        thread.effective = pri;
        self.reposition(t);
    }

    /// Recomputes `t`'s effective priority from its nominal priority
    /// and the waiters of every mutex it still holds, then fixes up its
    /// queue position. Used on unlock and on nominal-priority change.
    pub(crate) fn recompute_effective(&mut self, t: ThreadId) {
        let mut eff = self.threads[t.index()].nominal;
        for (i, m) in self.mutexes.iter().enumerate() {
            if m.owner != Some(t) {
                continue;
            }
            if let Some(w) = linkq::first(&self.run_links[..], mutex_head(i)) {
                let wp = self.threads[w as usize].effective;
                if wp.is_more_important_than(eff) {
                    eff = wp;
                }
            }
        }
        if self.threads[t.index()].effective != eff {
            self.threads[t.index()].effective = eff;
            self.reposition(t);
        }
    }

    /// Moves `t` to the right place after an effective-priority change:
    /// ready threads go to the tail of their new band; blocked threads
    /// get re-sorted in their waiter list.
    pub(crate) fn reposition(&mut self, t: ThreadId) {
        match self.threads[t.index()].state {
            ThreadState::Runnable => {
                if self.pending_block != Some(t) {
                    self.run_unlink(t);
                    self.ready_insert(t);
                }
            }
            ThreadState::Blocked(w) => {
                if let Some(head) = self.wait_anchor(w) {
                    // Only committed waiters are actually on the list;
                    // resort is a no-op for a pending block thanks to
                    // remove() tolerating detached nodes.
                    if linkq::is_linked(&self.run_links[..], t.0 as u32) {
                        self.resort_waiter(head, t);
                    }
                }
            }
            _ => {}
        }
    }

    // -- timeout queue -----------------------------------------------

    /// Deadline for a timeout-space node (thread or timer).
    pub(crate) fn tmo_deadline(&self, node: u32) -> u64 {
        if (node as usize) < MAX_THREADS {
            // Threads in the queue always have a deadline.
            match self.threads[node as usize].wake_at {
                Some(d) => d,
                None => {
                    panic!("thread in timeout queue without deadline")
                }
            }
        } else {
            self.timers[node as usize - MAX_THREADS].deadline
        }
    }

    /// Inserts `node` into the sorted timeout queue, keeping ascending
    /// deadline order with FIFO among equals.
    pub(crate) fn tmo_insert(&mut self, node: u32) {
        let deadline = self.tmo_deadline(node);
        let mut at = linkq::next(&self.tmo_links[..], TMO_HEAD);
        while at != TMO_HEAD {
            if deadline < self.tmo_deadline(at) {
                break;
            }
            at = linkq::next(&self.tmo_links[..], at);
        }
        linkq::insert_before(&mut self.tmo_links[..], at, node);
    }

    /// Detaches a timeout-space node, if linked.
    pub(crate) fn tmo_unlink(&mut self, node: u32) {
        linkq::remove(&mut self.tmo_links[..], node);
    }

    // -- misc --------------------------------------------------------

    /// True if `t`'s slot holds a live (initialized) thread.
    pub(crate) fn thread_live(&self, t: ThreadId) -> bool {
        t.index() < MAX_THREADS
            && self.threads[t.index()].state != ThreadState::Uninit
    }

    /// Marks the wake outcome the termination path uses.
    pub(crate) fn mark_killed(&mut self, t: ThreadId) {
        let thread = &mut self.threads[t.index()];
        thread.wake = Wake::Killed;
        thread.flags |= ThreadFlags::TERMINATING;
    }

    /// Semaphore accessor shared by the sync modules.
    pub(crate) fn sem_checked(&self, s: SemId) -> crate::err::Result<()> {
        if s.index() < MAX_SEMS && self.sems[s.index()].active {
            Ok(())
        } else {
            Err(abi::KernelError::InvalidParam)
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
