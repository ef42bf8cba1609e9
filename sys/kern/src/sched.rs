// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! [`Kernel::schedule`] is the single entry point, invoked from the
//! pendable trap after the architecture glue has saved the outgoing
//! thread's registers. In order it:
//!
//! 1. drains the timeout queue (expired sleepers become runnable with a
//!    timeout status; expired software timers run their callbacks right
//!    here, in interrupt context);
//! 2. commits a pending block announced by the outgoing thread --
//!    inserting it into the object's waiter list and, with a finite
//!    deadline, the timeout queue -- unless the wait condition was
//!    satisfied in the window since the announcement, in which case the
//!    thread stays runnable (this closes the classic lost-wakeup race
//!    against interrupt-context posts);
//! 3. picks the head of the most important nonempty ready queue and
//!    rotates that queue for round-robin;
//! 4. chooses the next tick interval -- short while round-robin has
//!    company, otherwise stretched out to the next timeout deadline or
//!    the hardware maximum -- so an idle system sleeps through tickless
//!    stretches;
//! 5. records the choice for the tick driver and broadcasts the
//!    scheduler-exit event.
//!
//! The trap glue then restores the incoming thread from its saved
//! state.

use abi::{ThreadId, ThreadState, Wake, WaitRef};

use crate::config::{
    MAX_THREADS, MAX_TICK_INTERVAL, NUM_PRIORITIES, ROUND_ROBIN_INTERVAL,
};
use crate::hooks::Event;
use crate::kernel::{ready_head, Kernel, TMO_HEAD};

impl Kernel {
    /// Full scheduler pass; returns the thread to dispatch. The caller
    /// (trap glue or hosted harness) has already saved the outgoing
    /// context and will restore the returned thread's.
    pub fn schedule(&mut self) -> ThreadId {
        self.drain_timeouts();
        self.commit_pending_block();
        let next = self.select();
        self.choose_interval(next);
        self.current = next;
        self.hooks.broadcast(Event::SchedulerExit);
        next
    }

    /// Advances the tick accumulator; called by the tick interrupt with
    /// the interval that just expired, and by the mid-interval time
    /// reader with partial elapsed ticks.
    pub fn advance_time(&mut self, ticks: u64) -> u64 {
        self.clock.ticks += ticks;
        self.clock.ticks
    }

    /// Tick-interrupt half of the scheduler: account for the elapsed
    /// interval and let event hooks observe the tick. The interrupt
    /// then pends the context-switch trap, which runs [`Kernel::schedule`].
    pub fn tick(&mut self) -> u64 {
        let now = self.advance_time(u64::from(self.clock.interval));
        self.hooks.broadcast(Event::Tick);
        now
    }

    /// Makes every expired timeout-queue entry happen: threads wake
    /// with a timeout status, timers fire their callbacks here in
    /// interrupt context.
    pub(crate) fn drain_timeouts(&mut self) {
        let now = self.clock.ticks;
        while let Some(node) = linkq::first(&self.tmo_links[..], TMO_HEAD) {
            if self.tmo_deadline(node) > now {
                break;
            }
            self.tmo_unlink(node);
            if (node as usize) < MAX_THREADS {
                // Waking a thread here can't preempt anyone by itself;
                // the select pass below decides who runs.
                let _ = self.wake_thread(ThreadId(node as u16), Wake::Timeout);
            } else {
                self.fire_timer(node as usize - MAX_THREADS);
            }
        }
    }

    /// Commits the outgoing thread's announced wait, unless the wait is
    /// already over.
    fn commit_pending_block(&mut self) {
        let Some(t) = self.pending_block.take() else {
            return;
        };
        let ThreadState::Blocked(w) = self.threads[t.index()].state else {
            // The announcement was overtaken by a kill.
            return;
        };

        // Re-check the condition: an interrupt may have satisfied it
        // between the announcement and this commit, without finding the
        // thread on any waiter list.
        match w {
            WaitRef::Sem(s) => {
                let sem = &mut self.sems[s.index()];
                if sem.value > 0 {
                    sem.value -= 1;
                    let _ = self.wake_thread(t, Wake::Normal);
                    return;
                }
            }
            WaitRef::Signal(s) => {
                let mask = self.threads[t.index()].wait_mask;
                let sem = &mut self.sems[s.index()];
                let taken = sem.value & mask;
                if taken != 0 {
                    sem.value &= !taken;
                    self.threads[t.index()].sig_taken = taken;
                    let _ = self.wake_thread(t, Wake::Normal);
                    return;
                }
            }
            WaitRef::Mutex(m) => {
                // The owner can only vanish in this window by being
                // killed; don't let the waiter commit to an unowned
                // mutex.
                if self.mutexes[m.index()].owner.is_none() {
                    let mutex = &mut self.mutexes[m.index()];
                    mutex.owner = Some(t);
                    mutex.depth = 1;
                    let _ = self.wake_thread(t, Wake::Normal);
                    return;
                }
            }
            WaitRef::Join(target) => {
                if self.threads[target.index()].state == ThreadState::Stopped
                {
                    let _ = self.wake_thread(t, Wake::Normal);
                    return;
                }
            }
            WaitRef::Sleep => {}
        }

        if let Some(head) = self.wait_anchor(w) {
            self.insert_waiter(head, t);
        }
        if self.threads[t.index()].wake_at.is_some() {
            self.tmo_insert(t.0 as u32);
        }
    }

    /// Picks the head of the most important nonempty ready queue and
    /// rotates it to the tail, so repeated entries round-robin through
    /// a band.
    fn select(&mut self) -> ThreadId {
        for p in 0..NUM_PRIORITIES {
            let head = ready_head(p);
            if let Some(first) = linkq::first(&self.run_links[..], head) {
                linkq::remove(&mut self.run_links[..], first);
                linkq::insert_before(&mut self.run_links[..], head, first);
                return ThreadId(first as u16);
            }
        }
        // The idle thread never blocks, so this is a kernel bug.
        panic!("no threads runnable")
    }

    /// Decides how long the next tick interval should be and records it
    /// for the tick driver, which reprograms the hardware if it
    /// changed.
    fn choose_interval(&mut self, next: ThreadId) -> u32 {
        let interval = if cfg!(feature = "keep-tick") {
            ROUND_ROBIN_INTERVAL
        } else {
            let p = self.threads[next.index()].effective.0 as usize;
            let head = ready_head(p);
            let company = match linkq::first(&self.run_links[..], head) {
                Some(f) => linkq::next(&self.run_links[..], f) != head,
                None => false,
            };
            if company {
                // Round-robin needs the tick to keep coming.
                ROUND_ROBIN_INTERVAL
            } else if let Some(node) =
                linkq::first(&self.tmo_links[..], TMO_HEAD)
            {
                let remaining =
                    self.tmo_deadline(node).saturating_sub(self.clock.ticks);
                remaining.clamp(1, u64::from(MAX_TICK_INTERVAL)) as u32
            } else {
                // Nothing to wait for; stretch out to the overflow-safe
                // maximum.
                MAX_TICK_INTERVAL
            }
        };
        self.clock.interval = interval;
        interval
    }

    /// Explicit yield: the current thread keeps its ready-queue
    /// membership and simply asks for a scheduler pass, which rotates
    /// its band.
    pub fn yield_now(&mut self) -> crate::err::NextThread {
        crate::err::NextThread::Other
    }

    /// Announces a pure timed sleep for the current thread, `ticks`
    /// long. The caller must then enter the scheduler; the wake arrives
    /// with timeout status, which for a sleep is its success case.
    pub fn sleep_prepare(&mut self, ticks: u64) {
        let dl = self.deadline_in(ticks);
        self.block_current(WaitRef::Sleep, Some(dl));
    }
}

#[cfg(test)]
mod tests {
    use abi::{Wake, WaitRef};

    use crate::test_support::{kernel_with, tick};

    #[test]
    fn most_important_nonempty_band_wins() {
        let (k, t) = kernel_with(&[2, 1, 3]);
        assert_eq!(k.current(), t[1]);
    }

    #[test]
    fn equal_priorities_round_robin() {
        let (mut k, t) = kernel_with(&[1, 1]);
        let first = k.current();
        let second = tick(&mut k);
        let third = tick(&mut k);
        assert_ne!(first, second);
        assert_eq!(third, first);
        assert!(t.contains(&second));
    }

    #[test]
    fn sleeper_wakes_at_deadline_with_timeout_status() {
        let (mut k, t) = kernel_with(&[1, 7]);
        assert_eq!(k.current(), t[0]);
        let dl = k.deadline_in(3);
        k.block_current(WaitRef::Sleep, Some(dl));
        assert_eq!(k.schedule(), t[1]);
        k.advance_time(2);
        assert_eq!(k.schedule(), t[1], "woke early");
        k.advance_time(1);
        assert_eq!(k.schedule(), t[0]);
        assert_eq!(k.thread(t[0]).last_wake(), Wake::Timeout);
    }

    #[test]
    fn interval_stretches_when_idle() {
        let (mut k, _t) = kernel_with(&[1]);
        let _ = k.schedule();
        assert_eq!(k.tick_interval(), crate::config::MAX_TICK_INTERVAL);
    }

    #[test]
    fn interval_tracks_timeout_head() {
        let (mut k, t) = kernel_with(&[1, 7]);
        let dl = k.deadline_in(50);
        k.block_current(WaitRef::Sleep, Some(dl));
        assert_eq!(k.schedule(), t[1]);
        assert_eq!(k.tick_interval(), 50);
        // Mid-interval entries shrink the remaining wait.
        k.advance_time(40);
        let _ = k.schedule();
        assert_eq!(k.tick_interval(), 10);
    }

    #[test]
    fn interval_never_exceeds_the_hardware_maximum() {
        let (mut k, t) = kernel_with(&[1, 7]);
        let dl = k.deadline_in(1_000_000);
        k.block_current(WaitRef::Sleep, Some(dl));
        assert_eq!(k.schedule(), t[1]);
        assert_eq!(k.tick_interval(), crate::config::MAX_TICK_INTERVAL);
    }

    #[test]
    fn interval_short_while_round_robin_live() {
        let (mut k, _t) = kernel_with(&[3, 3]);
        let _ = k.schedule();
        assert_eq!(k.tick_interval(), crate::config::ROUND_ROBIN_INTERVAL);
    }

    #[test]
    fn commit_recheck_absorbs_interrupt_post() {
        let (mut k, t) = kernel_with(&[1, 7]);
        let s = k.sem_create(0).unwrap();
        assert!(!k.sem_wait_prepare(s, None).unwrap());
        // An interrupt posts before the scheduler commits the block.
        let _ = k.sem_post(s).unwrap();
        // The would-be waiter stays runnable and owns the token.
        assert_eq!(k.schedule(), t[0]);
        assert_eq!(k.sem_value(s).unwrap(), 0);
    }

    #[test]
    fn tick_broadcasts_and_accumulates() {
        let (mut k, _t) = kernel_with(&[1]);
        let _ = k.schedule();
        let interval = u64::from(k.tick_interval());
        let before = k.now();
        let after = k.tick();
        assert_eq!(after, before + interval);
    }
}
