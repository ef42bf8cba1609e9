// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores and signals.
//!
//! Both personalities share one object: a 32-bit value plus a waiter
//! list. The counting operations treat the value as a count; the signal
//! operations treat it as a bitmask and wake a waiter whose recorded
//! mask intersects the newly-set bits. The value and waiter list are
//! only touched with interrupts masked, which is what makes `sem_post`
//! and `signal_raise` legal from interrupt handlers.
//!
//! A post with waiters present hands the token straight to the most
//! important waiter instead of bumping the value, so there is never a
//! moment where a count exists that a sleeping waiter hasn't been woken
//! for.

use abi::{KernelError, SemId, ThreadId, ThreadState, Wake, WaitRef};

use crate::err::{NextThread, Result};
use crate::kernel::{sem_head, Kernel};

/// Semaphore state. The waiter list lives in the kernel's link arena,
/// anchored per table slot.
#[derive(Debug)]
pub struct Sem {
    pub(crate) value: u32,
    pub(crate) active: bool,
}

impl Sem {
    pub const fn new() -> Self {
        Sem {
            value: 0,
            active: false,
        }
    }
}

impl Kernel {
    /// Claims a semaphore slot with the given initial value.
    pub fn sem_create(&mut self, initial: u32) -> Result<SemId> {
        let slot = self
            .sems
            .iter()
            .position(|s| !s.active)
            .ok_or(KernelError::Exhausted)?;
        self.sems[slot] = Sem {
            value: initial,
            active: true,
        };
        Ok(SemId(slot as u16))
    }

    /// Current value, for inspection. For a signal this is the set of
    /// pending bits.
    pub fn sem_value(&self, s: SemId) -> Result<u32> {
        self.sem_checked(s)?;
        Ok(self.sems[s.index()].value)
    }

    /// Increments the count, or hands the token directly to the most
    /// important counting waiter. ISR-safe.
    pub fn sem_post(&mut self, s: SemId) -> Result<NextThread> {
        self.sem_checked(s)?;
        if let Some(w) = self.first_counting_waiter(s) {
            return Ok(self.wake_thread(w, Wake::Normal));
        }
        let sem = &mut self.sems[s.index()];
        sem.value = sem.value.saturating_add(1);
        Ok(NextThread::Same)
    }

    /// Takes a token if one is available. ISR-safe. Returns whether the
    /// value was decremented.
    pub fn sem_try_wait(&mut self, s: SemId) -> Result<bool> {
        self.sem_checked(s)?;
        let sem = &mut self.sems[s.index()];
        if sem.value > 0 {
            sem.value -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// First half of a blocking wait: takes a token if available
    /// (returns `true`), else announces a block (returns `false`) --
    /// the caller must then enter the scheduler and, once resumed,
    /// consult its wake status for the timeout case.
    pub fn sem_wait_prepare(
        &mut self,
        s: SemId,
        deadline: Option<u64>,
    ) -> Result<bool> {
        if self.sem_try_wait(s)? {
            return Ok(true);
        }
        self.block_current(WaitRef::Sem(s), deadline);
        Ok(false)
    }

    /// ORs `flags` into the value and wakes the most important waiter
    /// whose mask now matches, handing it the matched bits. ISR-safe.
    pub fn signal_raise(&mut self, s: SemId, flags: u32) -> Result<NextThread> {
        self.sem_checked(s)?;
        self.sems[s.index()].value |= flags;
        let value = self.sems[s.index()].value;
        if let Some((w, taken)) = self.first_signal_match(s, value) {
            self.sems[s.index()].value &= !taken;
            self.threads[w.index()].sig_taken = taken;
            return Ok(self.wake_thread(w, Wake::Normal));
        }
        Ok(NextThread::Same)
    }

    /// Atomically consumes and returns `value & mask`. A zero result
    /// means no interesting bits were pending. ISR-safe.
    pub fn signal_try_wait(&mut self, s: SemId, mask: u32) -> Result<u32> {
        self.sem_checked(s)?;
        let sem = &mut self.sems[s.index()];
        let taken = sem.value & mask;
        sem.value &= !taken;
        Ok(taken)
    }

    /// First half of a blocking signal wait: consumes matching bits if
    /// any are pending (`Some(bits)`), else records the mask and
    /// announces a block (`None`). The resumed caller reads
    /// [`crate::thread::Thread::taken_signals`].
    pub fn signal_wait_prepare(
        &mut self,
        s: SemId,
        mask: u32,
        deadline: Option<u64>,
    ) -> Result<Option<u32>> {
        let taken = self.signal_try_wait(s, mask)?;
        if taken != 0 {
            return Ok(Some(taken));
        }
        let t = self.current;
        self.threads[t.index()].wait_mask = mask;
        self.threads[t.index()].sig_taken = 0;
        self.block_current(WaitRef::Signal(s), deadline);
        Ok(None)
    }

    /// Clears bits without consuming them on anyone's behalf. This is
    /// how a multi-queue waiter tells the kernel it observed a channel
    /// and chose not to receive.
    pub fn signal_clear(&mut self, s: SemId, bits: u32) -> Result<()> {
        self.sem_checked(s)?;
        self.sems[s.index()].value &= !bits;
        Ok(())
    }

    /// Most important waiter doing a *counting* wait on `s`. Signal
    /// waiters sharing the object are skipped.
    fn first_counting_waiter(&self, s: SemId) -> Option<ThreadId> {
        let head = sem_head(s.index());
        let mut at = linkq::next(&self.run_links[..], head);
        while at != head {
            let t = ThreadId(at as u16);
            if self.threads[t.index()].state
                == ThreadState::Blocked(WaitRef::Sem(s))
            {
                return Some(t);
            }
            at = linkq::next(&self.run_links[..], at);
        }
        None
    }

    /// Most important signal waiter on `s` whose mask intersects
    /// `value`, along with the bits it would take.
    fn first_signal_match(
        &self,
        s: SemId,
        value: u32,
    ) -> Option<(ThreadId, u32)> {
        let head = sem_head(s.index());
        let mut at = linkq::next(&self.run_links[..], head);
        while at != head {
            let t = ThreadId(at as u16);
            let thread = &self.threads[t.index()];
            if thread.state == ThreadState::Blocked(WaitRef::Signal(s)) {
                let taken = thread.wait_mask & value;
                if taken != 0 {
                    return Some((t, taken));
                }
            }
            at = linkq::next(&self.run_links[..], at);
        }
        None
    }
}
