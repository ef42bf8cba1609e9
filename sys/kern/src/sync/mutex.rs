// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive mutex with priority inheritance.
//!
//! The waiter list is sorted by effective priority, and a contended
//! lock raises the owner's effective priority to the claimant's --
//! iteratively up the blocked-on chain, so a mid-priority thread can
//! never fence a high-priority thread off from the low-priority holder
//! it's waiting on. Unlock hands ownership directly to the head waiter
//! and recomputes the releaser's effective priority from the mutexes it
//! still holds, so inflation never outlives the contention that caused
//! it.
//!
//! Locking is untimed; `try_lock` is the non-blocking form. None of
//! these operations are ISR-safe.

use abi::{KernelError, MutexId, ThreadId, ThreadState, Wake, WaitRef};

use crate::err::{NextThread, Result};
use crate::kernel::{mutex_head, Kernel};

/// Mutex state. Invariants: `depth == 0` iff `owner` is `None`; a
/// nonempty waiter list implies an owner.
#[derive(Debug)]
pub struct Mutex {
    pub(crate) owner: Option<ThreadId>,
    pub(crate) depth: u32,
    pub(crate) active: bool,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            owner: None,
            depth: 0,
            active: false,
        }
    }
}

impl Kernel {
    /// Claims a mutex slot.
    pub fn mutex_create(&mut self) -> Result<MutexId> {
        let slot = self
            .mutexes
            .iter()
            .position(|m| !m.active)
            .ok_or(KernelError::Exhausted)?;
        self.mutexes[slot] = Mutex {
            owner: None,
            depth: 0,
            active: true,
        };
        Ok(MutexId(slot as u16))
    }

    /// The current owner, for inspection.
    pub fn mutex_owner(&self, m: MutexId) -> Result<Option<ThreadId>> {
        self.mutex_checked(m)?;
        Ok(self.mutexes[m.index()].owner)
    }

    /// Non-blocking acquire: succeeds iff the mutex is free or already
    /// held by the caller.
    pub fn mutex_try_lock(&mut self, m: MutexId) -> Result<bool> {
        self.mutex_checked(m)?;
        let t = self.current;
        let mutex = &mut self.mutexes[m.index()];
        match mutex.owner {
            None => {
                mutex.owner = Some(t);
                mutex.depth = 1;
                Ok(true)
            }
            Some(o) if o == t => {
                mutex.depth += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// First half of a blocking acquire: takes the mutex if possible
    /// (returns `true`), else inflates the owner chain's priorities and
    /// announces a block (returns `false`); the caller then enters the
    /// scheduler and owns the mutex once resumed.
    pub fn mutex_lock_prepare(&mut self, m: MutexId) -> Result<bool> {
        if self.mutex_try_lock(m)? {
            return Ok(true);
        }
        let t = self.current;
        let pri = self.threads[t.index()].effective;

        // Walk the blocked-on chain, dragging everyone who stands
        // between us and the CPU up to our priority. The chain is
        // finite (a thread blocks on at most one mutex) and cycles are
        // impossible while the recursion check above holds.
        let mut at = m;
        loop {
            let Some(owner) = self.mutexes[at.index()].owner else {
                break;
            };
            if !pri.is_more_important_than(self.threads[owner.index()].effective)
            {
                break;
            }
            self.raise_effective(owner, pri);
            match self.threads[owner.index()].state {
                ThreadState::Blocked(WaitRef::Mutex(next)) => at = next,
                _ => break,
            }
        }

        self.block_current(WaitRef::Mutex(m), None);
        Ok(false)
    }

    /// Releases one level of recursion; on the last one, hands the
    /// mutex to its most important waiter (if any) and deflates the
    /// caller's effective priority. Errors if the caller isn't the
    /// owner.
    pub fn mutex_unlock(&mut self, m: MutexId) -> Result<NextThread> {
        self.mutex_checked(m)?;
        let t = self.current;
        if self.mutexes[m.index()].owner != Some(t) {
            return Err(KernelError::InvalidParam);
        }
        let mutex = &mut self.mutexes[m.index()];
        mutex.depth -= 1;
        if mutex.depth > 0 {
            return Ok(NextThread::Same);
        }
        Ok(self.mutex_release(m, t))
    }

    /// Safety form for termination handlers: if the caller holds `m` at
    /// any depth, forces the depth to one and unlocks. Does nothing
    /// when the caller isn't the owner.
    pub fn mutex_restore(&mut self, m: MutexId) -> Result<NextThread> {
        self.mutex_checked(m)?;
        let t = self.current;
        if self.mutexes[m.index()].owner != Some(t) {
            return Ok(NextThread::Same);
        }
        self.mutexes[m.index()].depth = 1;
        self.mutex_unlock(m)
    }

    /// Final release of `m` by `t`: transfer to the head waiter or
    /// leave free, then restore `t`'s effective priority.
    fn mutex_release(&mut self, m: MutexId, t: ThreadId) -> NextThread {
        let mutex = &mut self.mutexes[m.index()];
        mutex.owner = None;
        mutex.depth = 0;
        let hint = if let Some(w) = self.first_waiter(mutex_head(m.index())) {
            // Ownership transfers directly; the waiter list is sorted,
            // so the head is the most important claimant and the
            // leftover waiters can't out-rank it.
            let mutex = &mut self.mutexes[m.index()];
            mutex.owner = Some(w);
            mutex.depth = 1;
            self.wake_thread(w, Wake::Normal)
        } else {
            NextThread::Same
        };
        // Whatever importance this mutex lent the releaser goes away;
        // anything lent by mutexes still held stays.
        self.recompute_effective(t);
        hint
    }

    /// Force-releases every mutex `t` holds; used by the termination
    /// pipeline so a killed thread cannot take lock ownership to the
    /// grave.
    pub(crate) fn release_all_owned(&mut self, t: ThreadId) -> NextThread {
        let mut hint = NextThread::Same;
        for i in 0..self.mutexes.len() {
            if self.mutexes[i].active && self.mutexes[i].owner == Some(t) {
                hint = hint.combine(self.mutex_release(MutexId(i as u16), t));
            }
        }
        hint
    }

    /// Re-propagates priority inheritance up the blocked-on chain
    /// starting at `t`, after `t`'s effective priority may have moved
    /// in either direction (nominal change). Each owner on the chain is
    /// recomputed from its own waiters, which both raises and lowers
    /// correctly.
    pub(crate) fn refresh_inheritance_from(&mut self, t: ThreadId) {
        let mut at = t;
        loop {
            let ThreadState::Blocked(WaitRef::Mutex(m)) =
                self.threads[at.index()].state
            else {
                break;
            };
            let Some(owner) = self.mutexes[m.index()].owner else {
                break;
            };
            self.recompute_effective(owner);
            at = owner;
        }
    }

    fn mutex_checked(&self, m: MutexId) -> Result<()> {
        if m.index() < self.mutexes.len() && self.mutexes[m.index()].active {
            Ok(())
        } else {
            Err(KernelError::InvalidParam)
        }
    }
}
