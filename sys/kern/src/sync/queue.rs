// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded message queues.
//!
//! A queue is a fixed ring of machine words guarded by two counting
//! semaphores: one counts free slots, the other occupied slots. A
//! blocking send waits on the free counter (possibly suspending), then
//! commits the element with interrupts masked and posts the occupied
//! counter; receive is the mirror image. The try variants are ISR-safe.
//!
//! A queue may be bound to a *signal* semaphore under a channel index:
//! every successful send raises `1 << channel`, which is what lets one
//! thread block on many queues at once ([`Kernel::multi_wait_prepare`] /
//! [`Kernel::multi_resolve`]).

use abi::{KernelError, QueueId, SemId};

use crate::config::MAX_QUEUES;
use crate::err::{NextThread, Result};
use crate::kernel::Kernel;

/// Queue state. The ring storage is borrowed from the creator for the
/// life of the system.
#[derive(Debug)]
pub struct Queue {
    pub(crate) ring: Option<&'static mut [usize]>,
    /// Next slot to read.
    pub(crate) head: u32,
    /// Next slot to write.
    pub(crate) tail: u32,
    /// Counts free ring slots; senders wait here.
    pub(crate) free: SemId,
    /// Counts occupied ring slots; receivers wait here.
    pub(crate) used: SemId,
    /// Signal semaphore and channel bit raised on each send.
    pub(crate) binding: Option<(SemId, u8)>,
    pub(crate) active: bool,
}

impl Queue {
    pub const fn new() -> Self {
        Queue {
            ring: None,
            head: 0,
            tail: 0,
            free: SemId(0),
            used: SemId(0),
            binding: None,
            active: false,
        }
    }
}

impl Kernel {
    /// Claims a queue slot around the given ring storage. Two
    /// semaphore slots are consumed for the guards.
    pub fn queue_create(
        &mut self,
        ring: &'static mut [usize],
    ) -> Result<QueueId> {
        if ring.is_empty() || ring.len() > u32::MAX as usize {
            return Err(KernelError::InvalidParam);
        }
        let slot = self
            .queues
            .iter()
            .position(|q| !q.active)
            .ok_or(KernelError::Exhausted)?;
        let free = self.sem_create(ring.len() as u32)?;
        let used = match self.sem_create(0) {
            Ok(s) => s,
            Err(e) => {
                self.sems[free.index()].active = false;
                return Err(e);
            }
        };
        self.queues[slot] = Queue {
            ring: Some(ring),
            head: 0,
            tail: 0,
            free,
            used,
            binding: None,
            active: true,
        };
        Ok(QueueId(slot as u16))
    }

    /// The free-slot counting semaphore; blocking sends wait on it.
    pub fn queue_free_sem(&self, q: QueueId) -> Result<SemId> {
        self.queue_checked(q)?;
        Ok(self.queues[q.index()].free)
    }

    /// The occupied-slot counting semaphore; blocking receives wait on
    /// it.
    pub fn queue_used_sem(&self, q: QueueId) -> Result<SemId> {
        self.queue_checked(q)?;
        Ok(self.queues[q.index()].used)
    }

    /// Number of elements currently committed to the ring.
    pub fn queue_len(&self, q: QueueId) -> Result<u32> {
        self.queue_checked(q)?;
        self.sem_value(self.queues[q.index()].used)
    }

    /// Binds `q` to bit `1 << channel` of the signal semaphore `sig`,
    /// making it selectable by a multi-queue wait.
    pub fn queue_bind_signal(
        &mut self,
        q: QueueId,
        sig: SemId,
        channel: u8,
    ) -> Result<()> {
        self.queue_checked(q)?;
        self.sem_checked(sig)?;
        if channel >= 32 {
            return Err(KernelError::InvalidParam);
        }
        self.queues[q.index()].binding = Some((sig, channel));
        Ok(())
    }

    /// Non-blocking send. ISR-safe. Fails with `WouldBlock` when the
    /// ring is full.
    pub fn queue_try_send(
        &mut self,
        q: QueueId,
        value: usize,
    ) -> Result<NextThread> {
        self.queue_checked(q)?;
        if !self.sem_try_wait(self.queues[q.index()].free)? {
            return Err(KernelError::WouldBlock);
        }
        Ok(self.queue_send_commit(q, value))
    }

    /// Second half of a blocking send: the caller has already consumed
    /// a free-slot token (its wait on [`Kernel::queue_free_sem`]
    /// succeeded), so a slot is reserved and the write cannot fail.
    pub fn queue_send_commit(&mut self, q: QueueId, value: usize) -> NextThread {
        let queue = &mut self.queues[q.index()];
        let ring = match queue.ring.as_mut() {
            Some(r) => r,
            None => panic!("active queue without ring"),
        };
        ring[queue.tail as usize] = value;
        queue.tail = (queue.tail + 1) % ring.len() as u32;
        let used = queue.used;
        let binding = queue.binding;
        let mut hint = match self.sem_post(used) {
            Ok(h) => h,
            Err(_) => NextThread::Same,
        };
        if let Some((sig, ch)) = binding {
            if let Ok(h) = self.signal_raise(sig, 1 << ch) {
                hint = hint.combine(h);
            }
        }
        hint
    }

    /// Non-blocking receive. ISR-safe. Fails with `WouldBlock` when the
    /// ring is empty.
    pub fn queue_try_recv(&mut self, q: QueueId) -> Result<(usize, NextThread)> {
        self.queue_checked(q)?;
        if !self.sem_try_wait(self.queues[q.index()].used)? {
            return Err(KernelError::WouldBlock);
        }
        Ok(self.queue_recv_commit(q))
    }

    /// Second half of a blocking receive: the caller holds an
    /// occupied-slot token, so an element is guaranteed present.
    pub fn queue_recv_commit(&mut self, q: QueueId) -> (usize, NextThread) {
        let queue = &mut self.queues[q.index()];
        let ring = match queue.ring.as_mut() {
            Some(r) => r,
            None => panic!("active queue without ring"),
        };
        let value = ring[queue.head as usize];
        queue.head = (queue.head + 1) % ring.len() as u32;
        let free = queue.free;
        let used = queue.used;
        let binding = queue.binding;
        let mut hint = match self.sem_post(free) {
            Ok(h) => h,
            Err(_) => NextThread::Same,
        };
        // If elements remain, refresh the channel bit: the bit for this
        // receive was consumed by whoever selected us, and later
        // waiters still need to see the queue as hot.
        if let Some((sig, ch)) = binding {
            if self.sems[used.index()].value > 0 {
                if let Ok(h) = self.signal_raise(sig, 1 << ch) {
                    hint = hint.combine(h);
                }
            }
        }
        (value, hint)
    }

    // -- multi-queue wait --------------------------------------------

    /// The queue bound to `sig` under `channel`, if any.
    pub fn bound_queue(&self, sig: SemId, channel: u32) -> Option<QueueId> {
        (0..MAX_QUEUES)
            .filter(|&i| self.queues[i].active)
            .find(|&i| {
                self.queues[i].binding == Some((sig, channel as u8))
            })
            .map(|i| QueueId(i as u16))
    }

    /// First half of a multi-queue wait on `sig`: consumes any pending
    /// channel bits (`Some(flags)`), else announces a block across
    /// every channel bound to `sig` (`None`). Errors if no queue is
    /// bound.
    pub fn multi_wait_prepare(
        &mut self,
        sig: SemId,
        deadline: Option<u64>,
    ) -> Result<Option<u32>> {
        let mask = self.bound_mask(sig)?;
        self.signal_wait_prepare(sig, mask, deadline)
    }

    /// Second half: picks one nonempty bound queue out of `flags` and
    /// returns its channel. Stale bits (queue already drained) are
    /// dropped; unconsumed live bits are raised back onto `sig` so no
    /// wake is lost. `None` means every flagged queue turned out to be
    /// empty and the caller should wait again.
    pub fn multi_resolve(
        &mut self,
        sig: SemId,
        flags: u32,
    ) -> Result<Option<u32>> {
        self.sem_checked(sig)?;
        let mut rest = flags;
        while rest != 0 {
            let ch = rest.trailing_zeros();
            rest &= !(1 << ch);
            let Some(q) = self.bound_queue(sig, ch) else {
                continue;
            };
            if self.queue_len(q)? == 0 {
                // The consumer raced us to this channel; drop the bit.
                continue;
            }
            if rest != 0 {
                // Put back what we aren't handling; this may wake
                // another multi-waiter, which is exactly right.
                let _ = self.signal_raise(sig, rest)?;
            }
            return Ok(Some(ch));
        }
        Ok(None)
    }

    /// OR of all channel bits bound to `sig`.
    fn bound_mask(&self, sig: SemId) -> Result<u32> {
        let mut mask = 0;
        for q in self.queues.iter().filter(|q| q.active) {
            if let Some((s, ch)) = q.binding {
                if s == sig {
                    mask |= 1 << ch;
                }
            }
        }
        if mask == 0 {
            return Err(KernelError::InvalidParam);
        }
        Ok(mask)
    }

    fn queue_checked(&self, q: QueueId) -> Result<()> {
        if q.index() < MAX_QUEUES && self.queues[q.index()].active {
            Ok(())
        } else {
            Err(KernelError::InvalidParam)
        }
    }
}
