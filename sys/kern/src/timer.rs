// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot software timers.
//!
//! Timers share the sorted timeout queue with sleeping threads; on
//! expiry the callback runs in scheduler (interrupt) context, so it
//! must not block or allocate. The supported pattern for getting work
//! back into thread context is a callback that posts its cookie to a
//! queue with the non-blocking send:
//!
//! ```ignore
//! fn pump(k: &mut Kernel, t: TimerId) -> bool {
//!     let cookie = k.timer_cookie(t).unwrap_or(0);
//!     k.queue_try_send(PUMP_QUEUE, cookie).is_ok()
//! }
//! ```
//!
//! The callback's boolean result is informational: `false` records that
//! the callback chose not to (or could not) deliver, and any
//! backpressure policy is the callback's own business.

use abi::{KernelError, TimerId};

use crate::config::MAX_TIMERS;
use crate::err::Result;
use crate::kernel::{timer_node, Kernel};

/// Timer callback, invoked with the kernel state and the expired
/// timer's id. Interrupt context: non-blocking kernel operations only.
pub type TimerFn = fn(&mut Kernel, TimerId) -> bool;

/// Software timer state; list membership lives in the timeout-space
/// link arena.
#[derive(Debug)]
pub struct KTimer {
    pub(crate) cb: Option<TimerFn>,
    pub(crate) cookie: usize,
    pub(crate) deadline: u64,
    pub(crate) active: bool,
}

impl KTimer {
    pub const fn new() -> Self {
        KTimer {
            cb: None,
            cookie: 0,
            deadline: 0,
            active: false,
        }
    }
}

impl Kernel {
    /// Claims a timer slot with the given callback.
    pub fn timer_create(&mut self, cb: TimerFn) -> Result<TimerId> {
        let slot = self
            .timers
            .iter()
            .position(|t| !t.active)
            .ok_or(KernelError::Exhausted)?;
        self.timers[slot] = KTimer {
            cb: Some(cb),
            cookie: 0,
            deadline: 0,
            active: true,
        };
        Ok(TimerId(slot as u16))
    }

    /// Arms (or re-arms) the timer to fire `ticks` from now, stashing
    /// `cookie` for the callback.
    pub fn timer_set(
        &mut self,
        t: TimerId,
        ticks: u64,
        cookie: usize,
    ) -> Result<()> {
        self.timer_checked(t)?;
        let node = timer_node(t.index());
        self.tmo_unlink(node);
        let timer = &mut self.timers[t.index()];
        timer.deadline = self.clock.ticks.saturating_add(ticks);
        timer.cookie = cookie;
        self.tmo_insert(node);
        Ok(())
    }

    /// Disarms the timer if it's pending; harmless otherwise.
    pub fn timer_cancel(&mut self, t: TimerId) -> Result<()> {
        self.timer_checked(t)?;
        self.tmo_unlink(timer_node(t.index()));
        Ok(())
    }

    /// The cookie stashed by the most recent `timer_set`.
    pub fn timer_cookie(&self, t: TimerId) -> Result<usize> {
        self.timer_checked(t)?;
        Ok(self.timers[t.index()].cookie)
    }

    /// Whether the timer is currently armed.
    pub fn timer_armed(&self, t: TimerId) -> Result<bool> {
        self.timer_checked(t)?;
        Ok(linkq::is_linked(
            &self.tmo_links[..],
            timer_node(t.index()),
        ))
    }

    /// Runs an expired timer's callback. Called from the timeout drain
    /// with the timer already unlinked, i.e. one-shot semantics: it
    /// stays disarmed unless the callback re-arms it.
    pub(crate) fn fire_timer(&mut self, ix: usize) {
        let Some(cb) = self.timers[ix].cb else {
            return;
        };
        // The result is informational; a false return means the
        // callback declined to deliver.
        let _delivered = cb(self, TimerId(ix as u16));
    }

    fn timer_checked(&self, t: TimerId) -> Result<()> {
        if t.index() < MAX_TIMERS && self.timers[t.index()].active {
            Ok(())
        } else {
            Err(KernelError::InvalidParam)
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use abi::TimerId;

    use crate::test_support::kernel_with;
    use crate::Kernel;

    #[test]
    fn fires_once_at_deadline() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        fn cb(_k: &mut Kernel, _t: TimerId) -> bool {
            FIRES.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (mut k, _t) = kernel_with(&[1]);
        let tm = k.timer_create(cb).unwrap();
        k.timer_set(tm, 3, 0).unwrap();
        assert!(k.timer_armed(tm).unwrap());

        k.advance_time(2);
        let _ = k.schedule();
        assert_eq!(FIRES.load(Ordering::Relaxed), 0);

        k.advance_time(1);
        let _ = k.schedule();
        assert_eq!(FIRES.load(Ordering::Relaxed), 1);
        assert!(!k.timer_armed(tm).unwrap());

        // One-shot: no further expiry without a new set.
        k.advance_time(50);
        let _ = k.schedule();
        assert_eq!(FIRES.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cancel_prevents_expiry() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        fn cb(_k: &mut Kernel, _t: TimerId) -> bool {
            FIRES.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (mut k, _t) = kernel_with(&[1]);
        let tm = k.timer_create(cb).unwrap();
        k.timer_set(tm, 3, 0).unwrap();
        k.timer_cancel(tm).unwrap();
        k.advance_time(10);
        let _ = k.schedule();
        assert_eq!(FIRES.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn expiry_order_follows_deadlines() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);
        fn record(k: &mut Kernel, t: TimerId) -> bool {
            // Encode arrival order in a decimal digit per fire.
            let cookie = k.timer_cookie(t).unwrap_or(0);
            ORDER
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v * 10 + cookie)
                })
                .ok();
            true
        }

        let (mut k, _t) = kernel_with(&[1]);
        let a = k.timer_create(record).unwrap();
        let b = k.timer_create(record).unwrap();
        k.timer_set(a, 5, 1).unwrap();
        k.timer_set(b, 3, 2).unwrap();
        k.advance_time(6);
        let _ = k.schedule();
        assert_eq!(ORDER.load(Ordering::Relaxed), 21);
    }

    #[test]
    fn callback_pumps_a_queue() {
        fn pump(k: &mut Kernel, t: TimerId) -> bool {
            let cookie = k.timer_cookie(t).unwrap_or(0);
            let q = abi::QueueId(0);
            match k.queue_try_send(q, cookie) {
                Ok(_hint) => true,
                Err(_) => false,
            }
        }

        let (mut k, _t) = kernel_with(&[1]);
        let ring = Box::leak(vec![0usize; 2].into_boxed_slice());
        let q = k.queue_create(ring).unwrap();
        assert_eq!(q.index(), 0);
        let tm = k.timer_create(pump).unwrap();
        k.timer_set(tm, 2, 77).unwrap();
        k.advance_time(2);
        let _ = k.schedule();
        let (v, _hint) = k.queue_try_recv(q).unwrap();
        assert_eq!(v, 77);
    }

    #[test]
    fn rearm_replaces_deadline() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        fn cb(_k: &mut Kernel, _t: TimerId) -> bool {
            FIRES.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (mut k, _t) = kernel_with(&[1]);
        let tm = k.timer_create(cb).unwrap();
        k.timer_set(tm, 3, 0).unwrap();
        k.timer_set(tm, 10, 0).unwrap();
        k.advance_time(5);
        let _ = k.schedule();
        assert_eq!(FIRES.load(Ordering::Relaxed), 0);
        k.advance_time(5);
        let _ = k.schedule();
        assert_eq!(FIRES.load(Ordering::Relaxed), 1);
    }
}
