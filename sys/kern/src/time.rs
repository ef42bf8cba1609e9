// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time.
//!
//! Time is a 64-bit monotonic count of *ticks*, maintained by adding
//! the programmed interval on every tick-interrupt expiry. The hardware
//! counter only has to cover one interval; the accumulator never
//! wraps in any realistic uptime. When code needs the time mid-interval
//! the architecture layer reads the hardware counter and feeds the
//! partial elapsed ticks through [`crate::Kernel::advance_time`].
//!
//! The interval is variable ("tickless"): the scheduler stretches it
//! out to the next timeout deadline (bounded by the hardware maximum)
//! whenever round-robin doesn't need a short one.

use crate::config::MAX_TICK_INTERVAL;

/// Tick accumulator plus the interval currently programmed into the
/// tick hardware.
#[derive(Debug)]
pub struct Clock {
    /// Monotonic tick count.
    pub(crate) ticks: u64,
    /// Current interval length, in ticks.
    pub(crate) interval: u32,
}

impl Clock {
    pub const fn new() -> Self {
        Clock {
            ticks: 0,
            interval: MAX_TICK_INTERVAL,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::Kernel {
    /// Current kernel time in ticks. On hardware this is only as fresh
    /// as the last accumulator update; the arch layer refreshes it from
    /// the hardware counter before anything deadline-sensitive.
    pub fn now(&self) -> u64 {
        self.clock.ticks
    }

    /// The tick interval currently in effect, in ticks.
    pub fn tick_interval(&self) -> u32 {
        self.clock.interval
    }

    /// Absolute deadline `ticks` from now, the form the timeout queue
    /// stores.
    pub fn deadline_in(&self, ticks: u64) -> u64 {
        self.clock.ticks.saturating_add(ticks)
    }
}
