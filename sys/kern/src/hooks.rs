// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event hooks.
//!
//! Instrumentation (cycle counters, trace capture, watchdog feeding)
//! can register a function to be called at the kernel's two broadcast
//! points: every tick interrupt, and every scheduler exit. Hooks run in
//! interrupt context and must be quick and non-blocking.
//!
//! Registration is expected to happen during bring-up; there is no
//! deregistration.

use abi::KernelError;

use crate::config::MAX_EVENT_HOOKS;
use crate::err::Result;
use crate::kernel::Kernel;

/// The broadcast points.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// The tick interrupt fired and the accumulator was advanced.
    Tick,
    /// A scheduler pass finished; the next thread has been chosen.
    SchedulerExit,
}

/// Registered hook table.
#[derive(Debug)]
pub struct Hooks {
    slots: [Option<fn(Event)>; MAX_EVENT_HOOKS],
}

impl Hooks {
    pub const fn new() -> Self {
        Hooks {
            slots: [None; MAX_EVENT_HOOKS],
        }
    }

    pub(crate) fn broadcast(&self, e: Event) {
        for hook in self.slots.iter().flatten() {
            hook(e);
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Registers `hook` for all kernel events.
    pub fn register_event_hook(&mut self, hook: fn(Event)) -> Result<()> {
        let slot = self
            .hooks
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(KernelError::Exhausted)?;
        *slot = Some(hook);
        Ok(())
    }
}
