// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel configuration.
//!
//! The kernel takes a single shape fixed at build time: table sizes,
//! the priority band count, and the tick timing parameters all live
//! here. Applications that need different numbers edit this file (or
//! patch it in their build); nothing in the kernel reads configuration
//! at runtime.

/// Number of priority bands. Priority 0 is the most important;
/// `NUM_PRIORITIES - 1` is reserved for the idle thread.
pub const NUM_PRIORITIES: usize = 8;

/// Thread table size, including the idle thread.
pub const MAX_THREADS: usize = 16;

/// Mutex table size.
pub const MAX_MUTEXES: usize = 8;

/// Semaphore table size. Note that every message queue consumes two
/// slots (its free-slot and occupied-slot counters), and a multi-queue
/// signal consumes one more.
pub const MAX_SEMS: usize = 24;

/// Message queue table size.
pub const MAX_QUEUES: usize = 8;

/// Software timer table size.
pub const MAX_TIMERS: usize = 8;

/// Thread-local storage slots per thread.
pub const TLS_SLOTS: usize = 4;

/// Registered kernel event hook slots.
pub const MAX_EVENT_HOOKS: usize = 4;

/// Processor cycles per kernel tick. The default pairs a 1 kHz tick
/// with a 168 MHz core clock; boards override this to taste.
pub const CYCLES_PER_TICK: u32 = 168_000;

/// Processor cycles per microsecond, for the short busy-wait facility.
pub const CYCLES_PER_MICROSECOND: u32 = 168;

/// Longest interval (in ticks) the tick timer is ever programmed for.
/// The hardware counter is 24 bits, so this is also an overflow bound:
/// even a fully idle system wakes at least this often to maintain the
/// 64-bit accumulator.
pub const MAX_TICK_INTERVAL: u32 = ((1 << 24) - 1) / CYCLES_PER_TICK;

/// Interval (in ticks) used while more than one thread is runnable at
/// the scheduled priority, so round-robin rotation keeps happening.
pub const ROUND_ROBIN_INTERVAL: u32 = 1;

/// Stack for the kernel-created idle thread.
pub const IDLE_STACK_SIZE: usize = 512;

/// Fill pattern for stack painting under the `stack-monitor` feature.
pub const STACK_PAINT: u32 = 0xbaddcafe;
