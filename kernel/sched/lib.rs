//! Scheduling for Ferrite OS.
//!
//! `scheduler` is the single-CPU round-robin core driven from the timer
//! interrupt; `runqueue` is the per-CPU priority-queue variant with work
//! stealing for multi-processor configurations.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod runqueue;
pub mod scheduler;

pub use runqueue::{
    effective_priority, CpuId, SmpScheduler, ThreadId, ThreadState, MAX_CPUS, PRIORITY_LEVELS,
};
pub use scheduler::{
    block, init, is_enabled, schedule, start, stats, tick, unblock, yield_now, SchedulerStats,
};
