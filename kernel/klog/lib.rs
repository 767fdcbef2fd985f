//! Ferrite OS kernel logging (`klog`).
//!
//! Leveled logging macros shared by every kernel sub-crate. The filter is a
//! single runtime atomic so the hot path costs one relaxed load and an
//! integer compare.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Filtered | Use case |
//! |-------|--------------|----------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging |
//! | [`klog_always!`] | Active | No | Boot banners, panic output |
//!
//! Output starts **disabled**: until the boot path calls [`set_level`],
//! `klog!` emits nothing. `klog_always!` is never filtered and is the right
//! tool for panic and trap dumps that must reach the console.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU8, Ordering};

/// Severity level for [`klog!`] messages, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

/// Sentinel: all filtered output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level. Messages with `level >= LOG_MIN_LEVEL` are emitted.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Set the minimum level that [`klog!`] will emit.
///
/// Called once during early boot after the console comes up; safe to call
/// again to change verbosity at runtime.
#[inline]
pub fn set_level(level: Level) {
    LOG_MIN_LEVEL.store(level as u8, Ordering::Release);
}

/// Disable all [`klog!`] output. Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

// ============================================================================
// Output Helpers (not public API — used by macros)
// ============================================================================

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(args: core::fmt::Arguments) {
    drivers::vga_buffer::_print(args);
}

// ============================================================================
// Macros
// ============================================================================

/// Unconditional kernel output (boot banners, panic and trap dumps).
#[macro_export]
macro_rules! klog_always {
    () => {{
        $crate::_klog_print(format_args!("\n"));
    }};
    ($($arg:tt)+) => {{
        $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Debug-only kernel print — drop-in replacement for `println!`.
///
/// Fully compiled out in release builds.
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Level-filtered kernel logging.
///
/// `Debug` and `Trace` are additionally compiled out in release builds, so
/// they cost nothing in production even when the runtime filter would allow
/// them.
///
/// # Examples
///
/// ```ignore
/// klog!(Error, "pmm: out of physical memory");
/// klog!(Info,  "vmm: paging enabled, directory at 0x{:08x}", pd);
/// klog!(Debug, "sched: pid {} quantum expired", pid);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    // The filter is a process-global atomic, so these assertions live in one
    // test to keep them ordered.
    #[test]
    fn level_ordering_controls_filter() {
        assert!(!enabled(Level::Error)); // starts disabled
        set_level(Level::Warn);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));
        disable();
        assert!(!enabled(Level::Error));
    }
}
