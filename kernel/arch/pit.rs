//! Programmable interval timer (channel 0).
//!
//! The kernel programs a rate-generator at the scheduler frequency; the IRQ0
//! handler calls [`on_tick`] and then drives the scheduler.

use crate::instructions::hlt;
use crate::pic;
use crate::port::outb;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Input clock of the 8253/8254, in Hz.
pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;

static TICK_COUNT: AtomicU64 = AtomicU64::new(0);
static TIMER_FREQUENCY: AtomicU32 = AtomicU32::new(0);

/// Program channel 0 as a rate generator at `frequency` Hz and unmask IRQ0.
///
/// The caller is responsible for registering the vector-32 handler first.
pub fn init(frequency: u32) {
    TIMER_FREQUENCY.store(frequency, Ordering::Relaxed);

    let divisor = (PIT_BASE_FREQUENCY / frequency.max(1)).clamp(1, 65_535);
    unsafe {
        // Channel 0, lobyte/hibyte access, mode 3 (rate generator).
        outb(PIT_COMMAND, 0x36);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, ((divisor >> 8) & 0xFF) as u8);
    }
    pic::unmask(0);

    klog::klog!(Info, "timer: PIT programmed at {} Hz", frequency);
}

/// Count one timer interrupt. Called from the IRQ0 handler.
#[inline]
pub fn on_tick() {
    TICK_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot.
#[inline]
pub fn ticks() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Configured timer frequency in Hz (0 before init).
#[inline]
pub fn frequency() -> u32 {
    TIMER_FREQUENCY.load(Ordering::Relaxed)
}

/// Busy-wait for approximately `ms` milliseconds, halting between ticks.
pub fn sleep_ms(ms: u32) {
    let hz = frequency().max(1) as u64;
    let ticks_to_wait = ((ms as u64 * hz) / 1000).max(1);
    let start = ticks();
    while ticks().wrapping_sub(start) < ticks_to_wait {
        hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_counter_is_monotonic() {
        let before = ticks();
        on_tick();
        on_tick();
        assert!(ticks() >= before + 2);
    }
}
