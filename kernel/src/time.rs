//! Timer-tick accounting.
//!
//! The external timer driver (PIT or LAPIC timer, programmed outside the
//! core) calls [`timer_tick`] once per interrupt. We keep the global
//! tick count and hand the tick to the scheduler, which charges the
//! current thread and decides about preemption.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupts per second.
pub const HZ: u64 = 100;

/// Nanoseconds per tick.
pub const TICK_NS: u64 = 1_000_000_000 / HZ;

/// Default scheduling quantum: 10 ticks.
pub const DEFAULT_TIME_SLICE_NS: u64 = 10 * TICK_NS;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Global tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot, derived from the tick count.
pub fn uptime_ms() -> u64 {
    ticks() * (1000 / HZ)
}

/// Timer interrupt entry point. Called by the architecture layer once
/// per tick, with interrupts disabled, on the interrupted thread's
/// kernel stack.
pub fn timer_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::task::scheduler::scheduler_tick();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_constants_are_consistent() {
        assert_eq!(TICK_NS * HZ, 1_000_000_000);
        assert_eq!(DEFAULT_TIME_SLICE_NS % TICK_NS, 0);
    }
}
