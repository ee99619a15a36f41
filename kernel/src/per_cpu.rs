//! Per-CPU state.
//!
//! Single-CPU rendition of the per-CPU block: the preempt count, the
//! need_resched flag, the current and idle thread ids, and the kernel
//! stack top used by the syscall entry path. The layout is already
//! sharded the way an SMP kernel wants it; bringing up more CPUs means
//! instantiating more of these, not restructuring.
//!
//! Hosted test builds make the block thread-local so concurrently
//! running tests each see their own "CPU".

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Thread id sentinel meaning "no thread".
pub const NO_THREAD: u64 = 0;

struct CpuLocal {
    preempt_count: AtomicU32,
    need_resched: AtomicU8,
    current_tid: AtomicU64,
    idle_tid: AtomicU64,
    kernel_stack_top: AtomicU64,
    context_switches: AtomicU64,
    idle_ticks: AtomicU64,
    ticks: AtomicU64,
}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            preempt_count: AtomicU32::new(0),
            need_resched: AtomicU8::new(0),
            current_tid: AtomicU64::new(NO_THREAD),
            idle_tid: AtomicU64::new(NO_THREAD),
            kernel_stack_top: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }
}

#[cfg(not(test))]
mod storage {
    use super::CpuLocal;

    static CPU0: CpuLocal = CpuLocal::new();

    pub fn with<R>(f: impl FnOnce(&CpuLocal) -> R) -> R {
        f(&CPU0)
    }
}


/// Increment the preemption nesting depth.
#[inline]
pub fn preempt_disable() {
    storage::with(|c| c.preempt_count.fetch_add(1, Ordering::Relaxed));
}

/// Decrement the preemption nesting depth and, back at zero, run the
/// scheduler if a reschedule was requested meanwhile.
#[inline]
pub fn preempt_enable() {
    let count = storage::with(|c| c.preempt_count.fetch_sub(1, Ordering::Relaxed));
    debug_assert!(count > 0, "preempt_enable without matching disable");
    if count == 1 && take_need_resched() {
        crate::task::scheduler::schedule();
    }
}

/// Decrement the preemption depth without the reschedule check. Used by
/// the scheduler itself, which is already rescheduling.
#[inline]
pub fn preempt_enable_no_resched() {
    let count = storage::with(|c| c.preempt_count.fetch_sub(1, Ordering::Relaxed));
    debug_assert!(count > 0, "preempt_enable without matching disable");
}

#[inline]
pub fn preempt_count() -> u32 {
    storage::with(|c| c.preempt_count.load(Ordering::Relaxed))
}

#[inline]
pub fn set_need_resched() {
    storage::with(|c| c.need_resched.store(1, Ordering::Relaxed));
}

/// Read and clear the need_resched flag.
#[inline]
pub fn take_need_resched() -> bool {
    storage::with(|c| c.need_resched.swap(0, Ordering::Relaxed)) != 0
}

#[inline]
pub fn need_resched() -> bool {
    storage::with(|c| c.need_resched.load(Ordering::Relaxed)) != 0
}

/// Id of the thread currently executing on this CPU.
#[inline]
pub fn current_tid() -> u64 {
    storage::with(|c| c.current_tid.load(Ordering::Relaxed))
}

#[inline]
pub fn set_current_tid(tid: u64) {
    storage::with(|c| c.current_tid.store(tid, Ordering::Relaxed));
}

#[inline]
pub fn idle_tid() -> u64 {
    storage::with(|c| c.idle_tid.load(Ordering::Relaxed))
}

#[inline]
pub fn set_idle_tid(tid: u64) {
    storage::with(|c| c.idle_tid.store(tid, Ordering::Relaxed));
}

/// Kernel stack top for syscall entry (TSS.RSP0 feed).
#[inline]
pub fn kernel_stack_top() -> u64 {
    storage::with(|c| c.kernel_stack_top.load(Ordering::Relaxed))
}

#[inline]
pub fn set_kernel_stack_top(top: u64) {
    storage::with(|c| c.kernel_stack_top.store(top, Ordering::Relaxed));
}

#[inline]
pub fn count_context_switch() {
    storage::with(|c| c.context_switches.fetch_add(1, Ordering::Relaxed));
}

#[inline]
pub fn context_switches() -> u64 {
    storage::with(|c| c.context_switches.load(Ordering::Relaxed))
}

#[inline]
pub fn count_tick(idle: bool) {
    storage::with(|c| {
        c.ticks.fetch_add(1, Ordering::Relaxed);
        if idle {
            c.idle_ticks.fetch_add(1, Ordering::Relaxed);
        }
    });
}

#[inline]
pub fn idle_ticks() -> u64 {
    storage::with(|c| c.idle_ticks.load(Ordering::Relaxed))
}

#[inline]
pub fn ticks() -> u64 {
    storage::with(|c| c.ticks.load(Ordering::Relaxed))
}
