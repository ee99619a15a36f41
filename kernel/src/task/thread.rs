//! Thread control blocks.
//!
//! A thread is the scheduling unit: saved callee-saved context, kernel
//! stack, priority, state, and accounting. Threads belong to a process
//! (the process owns them; destruction cascades) but the scheduler deals
//! in thread ids, looked up through the global registry.

use crate::memory::{self, layout, PAGE_SIZE};
use crate::process::Pid;
use crate::time;
use alloc::string::String;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

pub type Tid = u64;

/// Tid 0 is "no thread"; the idle thread gets the first real id.
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

pub fn allocate_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

/// Lowest priority index is most urgent. The real-time band is
/// `0..MAX_RT_PRIO`; user threads live above it.
pub const MAX_PRIO: usize = 140;
pub const MAX_RT_PRIO: usize = 100;
pub const DEFAULT_USER_PRIO: u8 = 120;
pub const IDLE_PRIO: u8 = (MAX_PRIO - 1) as u8;

/// Map a nice value (-20..=19) into the user priority band.
pub fn nice_to_prio(nice: i8) -> u8 {
    let nice = nice.clamp(-20, 19);
    (DEFAULT_USER_PRIO as i16 + nice as i16) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Running on the CPU or queued to run.
    Ready,
    /// Interruptible sleep (wait channel, blocking IPC).
    Sleeping,
    /// Sleep that nothing but an explicit wake may end.
    SleepingUninterruptible,
    Stopped,
    /// Finished; waiting for the parent to reap its process.
    Zombie,
    Dead,
}

impl ThreadState {
    pub fn is_sleeping(self) -> bool {
        matches!(self, Self::Sleeping | Self::SleepingUninterruptible)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        const KERNEL_THREAD = 1 << 0;
        const IDLE          = 1 << 1;
        const NEED_RESCHED  = 1 << 2;
        const EXITING       = 1 << 3;
        const FORKING       = 1 << 4;
    }
}

/// Callee-saved register set plus stack and instruction pointers; the
/// only state the cooperative switch path must preserve. Field order is
/// load-bearing: the context-switch assembly addresses these by offset.
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct CpuContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// A kernel stack: a small compound block reached through the direct
/// map. Freed with the thread.
pub struct KernelStack {
    frame: PhysFrame,
    order: usize,
}

impl KernelStack {
    pub fn allocate() -> Option<Self> {
        let pages = (layout::KERNEL_STACK_SIZE as u64) / PAGE_SIZE;
        let order = memory::order_for_pages(pages);
        let frame = memory::alloc_pages(order, memory::AllocFlags::ZERO)?;
        Some(Self { frame, order })
    }

    pub fn base(&self) -> VirtAddr {
        VirtAddr::new(memory::phys_to_virt(self.frame.start_address().as_u64()))
    }

    pub fn size(&self) -> usize {
        (PAGE_SIZE as usize) << self.order
    }

    /// Initial stack pointer: stacks grow down from the top.
    pub fn top(&self) -> VirtAddr {
        self.base() + self.size() as u64
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        memory::free_pages(self.frame, self.order);
    }
}

/// The thread control block.
pub struct Thread {
    pub id: Tid,
    /// Owning process.
    pub pid: Pid,
    pub name: String,
    pub state: ThreadState,
    pub flags: ThreadFlags,

    pub priority: u8,
    pub nice: i8,
    /// Remaining quantum in nanoseconds.
    pub time_slice_ns: u64,

    pub context: CpuContext,
    pub kernel_stack: Option<KernelStack>,
    pub user_stack_top: u64,

    pub start_tick: u64,
    pub user_time_ns: u64,
    pub system_time_ns: u64,
    pub last_run_tick: u64,

    /// Channel this thread sleeps on; 0 when awake.
    pub wait_channel: u64,
    /// Result slot a waker fills before the wake.
    pub wait_result: i64,

    /// Bound reply endpoint id, created lazily at the first `call`.
    pub reply_endpoint: u64,

    pub affinity: u64,
    pub last_cpu: u32,
}

impl Thread {
    /// A kernel thread entering at `entry` with `arg`. The entry point
    /// and argument ride in callee-saved registers until the first
    /// switch lands in the trampoline.
    pub fn new_kernel(
        name: String,
        entry: extern "C" fn(u64) -> !,
        arg: u64,
        priority: u8,
    ) -> Option<Self> {
        let stack = KernelStack::allocate()?;
        let mut context = CpuContext {
            rsp: stack.top().as_u64(),
            rflags: 0x2,
            ..CpuContext::default()
        };
        context.r12 = entry as usize as u64;
        context.r13 = arg;
        context.rip = super::context::kernel_thread_entry_point();

        Some(Self {
            id: allocate_tid(),
            pid: 0,
            name,
            state: ThreadState::Ready,
            flags: ThreadFlags::KERNEL_THREAD,
            priority: priority.min(IDLE_PRIO),
            nice: 0,
            time_slice_ns: time::DEFAULT_TIME_SLICE_NS,
            context,
            kernel_stack: Some(stack),
            user_stack_top: 0,
            start_tick: time::ticks(),
            user_time_ns: 0,
            system_time_ns: 0,
            last_run_tick: 0,
            wait_channel: 0,
            wait_result: 0,
            reply_endpoint: 0,
            affinity: 1,
            last_cpu: 0,
        })
    }

    /// The main thread of a user process.
    pub fn new_user(
        name: String,
        pid: Pid,
        entry: u64,
        user_stack_top: u64,
        priority: u8,
    ) -> Option<Self> {
        let stack = KernelStack::allocate()?;
        let context = CpuContext {
            rsp: stack.top().as_u64(),
            rip: entry,
            rflags: 0x202,
            ..CpuContext::default()
        };

        Some(Self {
            id: allocate_tid(),
            pid,
            name,
            state: ThreadState::Ready,
            flags: ThreadFlags::empty(),
            priority: priority.min(IDLE_PRIO),
            nice: 0,
            time_slice_ns: time::DEFAULT_TIME_SLICE_NS,
            context,
            kernel_stack: Some(stack),
            user_stack_top,
            start_tick: time::ticks(),
            user_time_ns: 0,
            system_time_ns: 0,
            last_run_tick: 0,
            wait_channel: 0,
            wait_result: 0,
            reply_endpoint: 0,
            affinity: 1,
            last_cpu: 0,
        })
    }

    /// The per-CPU idle thread. Runs only when nothing else can.
    pub fn new_idle() -> Option<Self> {
        let mut thread = Self::new_kernel(String::from("idle"), idle_loop, 0, IDLE_PRIO)?;
        thread.flags |= ThreadFlags::IDLE;
        Some(thread)
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ThreadState::Ready
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack
            .as_ref()
            .map(|s| s.top().as_u64())
            .unwrap_or(0)
    }

    pub fn set_ready(&mut self) {
        if !matches!(self.state, ThreadState::Zombie | ThreadState::Dead) {
            self.state = ThreadState::Ready;
            self.wait_channel = 0;
        }
    }
}

extern "C" fn idle_loop(_arg: u64) -> ! {
    loop {
        crate::arch::enable_interrupts();
        crate::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_pmm;

    #[test]
    fn nice_maps_into_user_band() {
        assert_eq!(nice_to_prio(0), 120);
        assert_eq!(nice_to_prio(-20), 100);
        assert_eq!(nice_to_prio(19), 139);
        assert_eq!(nice_to_prio(-128), 100);
        assert!(nice_to_prio(-20) as usize >= MAX_RT_PRIO);
    }

    #[test]
    fn kernel_thread_has_stack_and_slice() {
        let _pmm = init_test_pmm();
        extern "C" fn dummy(_: u64) -> ! {
            unreachable!()
        }
        let t = Thread::new_kernel(String::from("t"), dummy, 7, 50).unwrap();
        assert!(t.flags.contains(ThreadFlags::KERNEL_THREAD));
        assert_eq!(t.context.r13, 7);
        assert_eq!(t.time_slice_ns, time::DEFAULT_TIME_SLICE_NS);
        let stack = t.kernel_stack.as_ref().unwrap();
        assert_eq!(stack.size(), layout::KERNEL_STACK_SIZE);
        assert_eq!(t.context.rsp, stack.top().as_u64());
    }

    #[test]
    fn zombie_cannot_return_to_ready() {
        let _pmm = init_test_pmm();
        extern "C" fn dummy(_: u64) -> ! {
            unreachable!()
        }
        let mut t = Thread::new_kernel(String::from("t"), dummy, 0, 50).unwrap();
        t.state = ThreadState::Zombie;
        t.set_ready();
        assert_eq!(t.state, ThreadState::Zombie);
    }
}
