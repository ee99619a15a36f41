//! Core of an educational x86_64 microkernel.
//!
//! The crate covers the pieces that jointly enforce the isolation
//! invariants: the physical page allocator (buddy system over per-zone
//! free lists), the 4-level paging manager and address-space model with
//! demand paging and copy-on-write, the slab/kmalloc kernel heap, the
//! priority-preemptive scheduler, synchronous rendezvous IPC, and
//! per-process capability spaces.
//!
//! Everything outside the core (bootloader trampoline, GDT/IDT/TSS,
//! PIC/PIT programming, ELF loading, userspace servers) talks to us
//! through a narrow surface: one [`boot::BootInfo`] descriptor at
//! startup, the exported [`memory::handle_page_fault`],
//! [`syscall::syscall_dispatch`] and [`time::timer_tick`] entry points,
//! and the serial diagnostics sink.
//!
//! Privileged instructions live behind the [`arch`] seam, so the whole
//! core also builds and runs hosted, which is how the test suite
//! exercises it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod ipc;
pub mod logger;
pub mod memory;
pub mod panic;
pub mod per_cpu;
pub mod process;
pub mod serial;
pub mod spinlock;
pub mod syscall;
pub mod task;
pub mod time;

use boot::BootInfo;

/// Bring the core up from the boot-info descriptor.
///
/// Must be called exactly once, before interrupts are enabled. Ordering
/// matters: the logger only needs the serial port, the heap needs the
/// page allocator, and the scheduler needs the heap for its thread
/// registry.
pub fn init(boot_info: &BootInfo) {
    serial::init();
    logger::init();

    log::info!(
        "muon: hhdm={:#x} kernel_phys={:#x} kernel_virt={:#x}",
        boot_info.hhdm_offset,
        boot_info.kernel_phys_base,
        boot_info.kernel_virt_base
    );

    memory::init(boot_info);
    memory::heap::init();
    boot::cache_boot_modules(boot_info);
    task::scheduler::init();
    process::init();
    syscall::init();

    log::info!("muon: core initialized, {} ticks/s", time::HZ);
}

/// Halt the CPU forever with interrupts disabled.
pub fn halt_loop() -> ! {
    arch::disable_interrupts();
    loop {
        arch::halt();
    }
}
