//! Bare-metal panic path.
//!
//! Recoverable errors are values everywhere in this kernel; reaching
//! here means an assertion or integrity check failed. Print a dump over
//! serial and halt with interrupts disabled. Hosted builds keep the
//! platform's own panic machinery.

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::arch::disable_interrupts();

    crate::serial_println!();
    crate::serial_println!("KERNEL PANIC: {}", info);
    crate::serial_println!(
        "  tid={} preempt_count={}",
        crate::per_cpu::current_tid(),
        crate::per_cpu::preempt_count()
    );
    crate::serial_println!("  ticks={}", crate::time::ticks());

    loop {
        crate::arch::halt();
    }
}
