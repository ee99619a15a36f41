//! Privileged-instruction seam.
//!
//! Every instruction that only makes sense in ring 0 (interrupt flag
//! control, TLB invalidation, CR3, `hlt`) goes through this module. On
//! bare metal (`target_os = "none"`) these are the real instructions;
//! hosted builds get no-op stubs so the rest of the kernel can be
//! exercised by ordinary `cargo test` runs.

#[cfg(target_os = "none")]
mod imp {
    use x86_64::instructions::interrupts;
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::VirtAddr;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        interrupts::are_enabled()
    }

    #[inline]
    pub fn disable_interrupts() {
        interrupts::disable();
    }

    #[inline]
    pub fn enable_interrupts() {
        interrupts::enable();
    }

    /// Save the interrupt flag and disable interrupts. Pair with
    /// [`restore_interrupts`].
    #[inline]
    pub fn save_and_disable_interrupts() -> bool {
        let enabled = interrupts::are_enabled();
        if enabled {
            interrupts::disable();
        }
        enabled
    }

    #[inline]
    pub fn restore_interrupts(were_enabled: bool) {
        if were_enabled {
            interrupts::enable();
        }
    }

    #[inline]
    pub fn flush_tlb_page(addr: u64) {
        x86_64::instructions::tlb::flush(VirtAddr::new(addr));
    }

    #[inline]
    pub fn flush_tlb_all() {
        x86_64::instructions::tlb::flush_all();
    }

    /// Write the page-table base register.
    ///
    /// # Safety
    ///
    /// `pml4` must be the physical frame of a valid top-level table that
    /// maps the currently executing code and stack.
    #[inline]
    pub unsafe fn write_page_table_root(pml4: PhysFrame) {
        unsafe { Cr3::write(pml4, Cr3Flags::empty()) };
    }

    #[inline]
    pub fn read_page_table_root() -> u64 {
        Cr3::read().0.start_address().as_u64()
    }

    #[inline]
    pub fn halt() {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    //! Hosted stubs. State-free: the hosted build never takes real
    //! interrupts and never owns the MMU, so flag bookkeeping would only
    //! pretend at fidelity the environment cannot provide.

    use x86_64::structures::paging::PhysFrame;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        false
    }

    #[inline]
    pub fn disable_interrupts() {}

    #[inline]
    pub fn enable_interrupts() {}

    #[inline]
    pub fn save_and_disable_interrupts() -> bool {
        false
    }

    #[inline]
    pub fn restore_interrupts(_were_enabled: bool) {}

    #[inline]
    pub fn flush_tlb_page(_addr: u64) {}

    #[inline]
    pub fn flush_tlb_all() {}

    #[inline]
    pub unsafe fn write_page_table_root(_pml4: PhysFrame) {}

    #[inline]
    pub fn read_page_table_root() -> u64 {
        0
    }

    #[inline]
    pub fn halt() {}
}

pub use imp::*;

/// Run `f` with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let saved = save_and_disable_interrupts();
    let ret = f();
    restore_interrupts(saved);
    ret
}
