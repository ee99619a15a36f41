//! Canonical kernel memory layout constants.
//!
//! The higher half belongs to the kernel and is mapped identically into
//! every address space; the lower canonical half belongs to userspace.
//! Regions here are virtual-address budgets, not mappings: nothing is
//! populated until a subsystem asks for it.

/// First address of kernel space; everything at or above is kernel.
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// Base of the higher-half direct map. The actual runtime offset comes
/// from the bootloader and is recorded at PMM init; this constant is the
/// conventional location.
pub const HHDM_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Kernel stack region: per-thread kernel stacks are carved from here.
pub const KERNEL_STACK_REGION_BASE: u64 = 0xFFFF_C900_0000_0000;

/// Size of one kernel stack (16 KiB) plus an unmapped guard page below.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;
pub const KERNEL_STACK_GUARD_SIZE: usize = 4096;

/// vmalloc-style region for large kernel mappings.
pub const VMALLOC_BASE: u64 = 0xFFFF_E000_0000_0000;

/// Kernel image high alias.
pub const KERNEL_TEXT_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// End of the user canonical half (exclusive).
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Top of the user stack. One page below the canonical boundary stays
/// unmapped as a guard.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Default user stack reservation (64 KiB).
pub const USER_STACK_SIZE: u64 = 64 * 1024;

/// Base address for mmap-style hole searches.
pub const USER_MMAP_BASE: u64 = 0x0000_7000_0000_0000;

/// Default base for program text/data.
pub const USER_CODE_BASE: u64 = 0x0000_0000_0040_0000;

/// How far below a stack VMA a fault still counts as stack growth.
pub const STACK_GROWTH_WINDOW_PAGES: u64 = 256;

#[inline]
pub fn is_kernel_address(addr: u64) -> bool {
    addr >= KERNEL_SPACE_START
}

#[inline]
pub fn is_user_address(addr: u64) -> bool {
    addr < USER_SPACE_END
}

// The user regions must not collide.
const _: () = assert!(USER_CODE_BASE < USER_MMAP_BASE);
const _: () = assert!(USER_MMAP_BASE < USER_STACK_TOP - USER_STACK_SIZE);
const _: () = assert!(USER_STACK_TOP < USER_SPACE_END);
const _: () = assert!(KERNEL_STACK_REGION_BASE > HHDM_BASE);
