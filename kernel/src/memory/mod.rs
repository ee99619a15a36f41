//! Memory management: physical frames, paging, address spaces, heap.
//!
//! Subsystem layering, leaves first: the PMM owns page frames; paging
//! maintains the 4-level tables; the slab/kmalloc heap sits on the PMM;
//! the address-space layer drives VMAs, page faults, and fork-time COW
//! on top of all of them.

pub mod address_space;
pub mod bitmap;
pub mod frame_allocator;
pub mod heap;
pub mod layout;
pub mod page;
pub mod paging;
pub mod slab;
pub mod tlb;
pub mod vma;
pub mod zone;

pub use frame_allocator::{
    alloc_pages, allocate_frame, allocate_zeroed_frame, deallocate_frame, frame_decref,
    frame_incref, frame_refcount, free_page_count, free_pages, hhdm_offset, memory_stats,
    phys_to_virt, put_frame, virt_to_phys, AllocFlags,
};
pub use zone::MAX_ORDER;

use crate::boot::BootInfo;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

/// Page size. The only size this kernel maps.
pub const PAGE_SIZE: u64 = 4096;

/// Smallest order whose block covers `pages` pages.
pub fn order_for_pages(pages: u64) -> usize {
    let pages = pages.max(1);
    (64 - (pages - 1).leading_zeros()) as usize
}

/// Bring up physical memory and the kernel page-table root.
pub fn init(boot_info: &BootInfo) {
    frame_allocator::init(boot_info);
    paging::init_kernel_root();
}

/// Page-fault entry point, called by the architecture layer's exception
/// vector with the faulting address and the hardware error bits.
///
/// Kernel-mode faults on kernel addresses are fatal by design. User
/// faults are handed to the owning address space; if it cannot resolve
/// them (no VMA, protection violation, out of memory) the fault is fatal
/// to the calling process.
pub fn handle_page_fault(fault_addr: VirtAddr, error_code: PageFaultErrorCode) {
    let from_user = error_code.contains(PageFaultErrorCode::USER_MODE);
    if layout::is_kernel_address(fault_addr.as_u64()) && !from_user {
        panic!(
            "kernel page fault at {:#x} ({:?})",
            fault_addr.as_u64(),
            error_code
        );
    }

    let pid = crate::process::current_pid();
    let resolved = crate::process::with_current_address_space(|aspace| {
        aspace.handle_fault(fault_addr, error_code)
    });

    match resolved {
        Some(Ok(())) => {}
        Some(Err(err)) => {
            log::error!(
                "pid {} unresolvable page fault at {:#x}: {:?}",
                pid,
                fault_addr.as_u64(),
                err
            );
            crate::process::fatal_fault();
        }
        None => {
            log::error!(
                "page fault at {:#x} with no current address space",
                fault_addr.as_u64()
            );
            crate::process::fatal_fault();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_for_pages_covers() {
        assert_eq!(order_for_pages(0), 0);
        assert_eq!(order_for_pages(1), 0);
        assert_eq!(order_for_pages(2), 1);
        assert_eq!(order_for_pages(3), 2);
        assert_eq!(order_for_pages(4), 2);
        assert_eq!(order_for_pages(5), 3);
        assert_eq!(order_for_pages(1024), 10);
    }

    #[test]
    fn test_pmm_comes_up() {
        let _pmm = test_support::init_test_pmm();
        assert!(frame_allocator::is_initialized());
        assert!(free_page_count() > 0);
    }

    #[test]
    fn page_fault_entry_point_resolves_user_fault() {
        use crate::memory::vma::VmaFlags;
        use crate::process;
        use crate::task::scheduler;

        let _pmm = test_support::init_test_pmm();
        scheduler::test_support::reset();

        let pid = process::create_user_process("pf", layout::USER_CODE_BASE).unwrap();
        process::with_address_space(pid, |aspace| {
            aspace
                .mmap(
                    Some(VirtAddr::new(0x4600_0000)),
                    4 * PAGE_SIZE,
                    VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANONYMOUS,
                    None,
                )
                .unwrap();
        })
        .unwrap();
        scheduler::schedule();

        handle_page_fault(
            VirtAddr::new(0x4600_1000),
            PageFaultErrorCode::USER_MODE | PageFaultErrorCode::CAUSED_BY_WRITE,
        );

        let present = process::with_address_space(pid, |aspace| {
            aspace
                .tables()
                .translate(VirtAddr::new(0x4600_1000))
                .is_some()
        })
        .unwrap();
        assert!(present, "the exported fault entry must demand-page");

        process::remove_for_test(pid);
        scheduler::test_support::reset();
    }
}
