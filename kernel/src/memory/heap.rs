//! kmalloc: the general-purpose kernel allocator.
//!
//! Requests up to 2048 bytes are served by a fixed ladder of power-of-two
//! slab caches; anything larger goes straight to the page allocator as a
//! compound block whose order is recorded in the head page's descriptor.
//! `kfree` needs no size argument: the backing page descriptor says
//! whether a pointer is slab-backed, a compound head, or a single page.
//!
//! On bare metal this front end is the `#[global_allocator]`, so every
//! `alloc::` collection in the kernel lands here.

use super::frame_allocator::{self, phys_to_virt, virt_to_phys, AllocFlags};
use super::page::PageFlags;
use super::slab::{self, SlabCache};
use super::{order_for_pages, PAGE_SIZE};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

/// Largest request the slab ladder serves.
pub const KMALLOC_MAX_SLAB: usize = 2048;

static KMALLOC_CACHES: [SlabCache; 9] = [
    SlabCache::new("kmalloc-8", 8, 8),
    SlabCache::new("kmalloc-16", 16, 8),
    SlabCache::new("kmalloc-32", 32, 8),
    SlabCache::new("kmalloc-64", 64, 8),
    SlabCache::new("kmalloc-128", 128, 8),
    SlabCache::new("kmalloc-256", 256, 8),
    SlabCache::new("kmalloc-512", 512, 8),
    SlabCache::new("kmalloc-1024", 1024, 8),
    SlabCache::new("kmalloc-2048", 2048, 8),
];

fn class_for(size: usize) -> &'static SlabCache {
    debug_assert!(size <= KMALLOC_MAX_SLAB);
    let rounded = size.next_power_of_two().max(8);
    let index = rounded.trailing_zeros() as usize - 3;
    &KMALLOC_CACHES[index]
}

/// Register the kmalloc caches with the slab registry. The caches work
/// without this; registration only feeds diagnostics.
pub fn init() {
    for cache in &KMALLOC_CACHES {
        slab::register_cache(cache);
    }
    log::info!(
        "heap: kmalloc ladder 8..={} bytes, larger requests go to the page allocator",
        KMALLOC_MAX_SLAB
    );
}

/// Allocate `size` bytes, 8-byte aligned. Null on exhaustion or a zero
/// size.
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    if size <= KMALLOC_MAX_SLAB {
        return match class_for(size).alloc() {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        };
    }

    let pages = (size as u64).div_ceil(PAGE_SIZE);
    let order = order_for_pages(pages);
    match frame_allocator::alloc_pages(order, AllocFlags::empty()) {
        Some(frame) => phys_to_virt(frame.start_address().as_u64()) as *mut u8,
        None => core::ptr::null_mut(),
    }
}

/// [`kmalloc`] plus zeroing.
pub fn kzalloc(size: usize) -> *mut u8 {
    let ptr = kmalloc(size);
    if !ptr.is_null() {
        unsafe { core::ptr::write_bytes(ptr, 0, size) };
    }
    ptr
}

/// Free a pointer from [`kmalloc`]/[`kzalloc`].
///
/// # Safety
///
/// `ptr` must be a live kmalloc pointer; it is dead after this call.
pub unsafe fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let page_virt = (ptr as u64) & !(PAGE_SIZE - 1);
    let pfn = virt_to_phys(page_virt) / PAGE_SIZE;
    let desc = frame_allocator::frame_map().frame(pfn);

    if desc.has_flags(PageFlags::SLAB) {
        let cache = unsafe { slab::cache_of(ptr) };
        unsafe { cache.free(ptr) };
    } else if desc.has_flags(PageFlags::COMPOUND_HEAD) {
        debug_assert_eq!(ptr as u64, page_virt, "compound free must use the head");
        frame_allocator::free_pages(
            PhysFrame::containing_address(PhysAddr::new(virt_to_phys(page_virt))),
            desc.order(),
        );
    } else if desc.has_flags(PageFlags::COMPOUND_TAIL) {
        panic!("kfree of a compound tail page {:p}", ptr);
    } else {
        frame_allocator::free_pages(
            PhysFrame::containing_address(PhysAddr::new(virt_to_phys(page_virt))),
            0,
        );
    }
}

/// Usable size behind a kmalloc pointer. Best effort: the slab stride,
/// the compound span, or one page.
pub fn ksize(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let page_virt = (ptr as u64) & !(PAGE_SIZE - 1);
    let pfn = virt_to_phys(page_virt) / PAGE_SIZE;
    let desc = frame_allocator::frame_map().frame(pfn);

    if desc.has_flags(PageFlags::SLAB) {
        unsafe { slab::cache_of(ptr as *mut u8) }.stride()
    } else if desc.has_flags(PageFlags::COMPOUND_HEAD) {
        (PAGE_SIZE as usize) << desc.order()
    } else {
        PAGE_SIZE as usize
    }
}

/// The kernel's global allocator on bare metal. Alignments beyond 8
/// take whole pages, which are 4 KiB aligned by construction.
#[cfg(all(not(test), target_os = "none"))]
mod global {
    use super::*;
    use core::alloc::{GlobalAlloc, Layout};

    struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if layout.align() > 8 {
                let size = layout.size().max(layout.align());
                let pages = (size as u64).div_ceil(PAGE_SIZE);
                let order = order_for_pages(pages);
                return match frame_allocator::alloc_pages(order, AllocFlags::empty()) {
                    Some(frame) => phys_to_virt(frame.start_address().as_u64()) as *mut u8,
                    None => core::ptr::null_mut(),
                };
            }
            kmalloc(layout.size())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            unsafe { kfree(ptr) };
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_pmm;

    #[test]
    fn ksize_covers_request() {
        let _pmm = init_test_pmm();
        for size in [1usize, 8, 9, 100, 2048, 2049, 5000, 100_000] {
            let ptr = kmalloc(size);
            assert!(!ptr.is_null(), "kmalloc({}) failed", size);
            assert!(ksize(ptr) >= size, "ksize({}) too small", size);
            unsafe { kfree(ptr) };
        }
    }

    #[test]
    fn zero_size_is_null() {
        let _pmm = init_test_pmm();
        assert!(kmalloc(0).is_null());
    }

    #[test]
    fn kzalloc_zeroes() {
        let _pmm = init_test_pmm();
        let ptr = kzalloc(777);
        assert!(!ptr.is_null());
        for i in 0..777 {
            assert_eq!(unsafe { ptr.add(i).read() }, 0);
        }
        unsafe { kfree(ptr) };
    }

    #[test]
    fn large_allocations_round_trip_pages() {
        let _pmm = init_test_pmm();
        let before = frame_allocator::free_page_count();
        // 3 pages -> order 2 compound block.
        let ptr = kmalloc(3 * PAGE_SIZE as usize);
        assert!(!ptr.is_null());
        assert_eq!(frame_allocator::free_page_count(), before - 4);
        assert_eq!(ksize(ptr), 4 * PAGE_SIZE as usize);
        unsafe { kfree(ptr) };
        assert_eq!(frame_allocator::free_page_count(), before);
    }

    #[test]
    fn small_free_reuses_memory() {
        let _pmm = init_test_pmm();
        let a = kmalloc(64);
        unsafe { kfree(a) };
        let b = kmalloc(64);
        // LIFO free list: the freed object comes straight back.
        assert_eq!(a, b);
        unsafe { kfree(b) };
    }

    #[test]
    fn classes_route_to_smallest_fit() {
        let _pmm = init_test_pmm();
        assert_eq!(class_for(1).object_size(), 8);
        assert_eq!(class_for(8).object_size(), 8);
        assert_eq!(class_for(9).object_size(), 16);
        assert_eq!(class_for(100).object_size(), 128);
        assert_eq!(class_for(2048).object_size(), 2048);
    }

    #[test]
    fn page_sized_allocation_is_single_page() {
        let _pmm = init_test_pmm();
        let before = frame_allocator::free_page_count();
        let ptr = kmalloc(3000);
        assert!(!ptr.is_null());
        assert_eq!(frame_allocator::free_page_count(), before - 1);
        assert_eq!(ksize(ptr), PAGE_SIZE as usize);
        unsafe { kfree(ptr) };
        assert_eq!(frame_allocator::free_page_count(), before);
    }
}
