//! Page-frame descriptors.
//!
//! One descriptor per physical page frame, created once at PMM init and
//! never destroyed; individual descriptors transition between free and
//! allocated for the machine's whole lifetime. The descriptor doubles as
//! the buddy allocator's free-list node (PFN links instead of pointers)
//! and carries the per-frame reference count that copy-on-write sharing
//! relies on.
//!
//! Fields are atomics: free-list links and order are only written under
//! the owning zone's lock, but reads happen elsewhere (kfree dispatch,
//! diagnostics) and the layout is meant to survive SMP unchanged.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Sentinel PFN meaning "no link".
pub const INVALID_PFN: u64 = u64::MAX;

bitflags! {
    /// Page-frame state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Never handed out: firmware, kernel image, descriptor arrays.
        const RESERVED      = 1 << 0;
        /// Currently on a buddy free list.
        const BUDDY         = 1 << 1;
        /// Backs a slab; `private` points at the owning cache's page.
        const SLAB          = 1 << 2;
        /// Head of a multi-page (order > 0) allocation.
        const COMPOUND_HEAD = 1 << 3;
        /// Tail page of a multi-page allocation.
        const COMPOUND_TAIL = 1 << 4;
        const LOCKED        = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Owned by the kernel itself (stacks, page tables).
        const KERNEL        = 1 << 7;
    }
}

/// Per-frame descriptor. Cache-line sized so descriptor churn on one
/// frame never false-shares with its neighbors.
#[repr(C, align(64))]
pub struct PageFrame {
    flags: AtomicU32,
    /// Buddy order while free; allocation order for compound heads.
    order: AtomicU8,
    /// Owning zone index.
    zone: AtomicU8,
    _pad: [u8; 2],
    /// Address-space references to this frame. Freed only at zero.
    refcount: AtomicU32,
    /// Page-table mappings of this frame.
    mapcount: AtomicU32,
    /// Subsystem-private word; the slab layer keeps its cache here.
    private: AtomicUsize,
    /// Free-list links, valid while `BUDDY` is set.
    next_free: AtomicU64,
    prev_free: AtomicU64,
    /// PFN of the compound head, valid while `COMPOUND_TAIL` is set.
    compound_head: AtomicU64,
}

impl PageFrame {
    pub const fn new_reserved() -> Self {
        Self {
            flags: AtomicU32::new(PageFlags::RESERVED.bits()),
            order: AtomicU8::new(0),
            zone: AtomicU8::new(0),
            _pad: [0; 2],
            refcount: AtomicU32::new(0),
            mapcount: AtomicU32::new(0),
            private: AtomicUsize::new(0),
            next_free: AtomicU64::new(INVALID_PFN),
            prev_free: AtomicU64::new(INVALID_PFN),
            compound_head: AtomicU64::new(INVALID_PFN),
        }
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_flags(&self, set: PageFlags) {
        self.flags.fetch_or(set.bits(), Ordering::Relaxed);
    }

    pub fn clear_flags(&self, clear: PageFlags) {
        self.flags.fetch_and(!clear.bits(), Ordering::Relaxed);
    }

    pub fn has_flags(&self, check: PageFlags) -> bool {
        self.flags().contains(check)
    }

    pub fn order(&self) -> usize {
        self.order.load(Ordering::Relaxed) as usize
    }

    pub fn set_order(&self, order: usize) {
        self.order.store(order as u8, Ordering::Relaxed);
    }

    pub fn zone(&self) -> u8 {
        self.zone.load(Ordering::Relaxed)
    }

    pub fn set_zone(&self, zone: u8) {
        self.zone.store(zone, Ordering::Relaxed);
    }

    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn set_ref_count(&self, count: u32) {
        self.refcount.store(count, Ordering::Release);
    }

    pub fn inc_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrement; returns the previous count. A return of 1 means the
    /// caller just dropped the last reference and owns the frame.
    pub fn dec_ref(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "page refcount underflow");
        prev
    }

    pub fn map_count(&self) -> u32 {
        self.mapcount.load(Ordering::Relaxed)
    }

    pub fn inc_map(&self) {
        self.mapcount.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_map(&self) {
        self.mapcount.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn private(&self) -> usize {
        self.private.load(Ordering::Relaxed)
    }

    pub fn set_private(&self, value: usize) {
        self.private.store(value, Ordering::Relaxed);
    }

    pub fn next_free(&self) -> u64 {
        self.next_free.load(Ordering::Relaxed)
    }

    pub fn set_next_free(&self, pfn: u64) {
        self.next_free.store(pfn, Ordering::Relaxed);
    }

    pub fn prev_free(&self) -> u64 {
        self.prev_free.load(Ordering::Relaxed)
    }

    pub fn set_prev_free(&self, pfn: u64) {
        self.prev_free.store(pfn, Ordering::Relaxed);
    }

    pub fn compound_head(&self) -> u64 {
        self.compound_head.load(Ordering::Relaxed)
    }

    pub fn set_compound_head(&self, pfn: u64) {
        self.compound_head.store(pfn, Ordering::Relaxed);
    }
}

// One descriptor must stay within a cache line.
const _: () = assert!(core::mem::size_of::<PageFrame>() == 64);

/// The descriptor array: one [`PageFrame`] per physical page in
/// `[base_pfn, base_pfn + len)`.
pub struct FrameMap {
    base_pfn: u64,
    len: usize,
    frames: *const PageFrame,
}

unsafe impl Send for FrameMap {}
unsafe impl Sync for FrameMap {}

impl FrameMap {
    /// Build the map over raw descriptor storage, initializing every
    /// descriptor to the reserved state.
    ///
    /// # Safety
    ///
    /// `frames` must point to storage for `len` descriptors, suitably
    /// aligned, that outlives the map and is not used by anyone else.
    pub unsafe fn from_raw(base_pfn: u64, frames: *mut PageFrame, len: usize) -> Self {
        for i in 0..len {
            unsafe { frames.add(i).write(PageFrame::new_reserved()) };
        }
        Self {
            base_pfn,
            len,
            frames,
        }
    }

    pub fn base_pfn(&self) -> u64 {
        self.base_pfn
    }

    pub fn end_pfn(&self) -> u64 {
        self.base_pfn + self.len as u64
    }

    pub fn contains(&self, pfn: u64) -> bool {
        pfn >= self.base_pfn && pfn < self.end_pfn()
    }

    /// Descriptor for `pfn`. Panics on out-of-range PFNs: those always
    /// indicate corrupted bookkeeping, never a recoverable condition.
    pub fn frame(&self, pfn: u64) -> &PageFrame {
        assert!(
            self.contains(pfn),
            "pfn {:#x} outside frame map [{:#x}, {:#x})",
            pfn,
            self.base_pfn,
            self.end_pfn()
        );
        unsafe { &*self.frames.add((pfn - self.base_pfn) as usize) }
    }

    pub fn get(&self, pfn: u64) -> Option<&PageFrame> {
        if self.contains(pfn) {
            Some(self.frame(pfn))
        } else {
            None
        }
    }

    /// Bytes of descriptor storage needed for `pages` frames.
    pub fn storage_size(pages: u64) -> u64 {
        pages * core::mem::size_of::<PageFrame>() as u64
    }
}

#[cfg(test)]
pub(crate) fn test_frame_map(base_pfn: u64, len: usize) -> FrameMap {
    let mut storage = alloc::vec::Vec::with_capacity(len);
    for _ in 0..len {
        storage.push(PageFrame::new_reserved());
    }
    let slice: &'static mut [PageFrame] = alloc::vec::Vec::leak(storage);
    unsafe { FrameMap::from_raw(base_pfn, slice.as_mut_ptr(), len) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_is_cache_line_sized() {
        assert_eq!(core::mem::size_of::<PageFrame>(), 64);
        assert_eq!(core::mem::align_of::<PageFrame>(), 64);
    }

    #[test]
    fn new_descriptors_start_reserved() {
        let map = test_frame_map(100, 4);
        assert!(map.frame(100).has_flags(PageFlags::RESERVED));
        assert!(map.frame(103).has_flags(PageFlags::RESERVED));
        assert!(!map.contains(104));
        assert!(map.get(104).is_none());
    }

    #[test]
    fn refcount_transitions() {
        let map = test_frame_map(0, 1);
        let frame = map.frame(0);
        frame.set_ref_count(1);
        assert_eq!(frame.inc_ref(), 1);
        assert_eq!(frame.ref_count(), 2);
        assert_eq!(frame.dec_ref(), 2);
        assert_eq!(frame.dec_ref(), 1);
        assert_eq!(frame.ref_count(), 0);
    }
}
