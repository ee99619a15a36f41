//! Physical memory zones and the buddy allocator.
//!
//! A zone owns a PFN range and per-order free lists of naturally aligned
//! 2^k-page blocks. The buddy of a block at PFN `p`, order `k`, is
//! `p ^ (1 << k)`; allocation splits larger blocks downward, freeing
//! coalesces with free buddies upward. Free-list nodes live in the page
//! frame descriptors themselves, so the zone needs no allocation of its
//! own.
//!
//! All list manipulation happens under the zone lock, which is an
//! irqsave lock: the page allocator is callable from interrupt context.

use super::page::{FrameMap, PageFlags, INVALID_PFN};
use crate::spinlock::TicketLock;

/// Orders 0..MAX_ORDER; the largest block is 2^(MAX_ORDER-1) pages
/// (4 MiB with 4 KiB pages).
pub const MAX_ORDER: usize = 11;

/// Zone boundaries in PFNs (16 MiB and 4 GiB).
pub const ZONE_DMA_END_PFN: u64 = 0x100_0000 >> 12;
pub const ZONE_DMA32_END_PFN: u64 = 0x1_0000_0000 >> 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneId {
    Dma = 0,
    Dma32 = 1,
    Normal = 2,
}

impl ZoneId {
    pub fn name(self) -> &'static str {
        match self {
            ZoneId::Dma => "DMA",
            ZoneId::Dma32 => "DMA32",
            ZoneId::Normal => "Normal",
        }
    }

    pub fn from_index(index: u8) -> ZoneId {
        match index {
            0 => ZoneId::Dma,
            1 => ZoneId::Dma32,
            _ => ZoneId::Normal,
        }
    }
}

/// Which zone a PFN belongs to.
pub fn zone_for_pfn(pfn: u64) -> ZoneId {
    if pfn < ZONE_DMA_END_PFN {
        ZoneId::Dma
    } else if pfn < ZONE_DMA32_END_PFN {
        ZoneId::Dma32
    } else {
        ZoneId::Normal
    }
}

struct ZoneInner {
    start_pfn: u64,
    end_pfn: u64,
    /// Head PFN per order, INVALID_PFN when empty.
    free_lists: [u64; MAX_ORDER],
    free_pages: u64,
    alloc_count: u64,
    free_count: u64,
}

/// One zone of physical memory with its buddy free lists.
pub struct Zone {
    id: ZoneId,
    inner: TicketLock<ZoneInner>,
}

/// Snapshot of a zone's counters.
#[derive(Debug, Clone, Copy)]
pub struct ZoneStats {
    pub id: ZoneId,
    pub start_pfn: u64,
    pub end_pfn: u64,
    pub free_pages: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

impl Zone {
    pub const fn new(id: ZoneId) -> Self {
        Self {
            id,
            inner: TicketLock::new(ZoneInner {
                start_pfn: 0,
                end_pfn: 0,
                free_lists: [INVALID_PFN; MAX_ORDER],
                free_pages: 0,
                alloc_count: 0,
                free_count: 0,
            }),
        }
    }

    pub fn id(&self) -> ZoneId {
        self.id
    }

    /// Set the PFN range this zone covers. Called once during PMM init.
    pub fn set_span(&self, start_pfn: u64, end_pfn: u64) {
        let mut inner = self.inner.lock_irqsave();
        inner.start_pfn = start_pfn;
        inner.end_pfn = end_pfn;
    }

    pub fn free_pages(&self) -> u64 {
        self.inner.lock_irqsave().free_pages
    }

    pub fn stats(&self) -> ZoneStats {
        let inner = self.inner.lock_irqsave();
        ZoneStats {
            id: self.id,
            start_pfn: inner.start_pfn,
            end_pfn: inner.end_pfn,
            free_pages: inner.free_pages,
            alloc_count: inner.alloc_count,
            free_count: inner.free_count,
        }
    }

    /// Length of the free list at `order`. Diagnostic/test hook.
    pub fn free_list_len(&self, frames: &FrameMap, order: usize) -> usize {
        let inner = self.inner.lock_irqsave();
        let mut len = 0;
        let mut pfn = inner.free_lists[order];
        while pfn != INVALID_PFN {
            len += 1;
            pfn = frames.frame(pfn).next_free();
        }
        len
    }

    /// Head of the free list at `order`, if any. Test hook.
    pub fn free_list_head(&self, order: usize) -> Option<u64> {
        let inner = self.inner.lock_irqsave();
        match inner.free_lists[order] {
            INVALID_PFN => None,
            pfn => Some(pfn),
        }
    }

    /// Seed `[start_pfn, end_pfn)` into the free lists as the largest
    /// naturally aligned blocks that fit. The range must not overlap
    /// anything already owned by the buddy system.
    pub fn seed_range(&self, frames: &FrameMap, start_pfn: u64, end_pfn: u64) {
        let mut inner = self.inner.lock_irqsave();
        let mut pfn = start_pfn;
        while pfn < end_pfn {
            frames.frame(pfn).set_zone(self.id as u8);
            // Largest order allowed by both the block's alignment and
            // the remaining length.
            let align_order = if pfn == 0 {
                MAX_ORDER - 1
            } else {
                (pfn.trailing_zeros() as usize).min(MAX_ORDER - 1)
            };
            let mut order = align_order;
            while order > 0 && pfn + (1u64 << order) > end_pfn {
                order -= 1;
            }
            for tail in pfn..pfn + (1u64 << order) {
                frames.frame(tail).set_zone(self.id as u8);
            }
            push_free(&mut inner, frames, pfn, order);
            inner.free_pages += 1u64 << order;
            pfn += 1u64 << order;
        }
    }

    /// Allocate a naturally aligned block of 2^order pages.
    ///
    /// Scans orders `order..MAX_ORDER` for a nonempty free list, splits
    /// back down to the requested size, and marks the block allocated
    /// (refcount 1, compound flags for order > 0). Returns the head PFN,
    /// or `None` when no block of sufficient order exists.
    pub fn alloc_block(&self, frames: &FrameMap, order: usize) -> Option<u64> {
        if order >= MAX_ORDER {
            return None;
        }
        let mut inner = self.inner.lock_irqsave();

        let found = (order..MAX_ORDER).find(|&k| inner.free_lists[k] != INVALID_PFN)?;
        let pfn = pop_free(&mut inner, frames, found).expect("nonempty list must pop");

        // Split back down, returning the upper halves.
        let mut k = found;
        while k > order {
            k -= 1;
            let upper = pfn + (1u64 << k);
            push_free(&mut inner, frames, upper, k);
        }

        let head = frames.frame(pfn);
        head.clear_flags(PageFlags::BUDDY);
        head.set_order(order);
        head.set_ref_count(1);
        if order > 0 {
            head.set_flags(PageFlags::COMPOUND_HEAD);
            for tail in pfn + 1..pfn + (1u64 << order) {
                let t = frames.frame(tail);
                t.set_flags(PageFlags::COMPOUND_TAIL);
                t.set_compound_head(pfn);
                t.set_ref_count(0);
            }
        }

        inner.free_pages -= 1u64 << order;
        inner.alloc_count += 1;
        Some(pfn)
    }

    /// Return a block of 2^order pages starting at `pfn`, coalescing
    /// with free buddies as far as possible.
    pub fn free_block(&self, frames: &FrameMap, pfn: u64, order: usize) {
        assert!(order < MAX_ORDER);
        assert_eq!(pfn & ((1u64 << order) - 1), 0, "misaligned buddy free");
        let mut inner = self.inner.lock_irqsave();

        debug_assert!(
            !frames.frame(pfn).has_flags(PageFlags::BUDDY),
            "double free of pfn {:#x}",
            pfn
        );

        // Strip allocation-time state off the whole block.
        let head = frames.frame(pfn);
        head.clear_flags(PageFlags::COMPOUND_HEAD | PageFlags::SLAB | PageFlags::DIRTY);
        head.set_ref_count(0);
        head.set_private(0);
        for tail in pfn + 1..pfn + (1u64 << order) {
            let t = frames.frame(tail);
            t.clear_flags(PageFlags::COMPOUND_TAIL);
            t.set_compound_head(INVALID_PFN);
        }

        let mut pfn = pfn;
        let mut k = order;
        while k + 1 < MAX_ORDER {
            let buddy = pfn ^ (1u64 << k);
            if buddy < inner.start_pfn || buddy + (1u64 << k) > inner.end_pfn {
                break;
            }
            let b = frames.frame(buddy);
            if !b.has_flags(PageFlags::BUDDY) || b.order() != k {
                break;
            }
            remove_free(&mut inner, frames, buddy, k);
            pfn &= !(1u64 << k);
            k += 1;
        }

        push_free(&mut inner, frames, pfn, k);
        inner.free_pages += 1u64 << order;
        inner.free_count += 1;
    }

    /// Verify the zone's accounting: the free-page counter must equal
    /// the pages held across all free lists, and every listed block must
    /// be naturally aligned. Debug/test integrity check.
    pub fn check_integrity(&self, frames: &FrameMap) -> bool {
        let inner = self.inner.lock_irqsave();
        let mut counted = 0u64;
        for order in 0..MAX_ORDER {
            let mut pfn = inner.free_lists[order];
            while pfn != INVALID_PFN {
                if pfn & ((1u64 << order) - 1) != 0 {
                    return false;
                }
                let f = frames.frame(pfn);
                if !f.has_flags(PageFlags::BUDDY) || f.order() != order {
                    return false;
                }
                counted += 1u64 << order;
                pfn = f.next_free();
            }
        }
        counted == inner.free_pages
    }
}

fn push_free(inner: &mut ZoneInner, frames: &FrameMap, pfn: u64, order: usize) {
    let frame = frames.frame(pfn);
    let old_head = inner.free_lists[order];
    frame.set_next_free(old_head);
    frame.set_prev_free(INVALID_PFN);
    frame.set_order(order);
    frame.set_flags(PageFlags::BUDDY);
    if old_head != INVALID_PFN {
        frames.frame(old_head).set_prev_free(pfn);
    }
    inner.free_lists[order] = pfn;
}

fn pop_free(inner: &mut ZoneInner, frames: &FrameMap, order: usize) -> Option<u64> {
    let pfn = inner.free_lists[order];
    if pfn == INVALID_PFN {
        return None;
    }
    remove_free(inner, frames, pfn, order);
    Some(pfn)
}

fn remove_free(inner: &mut ZoneInner, frames: &FrameMap, pfn: u64, order: usize) {
    let frame = frames.frame(pfn);
    let next = frame.next_free();
    let prev = frame.prev_free();
    if prev != INVALID_PFN {
        frames.frame(prev).set_next_free(next);
    } else {
        inner.free_lists[order] = next;
    }
    if next != INVALID_PFN {
        frames.frame(next).set_prev_free(prev);
    }
    frame.set_next_free(INVALID_PFN);
    frame.set_prev_free(INVALID_PFN);
    frame.clear_flags(PageFlags::BUDDY);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page::test_frame_map;

    fn seeded_zone(pages: u64) -> (Zone, FrameMap) {
        let frames = test_frame_map(0, pages as usize);
        let zone = Zone::new(ZoneId::Dma);
        zone.set_span(0, pages);
        for pfn in 0..pages {
            frames.frame(pfn).clear_flags(PageFlags::RESERVED);
        }
        zone.seed_range(&frames, 0, pages);
        (zone, frames)
    }

    #[test]
    fn seed_produces_aligned_blocks() {
        let (zone, frames) = seeded_zone(16);
        assert_eq!(zone.free_pages(), 16);
        // 16 aligned pages at PFN 0 seed as a single order-4 block.
        assert_eq!(zone.free_list_len(&frames, 4), 1);
        assert_eq!(zone.free_list_head(4), Some(0));
        assert!(zone.check_integrity(&frames));
    }

    #[test]
    fn split_and_full_coalesce() {
        // Two order-0 allocations out of a 16-page zone, freed again,
        // must re-coalesce to a single order-4 block.
        let (zone, frames) = seeded_zone(16);

        let a = zone.alloc_block(&frames, 0).unwrap();
        assert_eq!(a, 0);
        assert_eq!(zone.free_pages(), 15);

        let b = zone.alloc_block(&frames, 0).unwrap();
        assert_eq!(b, 1);
        assert_eq!(zone.free_pages(), 14);

        zone.free_block(&frames, a, 0);
        zone.free_block(&frames, b, 0);

        assert_eq!(zone.free_pages(), 16);
        assert_eq!(zone.free_list_len(&frames, 4), 1);
        assert_eq!(zone.free_list_head(4), Some(0));
        for order in 0..4 {
            assert_eq!(zone.free_list_len(&frames, order), 0);
        }
        assert!(zone.check_integrity(&frames));
    }

    #[test]
    fn exhaust_single_page_zone() {
        let (zone, frames) = seeded_zone(1);
        let pfn = zone.alloc_block(&frames, 0).unwrap();
        assert_eq!(pfn, 0);
        assert_eq!(zone.free_pages(), 0);
        for order in 0..MAX_ORDER {
            assert_eq!(zone.free_list_len(&frames, order), 0);
        }
        assert!(zone.alloc_block(&frames, 0).is_none());
        zone.free_block(&frames, pfn, 0);
        assert_eq!(zone.free_pages(), 1);
    }

    #[test]
    fn top_order_allocation_needs_aligned_run() {
        let top = MAX_ORDER - 1;
        let pages = 1u64 << top;

        let (zone, frames) = seeded_zone(pages);
        let pfn = zone.alloc_block(&frames, top).expect("aligned run present");
        assert_eq!(pfn, 0);
        assert_eq!(zone.free_pages(), 0);
        zone.free_block(&frames, pfn, top);

        // A zone whose aligned run is too small cannot satisfy it.
        let (small_zone, small_frames) = seeded_zone(pages - 1);
        assert!(small_zone.alloc_block(&small_frames, top).is_none());
    }

    #[test]
    fn compound_marking() {
        let (zone, frames) = seeded_zone(16);
        let pfn = zone.alloc_block(&frames, 2).unwrap();
        let head = frames.frame(pfn);
        assert!(head.has_flags(PageFlags::COMPOUND_HEAD));
        assert_eq!(head.order(), 2);
        for tail in pfn + 1..pfn + 4 {
            let t = frames.frame(tail);
            assert!(t.has_flags(PageFlags::COMPOUND_TAIL));
            assert_eq!(t.compound_head(), pfn);
        }
        zone.free_block(&frames, pfn, 2);
        assert!(!frames.frame(pfn).has_flags(PageFlags::COMPOUND_HEAD));
        assert!(!frames.frame(pfn + 1).has_flags(PageFlags::COMPOUND_TAIL));
    }

    #[test]
    fn buddy_alignment_invariant_under_churn() {
        let (zone, frames) = seeded_zone(64);
        let mut held = alloc::vec::Vec::new();
        for order in [0usize, 1, 0, 2, 1, 0] {
            let pfn = zone.alloc_block(&frames, order).unwrap();
            assert_eq!(pfn & ((1u64 << order) - 1), 0, "block must be naturally aligned");
            held.push((pfn, order));
        }
        assert!(zone.check_integrity(&frames));
        for (pfn, order) in held.into_iter().rev() {
            zone.free_block(&frames, pfn, order);
        }
        assert_eq!(zone.free_pages(), 64);
        assert!(zone.check_integrity(&frames));
        // Everything must have cascaded back to a single order-6 block,
        // seeded as order-6 because 64 pages at PFN 0 are 64-aligned.
        assert_eq!(zone.free_list_len(&frames, 6), 1);
    }

    #[test]
    fn unaligned_seed_start() {
        // Pages 3..16: expect blocks 3(o0), 4..8(o2), 8..16(o3).
        let frames = test_frame_map(0, 16);
        let zone = Zone::new(ZoneId::Dma);
        zone.set_span(0, 16);
        zone.seed_range(&frames, 3, 16);
        assert_eq!(zone.free_pages(), 13);
        assert_eq!(zone.free_list_len(&frames, 0), 1);
        assert_eq!(zone.free_list_len(&frames, 2), 1);
        assert_eq!(zone.free_list_len(&frames, 3), 1);
        assert!(zone.check_integrity(&frames));
    }

    #[test]
    fn zone_classification() {
        assert_eq!(zone_for_pfn(0), ZoneId::Dma);
        assert_eq!(zone_for_pfn(ZONE_DMA_END_PFN - 1), ZoneId::Dma);
        assert_eq!(zone_for_pfn(ZONE_DMA_END_PFN), ZoneId::Dma32);
        assert_eq!(zone_for_pfn(ZONE_DMA32_END_PFN), ZoneId::Normal);
    }
}
