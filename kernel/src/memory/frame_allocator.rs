//! The physical memory manager.
//!
//! Owns every page frame from boot to shutdown. Init consumes the
//! bootloader's memory map: a bump allocator carves the memory bitmap
//! and the page-frame descriptor array out of the largest usable region,
//! every frame starts reserved, usable regions are cleared, the boot
//! allocations are re-marked, and whatever is still clear is fed to the
//! per-zone buddy allocators as maximal aligned runs. After that the
//! "initialized" latch is set and no further bump allocation happens.
//!
//! Allocation never sleeps and is callable from interrupt context
//! (irqsave zone locks); out of memory is reported as `None`, never
//! retried.

use super::bitmap::MemoryBitmap;
use super::page::{FrameMap, PageFlags, PageFrame};
use super::zone::{Zone, ZoneId, MAX_ORDER};
use super::PAGE_SIZE;
use crate::boot::{BootInfo, MemoryRegion};
use bitflags::bitflags;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

bitflags! {
    /// Allocation request modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the block before returning it.
        const ZERO  = 1 << 0;
        /// Must come from the DMA zone (no fallback upward).
        const DMA   = 1 << 1;
        /// Must come from DMA32 or below.
        const DMA32 = 1 << 2;
    }
}

struct Pmm {
    frames: FrameMap,
    zones: [Zone; 3],
    #[allow(dead_code)]
    bitmap: MemoryBitmap,
    total_pages: u64,
}

static PMM: OnceCell<Pmm> = OnceCell::uninit();
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Virtual offset of the higher-half direct map.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Translate a physical address through the direct map.
pub fn phys_to_virt(phys: u64) -> u64 {
    phys + hhdm_offset()
}

/// Inverse of [`phys_to_virt`]; only valid for direct-map addresses.
pub fn virt_to_phys(virt: u64) -> u64 {
    virt - hhdm_offset()
}

/// Bump allocator used only during init, carving from one usable region.
struct BootstrapAllocator {
    next: u64,
    end: u64,
}

impl BootstrapAllocator {
    fn alloc(&mut self, bytes: u64, align: u64) -> Option<u64> {
        let start = self.next.next_multiple_of(align);
        let end = start.checked_add(bytes)?;
        if end > self.end {
            return None;
        }
        self.next = end;
        Some(start)
    }
}

/// Initialize the PMM from the boot-info descriptor.
pub fn init(boot_info: &BootInfo) {
    init_from_map(boot_info.hhdm_offset, boot_info.memory_map);
}

/// Core init path, shared with the hosted test harness (which feeds an
/// arena-backed memory map with an HHDM offset of zero).
pub fn init_from_map(hhdm: u64, memory_map: &[MemoryRegion]) {
    HHDM_OFFSET.store(hhdm, Ordering::Relaxed);

    let usable = |r: &&MemoryRegion| r.kind.is_usable();

    // Bounds of the frame universe: everything between the lowest and
    // highest usable page.
    let min_pfn = memory_map
        .iter()
        .filter(usable)
        .map(|r| r.base / PAGE_SIZE)
        .min()
        .expect("memory map has no usable region");
    let max_pfn = memory_map
        .iter()
        .filter(usable)
        .map(|r| r.end().div_ceil(PAGE_SIZE))
        .max()
        .expect("memory map has no usable region");
    let span_pages = max_pfn - min_pfn;

    // Carve the bitmap and descriptor array from the largest usable
    // region.
    let largest = memory_map
        .iter()
        .filter(usable)
        .max_by_key(|r| r.length)
        .expect("memory map has no usable region");
    let mut bump = BootstrapAllocator {
        next: largest.base,
        end: largest.end(),
    };

    let bitmap_bytes = MemoryBitmap::storage_size(span_pages);
    let bitmap_phys = bump
        .alloc(bitmap_bytes, 8)
        .expect("no room for memory bitmap");
    let frames_bytes = FrameMap::storage_size(span_pages);
    let frames_phys = bump
        .alloc(frames_bytes, core::mem::align_of::<PageFrame>() as u64)
        .expect("no room for page descriptors");

    // Everything starts reserved.
    let mut bitmap =
        unsafe { MemoryBitmap::from_raw(min_pfn, span_pages, phys_to_virt(bitmap_phys) as *mut u64) };
    let frames = unsafe {
        FrameMap::from_raw(
            min_pfn,
            phys_to_virt(frames_phys) as *mut PageFrame,
            span_pages as usize,
        )
    };

    // Clear the usable regions...
    for region in memory_map.iter().filter(usable) {
        let start = region.base.div_ceil(PAGE_SIZE);
        let end = region.end() / PAGE_SIZE;
        bitmap.clear_range(start, end);
    }
    // ...then re-mark what init itself consumed.
    let bump_end_pfn = bump.next.div_ceil(PAGE_SIZE);
    bitmap.mark_range(largest.base / PAGE_SIZE, bump_end_pfn);

    // Mirror the final picture into the descriptors.
    for pfn in min_pfn..max_pfn {
        if !bitmap.is_reserved(pfn) {
            frames.frame(pfn).clear_flags(PageFlags::RESERVED);
        }
    }

    // Zones clipped to the frame universe, seeded from maximal runs of
    // non-reserved pages.
    let zones = [
        Zone::new(ZoneId::Dma),
        Zone::new(ZoneId::Dma32),
        Zone::new(ZoneId::Normal),
    ];
    let boundaries = [
        (0u64, super::zone::ZONE_DMA_END_PFN),
        (super::zone::ZONE_DMA_END_PFN, super::zone::ZONE_DMA32_END_PFN),
        (super::zone::ZONE_DMA32_END_PFN, u64::MAX),
    ];
    for (zone, (lo, hi)) in zones.iter().zip(boundaries) {
        let start = min_pfn.max(lo);
        let end = max_pfn.min(hi);
        if start >= end {
            zone.set_span(0, 0);
            continue;
        }
        zone.set_span(start, end);

        let mut run_start = None;
        for pfn in start..=end {
            let free = pfn < end && !bitmap.is_reserved(pfn);
            match (free, run_start) {
                (true, None) => run_start = Some(pfn),
                (false, Some(s)) => {
                    zone.seed_range(&frames, s, pfn);
                    run_start = None;
                }
                _ => {}
            }
        }
    }

    let total: u64 = zones.iter().map(|z| z.free_pages()).sum();
    for zone in &zones {
        let s = zone.stats();
        if s.end_pfn > s.start_pfn {
            log::info!(
                "pmm: zone {:6} pfn {:#x}..{:#x} free {} pages",
                zone.id().name(),
                s.start_pfn,
                s.end_pfn,
                s.free_pages
            );
        }
    }
    log::info!(
        "pmm: {} MiB managed, {} MiB free after init",
        span_pages * PAGE_SIZE / (1024 * 1024),
        total * PAGE_SIZE / (1024 * 1024)
    );

    PMM.init_once(|| Pmm {
        frames,
        zones,
        bitmap,
        total_pages: span_pages,
    });
}

pub fn is_initialized() -> bool {
    PMM.get().is_some()
}

fn pmm() -> &'static Pmm {
    PMM.get().expect("PMM used before init")
}

/// The global page-frame descriptor map.
pub fn frame_map() -> &'static FrameMap {
    &pmm().frames
}

/// Zones to try for a request, in fallback order (downward only).
fn zone_order(flags: AllocFlags) -> &'static [ZoneId] {
    if flags.contains(AllocFlags::DMA) {
        &[ZoneId::Dma]
    } else if flags.contains(AllocFlags::DMA32) {
        &[ZoneId::Dma32, ZoneId::Dma]
    } else {
        &[ZoneId::Normal, ZoneId::Dma32, ZoneId::Dma]
    }
}

/// Allocate 2^order contiguous pages. Returns the head frame, or `None`
/// on exhaustion.
pub fn alloc_pages(order: usize, flags: AllocFlags) -> Option<PhysFrame> {
    if order >= MAX_ORDER {
        return None;
    }
    let pmm = pmm();
    for &zone_id in zone_order(flags) {
        let zone = &pmm.zones[zone_id as usize];
        if let Some(pfn) = zone.alloc_block(&pmm.frames, order) {
            let phys = pfn * PAGE_SIZE;
            if flags.contains(AllocFlags::ZERO) {
                unsafe {
                    core::ptr::write_bytes(
                        phys_to_virt(phys) as *mut u8,
                        0,
                        (PAGE_SIZE << order) as usize,
                    );
                }
            }
            return Some(PhysFrame::containing_address(PhysAddr::new(phys)));
        }
    }
    log::warn!("pmm: out of memory allocating order {}", order);
    None
}

/// Return a block previously obtained from [`alloc_pages`] at the same
/// order.
pub fn free_pages(frame: PhysFrame, order: usize) {
    let pmm = pmm();
    let pfn = frame.start_address().as_u64() / PAGE_SIZE;
    let zone_id = ZoneId::from_index(pmm.frames.frame(pfn).zone());
    pmm.zones[zone_id as usize].free_block(&pmm.frames, pfn, order);
}

/// Allocate one zeroed-on-request page frame. Convenience for the many
/// single-page callers (page tables, stacks, COW copies).
pub fn allocate_frame() -> Option<PhysFrame> {
    alloc_pages(0, AllocFlags::empty())
}

pub fn allocate_zeroed_frame() -> Option<PhysFrame> {
    alloc_pages(0, AllocFlags::ZERO)
}

/// Return a single frame.
pub fn deallocate_frame(frame: PhysFrame) {
    free_pages(frame, 0);
}

/// Bump the reference count of a shared frame (fork COW sharing).
pub fn frame_incref(frame: PhysFrame) {
    let pfn = frame.start_address().as_u64() / PAGE_SIZE;
    pmm().frames.frame(pfn).inc_ref();
}

/// Drop one reference; returns true when the caller held the last one
/// and the frame may be freed.
pub fn frame_decref(frame: PhysFrame) -> bool {
    let pfn = frame.start_address().as_u64() / PAGE_SIZE;
    pmm().frames.frame(pfn).dec_ref() == 1
}

pub fn frame_refcount(frame: PhysFrame) -> u32 {
    let pfn = frame.start_address().as_u64() / PAGE_SIZE;
    pmm().frames.frame(pfn).ref_count()
}

/// Drop one reference and free the frame if it was the last.
pub fn put_frame(frame: PhysFrame) {
    if frame_decref(frame) {
        deallocate_frame(frame);
    }
}

/// Total free pages across all zones.
pub fn free_page_count() -> u64 {
    pmm().zones.iter().map(|z| z.free_pages()).sum()
}

/// Memory statistics for diagnostics.
pub struct MemoryStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub zones: [super::zone::ZoneStats; 3],
}

pub fn memory_stats() -> MemoryStats {
    let pmm = pmm();
    MemoryStats {
        total_pages: pmm.total_pages,
        free_pages: free_page_count(),
        zones: [
            pmm.zones[0].stats(),
            pmm.zones[1].stats(),
            pmm.zones[2].stats(),
        ],
    }
}
