//! Virtual memory areas.
//!
//! A VMA is a half-open, page-aligned virtual range with capability
//! flags and an optional file backing. Within one address space the
//! VMAs are kept sorted by start address and never overlap; both
//! properties are enforced at insertion and preserved by removal, which
//! trims or splits areas that partially intersect the removed range.

use super::layout;

use super::PAGE_SIZE;
use alloc::vec::Vec;
use bitflags::bitflags;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

bitflags! {
    /// VMA capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const EXEC      = 1 << 2;
        /// Shared between address spaces; never COW-demoted by fork.
        const SHARED    = 1 << 3;
        /// Grows downward on faults just below its start.
        const STACK     = 1 << 4;
        /// The process heap (brk range).
        const HEAP      = 1 << 5;
        /// Zero-fill on demand, no backing object.
        const ANONYMOUS = 1 << 6;
        /// Backed by a file region.
        const FILE      = 1 << 7;
    }
}

impl VmaFlags {
    /// Derive page-table protection bits. The PTE must never be more
    /// permissive than the VMA.
    pub fn page_flags(self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if self.contains(VmaFlags::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if !self.contains(VmaFlags::EXEC) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }
}

/// Reference to a region of a backing file. The file itself lives with
/// the external VFS collaborator; the core only carries the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBacking {
    pub handle: u64,
    pub offset: u64,
}

/// One mapped region: `[start, end)`, page-aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct Vma {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub flags: VmaFlags,
    pub file: Option<FileBacking>,
}

impl Vma {
    pub fn new(start: VirtAddr, end: VirtAddr, flags: VmaFlags) -> Self {
        Self {
            start,
            end,
            flags,
            file: None,
        }
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, other: &Vma) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    pub fn pages(&self) -> u64 {
        self.size() / PAGE_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaError {
    /// The range overlaps an existing VMA.
    Overlap,
    /// Bad range: unaligned, empty, or outside user space.
    InvalidRange,
    /// No VMA intersects the given range.
    NotFound,
}

/// The sorted, disjoint VMA list of one address space.
#[derive(Default)]
pub struct VmaList {
    vmas: Vec<Vma>,
}

impl VmaList {
    pub const fn new() -> Self {
        Self { vmas: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter()
    }

    /// Insert, keeping the list sorted; rejects overlap and bad ranges.
    pub fn insert(&mut self, vma: Vma) -> Result<(), VmaError> {
        if vma.start >= vma.end
            || !is_page_aligned(vma.start.as_u64())
            || !is_page_aligned(vma.end.as_u64())
            || !layout::is_user_address(vma.end.as_u64() - 1)
        {
            return Err(VmaError::InvalidRange);
        }
        if self.vmas.iter().any(|v| v.overlaps(&vma)) {
            return Err(VmaError::Overlap);
        }
        let pos = self
            .vmas
            .binary_search_by_key(&vma.start.as_u64(), |v| v.start.as_u64())
            .unwrap_or_else(|pos| pos);
        self.vmas.insert(pos, vma);
        Ok(())
    }

    /// The VMA containing `addr`, if any.
    pub fn find(&self, addr: VirtAddr) -> Option<&Vma> {
        self.vmas.iter().find(|v| v.contains(addr))
    }

    pub fn find_mut(&mut self, addr: VirtAddr) -> Option<&mut Vma> {
        self.vmas.iter_mut().find(|v| v.contains(addr))
    }

    /// The single VMA covering all of `[start, end)`, if one exists.
    pub fn find_covering(&self, start: VirtAddr, end: VirtAddr) -> Option<&Vma> {
        self.vmas
            .iter()
            .find(|v| v.start <= start && v.end >= end)
    }

    /// Remove everything intersecting `[start, end)`. Fully covered
    /// VMAs are dropped; partially covered ones are trimmed, and a VMA
    /// strictly containing the range splits in two. Returns the removed
    /// pieces, clipped to the range.
    pub fn remove_range(&mut self, start: VirtAddr, end: VirtAddr) -> Result<Vec<Vma>, VmaError> {
        if start >= end || !is_page_aligned(start.as_u64()) || !is_page_aligned(end.as_u64()) {
            return Err(VmaError::InvalidRange);
        }

        let mut removed = Vec::new();
        let mut to_insert = Vec::new();

        let mut i = 0;
        while i < self.vmas.len() {
            let vma = &self.vmas[i];
            if vma.end <= start || vma.start >= end {
                i += 1;
                continue;
            }
            let old = self.vmas.remove(i);
            if old.start < start {
                let mut head = old.clone();
                head.end = start;
                to_insert.push(head);
            }
            if old.end > end {
                let mut tail = old.clone();
                tail.start = end;
                if let Some(ref mut backing) = tail.file {
                    backing.offset += end.as_u64() - old.start.as_u64();
                }
                to_insert.push(tail);
            }
            let mut clipped = old;
            if clipped.start < start {
                clipped.start = start;
            }
            if clipped.end > end {
                clipped.end = end;
            }
            removed.push(clipped);
        }

        for vma in to_insert {
            self.insert(vma).expect("split re-insert cannot overlap");
        }

        if removed.is_empty() {
            Err(VmaError::NotFound)
        } else {
            Ok(removed)
        }
    }

    /// Find a free hole of `size` bytes, searching upward from the mmap
    /// base; an aligned, non-overlapping hint wins if it fits.
    pub fn find_free_region(&self, size: u64, hint: Option<VirtAddr>) -> Option<VirtAddr> {
        let size = align_up(size, PAGE_SIZE);

        if let Some(hint) = hint {
            if is_page_aligned(hint.as_u64()) && self.range_is_free(hint.as_u64(), size) {
                return Some(hint);
            }
        }

        let mut candidate = layout::USER_MMAP_BASE;
        for vma in &self.vmas {
            let vma_start = vma.start.as_u64();
            if vma.end.as_u64() <= candidate {
                continue;
            }
            if vma_start >= candidate + size {
                break;
            }
            candidate = vma.end.as_u64();
        }
        if candidate + size <= layout::USER_STACK_TOP - layout::USER_STACK_SIZE {
            Some(VirtAddr::new(candidate))
        } else {
            None
        }
    }

    fn range_is_free(&self, start: u64, size: u64) -> bool {
        let end = match start.checked_add(size) {
            Some(end) if layout::is_user_address(end - 1) => end,
            _ => return false,
        };
        let probe = Vma::new(
            VirtAddr::new(start),
            VirtAddr::new(end),
            VmaFlags::empty(),
        );
        !self.vmas.iter().any(|v| v.overlaps(&probe))
    }

    /// Debug check: sorted by start and pairwise disjoint.
    pub fn check_invariants(&self) -> bool {
        self.vmas.windows(2).all(|w| w[0].end <= w[1].start)
    }
}

#[inline]
pub fn is_page_aligned(addr: u64) -> bool {
    addr % PAGE_SIZE == 0
}

#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma(start: u64, end: u64) -> Vma {
        Vma::new(
            VirtAddr::new(start),
            VirtAddr::new(end),
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::ANONYMOUS,
        )
    }

    #[test]
    fn contains_and_overlap() {
        let a = vma(0x1000, 0x3000);
        assert!(a.contains(VirtAddr::new(0x1000)));
        assert!(a.contains(VirtAddr::new(0x2fff)));
        assert!(!a.contains(VirtAddr::new(0x3000)));

        assert!(a.overlaps(&vma(0x2000, 0x4000)));
        assert!(!a.overlaps(&vma(0x3000, 0x4000)));
    }

    #[test]
    fn insert_rejects_overlap_and_misalignment() {
        let mut list = VmaList::new();
        list.insert(vma(0x1000, 0x3000)).unwrap();
        assert_eq!(list.insert(vma(0x2000, 0x4000)), Err(VmaError::Overlap));
        assert_eq!(
            list.insert(vma(0x4001, 0x5000)),
            Err(VmaError::InvalidRange)
        );
        assert_eq!(list.insert(vma(0x5000, 0x5000)), Err(VmaError::InvalidRange));
        list.insert(vma(0x3000, 0x4000)).unwrap();
        assert!(list.check_invariants());
    }

    #[test]
    fn list_stays_sorted() {
        let mut list = VmaList::new();
        list.insert(vma(0x5000, 0x6000)).unwrap();
        list.insert(vma(0x1000, 0x2000)).unwrap();
        list.insert(vma(0x3000, 0x4000)).unwrap();
        let starts: Vec<u64> = list.iter().map(|v| v.start.as_u64()).collect();
        assert_eq!(starts, alloc::vec![0x1000, 0x3000, 0x5000]);
        assert!(list.check_invariants());
    }

    #[test]
    fn remove_fully_covered() {
        let mut list = VmaList::new();
        list.insert(vma(0x1000, 0x3000)).unwrap();
        let removed = list
            .remove_range(VirtAddr::new(0x1000), VirtAddr::new(0x3000))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_trims_edges() {
        let mut list = VmaList::new();
        list.insert(vma(0x1000, 0x5000)).unwrap();
        // Trim the head.
        list.remove_range(VirtAddr::new(0x1000), VirtAddr::new(0x2000))
            .unwrap();
        assert_eq!(list.find(VirtAddr::new(0x2000)).unwrap().start.as_u64(), 0x2000);
        // Trim the tail.
        list.remove_range(VirtAddr::new(0x4000), VirtAddr::new(0x5000))
            .unwrap();
        let v = list.find(VirtAddr::new(0x3000)).unwrap();
        assert_eq!((v.start.as_u64(), v.end.as_u64()), (0x2000, 0x4000));
    }

    #[test]
    fn remove_splits_interior() {
        let mut list = VmaList::new();
        list.insert(vma(0x1000, 0x6000)).unwrap();
        let removed = list
            .remove_range(VirtAddr::new(0x3000), VirtAddr::new(0x4000))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].start.as_u64(), 0x3000);
        assert_eq!(list.len(), 2);
        assert!(list.find(VirtAddr::new(0x3000)).is_none());
        assert!(list.find(VirtAddr::new(0x2000)).is_some());
        assert!(list.find(VirtAddr::new(0x4000)).is_some());
        assert!(list.check_invariants());
    }

    #[test]
    fn remove_range_not_found() {
        let mut list = VmaList::new();
        list.insert(vma(0x1000, 0x2000)).unwrap();
        assert_eq!(
            list.remove_range(VirtAddr::new(0x8000), VirtAddr::new(0x9000)),
            Err(VmaError::NotFound)
        );
    }

    #[test]
    fn free_region_search() {
        let mut list = VmaList::new();
        let base = layout::USER_MMAP_BASE;
        list.insert(vma(base, base + 0x3000)).unwrap();

        // First hole is right after the existing mapping.
        let found = list.find_free_region(0x2000, None).unwrap();
        assert_eq!(found.as_u64(), base + 0x3000);

        // A usable hint is honored.
        let hint = VirtAddr::new(base + 0x10000);
        assert_eq!(list.find_free_region(0x1000, Some(hint)), Some(hint));

        // An overlapping hint falls back to the search.
        let bad_hint = VirtAddr::new(base + 0x1000);
        assert_eq!(
            list.find_free_region(0x1000, Some(bad_hint)).unwrap().as_u64(),
            base + 0x3000
        );
    }

    #[test]
    fn page_flags_respect_vma_caps() {
        let rw = (VmaFlags::READ | VmaFlags::WRITE).page_flags();
        assert!(rw.contains(PageTableFlags::WRITABLE));
        assert!(rw.contains(PageTableFlags::NO_EXECUTE));

        let rx = (VmaFlags::READ | VmaFlags::EXEC).page_flags();
        assert!(!rx.contains(PageTableFlags::WRITABLE));
        assert!(!rx.contains(PageTableFlags::NO_EXECUTE));
    }
}
