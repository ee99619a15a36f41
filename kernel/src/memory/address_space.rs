//! Per-process address spaces.
//!
//! An address space is a sorted list of VMAs driving one page-table
//! tree. This layer owns the policy: eager region mapping with rollback,
//! lazy mmap regions populated on fault, bounded downward stack growth,
//! fork-time copy-on-write demotion, and teardown through the per-frame
//! reference counts so a frame shared by parent and child is only freed
//! with its last address space.

use super::frame_allocator::{self, phys_to_virt};
use super::layout;
use super::paging::{self, MapError, PageTables};
use super::vma::{align_down, FileBacking, Vma, VmaError, VmaFlags, VmaList};
use super::PAGE_SIZE;
use alloc::vec::Vec;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    Overlap,
    InvalidRange,
    NotFound,
    OutOfMemory,
}

impl From<VmaError> for VmError {
    fn from(err: VmaError) -> Self {
        match err {
            VmaError::Overlap => VmError::Overlap,
            VmaError::InvalidRange => VmError::InvalidRange,
            VmaError::NotFound => VmError::NotFound,
        }
    }
}

impl From<MapError> for VmError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => VmError::OutOfMemory,
            MapError::AlreadyMapped => VmError::Overlap,
            MapError::NotMapped => VmError::NotFound,
            MapError::HugePage => VmError::InvalidRange,
        }
    }
}

/// Why a page fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The address is in no VMA and not in a stack growth window.
    NoRegion,
    /// The access violates the VMA's capabilities.
    Protection,
    OutOfMemory,
}

/// One user address space: page tables plus the VMA list over them.
pub struct AddressSpace {
    tables: PageTables,
    vmas: VmaList,
    /// Current heap break; meaningful once a HEAP region exists.
    brk: u64,
    /// Present user pages.
    total_vm: u64,
    torn_down: bool,
}

impl AddressSpace {
    /// Fresh user address space sharing the kernel upper half.
    pub fn new_user() -> Option<Self> {
        Some(Self {
            tables: PageTables::new_user()?,
            vmas: VmaList::new(),
            brk: 0,
            total_vm: 0,
            torn_down: false,
        })
    }

    pub fn tables(&self) -> &PageTables {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut PageTables {
        &mut self.tables
    }

    pub fn total_vm(&self) -> u64 {
        self.total_vm
    }

    pub fn brk(&self) -> u64 {
        self.brk
    }

    pub fn vma_count(&self) -> usize {
        self.vmas.len()
    }

    pub fn find_vma(&self, addr: VirtAddr) -> Option<&Vma> {
        self.vmas.find(addr)
    }

    pub fn vmas(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter()
    }

    /// Switch the CPU to this address space.
    ///
    /// # Safety
    ///
    /// See [`PageTables::activate`].
    pub unsafe fn activate(&self) {
        unsafe { self.tables.activate() }
    }

    /// Map `[start, start + size)` eagerly: allocate and zero every
    /// page up front. Any failure rolls the whole region back.
    pub fn map_region(&mut self, start: VirtAddr, size: u64, flags: VmaFlags) -> Result<(), VmError> {
        let end = VirtAddr::new(
            start
                .as_u64()
                .checked_add(size)
                .ok_or(VmError::InvalidRange)?,
        );
        self.vmas.insert(Vma::new(start, end, flags))?;

        let pte_flags = flags.page_flags();
        let pages = size / PAGE_SIZE;
        for i in 0..pages {
            let page = Page::containing_address(start + i * PAGE_SIZE);
            let mapped = frame_allocator::allocate_zeroed_frame()
                .ok_or(VmError::OutOfMemory)
                .and_then(|frame| {
                    self.tables
                        .map_page(page, frame, pte_flags)
                        .map_err(|e| {
                            frame_allocator::deallocate_frame(frame);
                            VmError::from(e)
                        })
                });
            if let Err(e) = mapped {
                // Unwind everything installed so far, then the VMA.
                for j in 0..i {
                    let p = Page::containing_address(start + j * PAGE_SIZE);
                    if let Some((frame, _)) = self.tables.unmap_page(p) {
                        frame_allocator::put_frame(frame);
                    }
                }
                self.vmas
                    .remove_range(start, end)
                    .expect("rollback removes the region just inserted");
                return Err(e);
            }
        }
        self.total_vm += pages;
        if flags.contains(VmaFlags::HEAP) {
            self.brk = end.as_u64();
        }
        Ok(())
    }

    /// Reserve a lazily populated region. Pages materialize on first
    /// touch through the fault handler.
    pub fn mmap(
        &mut self,
        hint: Option<VirtAddr>,
        size: u64,
        flags: VmaFlags,
        file: Option<FileBacking>,
    ) -> Result<VirtAddr, VmError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(VmError::InvalidRange);
        }
        let start = self
            .vmas
            .find_free_region(size, hint)
            .ok_or(VmError::OutOfMemory)?;
        let mut vma = Vma::new(start, start + size, flags);
        vma.file = file;
        self.vmas.insert(vma)?;
        Ok(start)
    }

    /// Unmap `[start, start + size)`, freeing every present page.
    /// VMAs partially covered are trimmed or split.
    pub fn unmap_region(&mut self, start: VirtAddr, size: u64) -> Result<(), VmError> {
        let end = VirtAddr::new(
            start
                .as_u64()
                .checked_add(size)
                .ok_or(VmError::InvalidRange)?,
        );
        let removed = self.vmas.remove_range(start, end)?;
        for piece in removed {
            for i in 0..piece.pages() {
                let page = Page::containing_address(piece.start + i * PAGE_SIZE);
                if let Some((frame, _)) = self.tables.unmap_page(page) {
                    frame_allocator::put_frame(frame);
                    self.total_vm -= 1;
                }
            }
        }
        Ok(())
    }

    /// Change the protection of a range covered by exactly one VMA.
    /// Every present PTE is rewritten; CoW demotions survive the
    /// rewrite so shared frames stay read-only until copied.
    pub fn mprotect(&mut self, start: VirtAddr, size: u64, prot: VmaFlags) -> Result<(), VmError> {
        let end = start + size;
        let vma = self
            .vmas
            .find_covering(start, end)
            .ok_or(VmError::NotFound)?;
        let (vma_start, vma_end) = (vma.start, vma.end);

        let keep = VmaFlags::SHARED
            | VmaFlags::STACK
            | VmaFlags::HEAP
            | VmaFlags::ANONYMOUS
            | VmaFlags::FILE;
        let new_flags =
            (prot & (VmaFlags::READ | VmaFlags::WRITE | VmaFlags::EXEC)) | (vma.flags & keep);

        {
            let vma = self
                .vmas
                .find_mut(start)
                .expect("covering VMA cannot vanish");
            vma.flags = new_flags;
        }

        let pte_flags = new_flags.page_flags();
        let pages = (vma_end.as_u64() - vma_start.as_u64()) / PAGE_SIZE;
        for i in 0..pages {
            let page: Page<Size4KiB> = Page::containing_address(vma_start + i * PAGE_SIZE);
            if let Some((_, old)) = self.tables.translate(page.start_address()) {
                let updated = if paging::is_cow(old) {
                    paging::make_cow_flags(pte_flags)
                } else {
                    pte_flags
                };
                self.tables
                    .update_flags(page, updated)
                    .expect("present page must update");
            }
        }
        Ok(())
    }

    /// Fork-time clone. Writable private pages are demoted to
    /// read-only + CoW in **both** trees and share one frame; read-only
    /// and shared pages keep their flags. Frame refcounts go up for
    /// every shared frame.
    pub fn clone_cow(&mut self) -> Option<AddressSpace> {
        let mut child = AddressSpace::new_user()?;

        for vma in self.vmas.iter() {
            child
                .vmas
                .insert(vma.clone())
                .expect("cloning disjoint VMAs cannot overlap");
        }

        let regions: Vec<(VirtAddr, u64, VmaFlags)> = self
            .vmas
            .iter()
            .map(|v| (v.start, v.pages(), v.flags))
            .collect();

        for (start, pages, flags) in regions {
            let cow_eligible = flags.contains(VmaFlags::WRITE) && !flags.contains(VmaFlags::SHARED);
            for i in 0..pages {
                let page: Page<Size4KiB> = Page::containing_address(start + i * PAGE_SIZE);
                let Some((frame, pte)) = self.tables.translate(page.start_address()) else {
                    continue;
                };
                let child_flags = if cow_eligible && pte.contains(PageTableFlags::WRITABLE) {
                    let cow = paging::make_cow_flags(pte);
                    self.tables
                        .update_flags(page, cow)
                        .expect("parent page must demote");
                    cow
                } else {
                    pte
                };
                frame_allocator::frame_incref(frame);
                if child.tables.map_page(page, frame, child_flags).is_err() {
                    frame_allocator::frame_decref(frame);
                    return None;
                }
                child.total_vm += 1;
            }
        }

        child.brk = self.brk;
        Some(child)
    }

    /// Resolve a page fault at `addr`. Returns `Ok(())` when the access
    /// may be retried, or the reason it must not be.
    pub fn handle_fault(
        &mut self,
        addr: VirtAddr,
        error_code: PageFaultErrorCode,
    ) -> Result<(), FaultError> {
        let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
        let page: Page<Size4KiB> = Page::containing_address(addr);

        let vma_flags = match self.vmas.find(addr) {
            Some(vma) => vma.flags,
            None => return self.try_grow_stack(addr),
        };

        // A write needs the VMA's write capability; the PTE-level CoW
        // check below only ever applies inside writable VMAs, so the
        // resolved PTE can never exceed the VMA's protection.
        if write && !vma_flags.contains(VmaFlags::WRITE) {
            return Err(FaultError::Protection);
        }

        match self.tables.translate(page.start_address()) {
            None => {
                // Demand paging: first touch of a lazy page.
                let frame =
                    frame_allocator::allocate_zeroed_frame().ok_or(FaultError::OutOfMemory)?;
                self.tables
                    .map_page(page, frame, vma_flags.page_flags())
                    .map_err(|_| {
                        frame_allocator::deallocate_frame(frame);
                        FaultError::OutOfMemory
                    })?;
                self.total_vm += 1;
                Ok(())
            }
            Some((frame, pte)) => {
                if write && !pte.contains(PageTableFlags::WRITABLE) {
                    if paging::is_cow(pte) {
                        self.copy_on_write(page, frame, pte)
                    } else {
                        Err(FaultError::Protection)
                    }
                } else {
                    // Present and permitted: spurious (stale TLB), retry.
                    Ok(())
                }
            }
        }
    }

    /// The CoW slow path: give the faulting space a private copy, or
    /// reclaim the frame outright if it is no longer shared.
    fn copy_on_write(
        &mut self,
        page: Page<Size4KiB>,
        frame: PhysFrame,
        pte: PageTableFlags,
    ) -> Result<(), FaultError> {
        if frame_allocator::frame_refcount(frame) == 1 {
            // The other side already copied; the frame is ours alone.
            self.tables
                .update_flags(page, paging::make_private_flags(pte))
                .expect("present page must update");
            return Ok(());
        }

        let copy = frame_allocator::allocate_frame().ok_or(FaultError::OutOfMemory)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(frame.start_address().as_u64()) as *const u8,
                phys_to_virt(copy.start_address().as_u64()) as *mut u8,
                PAGE_SIZE as usize,
            );
        }

        self.tables
            .unmap_page(page)
            .expect("CoW page was just translated");
        self.tables
            .map_page(page, copy, paging::make_private_flags(pte))
            .expect("remap into an emptied slot cannot fail");
        frame_allocator::put_frame(frame);
        Ok(())
    }

    /// Grow a stack VMA downward if `addr` sits within the growth
    /// window just below it.
    fn try_grow_stack(&mut self, addr: VirtAddr) -> Result<(), FaultError> {
        let window = layout::STACK_GROWTH_WINDOW_PAGES * PAGE_SIZE;
        let stack = self
            .vmas
            .iter()
            .find(|v| {
                v.flags.contains(VmaFlags::STACK)
                    && addr < v.start
                    && v.start.as_u64() - addr.as_u64() <= window
            })
            .map(|v| (v.start, v.flags));
        let (old_start, flags) = stack.ok_or(FaultError::NoRegion)?;

        let new_start = VirtAddr::new(align_down(addr.as_u64(), PAGE_SIZE));
        let pte_flags = flags.page_flags();
        let pages = (old_start.as_u64() - new_start.as_u64()) / PAGE_SIZE;

        // One page at a time, lowest last, so a mid-way failure leaves a
        // well-formed (merely shorter) stack.
        for i in (0..pages).rev() {
            let page = Page::containing_address(new_start + i * PAGE_SIZE);
            let frame = frame_allocator::allocate_zeroed_frame().ok_or(FaultError::OutOfMemory)?;
            match self.tables.map_page(page, frame, pte_flags) {
                Ok(()) => {
                    self.total_vm += 1;
                    let vma = self
                        .vmas
                        .find_mut(old_start)
                        .expect("stack VMA cannot vanish mid-growth");
                    vma.start = page.start_address();
                }
                Err(_) => {
                    frame_allocator::deallocate_frame(frame);
                    return Err(FaultError::OutOfMemory);
                }
            }
        }
        Ok(())
    }

    /// Free every present page and reclaim the page-table tree.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let regions: Vec<(VirtAddr, u64)> =
            self.vmas.iter().map(|v| (v.start, v.pages())).collect();
        for (start, pages) in regions {
            for i in 0..pages {
                let page: Page<Size4KiB> = Page::containing_address(start + i * PAGE_SIZE);
                if let Some((frame, _)) = self.tables.unmap_page(page) {
                    frame_allocator::put_frame(frame);
                    self.total_vm -= 1;
                }
            }
        }
        self.tables.destroy_user_tables();
        self.tables.free_root();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_pmm;

    const RW: VmaFlags = VmaFlags::READ
        .union(VmaFlags::WRITE)
        .union(VmaFlags::ANONYMOUS);

    fn write_byte(aspace: &AddressSpace, addr: u64, value: u8) {
        let phys = aspace
            .tables()
            .translate_addr(VirtAddr::new(addr))
            .expect("address must be mapped");
        unsafe { (phys_to_virt(phys.as_u64()) as *mut u8).write(value) };
    }

    fn read_byte(aspace: &AddressSpace, addr: u64) -> u8 {
        let phys = aspace
            .tables()
            .translate_addr(VirtAddr::new(addr))
            .expect("address must be mapped");
        unsafe { (phys_to_virt(phys.as_u64()) as *const u8).read() }
    }

    fn write_fault() -> PageFaultErrorCode {
        PageFaultErrorCode::CAUSED_BY_WRITE | PageFaultErrorCode::USER_MODE
    }

    fn cow_write_fault() -> PageFaultErrorCode {
        PageFaultErrorCode::PROTECTION_VIOLATION
            | PageFaultErrorCode::CAUSED_BY_WRITE
            | PageFaultErrorCode::USER_MODE
    }

    #[test]
    fn eager_map_unmap_round_trip() {
        let _pmm = init_test_pmm();
        let free_before = frame_allocator::free_page_count();
        let mut aspace = AddressSpace::new_user().unwrap();

        aspace
            .map_region(VirtAddr::new(0x4000_0000), 4 * PAGE_SIZE, RW)
            .unwrap();
        assert_eq!(aspace.total_vm(), 4);
        assert!(aspace
            .tables()
            .translate(VirtAddr::new(0x4000_0000))
            .is_some());

        aspace
            .unmap_region(VirtAddr::new(0x4000_0000), 4 * PAGE_SIZE)
            .unwrap();
        assert_eq!(aspace.total_vm(), 0);
        assert!(aspace
            .tables()
            .translate(VirtAddr::new(0x4000_0000))
            .is_none());

        drop(aspace);
        assert_eq!(frame_allocator::free_page_count(), free_before);
    }

    #[test]
    fn map_region_rejects_overlap() {
        let _pmm = init_test_pmm();
        let mut aspace = AddressSpace::new_user().unwrap();
        aspace
            .map_region(VirtAddr::new(0x4000_0000), 2 * PAGE_SIZE, RW)
            .unwrap();
        assert_eq!(
            aspace.map_region(VirtAddr::new(0x4000_1000), 2 * PAGE_SIZE, RW),
            Err(VmError::Overlap)
        );
    }

    #[test]
    fn demand_paging_on_mmap_region() {
        let _pmm = init_test_pmm();
        let mut aspace = AddressSpace::new_user().unwrap();

        // Lazy region: nothing mapped up front.
        let start = aspace
            .mmap(Some(VirtAddr::new(0x4000_0000)), 16 * PAGE_SIZE, RW, None)
            .unwrap();
        assert_eq!(start.as_u64(), 0x4000_0000);
        assert!(aspace.tables().translate(VirtAddr::new(0x4000_5000)).is_none());

        // First write faults not-present; handler installs a zeroed
        // writable page.
        aspace
            .handle_fault(VirtAddr::new(0x4000_5000), write_fault())
            .unwrap();
        let (_, flags) = aspace.tables().translate(VirtAddr::new(0x4000_5000)).unwrap();
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert_eq!(read_byte(&aspace, 0x4000_5123), 0);
        assert_eq!(aspace.total_vm(), 1);

        // Subsequent access is a spurious fault at worst.
        aspace
            .handle_fault(VirtAddr::new(0x4000_5000), write_fault())
            .unwrap();
        assert_eq!(aspace.total_vm(), 1);
    }

    #[test]
    fn fault_outside_any_region_fails() {
        let _pmm = init_test_pmm();
        let mut aspace = AddressSpace::new_user().unwrap();
        assert_eq!(
            aspace.handle_fault(VirtAddr::new(0x1234_5000), write_fault()),
            Err(FaultError::NoRegion)
        );
    }

    #[test]
    fn write_to_readonly_region_is_protection_error() {
        let _pmm = init_test_pmm();
        let mut aspace = AddressSpace::new_user().unwrap();
        aspace
            .map_region(
                VirtAddr::new(0x4000_0000),
                PAGE_SIZE,
                VmaFlags::READ | VmaFlags::ANONYMOUS,
            )
            .unwrap();
        assert_eq!(
            aspace.handle_fault(VirtAddr::new(0x4000_0000), cow_write_fault()),
            Err(FaultError::Protection)
        );
    }

    #[test]
    fn fork_cow_isolates_parent_and_child() {
        let _pmm = init_test_pmm();
        let mut parent = AddressSpace::new_user().unwrap();
        let v = 0x4000_0000u64;
        parent.map_region(VirtAddr::new(v), PAGE_SIZE, RW).unwrap();
        write_byte(&parent, v, 0xAB);

        let child = parent.clone_cow().unwrap();

        // Both sides see the same frame, read-only with the CoW bit.
        let (pf, pflags) = parent.tables().translate(VirtAddr::new(v)).unwrap();
        let (cf, cflags) = child.tables().translate(VirtAddr::new(v)).unwrap();
        assert_eq!(pf, cf);
        assert!(!pflags.contains(PageTableFlags::WRITABLE));
        assert!(paging::is_cow(pflags));
        assert!(paging::is_cow(cflags));
        assert_eq!(frame_allocator::frame_refcount(pf), 2);
        assert_eq!(read_byte(&child, v), 0xAB);

        // Parent writes: CoW gives it a fresh frame; the child keeps
        // the old bytes.
        parent.handle_fault(VirtAddr::new(v), cow_write_fault()).unwrap();
        write_byte(&parent, v, 0xCD);

        let (pf2, pflags2) = parent.tables().translate(VirtAddr::new(v)).unwrap();
        assert_ne!(pf2, cf);
        assert!(pflags2.contains(PageTableFlags::WRITABLE));
        assert!(!paging::is_cow(pflags2));
        assert_eq!(read_byte(&parent, v), 0xCD);
        assert_eq!(read_byte(&child, v), 0xAB);
        assert_eq!(frame_allocator::frame_refcount(cf), 1);
    }

    #[test]
    fn cow_last_owner_reclaims_in_place() {
        let _pmm = init_test_pmm();
        let mut parent = AddressSpace::new_user().unwrap();
        let v = 0x4000_0000u64;
        parent.map_region(VirtAddr::new(v), PAGE_SIZE, RW).unwrap();
        write_byte(&parent, v, 0x5A);

        let child = parent.clone_cow().unwrap();
        let (frame, _) = parent.tables().translate(VirtAddr::new(v)).unwrap();
        drop(child);
        assert_eq!(frame_allocator::frame_refcount(frame), 1);

        // With the child gone the parent's fault resolves without a copy.
        parent.handle_fault(VirtAddr::new(v), cow_write_fault()).unwrap();
        let (frame2, flags2) = parent.tables().translate(VirtAddr::new(v)).unwrap();
        assert_eq!(frame, frame2);
        assert!(flags2.contains(PageTableFlags::WRITABLE));
        assert_eq!(read_byte(&parent, v), 0x5A);
    }

    #[test]
    fn fork_frees_cleanly_both_orders() {
        let _pmm = init_test_pmm();
        let free_before = frame_allocator::free_page_count();
        {
            let mut parent = AddressSpace::new_user().unwrap();
            parent
                .map_region(VirtAddr::new(0x4000_0000), 3 * PAGE_SIZE, RW)
                .unwrap();
            let child = parent.clone_cow().unwrap();
            drop(parent);
            drop(child);
        }
        assert_eq!(frame_allocator::free_page_count(), free_before);
    }

    #[test]
    fn stack_grows_downward_within_window() {
        let _pmm = init_test_pmm();
        let mut aspace = AddressSpace::new_user().unwrap();
        let top = layout::USER_STACK_TOP;
        let stack_start = top - 4 * PAGE_SIZE;
        aspace
            .map_region(
                VirtAddr::new(stack_start),
                4 * PAGE_SIZE,
                RW | VmaFlags::STACK,
            )
            .unwrap();

        // Two pages below the stack: within the growth window.
        let fault_addr = stack_start - 2 * PAGE_SIZE + 0x10;
        aspace
            .handle_fault(VirtAddr::new(fault_addr), write_fault())
            .unwrap();
        let vma = aspace.find_vma(VirtAddr::new(fault_addr)).unwrap();
        assert_eq!(vma.start.as_u64(), stack_start - 2 * PAGE_SIZE);
        assert!(aspace
            .tables()
            .translate(VirtAddr::new(fault_addr))
            .is_some());

        // Far below the window: no growth.
        let way_below = stack_start - (layout::STACK_GROWTH_WINDOW_PAGES + 10) * PAGE_SIZE;
        assert_eq!(
            aspace.handle_fault(VirtAddr::new(way_below), write_fault()),
            Err(FaultError::NoRegion)
        );
    }

    #[test]
    fn mprotect_rewrites_vma_and_ptes() {
        let _pmm = init_test_pmm();
        let mut aspace = AddressSpace::new_user().unwrap();
        let v = 0x4000_0000u64;
        aspace.map_region(VirtAddr::new(v), 2 * PAGE_SIZE, RW).unwrap();

        aspace
            .mprotect(VirtAddr::new(v), 2 * PAGE_SIZE, VmaFlags::READ)
            .unwrap();
        let vma = aspace.find_vma(VirtAddr::new(v)).unwrap();
        assert!(!vma.flags.contains(VmaFlags::WRITE));
        assert!(vma.flags.contains(VmaFlags::ANONYMOUS));
        let (_, flags) = aspace.tables().translate(VirtAddr::new(v)).unwrap();
        assert!(!flags.contains(PageTableFlags::WRITABLE));

        // A range spanning no single VMA is rejected.
        assert_eq!(
            aspace.mprotect(VirtAddr::new(v), 64 * PAGE_SIZE, VmaFlags::READ),
            Err(VmError::NotFound)
        );
    }

    #[test]
    fn mmap_round_trip_preserves_total_vm() {
        let _pmm = init_test_pmm();
        let mut aspace = AddressSpace::new_user().unwrap();
        let before = aspace.total_vm();
        let start = aspace.mmap(None, 8 * PAGE_SIZE, RW, None).unwrap();
        aspace
            .handle_fault(start + 0x1000u64, write_fault())
            .unwrap();
        aspace.unmap_region(start, 8 * PAGE_SIZE).unwrap();
        assert_eq!(aspace.total_vm(), before);
    }

    #[test]
    fn vma_protection_never_weaker_than_pte() {
        let _pmm = init_test_pmm();
        let mut aspace = AddressSpace::new_user().unwrap();
        aspace
            .map_region(VirtAddr::new(0x4000_0000), 2 * PAGE_SIZE, RW)
            .unwrap();
        aspace
            .map_region(
                VirtAddr::new(0x4010_0000),
                PAGE_SIZE,
                VmaFlags::READ | VmaFlags::ANONYMOUS,
            )
            .unwrap();

        for vma in aspace.vmas() {
            for i in 0..vma.pages() {
                let addr = vma.start + i * PAGE_SIZE;
                if let Some((_, pte)) = aspace.tables().translate(addr) {
                    if pte.contains(PageTableFlags::WRITABLE) {
                        assert!(vma.flags.contains(VmaFlags::WRITE));
                    }
                }
            }
        }
    }
}
