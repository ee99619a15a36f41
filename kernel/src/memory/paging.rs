//! 4-level page-table management.
//!
//! Walks and edits the PML4 → PDPT → PD → PT tree for one address
//! space. All table frames are reached through the higher-half direct
//! map, so the walker is plain memory access; the only privileged step
//! is loading CR3, which goes through the arch seam.
//!
//! The kernel's upper half is shared: every user root copies the kernel
//! root's entries 256..512, so kernel addresses resolve identically in
//! every address space. Destroying a user root therefore only walks the
//! lower half.

use super::frame_allocator::{self, phys_to_virt};
use super::page::PageFlags;
use super::{tlb, PAGE_SIZE};
use conquer_once::spin::OnceCell;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{Page, PageTable, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

/// Software-defined PTE bit marking a copy-on-write page.
pub const COW_FLAG: PageTableFlags = PageTableFlags::BIT_9;

/// A page is CoW if it was demoted to read-only for sharing, as opposed
/// to being genuinely read-only.
#[inline]
pub fn is_cow(flags: PageTableFlags) -> bool {
    flags.contains(COW_FLAG)
}

/// Demote writable flags for CoW sharing.
#[inline]
pub fn make_cow_flags(flags: PageTableFlags) -> PageTableFlags {
    let mut f = flags;
    f.remove(PageTableFlags::WRITABLE);
    f.insert(COW_FLAG);
    f
}

/// Promote CoW flags back to private writable after the copy.
#[inline]
pub fn make_private_flags(flags: PageTableFlags) -> PageTableFlags {
    let mut f = flags;
    f.insert(PageTableFlags::WRITABLE);
    f.remove(COW_FLAG);
    f
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The leaf slot already holds a mapping.
    AlreadyMapped,
    /// No mapping exists at the given page.
    NotMapped,
    /// A required page-table page could not be allocated.
    OutOfMemory,
    /// The walk hit a huge-page entry this kernel does not manage.
    HugePage,
}

static KERNEL_ROOT: OnceCell<u64> = OnceCell::uninit();

/// Establish the kernel's top-level table. On bare metal this adopts the
/// tables the bootloader handed us (CR3 already maps the kernel and the
/// direct map); hosted builds fabricate an empty root.
pub fn init_kernel_root() {
    KERNEL_ROOT.get_or_init(|| {
        #[cfg(target_os = "none")]
        {
            crate::arch::read_page_table_root()
        }
        #[cfg(not(target_os = "none"))]
        {
            let frame = frame_allocator::allocate_zeroed_frame()
                .expect("no frame for kernel page-table root");
            frame.start_address().as_u64()
        }
    });
}

fn kernel_root_phys() -> u64 {
    *KERNEL_ROOT.get().expect("paging used before init_kernel_root")
}

fn table_at<'a>(phys: PhysAddr) -> &'a mut PageTable {
    unsafe { &mut *(phys_to_virt(phys.as_u64()) as *mut PageTable) }
}

/// The page-table tree of one address space.
pub struct PageTables {
    pml4: PhysFrame,
}

impl PageTables {
    /// Wrap the kernel's own root.
    pub fn kernel() -> Self {
        Self {
            pml4: PhysFrame::containing_address(PhysAddr::new(kernel_root_phys())),
        }
    }

    /// Create a fresh user root sharing the kernel upper half.
    pub fn new_user() -> Option<Self> {
        let frame = frame_allocator::allocate_zeroed_frame()?;
        mark_table_frame(frame);
        let new_root = table_at(frame.start_address());
        let kernel_root = table_at(PhysAddr::new(kernel_root_phys()));
        for i in 256..512 {
            new_root[i] = kernel_root[i].clone();
        }
        Some(Self { pml4: frame })
    }

    pub fn root_frame(&self) -> PhysFrame {
        self.pml4
    }

    /// Load this tree into the MMU.
    ///
    /// # Safety
    ///
    /// The tree must map the currently executing code, stack, and the
    /// direct map, or the CPU is lost the instant CR3 is written.
    pub unsafe fn activate(&self) {
        unsafe { crate::arch::write_page_table_root(self.pml4) };
    }

    /// Walk to the leaf entry for `virt`, allocating missing tables.
    fn walk_create(&mut self, virt: VirtAddr) -> Result<&mut PageTableEntry, MapError> {
        let user = super::layout::is_user_address(virt.as_u64());
        let indices = [virt.p4_index(), virt.p3_index(), virt.p2_index()];
        let mut table = table_at(self.pml4.start_address());
        for index in indices {
            let entry = &mut table[index];
            if entry.is_unused() {
                let frame =
                    frame_allocator::allocate_zeroed_frame().ok_or(MapError::OutOfMemory)?;
                mark_table_frame(frame);
                let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
                if user {
                    flags |= PageTableFlags::USER_ACCESSIBLE;
                }
                entry.set_addr(frame.start_address(), flags);
            } else if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(MapError::HugePage);
            } else if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
                entry.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
            }
            table = table_at(entry.addr());
        }
        Ok(&mut table[virt.p1_index()])
    }

    /// Walk to the leaf entry for `virt` without allocating.
    fn walk(&self, virt: VirtAddr) -> Option<&mut PageTableEntry> {
        let indices = [virt.p4_index(), virt.p3_index(), virt.p2_index()];
        let mut table = table_at(self.pml4.start_address());
        for index in indices {
            let entry = &table[index];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return None;
            }
            table = table_at(entry.addr());
        }
        Some(&mut table[virt.p1_index()])
    }

    /// Install `frame` at `page` with `flags` (PRESENT is implied).
    pub fn map_page(
        &mut self,
        page: Page<Size4KiB>,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let entry = self.walk_create(page.start_address())?;
        if !entry.is_unused() {
            return Err(MapError::AlreadyMapped);
        }
        entry.set_addr(frame.start_address(), flags | PageTableFlags::PRESENT);
        if let Some(desc) = descriptor_for(frame) {
            desc.inc_map();
        }
        tlb::flush_page(page.start_address());
        Ok(())
    }

    /// Remove the mapping at `page`, returning what was mapped there.
    pub fn unmap_page(&mut self, page: Page<Size4KiB>) -> Option<(PhysFrame, PageTableFlags)> {
        let entry = self.walk(page.start_address())?;
        if entry.is_unused() {
            return None;
        }
        let frame = PhysFrame::containing_address(entry.addr());
        let flags = entry.flags();
        entry.set_unused();
        if let Some(desc) = descriptor_for(frame) {
            desc.dec_map();
        }
        tlb::flush_page(page.start_address());
        Some((frame, flags))
    }

    /// Rewrite the flags of an existing leaf mapping.
    pub fn update_flags(
        &mut self,
        page: Page<Size4KiB>,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        match self.walk(page.start_address()) {
            Some(entry) if !entry.is_unused() => {
                let frame = entry.addr();
                entry.set_addr(frame, flags | PageTableFlags::PRESENT);
                tlb::flush_page(page.start_address());
                Ok(())
            }
            _ => Err(MapError::NotMapped),
        }
    }

    /// Leaf frame and flags for `virt`, if present.
    pub fn translate(&self, virt: VirtAddr) -> Option<(PhysFrame, PageTableFlags)> {
        let entry = self.walk(virt)?;
        if entry.is_unused() || !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some((PhysFrame::containing_address(entry.addr()), entry.flags()))
    }

    /// Full virtual→physical translation including the page offset.
    pub fn translate_addr(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let (frame, _) = self.translate(virt)?;
        Some(frame.start_address() + (virt.as_u64() & (PAGE_SIZE - 1)))
    }

    /// Leaf PTE flags for `virt`, present or not.
    pub fn pte_flags(&self, virt: VirtAddr) -> Option<PageTableFlags> {
        let entry = self.walk(virt)?;
        if entry.is_unused() {
            None
        } else {
            Some(entry.flags())
        }
    }

    /// Map `count` consecutive pages starting at `page`/`frame`.
    /// Rolls back every page it mapped on failure.
    pub fn map_range(
        &mut self,
        page: Page<Size4KiB>,
        frame: PhysFrame,
        count: u64,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        for i in 0..count {
            let result = self.map_page(page + i, frame + i, flags);
            if let Err(e) = result {
                for j in 0..i {
                    self.unmap_page(page + j);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap `count` consecutive pages. Missing mappings are skipped.
    pub fn unmap_range(&mut self, page: Page<Size4KiB>, count: u64) {
        for i in 0..count {
            self.unmap_page(page + i);
        }
    }

    /// Reclaim every table page of the user half, post-order. Leaf data
    /// frames are the address-space layer's to free, not ours.
    pub fn destroy_user_tables(&mut self) {
        let root = table_at(self.pml4.start_address());
        for i in 0..256 {
            let entry = &mut root[i];
            if entry.is_unused() {
                continue;
            }
            free_subtree(entry.addr(), 3);
            entry.set_unused();
        }
    }

    /// Release the root itself. Only valid for user roots after
    /// [`Self::destroy_user_tables`].
    pub fn free_root(&mut self) {
        frame_allocator::deallocate_frame(self.pml4);
    }
}

/// Post-order reclamation of one table subtree. `level` is the height
/// of the table at `phys`: 3 = PDPT, 2 = PD, 1 = PT.
fn free_subtree(phys: PhysAddr, level: u8) {
    if level > 1 {
        let table = table_at(phys);
        for i in 0..512 {
            let entry = &table[i];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                continue;
            }
            free_subtree(entry.addr(), level - 1);
        }
    }
    frame_allocator::deallocate_frame(PhysFrame::containing_address(phys));
}

fn mark_table_frame(frame: PhysFrame) {
    let pfn = frame.start_address().as_u64() / PAGE_SIZE;
    if let Some(desc) = frame_allocator::frame_map().get(pfn) {
        desc.set_flags(PageFlags::KERNEL);
    }
}

fn descriptor_for(frame: PhysFrame) -> Option<&'static super::page::PageFrame> {
    let pfn = frame.start_address().as_u64() / PAGE_SIZE;
    frame_allocator::frame_map().get(pfn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_pmm;

    fn page(addr: u64) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::new(addr))
    }

    const USER_FLAGS: PageTableFlags = PageTableFlags::PRESENT
        .union(PageTableFlags::WRITABLE)
        .union(PageTableFlags::USER_ACCESSIBLE);

    #[test]
    fn map_translate_unmap() {
        let _pmm = init_test_pmm();
        let mut tables = PageTables::new_user().unwrap();
        let frame = frame_allocator::allocate_zeroed_frame().unwrap();

        tables.map_page(page(0x40000000), frame, USER_FLAGS).unwrap();
        let (got, flags) = tables.translate(VirtAddr::new(0x40000000)).unwrap();
        assert_eq!(got, frame);
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert_eq!(
            tables.translate_addr(VirtAddr::new(0x40000123)).unwrap(),
            frame.start_address() + 0x123u64
        );

        let (unmapped, _) = tables.unmap_page(page(0x40000000)).unwrap();
        assert_eq!(unmapped, frame);
        assert!(tables.translate(VirtAddr::new(0x40000000)).is_none());

        frame_allocator::deallocate_frame(frame);
        tables.destroy_user_tables();
        tables.free_root();
    }

    #[test]
    fn double_map_is_rejected() {
        let _pmm = init_test_pmm();
        let mut tables = PageTables::new_user().unwrap();
        let frame = frame_allocator::allocate_zeroed_frame().unwrap();
        tables.map_page(page(0x50000000), frame, USER_FLAGS).unwrap();
        assert_eq!(
            tables.map_page(page(0x50000000), frame, USER_FLAGS),
            Err(MapError::AlreadyMapped)
        );
        tables.unmap_page(page(0x50000000));
        frame_allocator::deallocate_frame(frame);
        tables.destroy_user_tables();
        tables.free_root();
    }

    #[test]
    fn destroy_reclaims_table_pages() {
        let _pmm = init_test_pmm();
        let before = frame_allocator::free_page_count();
        let mut tables = PageTables::new_user().unwrap();
        let frame = frame_allocator::allocate_zeroed_frame().unwrap();
        // Two leaves far apart force several table pages into existence.
        tables.map_page(page(0x40000000), frame, USER_FLAGS).unwrap();
        tables
            .map_page(page(0x7000_0000_0000), frame, USER_FLAGS)
            .unwrap();
        tables.unmap_page(page(0x40000000));
        tables.unmap_page(page(0x7000_0000_0000));
        frame_allocator::deallocate_frame(frame);
        tables.destroy_user_tables();
        tables.free_root();
        assert_eq!(frame_allocator::free_page_count(), before);
    }

    #[test]
    fn cow_flag_round_trip() {
        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE;
        let cow = make_cow_flags(flags);
        assert!(!cow.contains(PageTableFlags::WRITABLE));
        assert!(is_cow(cow));
        let back = make_private_flags(cow);
        assert!(back.contains(PageTableFlags::WRITABLE));
        assert!(!is_cow(back));
    }

    #[test]
    fn update_flags_rewrites_protection() {
        let _pmm = init_test_pmm();
        let mut tables = PageTables::new_user().unwrap();
        let frame = frame_allocator::allocate_zeroed_frame().unwrap();
        tables.map_page(page(0x60000000), frame, USER_FLAGS).unwrap();

        let ro = USER_FLAGS - PageTableFlags::WRITABLE;
        tables.update_flags(page(0x60000000), ro).unwrap();
        let (_, flags) = tables.translate(VirtAddr::new(0x60000000)).unwrap();
        assert!(!flags.contains(PageTableFlags::WRITABLE));

        tables.unmap_page(page(0x60000000));
        frame_allocator::deallocate_frame(frame);
        tables.destroy_user_tables();
        tables.free_root();
    }
}
