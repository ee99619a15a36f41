//! TLB maintenance helpers.
//!
//! Thin, safe wrappers over the architecture seam. Single-CPU release:
//! no shootdown IPIs, every flush is local.

use x86_64::VirtAddr;

/// Invalidate the translation for one page.
pub fn flush_page(addr: VirtAddr) {
    crate::arch::flush_tlb_page(addr.as_u64());
}

/// Invalidate every non-global translation.
pub fn flush_all() {
    crate::arch::flush_tlb_all();
}

/// Invalidate a page range, entry by entry. Ranges past a few hundred
/// pages are cheaper as a full flush.
pub fn flush_range(start: VirtAddr, pages: u64) {
    const FULL_FLUSH_THRESHOLD: u64 = 256;
    if pages >= FULL_FLUSH_THRESHOLD {
        flush_all();
        return;
    }
    for i in 0..pages {
        flush_page(start + i * super::PAGE_SIZE);
    }
}
