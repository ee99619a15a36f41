//! User-pointer validation and copying.
//!
//! Every user pointer is validated against the caller's VMAs before a
//! single byte moves, and copies are performed page by page through the
//! caller's page tables and the direct map, so a copy can never read or
//! write past a VMA boundary or touch an unmapped hole. A hole inside a
//! validated range (a lazy page nobody touched yet) is populated
//! through the fault path, exactly as a hardware access would.

use super::errno::Errno;
use crate::memory::address_space::AddressSpace;
use crate::memory::layout;
use crate::memory::vma::VmaFlags;
use crate::memory::{phys_to_virt, PAGE_SIZE};
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

/// Check that `[addr, addr + len)` lies in user space and every byte is
/// covered by a VMA with the required capability.
pub fn validate_user_range(
    aspace: &AddressSpace,
    addr: u64,
    len: usize,
    write: bool,
) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len as u64).ok_or(Errno::EFAULT)?;
    if addr == 0 || !layout::is_user_address(end - 1) {
        return Err(Errno::EFAULT);
    }

    let needed = if write { VmaFlags::WRITE } else { VmaFlags::READ };
    let mut cursor = addr;
    while cursor < end {
        let vma = aspace
            .find_vma(VirtAddr::new(cursor))
            .ok_or(Errno::EFAULT)?;
        if !vma.flags.contains(needed) {
            return Err(Errno::EFAULT);
        }
        cursor = vma.end.as_u64();
    }
    Ok(())
}

/// Resolve one user page for access, faulting it in if absent.
fn user_page_ptr(
    aspace: &mut AddressSpace,
    addr: u64,
    write: bool,
) -> Result<*mut u8, Errno> {
    let virt = VirtAddr::new(addr);
    let resolved = match aspace.tables().translate_addr(virt) {
        Some(phys) => {
            // A write to a CoW or stale read-only page must go through
            // the fault path first.
            use x86_64::structures::paging::PageTableFlags;
            let flags = aspace
                .tables()
                .pte_flags(virt)
                .unwrap_or(PageTableFlags::empty());
            if write && !flags.contains(PageTableFlags::WRITABLE) {
                None
            } else {
                Some(phys)
            }
        }
        None => None,
    };

    let phys = match resolved {
        Some(phys) => phys,
        None => {
            let mut error = PageFaultErrorCode::USER_MODE;
            if write {
                error |= PageFaultErrorCode::CAUSED_BY_WRITE;
            }
            aspace.handle_fault(virt, error).map_err(|_| Errno::EFAULT)?;
            aspace
                .tables()
                .translate_addr(virt)
                .ok_or(Errno::EFAULT)?
        }
    };
    Ok(phys_to_virt(phys.as_u64()) as *mut u8)
}

/// Copy `buf.len()` bytes in from user memory.
pub fn copy_from_user(
    aspace: &mut AddressSpace,
    addr: u64,
    buf: &mut [u8],
) -> Result<(), Errno> {
    validate_user_range(aspace, addr, buf.len(), false)?;
    let mut done = 0;
    while done < buf.len() {
        let cursor = addr + done as u64;
        let in_page = (PAGE_SIZE - (cursor & (PAGE_SIZE - 1))) as usize;
        let chunk = in_page.min(buf.len() - done);
        let src = user_page_ptr(aspace, cursor, false)?;
        unsafe {
            core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Copy `buf.len()` bytes out to user memory.
pub fn copy_to_user(aspace: &mut AddressSpace, addr: u64, buf: &[u8]) -> Result<(), Errno> {
    validate_user_range(aspace, addr, buf.len(), true)?;
    let mut done = 0;
    while done < buf.len() {
        let cursor = addr + done as u64;
        let in_page = (PAGE_SIZE - (cursor & (PAGE_SIZE - 1))) as usize;
        let chunk = in_page.min(buf.len() - done);
        let dst = user_page_ptr(aspace, cursor, true)?;
        unsafe {
            core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), dst, chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Copy a u64 out to user memory (syscall result slots).
pub fn put_user_u64(aspace: &mut AddressSpace, addr: u64, value: u64) -> Result<(), Errno> {
    copy_to_user(aspace, addr, &value.to_ne_bytes())
}

/// Read a u64 from user memory.
pub fn get_user_u64(aspace: &mut AddressSpace, addr: u64) -> Result<u64, Errno> {
    let mut buf = [0u8; 8];
    copy_from_user(aspace, addr, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}
