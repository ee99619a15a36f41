//! Boot-info handoff.
//!
//! The bootloader collaborator supplies exactly one [`BootInfo`]
//! descriptor at startup: the higher-half direct-map offset, kernel load
//! addresses, the typed physical memory map, and the boot modules. The
//! core consumes the memory map during PMM bring-up and caches module
//! payloads into kernel-owned pages before reclaimable memory is reused,
//! so the payloads survive for a later exec.

use crate::memory::{self, PAGE_SIZE};
use crate::spinlock::TicketLock;
use alloc::string::String;
use alloc::vec::Vec;

/// Maximum length of a boot-module command line.
pub const MODULE_CMDLINE_MAX: usize = 64;

/// Kind of a physical memory-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Bad,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
}

impl MemoryRegionKind {
    /// Regions the PMM may hand out as page frames. Bootloader-
    /// reclaimable memory only becomes usable after module caching.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Usable | Self::BootloaderReclaimable)
    }
}

/// One physical memory-map entry, `[base, base + length)`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// A module loaded by the bootloader (initial programs, config blobs).
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    /// Physical address of the payload.
    pub addr: u64,
    pub size: u64,
    /// NUL-padded command line, at most [`MODULE_CMDLINE_MAX`] bytes.
    pub cmdline: [u8; MODULE_CMDLINE_MAX],
}

impl BootModule {
    pub fn cmdline_str(&self) -> &str {
        let len = self
            .cmdline
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MODULE_CMDLINE_MAX);
        core::str::from_utf8(&self.cmdline[..len]).unwrap_or("")
    }
}

/// Framebuffer handed over by the bootloader. The core never draws; this
/// is carried for the external console collaborator.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u16,
}

/// SMP topology descriptor. Single-CPU release: recorded, not acted on.
#[derive(Debug, Clone, Copy)]
pub struct SmpInfo {
    pub cpu_count: u32,
    pub bsp_lapic_id: u32,
}

/// The one-shot descriptor from the bootloader collaborator.
#[derive(Debug)]
pub struct BootInfo<'a> {
    /// Virtual offset of the higher-half direct map.
    pub hhdm_offset: u64,
    pub kernel_phys_base: u64,
    pub kernel_virt_base: u64,
    pub memory_map: &'a [MemoryRegion],
    pub framebuffer: Option<FramebufferInfo>,
    /// Physical address of the ACPI RSDP, if the firmware provided one.
    pub rsdp: Option<u64>,
    pub smp: Option<SmpInfo>,
    /// Boot time as a Unix timestamp, if known.
    pub boot_time: Option<i64>,
    pub modules: &'a [BootModule],
}

/// A boot module whose payload has been copied into kernel-owned pages.
pub struct CachedModule {
    pub cmdline: String,
    /// Physical address of the kernel-owned copy.
    pub phys: u64,
    pub size: u64,
    /// Allocation order backing the copy, for teardown.
    order: usize,
}

static CACHED_MODULES: TicketLock<Vec<CachedModule>> = TicketLock::new(Vec::new());

/// Copy every boot module out of bootloader-reclaimable memory.
///
/// Must run after the PMM and heap are up but before any reclaimable
/// region is reused. Modules that fail to allocate are logged and
/// skipped; exec of that module will later fail with ENOENT semantics
/// rather than reading freed memory.
pub fn cache_boot_modules(boot_info: &BootInfo) {
    let mut cached = CACHED_MODULES.lock();
    for module in boot_info.modules {
        let pages = module.size.div_ceil(PAGE_SIZE);
        let order = memory::order_for_pages(pages);
        let frame = match memory::alloc_pages(order, memory::AllocFlags::empty()) {
            Some(frame) => frame,
            None => {
                log::error!(
                    "boot: no memory to cache module '{}' ({} bytes)",
                    module.cmdline_str(),
                    module.size
                );
                continue;
            }
        };

        let src = memory::phys_to_virt(module.addr) as *const u8;
        let dst = memory::phys_to_virt(frame.start_address().as_u64()) as *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(src, dst, module.size as usize);
        }

        log::info!(
            "boot: cached module '{}' {:#x} -> {:#x} ({} bytes)",
            module.cmdline_str(),
            module.addr,
            frame.start_address().as_u64(),
            module.size
        );

        cached.push(CachedModule {
            cmdline: String::from(module.cmdline_str()),
            phys: frame.start_address().as_u64(),
            size: module.size,
            order,
        });
    }
}

/// Look up a cached module by command line and hand its location to `f`.
pub fn with_module<R>(cmdline: &str, f: impl FnOnce(&CachedModule) -> R) -> Option<R> {
    let cached = CACHED_MODULES.lock();
    cached.iter().find(|m| m.cmdline == cmdline).map(f)
}

/// Number of cached modules.
pub fn module_count() -> usize {
    CACHED_MODULES.lock().len()
}

/// Drop every cached module, returning its pages. Test teardown hook.
#[cfg(test)]
pub fn clear_cached_modules() {
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    let mut cached = CACHED_MODULES.lock();
    for m in cached.drain(..) {
        memory::free_pages(PhysFrame::containing_address(PhysAddr::new(m.phys)), m.order);
    }
}

/// Helper for building a cmdline array from a string literal.
pub fn cmdline(s: &str) -> [u8; MODULE_CMDLINE_MAX] {
    let mut out = [0u8; MODULE_CMDLINE_MAX];
    let n = s.len().min(MODULE_CMDLINE_MAX);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}
