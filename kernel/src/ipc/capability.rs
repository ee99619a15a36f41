//! Capability spaces.
//!
//! A capability is an unforgeable, rights-bearing reference to a kernel
//! object; userspace only ever holds slot indices into its process's
//! capability space. Slots live in a resizable array with a free-slot
//! bitmap; a generation counter implements coarse revocation: revoking
//! bumps the space's generation, and any *derived* capability stamped
//! with an older generation fails its next lookup.

use super::endpoint::Endpoint;
use crate::process::Pid;
use crate::spinlock::TicketLock;
use crate::task::Tid;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Rights carried by a capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapRights: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXEC   = 1 << 2;
        /// May copy or mint this capability.
        const GRANT  = 1 << 3;
        /// May revoke capabilities derived from this one.
        const REVOKE = 1 << 4;
        const SEND   = 1 << 5;
        const RECV   = 1 << 6;
        const MANAGE = 1 << 7;
    }
}

impl CapRights {
    pub fn all_ipc() -> Self {
        CapRights::SEND | CapRights::RECV | CapRights::GRANT | CapRights::REVOKE
    }
}

/// The kernel object a capability refers to.
#[derive(Debug, Clone, Default)]
pub enum CapObject {
    #[default]
    None,
    Endpoint(Arc<Endpoint>),
    Memory {
        base: u64,
        len: u64,
    },
    Thread(Tid),
    Process(Pid),
    Irq(u32),
    IoPort(u16),
    Notification(u64),
}

impl CapObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            CapObject::None => "none",
            CapObject::Endpoint(_) => "endpoint",
            CapObject::Memory { .. } => "memory",
            CapObject::Thread(_) => "thread",
            CapObject::Process(_) => "process",
            CapObject::Irq(_) => "irq",
            CapObject::IoPort(_) => "ioport",
            CapObject::Notification(_) => "notification",
        }
    }
}

/// One slot's contents.
#[derive(Debug, Clone)]
pub struct Capability {
    pub object: CapObject,
    pub rights: CapRights,
    /// Caller-chosen identification tag, carried by minted copies.
    pub badge: u64,
    /// Space generation at creation; stale derived caps fail lookup.
    pub generation: u64,
    /// Whether this capability was produced by copy or mint.
    pub derived: bool,
    pub slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    InvalidSlot,
    WrongType,
    NoRights,
    Full,
}

const INITIAL_SLOTS: usize = 64;

struct CapSpaceInner {
    slots: Vec<Capability>,
    /// Bit set per allocated slot.
    used_bitmap: Vec<u64>,
    used: usize,
    generation: u64,
}

impl CapSpaceInner {
    fn is_used(&self, slot: usize) -> bool {
        slot < self.slots.len() && self.used_bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn set_used(&mut self, slot: usize, used: bool) {
        if used {
            self.used_bitmap[slot / 64] |= 1 << (slot % 64);
        } else {
            self.used_bitmap[slot / 64] &= !(1 << (slot % 64));
        }
    }

    fn find_free(&self) -> Option<usize> {
        (0..self.slots.len()).find(|&i| !self.is_used(i))
    }

    fn grow(&mut self) {
        let new_len = self.slots.len() * 2;
        self.slots.resize_with(new_len, empty_slot);
        self.used_bitmap.resize(new_len.div_ceil(64), 0);
    }

    fn insert(&mut self, object: CapObject, rights: CapRights, badge: u64, derived: bool) -> u32 {
        let slot = match self.find_free() {
            Some(slot) => slot,
            None => {
                self.grow();
                self.find_free().expect("grow produced no free slot")
            }
        };
        self.slots[slot] = Capability {
            object,
            rights,
            badge,
            generation: self.generation,
            derived,
            slot: slot as u32,
        };
        self.set_used(slot, true);
        self.used += 1;
        slot as u32
    }

    fn delete(&mut self, slot: usize) -> bool {
        if !self.is_used(slot) {
            return false;
        }
        self.slots[slot] = empty_slot();
        self.set_used(slot, false);
        self.used -= 1;
        true
    }

    /// Live capability at `slot`, dropping stale derived entries.
    fn get(&mut self, slot: usize) -> Option<&Capability> {
        if !self.is_used(slot) {
            return None;
        }
        let cap = &self.slots[slot];
        if cap.derived && cap.generation < self.generation {
            self.delete(slot);
            return None;
        }
        Some(&self.slots[slot])
    }
}

fn empty_slot() -> Capability {
    Capability {
        object: CapObject::None,
        rights: CapRights::empty(),
        badge: 0,
        generation: 0,
        derived: false,
        slot: 0,
    }
}

/// A per-process capability table.
pub struct CapSpace {
    inner: TicketLock<CapSpaceInner>,
}

impl CapSpace {
    pub fn new() -> Self {
        Self {
            inner: TicketLock::new(CapSpaceInner {
                slots: {
                    let mut v = Vec::with_capacity(INITIAL_SLOTS);
                    v.resize_with(INITIAL_SLOTS, empty_slot);
                    v
                },
                used_bitmap: alloc::vec![0; INITIAL_SLOTS.div_ceil(64)],
                used: 0,
                generation: 0,
            }),
        }
    }

    /// Install a capability, returning its slot index.
    pub fn insert(&self, object: CapObject, rights: CapRights, badge: u64) -> u32 {
        self.inner.lock().insert(object, rights, badge, false)
    }

    /// Clone of the capability at `slot`, if live.
    pub fn lookup(&self, slot: u32) -> Option<Capability> {
        self.inner.lock().get(slot as usize).cloned()
    }

    /// Typed lookup: the endpoint behind `slot`. Rights are *not*
    /// checked here; the caller verifies them for its operation.
    pub fn lookup_endpoint(&self, slot: u32) -> Result<(Arc<Endpoint>, CapRights, u64), CapError> {
        let cap = self.lookup(slot).ok_or(CapError::InvalidSlot)?;
        match cap.object {
            CapObject::Endpoint(ep) => Ok((ep, cap.rights, cap.badge)),
            _ => Err(CapError::WrongType),
        }
    }

    pub fn delete(&self, slot: u32) -> bool {
        self.inner.lock().delete(slot as usize)
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Revoke through the capability at `slot`: requires REVOKE and
    /// invalidates every derived capability of this space created
    /// before now.
    pub fn revoke(&self, slot: u32) -> Result<(), CapError> {
        let mut inner = self.inner.lock();
        let cap = inner.get(slot as usize).ok_or(CapError::InvalidSlot)?;
        if !cap.rights.contains(CapRights::REVOKE) {
            return Err(CapError::NoRights);
        }
        inner.generation += 1;
        Ok(())
    }

    /// Slot-for-slot duplicate, for fork: indices, rights, badges, and
    /// generations all carry over.
    pub fn duplicate(&self) -> CapSpace {
        let inner = self.inner.lock();
        CapSpace {
            inner: TicketLock::new(CapSpaceInner {
                slots: inner.slots.clone(),
                used_bitmap: inner.used_bitmap.clone(),
                used: inner.used,
                generation: inner.generation,
            }),
        }
    }

    /// Integrity check: `used` matches the bitmap, and free slots hold
    /// no object.
    pub fn check_invariants(&self) -> bool {
        let inner = self.inner.lock();
        let mut counted = 0;
        for i in 0..inner.slots.len() {
            if inner.is_used(i) {
                counted += 1;
            } else if !matches!(inner.slots[i].object, CapObject::None) {
                return false;
            }
        }
        counted == inner.used
    }
}

impl Default for CapSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy a capability between (possibly distinct) spaces. Requires
/// GRANT on the source capability.
pub fn cap_copy(src: &CapSpace, src_slot: u32, dst: &CapSpace) -> Result<u32, CapError> {
    transfer(src, src_slot, dst, None, None)
}

/// Copy with reduced rights and a caller-chosen badge. The produced
/// rights are the intersection of `rights` with the source's.
pub fn cap_mint(
    src: &CapSpace,
    src_slot: u32,
    dst: &CapSpace,
    rights: CapRights,
    badge: u64,
) -> Result<u32, CapError> {
    transfer(src, src_slot, dst, Some(rights), Some(badge))
}

/// Shared copy/mint path. When two spaces are involved the locks are
/// taken in address order; the same-space case takes a single lock.
fn transfer(
    src: &CapSpace,
    src_slot: u32,
    dst: &CapSpace,
    rights_mask: Option<CapRights>,
    badge: Option<u64>,
) -> Result<u32, CapError> {
    let derive = |cap: &Capability| -> Result<(CapObject, CapRights, u64), CapError> {
        if !cap.rights.contains(CapRights::GRANT) {
            return Err(CapError::NoRights);
        }
        let rights = match rights_mask {
            Some(mask) => mask & cap.rights,
            None => cap.rights,
        };
        Ok((cap.object.clone(), rights, badge.unwrap_or(cap.badge)))
    };

    if core::ptr::eq(src, dst) {
        let mut inner = src.inner.lock();
        let cap = inner.get(src_slot as usize).ok_or(CapError::InvalidSlot)?;
        let (object, rights, badge) = derive(cap)?;
        return Ok(inner.insert(object, rights, badge, true));
    }

    let src_first = (src as *const CapSpace) < (dst as *const CapSpace);
    let (mut low, mut high) = if src_first {
        (src.inner.lock(), dst.inner.lock())
    } else {
        (dst.inner.lock(), src.inner.lock())
    };
    let (src_inner, dst_inner) = if src_first {
        (&mut *low, &mut *high)
    } else {
        (&mut *high, &mut *low)
    };

    let cap = src_inner
        .get(src_slot as usize)
        .ok_or(CapError::InvalidSlot)?;
    let (object, rights, badge) = derive(cap)?;
    Ok(dst_inner.insert(object, rights, badge, true))
}

/// Move a capability: copy without the GRANT requirement, then delete
/// the source. Used by message-donate transfers.
pub fn cap_move(src: &CapSpace, src_slot: u32, dst: &CapSpace) -> Result<u32, CapError> {
    if core::ptr::eq(src, dst) {
        // A same-space donate is a no-op slot-wise.
        return src
            .lookup(src_slot)
            .map(|c| c.slot)
            .ok_or(CapError::InvalidSlot);
    }

    let src_first = (src as *const CapSpace) < (dst as *const CapSpace);
    let (mut low, mut high) = if src_first {
        (src.inner.lock(), dst.inner.lock())
    } else {
        (dst.inner.lock(), src.inner.lock())
    };
    let (src_inner, dst_inner) = if src_first {
        (&mut *low, &mut *high)
    } else {
        (&mut *high, &mut *low)
    };

    let cap = src_inner
        .get(src_slot as usize)
        .ok_or(CapError::InvalidSlot)?
        .clone();
    let slot = dst_inner.insert(cap.object.clone(), cap.rights, cap.badge, cap.derived);
    src_inner.delete(src_slot as usize);
    Ok(slot)
}
