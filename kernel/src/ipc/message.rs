//! IPC messages.
//!
//! A message is a 64-bit tag, eight register-sized data words (the fast
//! path), an optional out-of-line buffer, and a short run of capability
//! slot indices. The tag packs label, lengths, flags, and an error
//! field:
//!
//! ```text
//! bits  0..20  label        (20 bits, protocol-defined)
//! bits 20..26  word count   (6 bits, <= MSG_REGS)
//! bits 26..30  cap count    (4 bits, <= MSG_MAX_CAPS)
//! bits 30..38  flags        (8 bits)
//! bits 38..54  error        (16 bits, set by the kernel on delivery)
//! bits 54..64  reserved
//! ```

use bitflags::bitflags;

/// Register data words carried by every message.
pub const MSG_REGS: usize = 8;

/// Capability slots one message can carry.
pub const MSG_MAX_CAPS: usize = 4;

bitflags! {
    /// Tag flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// Fail with NoPartner instead of blocking.
        const NONBLOCK = 1 << 0;
        /// Copy the listed capabilities to the receiver.
        const GRANT    = 1 << 1;
        /// Move the listed capabilities to the receiver.
        const DONATE   = 1 << 2;
    }
}

const LABEL_SHIFT: u64 = 0;
const LABEL_MASK: u64 = (1 << 20) - 1;
const LEN_SHIFT: u64 = 20;
const LEN_MASK: u64 = (1 << 6) - 1;
const CAPS_SHIFT: u64 = 26;
const CAPS_MASK: u64 = (1 << 4) - 1;
const FLAGS_SHIFT: u64 = 30;
const FLAGS_MASK: u64 = (1 << 8) - 1;
const ERROR_SHIFT: u64 = 38;
const ERROR_MASK: u64 = (1 << 16) - 1;

/// The packed message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageTag(u64);

impl MessageTag {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn new(label: u32, words: usize, caps: usize, flags: MsgFlags) -> Self {
        debug_assert!(words <= MSG_REGS);
        debug_assert!(caps <= MSG_MAX_CAPS);
        let mut raw = 0u64;
        raw |= (label as u64 & LABEL_MASK) << LABEL_SHIFT;
        raw |= (words as u64 & LEN_MASK) << LEN_SHIFT;
        raw |= (caps as u64 & CAPS_MASK) << CAPS_SHIFT;
        raw |= (flags.bits() as u64 & FLAGS_MASK) << FLAGS_SHIFT;
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn label(self) -> u32 {
        ((self.0 >> LABEL_SHIFT) & LABEL_MASK) as u32
    }

    /// Data word count, clamped to the register capacity.
    pub fn words(self) -> usize {
        (((self.0 >> LEN_SHIFT) & LEN_MASK) as usize).min(MSG_REGS)
    }

    /// Capability count, clamped to the slot capacity.
    pub fn caps(self) -> usize {
        (((self.0 >> CAPS_SHIFT) & CAPS_MASK) as usize).min(MSG_MAX_CAPS)
    }

    pub fn flags(self) -> MsgFlags {
        MsgFlags::from_bits_truncate(((self.0 >> FLAGS_SHIFT) & FLAGS_MASK) as u8)
    }

    pub fn error(self) -> u16 {
        ((self.0 >> ERROR_SHIFT) & ERROR_MASK) as u16
    }

    pub fn with_error(self, error: u16) -> Self {
        let cleared = self.0 & !(ERROR_MASK << ERROR_SHIFT);
        Self(cleared | ((error as u64) << ERROR_SHIFT))
    }

    pub fn with_caps(self, caps: usize) -> Self {
        debug_assert!(caps <= MSG_MAX_CAPS);
        let cleared = self.0 & !(CAPS_MASK << CAPS_SHIFT);
        Self(cleared | ((caps as u64 & CAPS_MASK) << CAPS_SHIFT))
    }
}

/// Optional out-of-line payload, truncated on delivery to the shorter
/// of the two sides' buffers.
#[derive(Debug, Clone, Copy)]
pub struct MsgBuffer {
    pub ptr: *mut u8,
    pub len: usize,
}

/// A message as the kernel moves it.
#[derive(Debug)]
pub struct Message {
    pub tag: MessageTag,
    pub regs: [u64; MSG_REGS],
    pub buffer: Option<MsgBuffer>,
    /// Capability slot indices: the sender's slots going out, the
    /// receiver's freshly assigned slots on delivery.
    pub caps: [u32; MSG_MAX_CAPS],
    /// Filled on delivery: the sending thread.
    pub sender: u64,
}

impl Message {
    pub fn new(tag: MessageTag) -> Self {
        Self {
            tag,
            regs: [0; MSG_REGS],
            buffer: None,
            caps: [0; MSG_MAX_CAPS],
            sender: 0,
        }
    }

    pub fn with_regs(tag: MessageTag, words: &[u64]) -> Self {
        debug_assert!(words.len() <= MSG_REGS);
        let mut msg = Self::new(tag);
        msg.regs[..words.len()].copy_from_slice(words);
        msg
    }
}
