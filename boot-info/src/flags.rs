//! Flag bits shared by the on-disk block map and the boot-info page.

use bitflags::bitflags;

bitflags! {
    /// Flag bits packed into the low byte of a block-map entry.
    pub struct BlockMapFlags: u8 {
        const PRESENT     = 0x01;
        const WRITABLE    = 0x02;
        const ZERO_FILL   = 0x04;
        const WIRED       = 0x10;
        const TRACK_DIRTY = 0x20;
        const TRANSIENT   = 0x40;
    }
}

/// A single 64-bit block-map entry: a flag byte plus a 56-bit disk-block id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockMapEntry(u64);

impl BlockMapEntry {
    pub const EMPTY: BlockMapEntry = BlockMapEntry(0);

    pub fn new(block_id: u64, flags: BlockMapFlags) -> Self {
        BlockMapEntry((block_id << 8) | flags.bits() as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        BlockMapEntry(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> BlockMapFlags {
        BlockMapFlags::from_bits_truncate((self.0 & 0xff) as u8)
    }

    pub fn block_id(self) -> u64 {
        self.0 >> 8
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(BlockMapFlags::PRESENT)
    }

    pub fn with_block_id(self, block_id: u64) -> Self {
        BlockMapEntry::new(block_id, self.flags())
    }
}

bitflags! {
    /// Boot option flags, set from command tokens and recorded in the
    /// boot-info page for the kernel to read back.
    pub struct BootOptions: u64 {
        const FORCE_READ_ONLY = 0x01;
        const FREESTANDING    = 0x02;
        const VIDEO_CONSOLE   = 0x04;
        const NO_DETECT       = 0x08;
        const NO_SMP          = 0x10;
    }
}
