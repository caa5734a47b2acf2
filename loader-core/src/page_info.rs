//! The per-frame metadata array: a sparse table indexed by physical frame
//! number, backed (on real hardware) by pages mapped at a fixed kernel
//! virtual window.

use alloc::collections::BTreeMap;
use core::convert::TryInto;

use crate::memory_map::MemoryMap;
use crate::paging::{align_down, align_up, PagingContext, PAGE_SIZE};
use crate::platform::FrameAllocator;

/// Fixed kernel-virtual base of the page-info window.
pub const INFO_BASE: u64 = 0xFFFF_8080_0000_0000;
/// Size in bytes of one page-info entry.
pub const ENTRY_SIZE: u64 = 32;

pub fn info_address(frame: u64) -> u64 {
    INFO_BASE + frame * ENTRY_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Free,
    Wired,
    WiredBacking,
    Active,
    ActiveWriteback,
    InactiveWriteback,
    PageTable,
    Other,
}

impl PageType {
    fn to_raw(self) -> u8 {
        match self {
            PageType::Free => 0,
            PageType::Wired => 1,
            PageType::WiredBacking => 2,
            PageType::Active => 3,
            PageType::ActiveWriteback => 4,
            PageType::InactiveWriteback => 5,
            PageType::PageTable => 6,
            PageType::Other => 7,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PageType::Free,
            1 => PageType::Wired,
            2 => PageType::WiredBacking,
            3 => PageType::Active,
            4 => PageType::ActiveWriteback,
            5 => PageType::InactiveWriteback,
            6 => PageType::PageTable,
            _ => PageType::Other,
        }
    }
}

impl Default for PageType {
    fn default() -> Self {
        PageType::Other
    }
}

/// Typed view over the packed `flags` word of a page-info entry: low byte
/// is the page type, next byte is the buddy bin index when the type is
/// `Free`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageFlags(u64);

impl PageFlags {
    pub fn page_type(self) -> PageType {
        PageType::from_raw((self.0 & 0xff) as u8)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.0 = (self.0 & !0xff) | page_type.to_raw() as u64;
    }

    pub fn bin(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn set_bin(&mut self, bin: u8) {
        self.0 = (self.0 & !0xff00) | ((bin as u64) << 8);
    }
}

/// One 32-byte page-info entry: type/bin flags, a type-dependent payload,
/// and the doubly-linked free-list pointers used while a frame is free.
/// Link fields reference frames by frame number rather than a separate
/// index type, since the table itself is already keyed by frame number.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageInfo {
    pub flags: PageFlags,
    pub extra: u64,
    pub next: Option<u64>,
    pub prev: Option<u64>,
}

/// Link-field sentinel: no frame number is ever this large, so it is safe to
/// use in place of an absent `next`/`prev` in the on-disk 32-byte layout.
const NO_LINK: u64 = u64::MAX;

impl PageInfo {
    /// Packs this entry into the 32-byte on-disk layout: flags, extra,
    /// next, prev, each a little-endian `u64`.
    pub fn to_raw(self) -> [u8; ENTRY_SIZE as usize] {
        let mut buf = [0u8; ENTRY_SIZE as usize];
        buf[0..8].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[8..16].copy_from_slice(&self.extra.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next.unwrap_or(NO_LINK).to_le_bytes());
        buf[24..32].copy_from_slice(&self.prev.unwrap_or(NO_LINK).to_le_bytes());
        buf
    }

    pub fn from_raw(raw: [u8; ENTRY_SIZE as usize]) -> Self {
        let word = |off: usize| u64::from_le_bytes(raw[off..off + 8].try_into().unwrap());
        let link = |v: u64| if v == NO_LINK { None } else { Some(v) };
        PageInfo {
            flags: PageFlags(word(0)),
            extra: word(8),
            next: link(word(16)),
            prev: link(word(24)),
        }
    }
}

/// The sparse per-frame metadata table. Entries exist only for frames that
/// fall inside a memory-map range, mirroring the fact that only those
/// addresses are ever mapped in the real page-info window.
#[derive(Debug, Default)]
pub struct FrameTable {
    frames: BTreeMap<u64, PageInfo>,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable {
            frames: BTreeMap::new(),
        }
    }

    pub fn is_covered(&self, frame: u64) -> bool {
        self.frames.contains_key(&frame)
    }

    pub fn get(&self, frame: u64) -> Option<&PageInfo> {
        self.frames.get(&frame)
    }

    pub fn get_mut(&mut self, frame: u64) -> Option<&mut PageInfo> {
        self.frames.get_mut(&frame)
    }

    pub fn set(&mut self, frame: u64, info: PageInfo) {
        self.frames.insert(frame, info);
    }

    /// Iterates every covered frame in ascending frame-number order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &PageInfo)> {
        self.frames.iter().map(|(&frame, info)| (frame, info))
    }

    fn ensure_covered(&mut self, memory_map: &MemoryMap) {
        for range in memory_map.entries() {
            let mut frame = range.start / PAGE_SIZE;
            let end_frame = range.end / PAGE_SIZE;
            while frame < end_frame {
                self.frames.entry(frame).or_default();
                frame += 1;
            }
        }
    }
}

/// Allocates and maps the page-info window for every range in
/// `memory_map`, skipping any page already mapped by a previous range so
/// that adjacent ranges sharing an info-window page are not double
/// allocated.
pub fn build<C: PagingContext>(
    memory_map: &MemoryMap,
    ctx: &mut C,
    arena: &mut dyn FrameAllocator,
) -> FrameTable {
    let mut table = FrameTable::new();

    for range in memory_map.entries() {
        let info_start = align_down(info_address(range.start / PAGE_SIZE), PAGE_SIZE);
        let info_end = align_up(info_address(range.end / PAGE_SIZE), PAGE_SIZE);

        let mut addr = info_start;
        while addr < info_end {
            if !ctx.is_mapped(addr) {
                match arena.allocate_min_addr(1, 0x10_0000) {
                    Some(phys) => {
                        if ctx.map(addr, phys, PAGE_SIZE, true, false, arena) {
                            ctx.memset(addr, 0, PAGE_SIZE);
                        } else {
                            log::warn!("failed to map page-info window page at {addr:#x}");
                        }
                    }
                    None => log::warn!("out of memory allocating page-info backing page"),
                }
            }
            addr += PAGE_SIZE;
        }
    }

    table.ensure_covered(memory_map);
    table
}

/// Marks every intermediate page-table frame `ctx` has allocated since the
/// last call as [`PageType::PageTable`], so a later buddy seed pass does
/// not mistake a live table for a free frame.
pub fn tag_new_table_frames<C: PagingContext>(ctx: &mut C, table: &mut FrameTable) {
    for phys in ctx.take_new_table_frames() {
        let frame = phys / PAGE_SIZE;
        if let Some(info) = table.get_mut(frame) {
            info.flags.set_page_type(PageType::PageTable);
        }
    }
}

/// Serializes every covered entry of `table` back into the kernel-mapped
/// page-info window, so the kernel's own view of each frame's type and
/// free-list links matches what the loader computed. Returns `false` if any
/// entry's backing page-info page turns out to be unmapped.
pub fn write_back<C: PagingContext>(table: &FrameTable, ctx: &mut C) -> bool {
    let mut ok = true;
    for (frame, info) in table.iter() {
        if !ctx.memcpy_to(info_address(frame), &info.to_raw()) {
            ok = false;
        }
    }
    ok
}

/// Builds a [`FrameTable`] covering `memory_map` without touching any
/// paging context, for tests that only care about page-info/buddy state.
#[cfg(test)]
pub fn build_table_for_test(memory_map: &MemoryMap) -> FrameTable {
    let mut table = FrameTable::new();
    table.ensure_covered(memory_map);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFrameAllocator, VecPagingContext};

    #[test]
    fn covered_frames_are_mapped_and_others_are_not() {
        let mut map = MemoryMap::new();
        map.insert(0x10_0000, 0x20_0000);
        let mut ctx = VecPagingContext::new();
        let mut arena = MockFrameAllocator::new(0x100_0000);
        let table = build(&map, &mut ctx, &mut arena);

        let first_frame = 0x10_0000 / PAGE_SIZE;
        let last_frame = 0x20_0000 / PAGE_SIZE - 1;
        assert!(table.is_covered(first_frame));
        assert!(table.is_covered(last_frame));
        assert!(ctx.is_mapped(info_address(first_frame)));
        assert!(ctx.is_mapped(info_address(last_frame)));

        assert!(!table.is_covered(0x20_0000 / PAGE_SIZE));
        assert!(!ctx.is_mapped(info_address(0x20_0000 / PAGE_SIZE)));
    }

    #[test]
    fn adjacent_ranges_do_not_double_map_shared_window_page() {
        let mut map = MemoryMap::new();
        // Two ranges whose info windows fall on the same 4 KiB page
        // (32 bytes/entry * 128 entries = 4 KiB -> 128 frames per window page).
        map.insert(0, 64 * PAGE_SIZE);
        map.insert(64 * PAGE_SIZE, 128 * PAGE_SIZE);
        let mut ctx = VecPagingContext::new();
        let mut arena = MockFrameAllocator::new(0x100_0000);
        let _table = build(&map, &mut ctx, &mut arena);
        // A single allocation should have satisfied the shared window page.
        assert!(ctx.is_mapped(info_address(0)));
        assert!(ctx.is_mapped(info_address(127)));
    }

    #[test]
    fn raw_round_trip_preserves_every_field() {
        let mut flags = PageFlags::default();
        flags.set_page_type(PageType::Wired);
        flags.set_bin(5);
        let info = PageInfo {
            flags,
            extra: 0x1234,
            next: Some(7),
            prev: None,
        };
        let round_tripped = PageInfo::from_raw(info.to_raw());
        assert_eq!(round_tripped.flags, info.flags);
        assert_eq!(round_tripped.extra, info.extra);
        assert_eq!(round_tripped.next, info.next);
        assert_eq!(round_tripped.prev, info.prev);
    }

    #[test]
    fn write_back_copies_every_covered_frame_into_the_info_window() {
        let mut map = MemoryMap::new();
        map.insert(0, 2 * PAGE_SIZE);
        let mut ctx = VecPagingContext::new();
        let mut arena = MockFrameAllocator::new(0x100_0000);
        let mut table = build(&map, &mut ctx, &mut arena);

        let mut flags = PageFlags::default();
        flags.set_page_type(PageType::Wired);
        table.set(1, PageInfo { flags, extra: 99, next: None, prev: None });

        assert!(write_back(&table, &mut ctx));

        let mut raw = [0u8; ENTRY_SIZE as usize];
        ctx.memcpy_from(&mut raw, info_address(1));
        let written = PageInfo::from_raw(raw);
        assert_eq!(written.flags.page_type(), PageType::Wired);
        assert_eq!(written.extra, 99);
    }

    #[test]
    fn tag_new_table_frames_is_a_no_op_without_any_pending_allocations() {
        let mut map = MemoryMap::new();
        map.insert(0, PAGE_SIZE);
        let mut table = build_table_for_test(&map);
        let mut ctx = VecPagingContext::new();
        tag_new_table_frames(&mut ctx, &mut table);
        assert_eq!(table.get(0).unwrap().flags.page_type(), PageType::Free);
    }
}
