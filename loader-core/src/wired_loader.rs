//! The two-pass wired-page loader: size and materialize the block map,
//! then allocate, map, and populate every page it selects.

use core::convert::TryInto;

use boot_info::{fixnum, BlockMapEntry, BlockMapFlags};

use crate::block_map::{BlockCache, BlockDevice, BLOCK_SIZE, ENTRIES_PER_BLOCK};
use crate::page_info::{FrameTable, PageFlags, PageInfo, PageType};
use crate::paging::{PagingContext, PAGE_SIZE};
use crate::physical_map::pmap_address;
use crate::platform::FrameAllocator;

/// Rather than allocating one 4 KiB page per kernel page, frames are
/// handed out of 8 MiB chunks sliced into 4 KiB pieces, so firmware never
/// sees more than a few hundred allocation calls for a large image.
const CHUNK_BYTES: u64 = 8 * 1024 * 1024;

struct ChunkAllocator {
    chunk_start: u64,
    offset: u64,
    size: u64,
}

impl ChunkAllocator {
    fn new() -> Self {
        ChunkAllocator {
            chunk_start: 0,
            offset: 0,
            size: 0,
        }
    }

    fn next_frame(&mut self, arena: &mut dyn FrameAllocator, pages_remaining: u64) -> Option<u64> {
        if self.offset >= self.size {
            let want_bytes = CHUNK_BYTES.min(pages_remaining.max(1) * PAGE_SIZE);
            let want_pages = (want_bytes / PAGE_SIZE).max(1);
            let phys = arena.allocate(want_pages as usize)?;
            self.chunk_start = phys;
            self.size = want_pages * PAGE_SIZE;
            self.offset = 0;
        }
        let frame = self.chunk_start + self.offset;
        self.offset += PAGE_SIZE;
        Some(frame)
    }
}

pub struct LoadResult {
    pub pages_loaded: u64,
    /// Kernel virtual address of the materialized block-map root, for
    /// `BootInfo::block_map_address`.
    pub block_map_root_virt: u64,
}

/// Loads the wired pages of the image's block map (or, in freestanding
/// mode, every present page) into the kernel address space.
pub fn load<D: BlockDevice, C: PagingContext>(
    device: &mut D,
    root_block: u64,
    freestanding: bool,
    ctx: &mut C,
    frames: &mut FrameTable,
    arena: &mut dyn FrameAllocator,
) -> LoadResult {
    let mut cache = BlockCache::new(device, 64);

    let mut page_count = 0u64;
    let root_phys = materialize(&mut cache, root_block, 0, freestanding, &mut page_count, ctx, arena);
    let root_virt = pmap_address(root_phys);

    let mut loaded = 0u64;
    let mut chunks = ChunkAllocator::new();
    load_leaves(
        &mut cache,
        root_virt,
        0,
        0,
        freestanding,
        ctx,
        frames,
        arena,
        &mut chunks,
        page_count,
        &mut loaded,
    );

    LoadResult {
        pages_loaded: loaded,
        block_map_root_virt: root_virt,
    }
}

/// Pass 1: copies `block_id` (and everything below it) into kernel-visible
/// memory, rewriting intermediate child pointers from disk-block ids to
/// their physical frame address, and counts the leaves that pass 2 will
/// load. `load_leaves` re-derives the pmap alias from that physical address
/// rather than storing the alias itself, which would not fit in the 56 bits
/// a block-map entry has for an id. Leaf entries keep their original
/// disk-block id, since pass 2 still needs it to read page contents.
fn materialize<D: BlockDevice, C: PagingContext>(
    cache: &mut BlockCache<D>,
    block_id: u64,
    level: usize,
    freestanding: bool,
    counter: &mut u64,
    ctx: &mut C,
    arena: &mut dyn FrameAllocator,
) -> u64 {
    let data = cache.load(block_id);
    let phys = arena.allocate(1).expect("out of memory materializing block map");

    let mut new_data = [0u64; ENTRIES_PER_BLOCK];
    for i in 0..ENTRIES_PER_BLOCK {
        let entry = BlockMapEntry::from_raw(data[i]);
        if !entry.is_present() {
            continue;
        }

        if level == 3 {
            let wanted = freestanding || entry.flags().contains(BlockMapFlags::WIRED);
            if wanted && !entry.flags().contains(BlockMapFlags::TRANSIENT) {
                *counter += 1;
            }
            new_data[i] = entry.raw();
        } else {
            let child_phys = materialize(cache, entry.block_id(), level + 1, freestanding, counter, ctx, arena);
            // The packed entry only has 56 bits for the id, too narrow for a
            // pmap-aliased virtual address; store the physical address and
            // let `load_leaves` re-derive the alias when it recurses.
            new_data[i] = entry.with_block_id(child_phys).raw();
        }
    }

    let mut raw = [0u8; BLOCK_SIZE];
    for (i, v) in new_data.iter().enumerate() {
        raw[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
    }

    let virt = pmap_address(phys);
    if !ctx.is_mapped(virt) {
        ctx.map(virt, phys, PAGE_SIZE, true, false, arena);
    }
    ctx.memcpy_to(virt, &raw);
    phys
}

/// Pass 2: walks the materialized tree (now readable directly through
/// `ctx` at its physical-map alias) and loads every selected leaf.
#[allow(clippy::too_many_arguments)]
fn load_leaves<D: BlockDevice, C: PagingContext>(
    cache: &mut BlockCache<D>,
    block_virt: u64,
    level: usize,
    virt_prefix: u64,
    freestanding: bool,
    ctx: &mut C,
    frames: &mut FrameTable,
    arena: &mut dyn FrameAllocator,
    chunks: &mut ChunkAllocator,
    page_count: u64,
    loaded: &mut u64,
) {
    let mut raw = [0u8; BLOCK_SIZE];
    if !ctx.memcpy_from(&mut raw, block_virt) {
        return;
    }

    for i in 0..ENTRIES_PER_BLOCK {
        let raw_entry = u64::from_le_bytes(raw[i * 8..i * 8 + 8].try_into().unwrap());
        let entry = BlockMapEntry::from_raw(raw_entry);
        if !entry.is_present() {
            continue;
        }

        let shift = 39 - 9 * level as u32;
        let virt = virt_prefix | ((i as u64) << shift);

        if level < 3 {
            load_leaves(
                cache,
                pmap_address(entry.block_id()),
                level + 1,
                virt,
                freestanding,
                ctx,
                frames,
                arena,
                chunks,
                page_count,
                loaded,
            );
            continue;
        }

        let wanted = freestanding || entry.flags().contains(BlockMapFlags::WIRED);
        if !wanted || entry.flags().contains(BlockMapFlags::TRANSIENT) {
            continue;
        }

        let phys = match chunks.next_frame(arena, page_count.saturating_sub(*loaded)) {
            Some(p) => p,
            None => {
                log::error!("out of memory loading wired page at {virt:#x}");
                continue;
            }
        };

        let writable = entry.flags().contains(BlockMapFlags::WRITABLE)
            && !entry.flags().contains(BlockMapFlags::TRACK_DIRTY);
        ctx.map(virt, phys, PAGE_SIZE, writable, true, arena);

        let pmap = pmap_address(phys);
        if !ctx.is_mapped(pmap) {
            ctx.map(pmap, phys, PAGE_SIZE, true, false, arena);
        }
        if entry.flags().contains(BlockMapFlags::ZERO_FILL) {
            ctx.memset(pmap, 0, PAGE_SIZE);
        } else {
            let mut page = [0u8; BLOCK_SIZE];
            cache.read_raw(entry.block_id(), &mut page);
            ctx.memcpy_to(pmap, &page);
        }

        let frame_no = phys / PAGE_SIZE;
        let mut flags = PageFlags::default();
        flags.set_page_type(if freestanding {
            PageType::Active
        } else {
            PageType::Wired
        });
        frames.set(
            frame_no,
            PageInfo {
                flags,
                extra: fixnum::encode(entry.block_id() as i64),
                next: None,
                prev: None,
            },
        );
        *loaded += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBlockDevice, MockFrameAllocator, VecPagingContext};
    use boot_info::fixnum::decode;

    fn build_single_page_image(virt: u64, data_block: u64, flags: BlockMapFlags) -> (MockBlockDevice, u64) {
        let mut device = MockBlockDevice::new();
        let root = device.alloc_block();
        let l3 = device.alloc_block();
        let l2 = device.alloc_block();
        let l1 = device.alloc_block();
        let idx = crate::block_map::indices(virt);
        device.set_entry(root, idx[0], BlockMapEntry::new(l3, BlockMapFlags::PRESENT));
        device.set_entry(l3, idx[1], BlockMapEntry::new(l2, BlockMapFlags::PRESENT));
        device.set_entry(l2, idx[2], BlockMapEntry::new(l1, BlockMapFlags::PRESENT));
        device.set_entry(l1, idx[3], BlockMapEntry::new(data_block, flags));
        (device, root)
    }

    #[test]
    fn loads_a_single_wired_page() {
        let virt = 0xFFFF_8100_0000_1000u64;
        let data_block = 7u64;
        let (mut device, root) = build_single_page_image(
            virt,
            data_block,
            BlockMapFlags::PRESENT | BlockMapFlags::WRITABLE | BlockMapFlags::WIRED,
        );
        device.write_block_bytes(data_block, &[0xAB; BLOCK_SIZE]);

        let mut ctx = VecPagingContext::new();
        let mut frames = crate::page_info::FrameTable::new();
        let mut arena = MockFrameAllocator::new(0x100_0000);

        let result = load(&mut device, root, false, &mut ctx, &mut frames, &mut arena);
        assert_eq!(result.pages_loaded, 1);
        assert!(ctx.is_mapped(virt));

        let mut contents = [0u8; BLOCK_SIZE];
        ctx.memcpy_from(&mut contents, virt);
        assert_eq!(contents, [0xAB; BLOCK_SIZE]);
    }

    #[test]
    fn freestanding_mode_loads_non_wired_present_pages() {
        let virt = 0xFFFF_8100_0000_2000u64;
        let (mut device, root) = build_single_page_image(virt, 9, BlockMapFlags::PRESENT | BlockMapFlags::ZERO_FILL);

        let mut ctx = VecPagingContext::new();
        let mut frames = crate::page_info::FrameTable::new();
        let mut arena = MockFrameAllocator::new(0x100_0000);

        let result = load(&mut device, root, true, &mut ctx, &mut frames, &mut arena);
        assert_eq!(result.pages_loaded, 1);

        let frame = ctx
            .translate(virt)
            .expect("mapped page must translate")
            / PAGE_SIZE;
        let info = frames.get(frame).unwrap();
        assert_eq!(info.flags.page_type(), PageType::Active);
        assert_eq!(decode(info.extra), 9);
    }

    #[test]
    fn normal_mode_skips_non_wired_pages() {
        let virt = 0xFFFF_8100_0000_3000u64;
        let (mut device, root) = build_single_page_image(virt, 5, BlockMapFlags::PRESENT);

        let mut ctx = VecPagingContext::new();
        let mut frames = crate::page_info::FrameTable::new();
        let mut arena = MockFrameAllocator::new(0x100_0000);

        let result = load(&mut device, root, false, &mut ctx, &mut frames, &mut arena);
        assert_eq!(result.pages_loaded, 0);
        assert!(!ctx.is_mapped(virt));
    }
}
