//! The on-disk 4-level block-map radix trie and its LRU read-through cache.

use alloc::collections::VecDeque;
use core::convert::TryInto;

use boot_info::BlockMapEntry;

pub const BLOCK_SIZE: usize = 4096;
pub const ENTRIES_PER_BLOCK: usize = 512;

/// The injected block/file I/O collaborator. Implementations wrap
/// `device_read`/`fs_read`.
pub trait BlockDevice {
    fn read_block(&mut self, id: u64, buf: &mut [u8; BLOCK_SIZE]) -> bool;
}

type BlockContents = [u64; ENTRIES_PER_BLOCK];

struct CachedBlock {
    id: u64,
    data: BlockContents,
}

fn decode_block(raw: &[u8; BLOCK_SIZE]) -> BlockContents {
    let mut data = [0u64; ENTRIES_PER_BLOCK];
    for (i, slot) in data.iter_mut().enumerate() {
        *slot = u64::from_le_bytes(raw[i * 8..i * 8 + 8].try_into().unwrap());
    }
    data
}

/// An LRU cache of recently read indirect/data blocks, fronting a
/// [`BlockDevice`]. The reference loader never evicts because the image's
/// indirect blocks are bounded; this cache caps its size and evicts the
/// least-recently-used block on overflow instead, which is safe as long as
/// a single traversal doesn't exceed the cap (four levels, so a capacity
/// of a few dozen blocks comfortably covers any in-flight walk).
pub struct BlockCache<'d, D: BlockDevice> {
    device: &'d mut D,
    capacity: usize,
    entries: VecDeque<CachedBlock>,
}

impl<'d, D: BlockDevice> BlockCache<'d, D> {
    pub fn new(device: &'d mut D, capacity: usize) -> Self {
        assert!(capacity > 0);
        BlockCache {
            device,
            capacity,
            entries: VecDeque::new(),
        }
    }

    /// Reads block `id`, splicing it to the front of the LRU list.
    pub fn load(&mut self, id: u64) -> BlockContents {
        if let Some(pos) = self.entries.iter().position(|b| b.id == id) {
            let block = self.entries.remove(pos).unwrap();
            let data = block.data;
            self.entries.push_front(block);
            return data;
        }

        let mut raw = [0u8; BLOCK_SIZE];
        self.device.read_block(id, &mut raw);
        let data = decode_block(&raw);

        if self.entries.len() >= self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(CachedBlock { id, data });
        data
    }

    /// Reads block `id`'s raw bytes straight from the device, bypassing the
    /// decoded-index cache: used for leaf data blocks, which hold page
    /// contents rather than another level of block-map entries.
    pub fn read_raw(&mut self, id: u64, buf: &mut [u8; BLOCK_SIZE]) -> bool {
        self.device.read_block(id, buf)
    }
}

/// Splits a 48-bit virtual address into its four 9-bit block-map indices,
/// most significant first.
pub fn indices(virt: u64) -> [usize; 4] {
    [
        ((virt >> 39) & 0x1ff) as usize,
        ((virt >> 30) & 0x1ff) as usize,
        ((virt >> 21) & 0x1ff) as usize,
        ((virt >> 12) & 0x1ff) as usize,
    ]
}

/// Resolves `virt` to its level-1 block-map entry, or `BlockMapEntry::EMPTY`
/// if any ancestor along the walk is not present.
pub fn resolve<D: BlockDevice>(
    cache: &mut BlockCache<D>,
    root_block: u64,
    virt: u64,
) -> BlockMapEntry {
    let idx = indices(virt);
    let mut block_id = root_block;

    for (level, &i) in idx.iter().enumerate() {
        let block = cache.load(block_id);
        let entry = BlockMapEntry::from_raw(block[i]);
        if !entry.is_present() {
            return BlockMapEntry::EMPTY;
        }
        if level == 3 {
            return entry;
        }
        block_id = entry.block_id();
    }

    unreachable!("indices always has exactly 4 elements")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBlockDevice;
    use boot_info::BlockMapFlags;

    #[test]
    fn resolves_a_single_present_leaf() {
        let mut device = MockBlockDevice::new();
        let root = device.alloc_block();
        let l3 = device.alloc_block();
        let l2 = device.alloc_block();
        let l1 = device.alloc_block();

        let virt: u64 = 0xDEAD_BEEF_0000;
        let idx = indices(virt);
        device.set_entry(root, idx[0], BlockMapEntry::new(l3, BlockMapFlags::PRESENT));
        device.set_entry(l3, idx[1], BlockMapEntry::new(l2, BlockMapFlags::PRESENT));
        device.set_entry(l2, idx[2], BlockMapEntry::new(l1, BlockMapFlags::PRESENT));
        device.set_entry(
            l1,
            idx[3],
            BlockMapEntry::new(42, BlockMapFlags::PRESENT | BlockMapFlags::WIRED),
        );

        let mut cache = BlockCache::new(&mut device, 16);
        let entry = resolve(&mut cache, root, virt);
        assert!(entry.is_present());
        assert_eq!(entry.block_id(), 42);

        // Any other address resolves to empty: the root's other 511
        // entries were never populated.
        let other = resolve(&mut cache, root, virt + (1 << 21));
        assert!(!other.is_present());
    }

    #[test]
    fn cache_evicts_lru_block_beyond_capacity() {
        let mut device = MockBlockDevice::new();
        let blocks: alloc::vec::Vec<u64> = (0..4).map(|_| device.alloc_block()).collect();
        let mut cache = BlockCache::new(&mut device, 2);
        cache.load(blocks[0]);
        cache.load(blocks[1]);
        cache.load(blocks[2]); // evicts blocks[0]
        assert_eq!(cache.entries.len(), 2);
        assert!(cache.entries.iter().all(|b| b.id != blocks[0]));
    }
}
