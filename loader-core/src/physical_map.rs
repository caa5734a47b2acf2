//! Maps all reported RAM into the kernel's physical-map window and builds
//! the canonical memory map alongside it.

use crate::memory_map::MemoryMap;
use crate::paging::{align_down, align_up, PagingContext, PAGE_SIZE};
use crate::platform::{FirmwareMemoryMap, FrameAllocator};

/// Kernel-virtual base of the straight physical-memory mirror.
pub const PMAP_BASE: u64 = 0xFFFF_8000_0000_0000;
/// Only the first 512 GiB of physical memory is mirrored; anything past
/// this is discarded with a warning.
pub const PMAP_LIMIT: u64 = 512 * 1024 * 1024 * 1024;

pub struct PhysicalMap {
    pub memory_map: MemoryMap,
}

impl PhysicalMap {
    /// Walks every firmware descriptor, clips it to the physical-map
    /// window, maps it at `PMAP_BASE + start`, and folds it into the
    /// canonical memory map.
    pub fn build<F, C>(firmware: &F, ctx: &mut C, arena: &mut dyn FrameAllocator) -> Self
    where
        F: FirmwareMemoryMap,
        C: PagingContext,
    {
        let mut memory_map = MemoryMap::new();

        for region in firmware.regions() {
            let start = align_down(region.start, PAGE_SIZE);
            let end = align_up(region.end, PAGE_SIZE);
            if end <= start {
                continue;
            }

            let clipped_start = start.min(PMAP_LIMIT);
            let clipped_end = end.min(PMAP_LIMIT);
            if clipped_end <= clipped_start {
                log::warn!(
                    "discarding region {:#x}..{:#x}, entirely above the {} GiB physical-map limit",
                    region.start,
                    region.end,
                    PMAP_LIMIT / (1024 * 1024 * 1024),
                );
                continue;
            }
            if clipped_end < end {
                log::warn!(
                    "clipping region {:#x}..{:#x} to the physical-map limit",
                    region.start,
                    region.end,
                );
            }

            let ok = ctx.map(
                PMAP_BASE + clipped_start,
                clipped_start,
                clipped_end - clipped_start,
                true,
                false,
                arena,
            );
            if !ok {
                log::warn!(
                    "failed to map physical-map window for {:#x}..{:#x}",
                    clipped_start,
                    clipped_end
                );
                continue;
            }

            memory_map.insert(clipped_start, clipped_end);
        }

        PhysicalMap { memory_map }
    }
}

/// Translates a physical address into its physical-map window alias.
/// Callers are responsible for ensuring `phys < PMAP_LIMIT`.
pub fn pmap_address(phys: u64) -> u64 {
    PMAP_BASE + phys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFirmwareMap, MockFrameAllocator, VecPagingContext};
    use crate::platform::{FirmwareRegion, FirmwareRegionKind};

    #[test]
    fn clips_regions_above_512_gib() {
        let firmware = MockFirmwareMap::new(vec![FirmwareRegion {
            start: 0,
            end: 0x100_0000_0000, // 1 TiB
            kind: FirmwareRegionKind::Free,
        }]);
        let mut ctx = VecPagingContext::new();
        let mut arena = MockFrameAllocator::new(0x1_0000_0000);
        let map = PhysicalMap::build(&firmware, &mut ctx, &mut arena);
        assert_eq!(map.memory_map.len(), 1);
        assert_eq!(map.memory_map.entries()[0].end, PMAP_LIMIT);
    }

    #[test]
    fn maps_pmap_window_for_every_region() {
        let firmware = MockFirmwareMap::new(vec![FirmwareRegion {
            start: 0,
            end: 0x10_0000,
            kind: FirmwareRegionKind::Free,
        }]);
        let mut ctx = VecPagingContext::new();
        let mut arena = MockFrameAllocator::new(0x1000_0000);
        let _map = PhysicalMap::build(&firmware, &mut ctx, &mut arena);
        assert!(ctx.is_mapped(PMAP_BASE));
        assert!(ctx.is_mapped(PMAP_BASE + 0xf_f000));
    }
}
