//! The two-bin buddy allocator the kernel inherits at boot: `bin32` for
//! physical memory below 4 GiB, `bin64` for the remainder.

use crate::page_info::{FrameTable, PageType};
use crate::paging::PAGE_SIZE;

/// Orders 12..31, i.e. page sizes 4 KiB .. 2 GiB.
pub const BIN32_COUNT: usize = 20;
/// Orders 12..38, i.e. page sizes 4 KiB .. 128 GiB.
pub const BIN64_COUNT: usize = 27;
pub const FOUR_GIB: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bin {
    pub first_page: Option<u64>,
    pub count: u64,
}

#[derive(Debug)]
pub struct BuddyAllocator {
    pub bin32: [Bin; BIN32_COUNT],
    pub bin64: [Bin; BIN64_COUNT],
}

impl BuddyAllocator {
    pub fn new() -> Self {
        BuddyAllocator {
            bin32: [Bin::default(); BIN32_COUNT],
            bin64: [Bin::default(); BIN64_COUNT],
        }
    }

    /// Releases the 4 KiB frame at physical address `phys` into the
    /// allocator, iteratively coalescing with its buddy for as long as the
    /// buddy is itself a free frame of the matching order.
    pub fn free(&mut self, phys: u64, frames: &mut FrameTable) {
        let use_bin32 = phys < FOUR_GIB;
        let max_bin = if use_bin32 { BIN32_COUNT } else { BIN64_COUNT };
        let m = max_bin - 1;

        let mut l = phys;
        let mut k = 0usize;

        loop {
            if k == m {
                break;
            }
            let buddy = l ^ (1u64 << (k + 12));
            let buddy_frame = buddy / PAGE_SIZE;
            let buddy_is_free_at_k = frames
                .get(buddy_frame)
                .map(|info| {
                    info.flags.page_type() == PageType::Free && info.flags.bin() as usize == k
                })
                .unwrap_or(false);
            if !buddy_is_free_at_k {
                break;
            }

            let bins = if use_bin32 {
                self.bin32.as_mut_slice()
            } else {
                self.bin64.as_mut_slice()
            };
            unlink(bins, frames, buddy_frame, k);
            l = l.min(buddy);
            k += 1;
        }

        let bins = if use_bin32 {
            self.bin32.as_mut_slice()
        } else {
            self.bin64.as_mut_slice()
        };
        push_front(bins, frames, l / PAGE_SIZE, k);
    }
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical memory below this line is never handed to the buddy allocator,
/// even if firmware reports it free: the first megabyte holds real-mode
/// reset vectors and legacy BIOS structures other boot-stage code still
/// expects to find undisturbed.
const LOW_MEMORY_FLOOR: u64 = 0x10_0000;

/// Releases every `Free` or `LoaderOwned` firmware region into `allocator`,
/// skipping frames the loader has already put to a committed use (a wired
/// kernel page, a page-table frame, ...), frames below [`LOW_MEMORY_FLOOR`],
/// or frames that fall outside the frame table's coverage. Matches the
/// concurrency model's "scratch frames are reclaimed as a batch" hand-off
/// step.
///
/// Firmware-reported `PageTables` regions are classified first so that a
/// region the loader didn't allocate itself (inherited from an earlier boot
/// stage) is never swept into the free pool either.
pub fn seed<F: crate::platform::FirmwareMemoryMap>(
    allocator: &mut BuddyAllocator,
    firmware: &F,
    frames: &mut FrameTable,
) {
    use crate::paging::{align_down, align_up, PAGE_SIZE};
    use crate::platform::FirmwareRegionKind;

    for region in firmware.regions() {
        if region.kind != FirmwareRegionKind::PageTables {
            continue;
        }
        let start = align_down(region.start, PAGE_SIZE);
        let end = align_up(region.end, PAGE_SIZE);
        let mut phys = start;
        while phys < end {
            let frame = phys / PAGE_SIZE;
            if let Some(info) = frames.get_mut(frame) {
                info.flags.set_page_type(PageType::PageTable);
            }
            phys += PAGE_SIZE;
        }
    }

    for region in firmware.regions() {
        if !matches!(region.kind, FirmwareRegionKind::Free | FirmwareRegionKind::LoaderOwned) {
            continue;
        }
        let start = align_up(region.start, PAGE_SIZE);
        let end = align_down(region.end, PAGE_SIZE);
        let mut phys = start.max(LOW_MEMORY_FLOOR);
        while phys < end {
            let frame = phys / PAGE_SIZE;
            let free_to_use = frames
                .get(frame)
                .map(|info| info.flags.page_type() == PageType::Free)
                .unwrap_or(false);
            if free_to_use {
                allocator.free(phys, frames);
            }
            phys += PAGE_SIZE;
        }
    }
}

fn unlink(bins: &mut [Bin], frames: &mut FrameTable, frame: u64, bin_index: usize) {
    let (next, prev) = {
        let info = frames.get(frame).expect("buddy frame must have page-info");
        (info.next, info.prev)
    };
    match prev {
        Some(p) => {
            if let Some(info) = frames.get_mut(p) {
                info.next = next;
            }
        }
        None => bins[bin_index].first_page = next,
    }
    if let Some(n) = next {
        if let Some(info) = frames.get_mut(n) {
            info.prev = prev;
        }
    }
    bins[bin_index].count -= 1;
}

fn push_front(bins: &mut [Bin], frames: &mut FrameTable, frame: u64, bin_index: usize) {
    let old_head = bins[bin_index].first_page;
    if let Some(head) = old_head {
        if let Some(info) = frames.get_mut(head) {
            info.prev = Some(frame);
        }
    }
    let info = frames.get_mut(frame).expect("freed frame must have page-info");
    info.flags.set_page_type(PageType::Free);
    info.flags.set_bin(bin_index as u8);
    info.next = old_head;
    info.prev = None;
    bins[bin_index].first_page = Some(frame);
    bins[bin_index].count += 1;
}
