//! Assembles the bit-exact boot-information page handed to the kernel,
//! per the protocol's fixed field offsets.

use alloc::vec::Vec;

use boot_info::fixnum;
use boot_info::info::{BootInfo, BuddyBinDescriptor, MemoryMapEntry as InfoMemoryMapEntry, VideoDescriptor};
use boot_info::BootOptions;

use crate::buddy::BuddyAllocator;
use crate::memory_map::MemoryMap;
use crate::platform::VideoMode;

#[allow(clippy::too_many_arguments)]
pub fn build(
    uuid: [u8; 16],
    nil: u64,
    buddy: &BuddyAllocator,
    video: Option<VideoMode>,
    acpi_rsdp: Option<u64>,
    efi_system_table: Option<u64>,
    fdt_address: Option<u64>,
    boot_options: BootOptions,
    memory_map: &MemoryMap,
    block_map_address: u64,
) -> BootInfo {
    let mut info = BootInfo::zeroed();
    info.uuid = uuid;

    let encode_first_page = |first_page: Option<u64>| match first_page {
        Some(page) => fixnum::encode(page as i64),
        None => nil,
    };
    for (slot, bin) in info.buddy_bin_32.iter_mut().zip(buddy.bin32.iter()) {
        *slot = BuddyBinDescriptor {
            first_page: encode_first_page(bin.first_page),
            count: fixnum::encode(bin.count as i64),
        };
    }
    for (slot, bin) in info.buddy_bin_64.iter_mut().zip(buddy.bin64.iter()) {
        *slot = BuddyBinDescriptor {
            first_page: encode_first_page(bin.first_page),
            count: fixnum::encode(bin.count as i64),
        };
    }

    if let Some(mode) = video {
        info.video = VideoDescriptor {
            framebuffer_address: fixnum::encode(mode.framebuffer_address as i64),
            width: fixnum::encode(mode.width as i64),
            pitch: fixnum::encode(mode.pitch as i64),
            height: fixnum::encode(mode.height as i64),
            layout_id: fixnum::encode(mode.layout_id as i64),
        };
    }

    info.acpi_rsdp = acpi_rsdp.unwrap_or(0);
    info.efi_system_table = efi_system_table.unwrap_or(0);
    info.fdt_address = fdt_address.unwrap_or(0);
    info.boot_options = fixnum::encode(boot_options.bits() as i64);

    let entries: Vec<InfoMemoryMapEntry> = memory_map
        .entries()
        .iter()
        .map(|r| InfoMemoryMapEntry {
            start: r.start,
            end: r.end,
        })
        .collect();
    info.set_memory_map(&entries);

    info.block_map_address = block_map_address;
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_info::fixnum::decode;

    #[test]
    fn uuid_and_memory_map_round_trip() {
        let mut buddy = BuddyAllocator::new();
        buddy.bin32[3].first_page = Some(0x1000);
        buddy.bin32[3].count = 2;

        let mut memory_map = MemoryMap::new();
        memory_map.insert(0, 0x1000);
        memory_map.insert(0x2000, 0x3000);

        let uuid = [7u8; 16];
        let info = build(
            uuid,
            0xDEAD_BEEF,
            &buddy,
            None,
            None,
            None,
            None,
            BootOptions::FREESTANDING,
            &memory_map,
            0xFFFF_8080_0000_0000,
        );

        assert_eq!(info.uuid, uuid);
        assert_eq!(decode(info.buddy_bin_32[3].first_page), 0x1000);
        assert_eq!(decode(info.buddy_bin_32[3].count), 2);
        assert_eq!(decode(info.n_memory_map_entries), 2);
        assert_eq!(info.memory_map[0].start, 0);
        assert_eq!(info.memory_map[1].end, 0x3000);
        assert_eq!(decode(info.boot_options), BootOptions::FREESTANDING.bits() as i64);
        assert_eq!(info.acpi_rsdp, 0);
    }

    #[test]
    fn absent_platform_pointers_default_to_zero() {
        let buddy = BuddyAllocator::new();
        let memory_map = MemoryMap::new();
        let info = build(
            [0u8; 16],
            0xDEAD_BEEF,
            &buddy,
            None,
            Some(0xE000),
            None,
            Some(0x4000_0000),
            BootOptions::empty(),
            &memory_map,
            0,
        );
        assert_eq!(info.acpi_rsdp, 0xE000);
        assert_eq!(info.efi_system_table, 0);
        assert_eq!(info.fdt_address, 0x4000_0000);
    }

    #[test]
    fn empty_bins_carry_the_header_nil_sentinel_not_fixnum_zero() {
        let buddy = BuddyAllocator::new();
        let memory_map = MemoryMap::new();
        let nil = 0xDEAD_BEEF;
        let info = build(
            [0u8; 16],
            nil,
            &buddy,
            None,
            None,
            None,
            None,
            BootOptions::empty(),
            &memory_map,
            0,
        );
        assert_eq!(info.buddy_bin_32[0].first_page, nil);
        assert_eq!(info.buddy_bin_64[0].first_page, nil);
        assert_ne!(info.buddy_bin_32[0].first_page, fixnum::encode(0));
    }
}
