//! The loader driver: parses the invocation, validates the on-disk header,
//! and runs the full load sequence through to the architecture trampoline.

use boot_info::header::{HeaderError, ImageHeader, HEADER_LEN};
use boot_info::BootOptions;

use crate::block_map::BlockDevice;
use crate::buddy::{self, BuddyAllocator};
use crate::config::{BootRequest, ImageLocator};
use crate::error::{config_error, ConfigErrorKind, LoaderError};
use crate::page_info;
use crate::paging::PagingContext;
use crate::physical_map::{pmap_address, PhysicalMap};
use crate::platform::{ArchTrampoline, FirmwareMemoryMap, FirmwareRegionKind, FrameAllocator, PlatformHooks, VideoModeSelector};
use crate::{boot_info_builder, transition, wired_loader};

/// The protocol line this loader build understands; see
/// [`ImageHeader::protocol_compatible`]. Because the major here is 0, only
/// that function's exact-minor-match branch is ever reachable through this
/// constant — the "nonzero major, older minor still accepted" branch exists
/// for a future protocol bump and is exercised directly against
/// `protocol_compatible` in `boot-info`'s own tests, not through `boot()`.
pub const SUPPORTED_PROTOCOL_MAJOR: u16 = 0;
pub const SUPPORTED_PROTOCOL_MINOR: u16 = 1;

const MIN_RAM_BYTES: u64 = 500 * 1024 * 1024;

/// Logs a stage-1 failure and hands it back unchanged, so callers still get
/// a `Result` to match on.
fn report(err: LoaderError) -> LoaderError {
    config_error(err);
    err
}

/// Resolves an [`ImageLocator`] to an open device and its first 512-byte
/// sector. Implementations wrap the surrounding bootloader's block device
/// and filesystem enumeration.
pub trait DeviceResolver {
    type Device: BlockDevice;

    fn resolve(&mut self, locator: &ImageLocator) -> Result<(Self::Device, [u8; HEADER_LEN]), LoaderError>;
}

/// Runs the full boot sequence for `request`. Returns `Err` only for
/// failures in stage 1 (path resolution, header validation, the memory
/// gate), before any paging state has been committed; every failure past
/// that point is fatal and reported through [`crate::error::boot_error`]
/// instead, which never returns.
#[allow(clippy::too_many_arguments)]
pub fn boot<R, Firmware, Video, Hooks, Ctx, Trampoline>(
    request: &BootRequest,
    resolver: &mut R,
    firmware: &Firmware,
    video: &mut Video,
    hooks: &mut Hooks,
    mut kernel_ctx: Ctx,
    arena: &mut dyn FrameAllocator,
    loader_range: (u64, u64),
    trampoline: &Trampoline,
) -> Result<(), LoaderError>
where
    R: DeviceResolver,
    Firmware: FirmwareMemoryMap,
    Video: VideoModeSelector,
    Hooks: PlatformHooks,
    Ctx: PagingContext + Default,
    Trampoline: ArchTrampoline<Ctx>,
{
    let (mut device, sector) = resolver.resolve(&request.locator).map_err(report)?;

    let header = ImageHeader::parse(&sector)
        .map_err(|e| match e {
            HeaderError::TooShort | HeaderError::BadMagic => LoaderError::Config(ConfigErrorKind::BadMagic),
        })
        .map_err(report)?;

    if !header.protocol_compatible(SUPPORTED_PROTOCOL_MAJOR, SUPPORTED_PROTOCOL_MINOR) {
        return Err(report(LoaderError::Config(ConfigErrorKind::UnsupportedProtocol)));
    }

    if !request.skip_memory_check {
        let total_ram: u64 = firmware
            .regions()
            .filter(|r| r.kind == FirmwareRegionKind::Free)
            .map(|r| r.end - r.start)
            .sum();
        if total_ram < MIN_RAM_BYTES {
            return Err(report(LoaderError::Config(ConfigErrorKind::InsufficientMemory)));
        }
    }

    log::info!("mezzano: booting image {:x?}, protocol {}.{}", header.uuid, header.protocol_major, header.protocol_minor);

    // From here on resources are committed: any further failure is fatal.
    let physical_map = PhysicalMap::build(firmware, &mut kernel_ctx, arena);
    let mut frame_table = page_info::build(&physical_map.memory_map, &mut kernel_ctx, arena);
    page_info::tag_new_table_frames(&mut kernel_ctx, &mut frame_table);

    let freestanding = request.options.contains(BootOptions::FREESTANDING);
    let load_result = wired_loader::load(&mut device, header.bml4, freestanding, &mut kernel_ctx, &mut frame_table, arena);
    page_info::tag_new_table_frames(&mut kernel_ctx, &mut frame_table);
    log::info!("mezzano: loaded {} pages", load_result.pages_loaded);

    let mut transition_ctx = transition::build(loader_range.0, loader_range.1, &mut kernel_ctx, arena);
    page_info::tag_new_table_frames(&mut kernel_ctx, &mut frame_table);
    page_info::tag_new_table_frames(&mut transition_ctx, &mut frame_table);

    let mut buddy = BuddyAllocator::new();
    buddy::seed(&mut buddy, firmware, &mut frame_table);
    page_info::write_back(&frame_table, &mut kernel_ctx);

    let video_mode = if request.options.contains(BootOptions::VIDEO_CONSOLE) {
        video.select()
    } else {
        None
    };

    let boot_info = boot_info_builder::build(
        header.uuid,
        header.nil,
        &buddy,
        video_mode,
        hooks.acpi_rsdp(),
        hooks.efi_system_table(),
        hooks.fdt_address(),
        request.options,
        &physical_map.memory_map,
        load_result.block_map_root_virt,
    );

    let boot_info_phys = arena
        .allocate(1)
        .unwrap_or_else(|| crate::boot_error!("out of memory allocating the boot-info page"));
    let boot_info_virt = pmap_address(boot_info_phys);
    if !kernel_ctx.is_mapped(boot_info_virt) {
        kernel_ctx.map(boot_info_virt, boot_info_phys, crate::paging::PAGE_SIZE, true, false, arena);
    }
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &boot_info as *const _ as *const u8,
            core::mem::size_of_val(&boot_info),
        )
    };
    kernel_ctx.memcpy_to(boot_info_virt, bytes);

    hooks.finalize();

    let boot_info_fixnum = boot_info::fixnum::encode(boot_info_virt as i64);
    trampoline.enter(
        transition_ctx,
        kernel_ctx,
        header.entry_fref,
        header.initial_process,
        boot_info_fixnum,
        header.nil,
        header.initial_stack_pointer,
    );
}
