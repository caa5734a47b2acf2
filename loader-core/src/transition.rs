//! Builds the auxiliary paging context that bridges identity-mapped loader
//! code into the kernel's physical-map window long enough to perform the
//! final context switch.
//!
//! The final kernel context does not identity-map the loader, so the
//! instruction immediately after loading it would fault. The transition
//! context fixes this: it identity-maps the loader and also maps it at its
//! physical-map alias, and the kernel context gains the same alias, so a
//! trampoline running from the aliased address survives the switch.

use crate::paging::{align_down, align_up, PagingContext, PAGE_SIZE};
use crate::physical_map::pmap_address;
use crate::platform::FrameAllocator;

/// Builds the transition context for the loader's `[loader_start,
/// loader_end)` text+data range and extends `kernel_ctx` with the matching
/// physical-map alias.
pub fn build<C: PagingContext + Default>(
    loader_start: u64,
    loader_end: u64,
    kernel_ctx: &mut C,
    arena: &mut dyn FrameAllocator,
) -> C {
    let start = align_down(loader_start, PAGE_SIZE);
    let end = align_up(loader_end, PAGE_SIZE);
    let size = end - start;

    let mut transition_ctx = C::default();
    transition_ctx.map(start, start, size, true, true, arena);
    transition_ctx.map(pmap_address(start), start, size, true, true, arena);
    kernel_ctx.map(pmap_address(start), start, size, true, true, arena);

    transition_ctx
}
