//! Architecture-specific paging, serial console, and entry-trampoline
//! implementations, selected at compile time. Everything above this module
//! only ever touches the platform-service traits in [`crate::platform`], so
//! these are the only places in the crate that know the real calling
//! convention or page-table format.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
