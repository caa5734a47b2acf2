//! Error handling: configuration/IO errors are recoverable, internal
//! invariant violations are not.

use core::fmt;

/// Errors that can be reported back to the caller of the loader command
/// without having committed any loader resources yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    BadPath,
    UnknownFlag,
    NoMatchingDevice,
    BadMagic,
    UnsupportedProtocol,
    InsufficientMemory,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConfigErrorKind::BadPath => "could not resolve image path",
            ConfigErrorKind::UnknownFlag => "unrecognised flag",
            ConfigErrorKind::NoMatchingDevice => "no device with matching uuid",
            ConfigErrorKind::BadMagic => "image header magic mismatch",
            ConfigErrorKind::UnsupportedProtocol => "image protocol version not supported",
            ConfigErrorKind::InsufficientMemory => "not enough ram to boot this image",
        };
        f.write_str(msg)
    }
}

/// Errors recoverable at the configuration stage, before any paging
/// context has been built or allocator pool consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    Config(ConfigErrorKind),
    Io(&'static str),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::Config(kind) => write!(f, "{kind}"),
            LoaderError::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl From<ConfigErrorKind> for LoaderError {
    fn from(kind: ConfigErrorKind) -> Self {
        LoaderError::Config(kind)
    }
}

/// Reports a recoverable error to the shell. Does not halt; the caller is
/// expected to return `false`/`Err` from the command.
pub fn config_error(err: LoaderError) {
    log::warn!("mezzano: {err}");
}

/// Reports an internal invariant violation and halts. Used once the loader
/// has started consuming allocator resources and partial paging state,
/// past which there is no safe way to unwind.
#[cold]
pub fn boot_error(args: fmt::Arguments<'_>) -> ! {
    log::error!("mezzano: fatal: {args}");
    halt()
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn halt() -> ! {
    loop {
        unsafe { core::arch::asm!("cli", "hlt") };
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
fn halt() -> ! {
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}

#[cfg(test)]
fn halt() -> ! {
    panic!("boot_error")
}

/// Convenience macro mirroring `panic!`'s call syntax for `boot_error`.
#[macro_export]
macro_rules! boot_error {
    ($($arg:tt)*) => {
        $crate::error::boot_error(format_args!($($arg)*))
    };
}
