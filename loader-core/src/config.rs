//! The command-line-style configuration surface: parses the invocation's
//! path/UUID locator and flag tokens into a single [`BootRequest`] that is
//! threaded through the rest of the driver, the way the donor centralises
//! its mapping options into one `BootloaderConfig`.

use alloc::string::String;

use boot_info::BootOptions;

use crate::error::{ConfigErrorKind, LoaderError};

/// Where to find the image: a literal path, or a UUID to search
/// enumerated devices for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLocator {
    Path(String),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone)]
pub struct BootRequest {
    pub locator: ImageLocator,
    pub options: BootOptions,
    pub skip_memory_check: bool,
    pub verbose: bool,
}

impl Default for BootRequest {
    fn default() -> Self {
        BootRequest {
            locator: ImageLocator::Path(String::new()),
            options: BootOptions::empty(),
            skip_memory_check: false,
            verbose: false,
        }
    }
}

/// Parses the whitespace-separated command tokens described in §4.10/§6:
/// the first token is the path or `uuid:<uuid>` locator, the rest are flag
/// tokens.
pub fn parse(tokens: &[&str]) -> Result<BootRequest, LoaderError> {
    let (first, rest) = tokens
        .split_first()
        .ok_or(LoaderError::Config(ConfigErrorKind::BadPath))?;

    let locator = match first.strip_prefix("uuid:") {
        Some(hex) => ImageLocator::Uuid(parse_uuid(hex)?),
        None => ImageLocator::Path(String::from(*first)),
    };

    let mut request = BootRequest {
        locator,
        ..BootRequest::default()
    };

    for token in rest {
        match *token {
            "read-only" => request.options |= BootOptions::FORCE_READ_ONLY,
            "freestanding" => request.options |= BootOptions::FREESTANDING,
            "video-console" => request.options |= BootOptions::VIDEO_CONSOLE,
            "no-detect" => request.options |= BootOptions::NO_DETECT,
            "no-smp" => request.options |= BootOptions::NO_SMP,
            "i-promise-i-have-enough-memory" => request.skip_memory_check = true,
            "verbose" => request.verbose = true,
            _ => return Err(LoaderError::Config(ConfigErrorKind::UnknownFlag)),
        }
    }

    Ok(request)
}

fn parse_uuid(hex: &str) -> Result<[u8; 16], LoaderError> {
    if hex.len() != 32 {
        return Err(LoaderError::Config(ConfigErrorKind::BadPath));
    }
    let mut uuid = [0u8; 16];
    for (i, slot) in uuid.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| LoaderError::Config(ConfigErrorKind::BadPath))?;
    }
    Ok(uuid)
}
