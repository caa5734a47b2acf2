//! The on-disk image header: the first sector of a Mezzano image.

use core::convert::TryInto;

/// Magic bytes identifying a Mezzano image.
pub const MAGIC: [u8; 16] = *b"\0MezzanineImage\0";

/// Size of the header sector read off the device before anything else.
pub const HEADER_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Arm64,
    Unknown(u8),
}

impl Architecture {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Architecture::X86_64,
            2 => Architecture::Arm64,
            other => Architecture::Unknown(other),
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            Architecture::X86_64 => 1,
            Architecture::Arm64 => 2,
            Architecture::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    TooShort,
    BadMagic,
}

/// The parsed fields of a Mezzano image header.
///
/// Offsets into the raw sector: magic[16]@0, uuid[16]@16, protocol_major
/// u16@32, protocol_minor u16@34, entry_fref u64@40, initial_process
/// u64@48, nil u64@56, architecture u8@64, initial_stack_pointer u64@72,
/// bml4 u64@96, freelist_head u64@104.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub uuid: [u8; 16],
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub entry_fref: u64,
    pub initial_process: u64,
    pub nil: u64,
    pub architecture: Architecture,
    pub initial_stack_pointer: u64,
    pub bml4: u64,
    pub freelist_head: u64,
}

impl ImageHeader {
    pub fn parse(sector: &[u8]) -> Result<Self, HeaderError> {
        if sector.len() < HEADER_LEN {
            return Err(HeaderError::TooShort);
        }
        if sector[0..16] != MAGIC {
            return Err(HeaderError::BadMagic);
        }

        let u16_at = |off: usize| u16::from_le_bytes(sector[off..off + 2].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(sector[off..off + 8].try_into().unwrap());

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&sector[16..32]);

        Ok(ImageHeader {
            uuid,
            protocol_major: u16_at(32),
            protocol_minor: u16_at(34),
            entry_fref: u64_at(40),
            initial_process: u64_at(48),
            nil: u64_at(56),
            architecture: Architecture::from_raw(sector[64]),
            initial_stack_pointer: u64_at(72),
            bml4: u64_at(96),
            freelist_head: u64_at(104),
        })
    }

    /// The protocol version gate: major 0 is the unstable line and requires
    /// an exact minor match; any other major must match the loader's
    /// supported major and may be at or below the loader's supported minor.
    pub fn protocol_compatible(&self, supported_major: u16, supported_minor: u16) -> bool {
        if self.protocol_major != supported_major {
            return false;
        }
        if self.protocol_major == 0 {
            self.protocol_minor == supported_minor
        } else {
            self.protocol_minor <= supported_minor
        }
    }

    #[cfg(test)]
    pub(crate) fn random() -> Self {
        let mut uuid = [0u8; 16];
        for b in uuid.iter_mut() {
            *b = rand::random();
        }
        ImageHeader {
            uuid,
            protocol_major: rand::random(),
            protocol_minor: rand::random(),
            entry_fref: rand::random(),
            initial_process: rand::random(),
            nil: rand::random(),
            architecture: Architecture::from_raw(rand::random::<u8>() % 3 + 1),
            initial_stack_pointer: rand::random(),
            bml4: rand::random(),
            freelist_head: rand::random(),
        }
    }

    #[cfg(test)]
    pub(crate) fn write_to(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0..16].copy_from_slice(&MAGIC);
        buf[16..32].copy_from_slice(&self.uuid);
        buf[32..34].copy_from_slice(&self.protocol_major.to_le_bytes());
        buf[34..36].copy_from_slice(&self.protocol_minor.to_le_bytes());
        buf[40..48].copy_from_slice(&self.entry_fref.to_le_bytes());
        buf[48..56].copy_from_slice(&self.initial_process.to_le_bytes());
        buf[56..64].copy_from_slice(&self.nil.to_le_bytes());
        buf[64] = self.architecture.to_raw();
        buf[72..80].copy_from_slice(&self.initial_stack_pointer.to_le_bytes());
        buf[96..104].copy_from_slice(&self.bml4.to_le_bytes());
        buf[104..112].copy_from_slice(&self.freelist_head.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_sector() {
        let short = [0u8; 16];
        assert_eq!(ImageHeader::parse(&short), Err(HeaderError::TooShort));
    }

    #[test]
    fn rejects_bad_magic() {
        let sector = [0u8; HEADER_LEN];
        assert_eq!(ImageHeader::parse(&sector), Err(HeaderError::BadMagic));
    }

    #[test]
    fn round_trips_random_headers() {
        for _ in 0..2_000 {
            let header = ImageHeader::random();
            let mut buf = [0u8; HEADER_LEN];
            header.write_to(&mut buf);
            let parsed = ImageHeader::parse(&buf).unwrap();
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn protocol_gate_major_zero_requires_exact_minor() {
        let mut header = ImageHeader::random();
        header.protocol_major = 0;
        header.protocol_minor = 6;
        assert!(!header.protocol_compatible(0, 5));
        assert!(header.protocol_compatible(0, 6));
    }

    #[test]
    fn protocol_gate_nonzero_major_allows_older_minor() {
        let mut header = ImageHeader::random();
        header.protocol_major = 1;
        header.protocol_minor = 3;
        assert!(header.protocol_compatible(1, 5));
        assert!(header.protocol_compatible(1, 3));
        assert!(!header.protocol_compatible(1, 2));
        assert!(!header.protocol_compatible(2, 5));
    }
}
