//! # Configuration Space Access
//!
//! The raw read/write primitives are provided by the platform (port I/O, ECAM, a hypervisor
//! interface, ...). This module defines the [`ConfigAccess`] interface devices use to reach them
//! and the decoded [`ConfigSnapshot`] of a type 0 header.

use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};

use super::{
    constants::config_space::{self, offset, MAX_BARS},
    location::Location,
};

/// The direction of a failed Configuration Space access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AccessKind {
    Read,
    Write,
}

impl Display for AccessKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// A Configuration Space access did not complete.
///
/// The reason is opaque to this crate. Accessors may log details themselves.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("config {kind} at {location} offset {offset:#x} failed")]
pub struct AccessError {
    /// The function that was accessed.
    pub location: Location,
    /// The Configuration Space offset of the access.
    pub offset: u16,
    /// Whether this was a read or a write.
    pub kind: AccessKind,
}

impl AccessError {
    /// Create an error for a failed read.
    #[must_use]
    pub const fn read(location: Location, offset: u16) -> Self {
        Self {
            location,
            offset,
            kind: AccessKind::Read,
        }
    }

    /// Create an error for a failed write.
    #[must_use]
    pub const fn write(location: Location, offset: u16) -> Self {
        Self {
            location,
            offset,
            kind: AccessKind::Write,
        }
    }
}

/// Byte, word and dword access to the Configuration Space of any function on a segment.
///
/// Offsets are relative to the start of the function's Configuration Space. Accesses are
/// little-endian and never cross the natural alignment of their size.
pub trait ConfigAccess: Debug + Send + Sync {
    /// Read a single byte.
    fn read_u8(&self, location: Location, offset: u16) -> Result<u8, AccessError>;

    /// Read a 16-bit value.
    fn read_u16(&self, location: Location, offset: u16) -> Result<u16, AccessError>;

    /// Read a 32-bit value.
    fn read_u32(&self, location: Location, offset: u16) -> Result<u32, AccessError>;

    /// Write a single byte.
    fn write_u8(&self, location: Location, offset: u16, value: u8) -> Result<(), AccessError>;

    /// Write a 16-bit value.
    fn write_u16(&self, location: Location, offset: u16, value: u16) -> Result<(), AccessError>;

    /// Write a 32-bit value.
    fn write_u32(&self, location: Location, offset: u16, value: u32) -> Result<(), AccessError>;

    /// Read the complete Configuration Space and decode its header.
    ///
    /// The default implementation reads dword by dword. Accessors with a faster bulk path may
    /// override it.
    fn read_config(&self, location: Location) -> Result<ConfigSnapshot, AccessError> {
        let mut raw = [0u8; config_space::SIZE];

        for (dword, chunk) in raw.chunks_exact_mut(4).enumerate() {
            let value = self.read_u32(location, (dword * 4) as u16)?;
            chunk.copy_from_slice(&value.to_le_bytes());
        }

        Ok(ConfigSnapshot::from_bytes(&raw))
    }
}

/// A reference-counted, thread-safe Configuration Space accessor.
pub type ConfigAccessRef = Arc<dyn ConfigAccess>;

/// The decoded header of a type 0 Configuration Space.
///
/// A type 1 header shares everything up to and including the first two BARs, the capabilities
/// pointer and the interrupt fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct ConfigSnapshot {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision: u8,
    pub prog_if: u8,
    pub sub_class: u8,
    pub base_class: u8,
    pub cache_line_size: u8,
    pub latency_timer: u8,
    /// The raw header type byte, including the multifunction bit.
    pub header_type: u8,
    pub bist: u8,
    /// The raw, undecoded BAR registers.
    pub base_addresses: [u32; MAX_BARS],
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub expansion_rom: u32,
    pub capabilities_ptr: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub min_grant: u8,
    pub max_latency: u8,
}

impl ConfigSnapshot {
    /// Decode the standard header from a raw Configuration Space image.
    #[must_use]
    pub fn from_bytes(raw: &[u8; config_space::SIZE]) -> Self {
        let u8_at = |off: u16| raw[usize::from(off)];
        let u16_at = |off: u16| u16::from_le_bytes([u8_at(off), u8_at(off + 1)]);
        let u32_at = |off: u16| {
            u32::from_le_bytes([u8_at(off), u8_at(off + 1), u8_at(off + 2), u8_at(off + 3)])
        };

        Self {
            vendor_id: u16_at(offset::VENDOR),
            device_id: u16_at(offset::DEVICE),
            command: u16_at(offset::COMMAND),
            status: u16_at(offset::STATUS),
            revision: u8_at(offset::REVISION),
            prog_if: u8_at(offset::PROG_IF),
            sub_class: u8_at(offset::SUBCLASS),
            base_class: u8_at(offset::CLASS),
            cache_line_size: u8_at(offset::CACHE_LINE_SIZE),
            latency_timer: u8_at(offset::LATENCY_TIMER),
            header_type: u8_at(offset::HEADER_TYPE),
            bist: u8_at(offset::BIST),
            base_addresses: std::array::from_fn(|i| u32_at(offset::bar(i))),
            subsystem_vendor_id: u16_at(offset::SUBSYSTEM_VENDOR_ID),
            subsystem_id: u16_at(offset::SUBSYSTEM_ID),
            expansion_rom: u32_at(offset::ROM_BAR),
            capabilities_ptr: u8_at(offset::CAPABILITIES_POINTER),
            interrupt_line: u8_at(offset::IRQ_LINE),
            interrupt_pin: u8_at(offset::IRQ_PIN),
            min_grant: u8_at(offset::MIN_GNT),
            max_latency: u8_at(offset::MAX_LAT),
        }
    }
}
