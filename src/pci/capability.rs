//! # PCI Capabilities
//!
//! Optional features of a function are advertised as a singly-linked list of capability
//! structures in the device-specific part of the Configuration Space. Each node starts with a
//! one-byte ID followed by a one-byte pointer to the next node. A pointer of zero ends the list.

use std::fmt::{self, Display, Formatter};

use super::{
    config::{AccessError, ConfigAccess},
    constants::config_space::{self, capability_id, msi, msix},
    location::Location,
};

/// The capabilities this crate distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    /// Message Signaled Interrupts.
    Msi,
    /// MSI-X with a vector table in device memory.
    Msix,
    /// Vendor-specific capability with a length byte.
    VendorSpecific,
    /// Any other capability. The ID is kept in [`Capability::id`].
    Other,
}

impl From<u8> for CapabilityKind {
    fn from(id: u8) -> Self {
        match id {
            capability_id::MSI => Self::Msi,
            capability_id::MSI_X => Self::Msix,
            capability_id::VENDOR_SPECIFIC => Self::VendorSpecific,
            _ => Self::Other,
        }
    }
}

/// A capability discovered while walking the capability list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// The raw capability ID.
    pub id: u8,
    /// The Configuration Space offset of the ID byte.
    pub offset: u8,
}

impl Capability {
    /// Create a capability record.
    #[must_use]
    pub const fn new(id: u8, offset: u8) -> Self {
        Self { id, offset }
    }

    /// The classification of this capability.
    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        self.id.into()
    }

    /// The Configuration Space offset of a register inside this capability.
    #[must_use]
    pub fn register(&self, offset: u16) -> u16 {
        u16::from(self.offset) + offset
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "capability: offset {:#x} id {:#x}", self.offset, self.id)
    }
}

/// Read `len` bytes of a capability dword by dword and check that the structure fits into the
/// Configuration Space.
fn prefetch(
    access: &dyn ConfigAccess,
    location: Location,
    cap: &Capability,
    len: usize,
) -> Result<Vec<u32>, AccessError> {
    if usize::from(cap.offset) + len > config_space::SIZE {
        return Err(AccessError::read(location, u16::from(cap.offset)));
    }

    (0..len)
        .step_by(4)
        .map(|off| access.read_u32(location, cap.register(off as u16)))
        .collect()
}

/// Validate an MSI capability at discovery time.
///
/// The registers are only interpreted when interrupts are allocated.
pub fn init_msi_capability(
    access: &dyn ConfigAccess,
    location: Location,
    cap: &Capability,
) -> Result<(), AccessError> {
    debug_assert_eq!(cap.kind(), CapabilityKind::Msi);

    let header = prefetch(access, location, cap, 4)?;
    let control = (header[0] >> 16) as u16;

    let regs = prefetch(access, location, cap, msi_capability_size(control))?;
    tracing::trace!("msi capability at {:#x}: {:08x?}", cap.offset, regs);

    Ok(())
}

/// The number of bytes an MSI capability with the given Message Control value occupies, rounded
/// up to whole dwords.
#[must_use]
pub const fn msi_capability_size(control: u16) -> usize {
    let mut size = msi::BASE_SIZE;

    if control & msi::control::ADDRESS_64 != 0 {
        size += msi::ADDRESS_HIGH_SIZE;
    }
    if control & msi::control::PER_VECTOR_MASKING != 0 {
        size += msi::MASKING_SIZE;
    }

    size
}

/// Validate an MSI-X capability at discovery time.
pub fn init_msix_capability(
    access: &dyn ConfigAccess,
    location: Location,
    cap: &Capability,
) -> Result<(), AccessError> {
    debug_assert_eq!(cap.kind(), CapabilityKind::Msix);

    let regs = prefetch(access, location, cap, msix::SIZE)?;
    tracing::trace!("msi-x capability at {:#x}: {:08x?}", cap.offset, regs);

    Ok(())
}

/// Location of an MSI-X structure in device memory as encoded in the Table and PBA info words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsixStructure {
    /// The index of the BAR that contains the structure.
    pub bar: u8,
    /// The byte offset of the structure from the start of the BAR.
    pub offset: u32,
}

impl MsixStructure {
    /// Decode a Table or PBA info word.
    #[must_use]
    pub const fn from_info(info: u32) -> Self {
        Self {
            bar: (info & msix::table_info::REGION) as u8,
            offset: info & msix::table_info::OFFSET,
        }
    }
}

/// The number of MSI-X table entries announced in the Message Control register.
#[must_use]
pub const fn msix_table_count(control: u16) -> u16 {
    (control & msix::control::TABLE_SIZE) + 1
}
