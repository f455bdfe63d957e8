//! # MSI Messages

/// The address/data pair a device writes to signal an MSI or MSI-X interrupt.
///
/// The PCI specification makes no limitations here. The interpretation of address and data is
/// entirely platform specific and computed by
/// [`InterruptPlatform::compute_msi_message`](super::platform::InterruptPlatform::compute_msi_message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsiMessage {
    /// The physical address the device writes to.
    pub address: u64,

    /// The payload of the write.
    pub data: u16,
}

impl MsiMessage {
    /// Create a new [`MsiMessage`] struct.
    #[must_use]
    pub const fn new(address: u64, data: u16) -> Self {
        Self { address, data }
    }

    /// The lower half of the address.
    #[must_use]
    pub const fn address_low(&self) -> u32 {
        self.address as u32
    }

    /// The upper half of the address.
    #[must_use]
    pub const fn address_high(&self) -> u32 {
        (self.address >> 32) as u32
    }
}
