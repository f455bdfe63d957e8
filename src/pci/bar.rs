//! # Base Address Registers
//!
//! A BAR describes a window of I/O or memory space a device decodes. The size of the window is
//! not stored anywhere: software writes all ones into the register and checks which address bits
//! stick. This module contains the decoded [`Bar`] and the arithmetic for these size probes. The
//! register accesses themselves are in [`Device::load_bars`](super::device::Device::load_bars).

use std::{
    fmt::{self, Display, Formatter},
    ops::Range,
};

use super::constants::config_space::{mask, MAX_BARS};

/// The address space a BAR decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// Port I/O space.
    Io,
    /// Memory space below 4 GiB.
    Memory32,
    /// Memory space anywhere in the 64-bit address space. Occupies two BAR slots.
    Memory64,
}

impl BarKind {
    /// Classify a raw BAR register value by its low bits.
    ///
    /// Returns `None` for the reserved memory type `0b10` (formerly "below 1 MiB") and `0b11`.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw & mask::PIO_BAR_MARKER != 0 {
            return Some(Self::Io);
        }

        match raw & mask::MMIO_BAR_TYPE {
            mask::MMIO_BAR_TYPE_32 => Some(Self::Memory32),
            mask::MMIO_BAR_TYPE_64 => Some(Self::Memory64),
            _ => None,
        }
    }
}

/// A decoded BAR.
///
/// A BAR that is not implemented, that could not be sized, or that holds the upper half of a
/// 64-bit BAR is `valid == false` with all other fields zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bar {
    /// Whether this slot describes a window on its own.
    pub valid: bool,
    /// The window is in port I/O space.
    pub io: bool,
    /// The window is a 64-bit memory window that also uses the following slot.
    pub size_64: bool,
    /// Reads have no side effects.
    pub prefetchable: bool,
    /// The base address with the flag bits masked off.
    pub addr: u64,
    /// The size of the window in bytes. Always a power of two.
    pub size: u64,
}

impl Bar {
    /// The kind of address space of a valid BAR.
    #[must_use]
    pub const fn kind(&self) -> Option<BarKind> {
        match (self.valid, self.io, self.size_64) {
            (false, _, _) => None,
            (true, true, _) => Some(BarKind::Io),
            (true, false, false) => Some(BarKind::Memory32),
            (true, false, true) => Some(BarKind::Memory64),
        }
    }

    /// The bytes this BAR currently claims. Empty for invalid BARs.
    #[must_use]
    pub fn address_range(&self) -> Range<u64> {
        if self.valid {
            self.addr..self.addr.saturating_add(self.size)
        } else {
            0..0
        }
    }
}

impl Display for Bar {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let kind = match self.kind() {
            None => return write!(f, "invalid"),
            Some(BarKind::Io) => "io",
            Some(BarKind::Memory32) => "mem32",
            Some(BarKind::Memory64) => "mem64",
        };

        write!(
            f,
            "{kind}{} addr {:#x} size {:#x}",
            if self.prefetchable { " prefetch" } else { "" },
            self.addr,
            self.size
        )
    }
}

/// A snapshot of all BAR slots of a device.
pub type BarTable = [Bar; MAX_BARS];

/// The size of a window from the address bits that stuck after writing all ones.
///
/// Only the lowest writable bit counts. Devices that report gaps in their writable bits still
/// get a power-of-two size.
const fn size_from_address_bits(masked: u64) -> u64 {
    if masked == 0 {
        0
    } else {
        1 << masked.trailing_zeros()
    }
}

/// Compute the size of an I/O BAR from the value read back after writing `0xffff`.
///
/// I/O windows are decoded with 16 bits. A readback without writable address bits yields 0.
#[must_use]
pub const fn io_size_from_probe(readback: u32) -> u64 {
    size_from_address_bits((readback & mask::PIO_BAR_ADDRESS) as u64)
}

/// Compute the size of a 32-bit memory BAR from the value read back after writing all ones.
#[must_use]
pub const fn mem32_size_from_probe(readback: u32) -> u64 {
    size_from_address_bits((readback & mask::MMIO_BAR_ADDRESS) as u64)
}

/// Compute the size of a 64-bit memory BAR from both halves read back after writing all ones.
#[must_use]
pub const fn mem64_size_from_probe(readback: u64) -> u64 {
    size_from_address_bits(readback & !(mask::MMIO_BAR_FLAGS as u64))
}
