//! # MSI-X Table Access
//!
//! MSI-X interrupts are configured via a memory-mapped table in one of the device's BARs, with a
//! companion Pending Bit Array (PBA). This module wraps the mapped structures with typed
//! accessors. See [`MsixTable`].

use super::{
    constants::msix_table::{offset, CONTROL_MASKED, ENTRY_SIZE, PBA_CHUNK_BYTES},
    msi_message::MsiMessage,
    platform::MappedRegion,
};
use crate::Result;

/// The size of the table in bytes for `count` vectors.
#[must_use]
pub const fn table_bytes(count: u16) -> usize {
    count as usize * ENTRY_SIZE
}

/// The size of the PBA in bytes for `count` vectors. The PBA is read in quadwords.
#[must_use]
pub const fn pba_bytes(count: u16) -> usize {
    (count as usize).div_ceil(64) * PBA_CHUNK_BYTES
}

/// The content of a single table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsixEntry {
    /// The programmed address/data pair.
    pub message: MsiMessage,
    /// Whether the vector is masked.
    pub masked: bool,
}

/// The mapped MSI-X table and PBA of a device.
#[derive(Debug)]
pub struct MsixTable {
    table: MappedRegion,
    pba: MappedRegion,
    count: u16,
}

impl MsixTable {
    /// Wrap mapped table and PBA structures with `count` vectors.
    #[must_use]
    pub fn new(table: MappedRegion, pba: MappedRegion, count: u16) -> Self {
        debug_assert!(table.len() >= table_bytes(count));
        debug_assert!(pba.len() >= pba_bytes(count));

        Self { table, pba, count }
    }

    /// Return the number of MSI-X vectors in this table.
    #[must_use]
    pub const fn vector_count(&self) -> u16 {
        self.count
    }

    fn field(vector: u16, field: usize) -> usize {
        usize::from(vector) * ENTRY_SIZE + field
    }

    /// Mask a vector and clear its address and data.
    pub fn mask(&self, vector: u16) -> Result<()> {
        self.table.write_u32(Self::field(vector, offset::ADDRESS_LOW), 0)?;
        self.table.write_u32(Self::field(vector, offset::ADDRESS_HIGH), 0)?;
        self.table.write_u32(Self::field(vector, offset::DATA), 0)?;
        self.table
            .write_u32(Self::field(vector, offset::CONTROL), CONTROL_MASKED)
    }

    /// Mask every vector of the table.
    pub fn mask_all(&self) -> Result<()> {
        (0..self.count).try_for_each(|v| self.mask(v))
    }

    /// Program a vector with `message` and unmask it.
    ///
    /// The control word is written last, so the vector is never unmasked with a partial message.
    pub fn program(&self, vector: u16, message: MsiMessage) -> Result<()> {
        self.table
            .write_u32(Self::field(vector, offset::ADDRESS_LOW), message.address_low())?;
        self.table.write_u32(
            Self::field(vector, offset::ADDRESS_HIGH),
            message.address_high(),
        )?;
        self.table
            .write_u32(Self::field(vector, offset::DATA), message.data.into())?;
        self.table.write_u32(Self::field(vector, offset::CONTROL), 0)
    }

    /// Read back a table entry.
    pub fn entry(&self, vector: u16) -> Result<MsixEntry> {
        let low = self.table.read_u32(Self::field(vector, offset::ADDRESS_LOW))?;
        let high = self.table.read_u32(Self::field(vector, offset::ADDRESS_HIGH))?;
        let data = self.table.read_u32(Self::field(vector, offset::DATA))?;
        let control = self.table.read_u32(Self::field(vector, offset::CONTROL))?;

        Ok(MsixEntry {
            message: MsiMessage::new((u64::from(high) << 32) | u64::from(low), data as u16),
            masked: control & CONTROL_MASKED != 0,
        })
    }

    /// Check the pending bit of a vector.
    pub fn pending(&self, vector: u16) -> Result<bool> {
        let dword = self.pba.read_u32(usize::from(vector / 32) * 4)?;

        Ok(dword & (1 << (vector % 32)) != 0)
    }
}
