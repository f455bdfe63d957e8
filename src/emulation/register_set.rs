//! # Emulated Register Files
//!
//! A fixed-size byte array with a per-bit write mask. This is enough to model the Configuration
//! Space of a PCI function, where BAR sizes are expressed by which address bits are writable.

use super::bus::{Request, SingleThreadedBusDevice};

/// A builder for [`RegisterSet`] objects.
///
/// # Examples
///
/// ```
/// use pcidev::emulation::register_set::*;
///
/// let regs: RegisterSet<8> = RegisterSetBuilder::<8>::new()
///     .u8_ro_at(0, 0xAB)         // A read-only byte containing 0xAB at offset 0.
///     .u16_le_at(2, 0, 0xfff0)   // A 16-bit register with the low nibble hardwired to zero.
///     .u32_le_rw_at(4, 0xCAFE)   // A fully writable 32-bit register.
///     .into();
/// ```
#[derive(Debug, Clone)]
pub struct RegisterSetBuilder<const SIZE: usize> {
    data: [u8; SIZE],
    rw_mask: [u8; SIZE],
}

impl<const SIZE: usize> Default for RegisterSetBuilder<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> RegisterSetBuilder<SIZE> {
    /// Start with a read-only register file where all bits are set.
    ///
    /// This matches what unimplemented registers return on real hardware.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: [0xFF; SIZE],
            rw_mask: [0; SIZE],
        }
    }

    fn init_bytes(&mut self, pos: usize, value: &[u8], write_mask: &[u8]) {
        assert_eq!(value.len(), write_mask.len());
        assert!(
            pos + value.len() <= SIZE,
            "register at {pos:#x} does not fit into {SIZE} bytes"
        );

        self.data[pos..pos + value.len()].copy_from_slice(value);
        self.rw_mask[pos..pos + value.len()].copy_from_slice(write_mask);
    }

    /// Place a byte with a mask of writable bits.
    pub fn u8_at(&mut self, pos: usize, value: u8, write_mask: u8) -> &mut Self {
        self.init_bytes(pos, &[value], &[write_mask]);
        self
    }

    /// Place a read-only byte.
    pub fn u8_ro_at(&mut self, pos: usize, value: u8) -> &mut Self {
        self.u8_at(pos, value, 0)
    }

    /// Place a writable byte.
    pub fn u8_rw_at(&mut self, pos: usize, value: u8) -> &mut Self {
        self.u8_at(pos, value, 0xFF)
    }

    /// Place a little-endian 16-bit register with a mask of writable bits.
    pub fn u16_le_at(&mut self, pos: usize, value: u16, write_mask: u16) -> &mut Self {
        self.init_bytes(pos, &value.to_le_bytes(), &write_mask.to_le_bytes());
        self
    }

    /// Place a read-only little-endian 16-bit register.
    pub fn u16_le_ro_at(&mut self, pos: usize, value: u16) -> &mut Self {
        self.u16_le_at(pos, value, 0)
    }

    /// Place a writable little-endian 16-bit register.
    pub fn u16_le_rw_at(&mut self, pos: usize, value: u16) -> &mut Self {
        self.u16_le_at(pos, value, 0xFFFF)
    }

    /// Place a little-endian 32-bit register with a mask of writable bits.
    pub fn u32_le_at(&mut self, pos: usize, value: u32, write_mask: u32) -> &mut Self {
        self.init_bytes(pos, &value.to_le_bytes(), &write_mask.to_le_bytes());
        self
    }

    /// Place a read-only little-endian 32-bit register.
    pub fn u32_le_ro_at(&mut self, pos: usize, value: u32) -> &mut Self {
        self.u32_le_at(pos, value, 0)
    }

    /// Place a writable little-endian 32-bit register.
    pub fn u32_le_rw_at(&mut self, pos: usize, value: u32) -> &mut Self {
        self.u32_le_at(pos, value, 0xFFFF_FFFF)
    }

    /// Copy an existing register set, values and write masks, to `pos`.
    pub fn register_set_at<const PART_SIZE: usize>(
        &mut self,
        pos: usize,
        regs: &RegisterSet<PART_SIZE>,
    ) -> &mut Self {
        self.init_bytes(pos, &regs.data, &regs.rw_mask);
        self
    }

    /// Construct the final register set.
    #[must_use]
    pub fn build(&self) -> RegisterSet<SIZE> {
        RegisterSet {
            data: self.data,
            rw_mask: self.rw_mask,
        }
    }
}

impl<const SIZE: usize> From<&mut RegisterSetBuilder<SIZE>> for RegisterSet<SIZE> {
    fn from(builder: &mut RegisterSetBuilder<SIZE>) -> Self {
        builder.build()
    }
}

impl<const SIZE: usize> From<RegisterSetBuilder<SIZE>> for RegisterSet<SIZE> {
    fn from(builder: RegisterSetBuilder<SIZE>) -> Self {
        builder.build()
    }
}

/// A register file with configurable writability.
///
/// Constructed using [`RegisterSetBuilder`].
#[derive(Debug, Clone)]
pub struct RegisterSet<const SIZE: usize> {
    data: [u8; SIZE],
    rw_mask: [u8; SIZE],
}

impl<const SIZE: usize> RegisterSet<SIZE> {
    fn checked_offset(req: Request) -> usize {
        let end = usize::try_from(req.end()).unwrap_or(usize::MAX);
        assert!(end <= SIZE, "request {req} outside of {SIZE} byte register set");

        end - usize::from(req.size)
    }

    /// Read without requiring a mutable reference.
    #[must_use]
    pub fn read(&self, req: Request) -> u64 {
        let start = Self::checked_offset(req);

        self.data[start..start + usize::from(req.size)]
            .iter()
            .rev()
            .fold(0, |acc, &byte| (acc << 8) | u64::from(byte))
    }

    /// Write the underlying bytes regardless of the write mask.
    ///
    /// Used to change read-only state behind the back of the register file's user.
    pub fn write_direct(&mut self, req: Request, value: u64) {
        let start = Self::checked_offset(req);

        for (i, byte) in value
            .to_le_bytes()
            .into_iter()
            .take(req.size.into())
            .enumerate()
        {
            self.data[start + i] = byte;
        }
    }
}

impl<const SIZE: usize> SingleThreadedBusDevice for RegisterSet<SIZE> {
    fn size(&self) -> u64 {
        SIZE as u64
    }

    fn read(&mut self, req: Request) -> u64 {
        RegisterSet::read(self, req)
    }

    fn write(&mut self, req: Request, value: u64) {
        let start = Self::checked_offset(req);

        for (i, byte) in value
            .to_le_bytes()
            .into_iter()
            .take(req.size.into())
            .enumerate()
        {
            let mask = self.rw_mask[start + i];
            let old = self.data[start + i];

            self.data[start + i] = (old & !mask) | (byte & mask);
        }
    }
}
