//! # Platform Services
//!
//! Interrupt vectors, the MSI message format and the mapping of device memory all belong to the
//! platform. Devices use them through the traits in this module.

use std::{fmt::Debug, ops::Range};

use tracing::{debug, warn};

use super::{
    constants::PAGE_SIZE,
    msi_message::MsiMessage,
    resource::{checked_round_up, round_down},
};
use crate::{interval::Interval, Error, Result};

/// Interrupt vector management of the platform.
pub trait InterruptPlatform: Debug + Send + Sync {
    /// Translate a legacy interrupt pin (1 = INTA# .. 4 = INTD#) into a platform vector.
    fn pin_to_vector(&self, pin: u8) -> Result<u32>;

    /// Allocate `count` contiguous vectors and return the first one.
    ///
    /// `hint` is a preferred base vector or 0. `target_cpu` requests vectors that can be targeted
    /// at a specific CPU, which message signaled interrupts always need.
    fn allocate_vectors(&self, count: usize, hint: u32, target_cpu: bool) -> Result<u32>;

    /// Return vectors obtained from [`allocate_vectors`](Self::allocate_vectors).
    fn free_vectors(&self, base: u32, count: usize);

    /// Compute the address/data pair that raises `vector` on `target`.
    fn compute_msi_message(&self, vector: u32, target: u32, edge: bool) -> Result<MsiMessage>;
}

/// The access rights of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRights {
    /// The mapping may only be read.
    ReadOnly,
    /// The mapping may be read and written.
    ReadWrite,
}

/// A mapping of physical device memory.
///
/// Implementations are uncached device memory. Accesses are 32-bit, naturally aligned and within
/// `0..len()`.
pub trait MmioRegion: Debug + Send + Sync {
    /// The size of the mapping in bytes.
    fn len(&self) -> usize;

    /// Whether the mapping is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a dword at `offset`.
    fn read_u32(&self, offset: usize) -> u32;

    /// Write a dword at `offset`.
    fn write_u32(&self, offset: usize, value: u32);
}

/// The platform's facility to map physical address space.
pub trait PhysicalMapper: Debug + Send + Sync {
    /// Map `length` bytes of device memory starting at the physical address `base`.
    ///
    /// `base` and `length` are page aligned. Failures to find address space are reported as
    /// [`Error::NoMemory`].
    fn map_physical(
        &self,
        name: &str,
        length: usize,
        base: u64,
        access: AccessRights,
    ) -> Result<Box<dyn MmioRegion>>;
}

/// A structure in device memory that was mapped with page granularity.
///
/// All offsets passed to this type are relative to the structure, not to the mapping. Accesses
/// are checked against the structure's bounds.
#[derive(Debug)]
pub struct MappedRegion {
    region: Box<dyn MmioRegion>,
    /// Distance of the structure from the start of the mapping.
    offset: usize,
    /// The size of the structure in bytes.
    length: usize,
    access: AccessRights,
}

impl MappedRegion {
    /// Map the structure of `length` bytes at the physical address `phys`.
    pub fn map(
        mapper: &dyn PhysicalMapper,
        name: &str,
        phys: u64,
        length: usize,
        access: AccessRights,
    ) -> Result<Self> {
        let base = round_down(phys, PAGE_SIZE);
        let offset = phys - base;
        let map_len = (length as u64)
            .checked_add(offset)
            .and_then(|end| checked_round_up(end, PAGE_SIZE))
            .ok_or(Error::InvalidArgument)?;

        let region = mapper.map_physical(
            name,
            usize::try_from(map_len).map_err(|_| Error::InvalidArgument)?,
            base,
            access,
        )?;

        // The mapper is trusted to honor the length, but a short mapping must never be indexed.
        if region.len() < map_len as usize {
            warn!(
                "{name}: mapper returned {:#x} bytes, expected {:#x}",
                region.len(),
                map_len
            );
            return Err(Error::NoMemory);
        }

        debug!("{name}: {phys:#x}+{length:#x} mapped via page {base:#x}");

        Ok(Self {
            region,
            offset: offset as usize,
            length,
            access,
        })
    }

    /// The size of the structure in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Whether the structure is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The access rights the structure was mapped with.
    #[must_use]
    pub const fn access(&self) -> AccessRights {
        self.access
    }

    /// Translate a structure-relative dword access into an offset in the mapping.
    fn checked(&self, offset: usize) -> Result<usize> {
        let access: Range<usize> = offset..offset.checked_add(4).ok_or(Error::InvalidArgument)?;

        if offset % 4 != 0 || !(0..self.length).contains_interval(&access) {
            return Err(Error::InvalidArgument);
        }

        Ok(self.offset + offset)
    }

    /// Read the dword at `offset` in the structure.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        Ok(self.region.read_u32(self.checked(offset)?))
    }

    /// Write the dword at `offset` in the structure.
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        let offset = self.checked(offset)?;

        if self.access == AccessRights::ReadOnly {
            return Err(Error::InvalidArgument);
        }

        self.region.write_u32(offset, value);
        Ok(())
    }
}

/// Vectors obtained from the platform that are returned on drop unless committed.
///
/// Interrupt setup takes several steps after the vectors were allocated. Any of them may fail,
/// and the vectors must not leak when they do.
#[derive(Debug)]
pub struct VectorReservation<'a> {
    platform: &'a dyn InterruptPlatform,
    base: u32,
    count: usize,
    committed: bool,
}

impl<'a> VectorReservation<'a> {
    /// Allocate `count` vectors from the platform.
    pub fn allocate(platform: &'a dyn InterruptPlatform, count: usize) -> Result<Self> {
        let base = platform.allocate_vectors(count, 0, true)?;

        Ok(Self {
            platform,
            base,
            count,
            committed: false,
        })
    }

    /// The first allocated vector.
    #[must_use]
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Keep the vectors and return the base vector.
    #[must_use]
    pub fn commit(mut self) -> u32 {
        self.committed = true;
        self.base
    }
}

impl Drop for VectorReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!("returning {} vector(s) at {}", self.count, self.base);
            self.platform.free_vectors(self.base, self.count);
        }
    }
}
