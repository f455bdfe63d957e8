//! # Emulated Platform
//!
//! An x86-flavored [`InterruptPlatform`] and [`PhysicalMapper`] backed by sparse memory. Devices
//! driven against it behave like on a machine with a local APIC at `0xfee0_0000`.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tracing::{debug, warn};

use crate::{
    pci::{
        msi_message::MsiMessage,
        platform::{AccessRights, InterruptPlatform, MmioRegion, PhysicalMapper},
    },
    Error, Result,
};

/// The MSI address window of the local APIC.
pub const MSI_ADDRESS_BASE: u64 = 0xfee0_0000;

/// The vector legacy pin INTA# is routed to. INTB# to INTD# follow.
pub const LEGACY_VECTOR_BASE: u32 = 0x10;

/// The first vector handed out for message signaled interrupts.
pub const FIRST_DYNAMIC_VECTOR: u32 = 0x30;

/// The number of vectors the platform has.
pub const VECTOR_COUNT: u32 = 0x100;

/// Sparse, dword-granular physical memory. Unwritten memory reads as zero.
///
/// Clones share the same memory.
#[derive(Debug, Clone, Default)]
pub struct PhysicalMemory {
    dwords: Arc<Mutex<BTreeMap<u64, u32>>>,
}

impl PhysicalMemory {
    /// Read the dword at `address`.
    #[must_use]
    pub fn read_u32(&self, address: u64) -> u32 {
        debug_assert_eq!(address % 4, 0);

        self.dwords
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    /// Write the dword at `address`.
    pub fn write_u32(&self, address: u64, value: u32) {
        debug_assert_eq!(address % 4, 0);

        self.dwords.lock().unwrap().insert(address, value);
    }

    /// Fill `length` bytes starting at `address` with a dword pattern.
    pub fn fill(&self, address: u64, length: usize, value: u32) {
        let mut dwords = self.dwords.lock().unwrap();

        for addr in (address..address + length as u64).step_by(4) {
            dwords.insert(addr, value);
        }
    }
}

/// A mapping handed out by [`EmulatedPlatform`].
#[derive(Debug)]
struct EmulatedRegion {
    memory: PhysicalMemory,
    base: u64,
    length: usize,
    access: AccessRights,
}

impl MmioRegion for EmulatedRegion {
    fn len(&self) -> usize {
        self.length
    }

    fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.length, "read beyond mapping");

        self.memory.read_u32(self.base + offset as u64)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.length, "write beyond mapping");

        if self.access == AccessRights::ReadOnly {
            warn!("dropping write to read-only mapping at {:#x}", self.base + offset as u64);
            return;
        }

        self.memory.write_u32(self.base + offset as u64, value);
    }
}

#[derive(Debug)]
struct PlatformState {
    next_vector: u32,
    freed: Vec<(u32, usize)>,
    mappings: Vec<(u64, usize)>,
    fail_messages: bool,
    fail_mappings: bool,
}

/// Interrupt and memory services of an emulated machine.
#[derive(Debug)]
pub struct EmulatedPlatform {
    state: Mutex<PlatformState>,
    memory: PhysicalMemory,
}

impl Default for EmulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedPlatform {
    /// Create a platform with all dynamic vectors free.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlatformState {
                next_vector: FIRST_DYNAMIC_VECTOR,
                freed: Vec::new(),
                mappings: Vec::new(),
                fail_messages: false,
                fail_mappings: false,
            }),
            memory: PhysicalMemory::default(),
        }
    }

    /// The physical memory behind all mappings.
    #[must_use]
    pub const fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// All mappings as `(base, length)` in the order they were created.
    #[must_use]
    pub fn mappings(&self) -> Vec<(u64, usize)> {
        self.state.lock().unwrap().mappings.clone()
    }

    /// All vector ranges that were returned as `(base, count)`.
    #[must_use]
    pub fn freed_vectors(&self) -> Vec<(u32, usize)> {
        self.state.lock().unwrap().freed.clone()
    }

    /// Make all following MSI message computations fail.
    pub fn fail_msi_messages(&self) {
        self.state.lock().unwrap().fail_messages = true;
    }

    /// Make all following mappings fail for lack of address space.
    pub fn fail_mappings(&self) {
        self.state.lock().unwrap().fail_mappings = true;
    }
}

impl InterruptPlatform for EmulatedPlatform {
    fn pin_to_vector(&self, pin: u8) -> Result<u32> {
        match pin {
            1..=4 => Ok(LEGACY_VECTOR_BASE + u32::from(pin) - 1),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn allocate_vectors(&self, count: usize, hint: u32, _target_cpu: bool) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let count = u32::try_from(count).map_err(|_| Error::NoResources)?;

        let base = if hint >= state.next_vector {
            hint
        } else {
            state.next_vector
        };

        let end = base.checked_add(count).ok_or(Error::NoResources)?;
        if end > VECTOR_COUNT {
            return Err(Error::NoResources);
        }

        state.next_vector = end;
        debug!("allocated {count} vector(s) at {base:#x}");
        Ok(base)
    }

    fn free_vectors(&self, base: u32, count: usize) {
        self.state.lock().unwrap().freed.push((base, count));
    }

    fn compute_msi_message(&self, vector: u32, target: u32, edge: bool) -> Result<MsiMessage> {
        if self.state.lock().unwrap().fail_messages {
            return Err(Error::NotSupported);
        }

        let vector = u8::try_from(vector).map_err(|_| Error::InvalidArgument)?;
        let target = u8::try_from(target).map_err(|_| Error::InvalidArgument)?;

        // Destination APIC ID in address bits 19:12, trigger mode in data bit 15.
        let address = MSI_ADDRESS_BASE | (u64::from(target) << 12);
        let data = u16::from(vector) | if edge { 0 } else { 1 << 15 };

        Ok(MsiMessage::new(address, data))
    }
}

impl PhysicalMapper for EmulatedPlatform {
    fn map_physical(
        &self,
        name: &str,
        length: usize,
        base: u64,
        access: AccessRights,
    ) -> Result<Box<dyn MmioRegion>> {
        let mut state = self.state.lock().unwrap();

        if state.fail_mappings {
            return Err(Error::NoMemory);
        }

        debug!("{name}: mapping {base:#x}+{length:#x} {access:?}");
        state.mappings.push((base, length));

        Ok(Box::new(EmulatedRegion {
            memory: self.memory.clone(),
            base,
            length,
            access,
        }))
    }
}
