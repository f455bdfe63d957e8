//! An emulated PCI segment that implements [`ConfigAccess`].

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use tracing::trace;

use super::{
    bus::{Request, RequestSize},
    function::EmulatedFunction,
};
use crate::pci::{
    config::{AccessError, ConfigAccess},
    constants::config_space,
    location::Location,
};

/// A set of emulated functions addressed by their [`Location`].
///
/// Reads from locations without a function return all ones, as empty slots do on real hardware.
/// Writes to them are dropped.
#[derive(Debug, Default)]
pub struct EmulatedSegment {
    functions: BTreeMap<Location, Mutex<EmulatedFunction>>,
}

impl EmulatedSegment {
    /// Create a segment without any functions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a function into the segment.
    #[must_use]
    pub fn with_function(mut self, location: Location, function: EmulatedFunction) -> Self {
        self.functions.insert(location, Mutex::new(function));
        self
    }

    /// The locations that are populated.
    pub fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.functions.keys().copied()
    }

    /// Access an emulated function directly, e.g. to inject faults or inspect writes.
    ///
    /// # Panics
    ///
    /// If there is no function at `location`.
    #[must_use]
    pub fn function(&self, location: Location) -> MutexGuard<'_, EmulatedFunction> {
        self.functions
            .get(&location)
            .unwrap_or_else(|| panic!("no function at {location}"))
            .lock()
            .unwrap()
    }

    fn request(
        location: Location,
        offset: u16,
        size: RequestSize,
        kind: fn(Location, u16) -> AccessError,
    ) -> Result<Request, AccessError> {
        let req = Request::new(offset.into(), size);

        if req.end() > config_space::SIZE as u64 || req.addr % u64::from(size) != 0 {
            return Err(kind(location, offset));
        }

        Ok(req)
    }

    fn read(&self, location: Location, offset: u16, size: RequestSize) -> Result<u64, AccessError> {
        let req = Self::request(location, offset, size, AccessError::read)?;

        let Some(function) = self.functions.get(&location) else {
            return Ok(u64::MAX >> (64 - 8 * u64::from(size)));
        };

        let value = function
            .lock()
            .unwrap()
            .read(req)
            .map_err(|_| AccessError::read(location, offset))?;

        trace!("{location}: read {req} -> {value:#x}");
        Ok(value)
    }

    fn write(
        &self,
        location: Location,
        offset: u16,
        size: RequestSize,
        value: u64,
    ) -> Result<(), AccessError> {
        let req = Self::request(location, offset, size, AccessError::write)?;

        let Some(function) = self.functions.get(&location) else {
            return Ok(());
        };

        trace!("{location}: write {req} <- {value:#x}");
        function
            .lock()
            .unwrap()
            .write(req, value)
            .map_err(|_| AccessError::write(location, offset))
    }
}

impl ConfigAccess for EmulatedSegment {
    fn read_u8(&self, location: Location, offset: u16) -> Result<u8, AccessError> {
        self.read(location, offset, RequestSize::Size1)
            .map(|v| v as u8)
    }

    fn read_u16(&self, location: Location, offset: u16) -> Result<u16, AccessError> {
        self.read(location, offset, RequestSize::Size2)
            .map(|v| v as u16)
    }

    fn read_u32(&self, location: Location, offset: u16) -> Result<u32, AccessError> {
        self.read(location, offset, RequestSize::Size4)
            .map(|v| v as u32)
    }

    fn write_u8(&self, location: Location, offset: u16, value: u8) -> Result<(), AccessError> {
        self.write(location, offset, RequestSize::Size1, value.into())
    }

    fn write_u16(&self, location: Location, offset: u16, value: u16) -> Result<(), AccessError> {
        self.write(location, offset, RequestSize::Size2, value.into())
    }

    fn write_u32(&self, location: Location, offset: u16, value: u32) -> Result<(), AccessError> {
        self.write(location, offset, RequestSize::Size4, value.into())
    }
}
