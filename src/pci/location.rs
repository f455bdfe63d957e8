//! # Bus Locations

use std::fmt::{self, Display, Formatter};

/// The address of a PCI function on its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Location {
    /// The bus number.
    pub bus: u8,
    /// The device number on the bus (0..32).
    pub device: u8,
    /// The function number of the device (0..8).
    pub function: u8,
}

impl Location {
    /// Create a location from a bus/device/function triple.
    #[must_use]
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        assert!(device < 32);
        assert!(function < 8);

        Self {
            bus,
            device,
            function,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}
