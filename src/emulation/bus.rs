//! # Register Requests
//!
//! Emulated registers are accessed with an address and a size. This module contains the request
//! type shared by the emulated Configuration Space and register sets.

use std::{
    convert::{TryFrom, TryInto},
    fmt::{self, Display, Formatter},
};

/// The size of register requests.
///
/// We don't use plain integers here to prevent use with illegal
/// sizes. [`RequestSize`] can be converted from and to [`u64`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RequestSize {
    Size1 = 1,
    Size2 = 2,
    Size4 = 4,
    Size8 = 8,
}

impl From<RequestSize> for u64 {
    fn from(r: RequestSize) -> Self {
        r as Self
    }
}

impl From<RequestSize> for usize {
    fn from(r: RequestSize) -> Self {
        r as Self
    }
}

impl Display for RequestSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u64::from(*self))
    }
}

/// An attempt was made to convert a size into a [`RequestSize`] that
/// cannot be represented.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IllegalRequestSize {}

impl TryFrom<u64> for RequestSize {
    type Error = IllegalRequestSize;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Size1),
            2 => Ok(Self::Size2),
            4 => Ok(Self::Size4),
            8 => Ok(Self::Size8),
            _ => Err(IllegalRequestSize {}),
        }
    }
}

impl TryFrom<usize> for RequestSize {
    type Error = IllegalRequestSize;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map_err(|_| IllegalRequestSize {})?
            .try_into()
    }
}

/// The address-size pair for register read/write operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Request {
    /// The byte offset of the request.
    pub addr: u64,

    /// The size of this request.
    pub size: RequestSize,
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.addr, self.size)
    }
}

impl Request {
    /// Create a new request from address and size.
    #[must_use]
    pub const fn new(addr: u64, size: RequestSize) -> Self {
        Self { addr, size }
    }

    /// Split a request into individual byte requests.
    pub fn iter_bytes(&self) -> impl Iterator<Item = Self> {
        (self.addr..self.addr + u64::from(self.size))
            .map(|addr| Self::new(addr, RequestSize::Size1))
    }

    /// The first byte after this request.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.addr + u64::from(self.size)
    }
}

/// A register file that is accessed by one thread at a time.
///
/// Emulated devices are wrapped into a [`std::sync::Mutex`] to be shared.
pub trait SingleThreadedBusDevice {
    /// The size of the register file in bytes.
    fn size(&self) -> u64;

    /// Read `req.size` bytes at `req.addr`.
    fn read(&mut self, req: Request) -> u64;

    /// Write the low `req.size` bytes of `value` at `req.addr`.
    fn write(&mut self, req: Request, value: u64);
}
