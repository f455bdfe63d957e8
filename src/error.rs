//! # Error Types
//!
//! All fallible operations in this crate return [`Error`]. Hardware misbehavior and absent
//! devices are ordinary error values. Bugs in the calling allocator are reported as
//! [`Error::ContractViolation`] so callers can tell them apart from anything the hardware did.

use crate::pci::config::AccessError;

/// Errors returned by device operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Nothing usable at this location. Callers skip it.
    #[error("device not found")]
    NotFound,

    /// The device or feature was recognized, but is deliberately not handled.
    #[error("not supported")]
    NotSupported,

    /// The device cannot satisfy the request, e.g. too few MSI-X table entries or no legacy
    /// interrupt pin.
    #[error("no resources")]
    NoResources,

    /// Malformed parameters, such as an MSI-X structure in a BAR that does not exist.
    #[error("invalid argument")]
    InvalidArgument,

    /// A mapping or allocation in the platform failed.
    #[error("out of memory")]
    NoMemory,

    /// The Configuration Space accessor failed.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// The capability list points back into itself or into the standard header.
    #[error("malformed capability list at offset {offset:#x}")]
    MalformedCapabilityList {
        /// The offending pointer value.
        offset: u8,
    },

    /// The caller broke a precondition of the operation.
    #[error("contract violation: {0}")]
    ContractViolation(Violation),
}

/// Preconditions that callers of [`Device`](crate::pci::device::Device) must uphold.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Only single-vector MSI and MSI-X allocations are implemented.
    #[error("{0} vectors requested, only 1 is supported")]
    UnsupportedVectorCount(usize),

    /// The address handed to `assign_resource` does not honor the request alignment.
    #[error("address {address:#x} is not aligned to 2^{align}")]
    UnalignedAddress {
        /// The address that was passed in.
        address: u64,
        /// The required alignment as a power-of-two exponent.
        align: u8,
    },

    /// The resource request was generated by a different device.
    #[error("resource request belongs to a different device")]
    ForeignRequest,
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self {
        Self::ContractViolation(v)
    }
}

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
