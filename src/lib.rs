//! # Device-side PCI Discovery
//!
//! This crate implements the leaf-device half of PCI enumeration: probing a function's
//! Configuration Space, sizing and classifying its Base Address Registers (BARs), walking its
//! capability list, answering resource requests of a parent allocator and provisioning legacy,
//! MSI and MSI-X interrupts.
//!
//! Everything outside of a single device is a collaborator behind a narrow trait:
//!
//! - Configuration Space access is [`ConfigAccess`](pci::config::ConfigAccess),
//! - vector allocation and MSI message composition is
//!   [`InterruptPlatform`](pci::platform::InterruptPlatform),
//! - mapping of the MSI-X structures is [`PhysicalMapper`](pci::platform::PhysicalMapper).
//!
//! The [`emulation`] module provides in-memory implementations of all of them.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod emulation;
pub mod error;
pub mod interval;
pub mod pci;

pub use error::{Error, Result, Violation};
