//! # PCI Device Support
//!
//! This module discovers and configures PCI type 0 functions: it decodes the Configuration Space,
//! sizes and assigns BARs, walks the capability list and sets up legacy, MSI and MSI-X
//! interrupts. Hardware and platform access goes through the traits in [`config`] and
//! [`platform`].

pub mod bar;
pub mod capability;
pub mod config;
pub mod constants;
pub mod device;
pub mod location;
pub mod msi_message;
pub mod msix_table;
pub mod platform;
pub mod resource;
