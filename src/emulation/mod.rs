//! # Emulated Hardware
//!
//! Software models of the hardware and platform services the PCI code drives: emulated PCI
//! functions on a segment with Configuration Space access, and a platform with interrupt vectors
//! and physical memory mappings. The command-line tool and the tests use them in place of real
//! hardware.

pub mod bus;
pub mod function;
pub mod platform;
pub mod register_set;
pub mod segment;
