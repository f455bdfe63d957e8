//! This module implements the CLI interface.
//!
//! The tool probes an emulated PCI segment, assigns addresses from the windows given on the
//! command line and sets up interrupts, the way firmware or an early kernel would.
use std::num::ParseIntError;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The start of the memory window BARs are assigned from.
    #[arg(long, value_name = "HEX", value_parser = parse_hex, default_value = "0xe0000000")]
    pub mmio_base: u64,

    /// The start of the I/O port window BARs are assigned from.
    #[arg(long, value_name = "HEX", value_parser = parse_hex, default_value = "0xc000")]
    pub io_base: u64,

    /// Prefer MSI-X over MSI for devices that support both.
    #[arg(long)]
    pub msix: bool,
}

/// Parse a hexadecimal number with or without `0x` prefix.
fn parse_hex(value: &str) -> Result<u64, ParseIntError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    u64::from_str_radix(digits, 16)
}
