//! # PCI Constants
//!
//! This module collects the Configuration Space layout this crate decodes. All definitions are
//! derived from the "PCI Local Bus Specification" 3.0 and must match it bit for bit.

// Allow missing docs to avoid duplicating the PCI spec for all constants.
#![allow(missing_docs)]

/// The page size used to round memory BARs and MSI-X mappings.
pub const PAGE_SIZE: u64 = 0x1000;

/// Constants related to the configuration space.
pub mod config_space {

    /// The config space size of a single PCI function in bytes.
    pub const SIZE: usize = 256;

    /// The first byte after the standard type 0/1 header. Capabilities live above it.
    pub const HEADER_SIZE: usize = 0x40;

    /// The maximum number of Base Address Registers (BARs) per device.
    pub const MAX_BARS: usize = 6;

    /// The number of BARs in a type 1 (PCI-to-PCI bridge) header.
    pub const BRIDGE_BARS: usize = 2;

    /// The size in bytes of a single BAR.
    pub const BAR_ENTRY_SIZE: usize = 4;

    /// Masks for various configuration space fields.
    pub mod mask {
        pub const CAPABILITIES_POINTER: u8 = 0xfc;
        pub const HEADER_TYPE: u8 = 0x7f;

        pub const PIO_BAR_MARKER: u32 = 0x1;
        pub const PIO_BAR_FLAGS: u32 = 0x3;
        pub const PIO_BAR_ADDRESS: u32 = 0xfffc;

        pub const MMIO_BAR_TYPE: u32 = 0x6;
        pub const MMIO_BAR_TYPE_32: u32 = 0x0;
        pub const MMIO_BAR_TYPE_64: u32 = 0x4;
        pub const MMIO_BAR_PREFETCHABLE: u32 = 0x8;
        pub const MMIO_BAR_FLAGS: u32 = 0xf;
        pub const MMIO_BAR_ADDRESS: u32 = 0xffff_fff0;
    }

    /// The offsets of various fields in the configuration space.
    pub mod offset {
        pub const VENDOR: u16 = 0x0;
        pub const DEVICE: u16 = 0x2;
        pub const COMMAND: u16 = 0x4;
        pub const STATUS: u16 = 0x6;
        pub const REVISION: u16 = 0x8;
        pub const PROG_IF: u16 = 0x9;
        pub const SUBCLASS: u16 = 0xA;
        pub const CLASS: u16 = 0xB;
        pub const CACHE_LINE_SIZE: u16 = 0xC;
        pub const LATENCY_TIMER: u16 = 0xD;
        pub const HEADER_TYPE: u16 = 0xE;
        pub const BIST: u16 = 0xF;

        pub const BAR_0: u16 = 0x10;

        pub const SUBSYSTEM_VENDOR_ID: u16 = 0x2C;
        pub const SUBSYSTEM_ID: u16 = 0x2E;
        pub const ROM_BAR: u16 = 0x30;
        pub const CAPABILITIES_POINTER: u16 = 0x34;
        pub const IRQ_LINE: u16 = 0x3C;
        pub const IRQ_PIN: u16 = 0x3D;
        pub const MIN_GNT: u16 = 0x3E;
        pub const MAX_LAT: u16 = 0x3F;

        /// The Configuration Space offset of BAR number `index`.
        #[must_use]
        pub const fn bar(index: usize) -> u16 {
            BAR_0 + (index * super::BAR_ENTRY_SIZE) as u16
        }
    }

    /// The device vendor.
    pub mod vendor {
        /// Reads from empty slots return all ones.
        pub const INVALID: u16 = 0xFFFF;
        pub const INTEL: u16 = 0x8086;
        pub const REALTEK: u16 = 0x10ec;
        pub const REDHAT: u16 = 0x1b36;
    }

    /// Command Register Constants.
    pub mod command {
        pub const IO_ENABLE: u16 = 1 << 0;
        pub const MEMORY_ENABLE: u16 = 1 << 1;
        pub const BUS_MASTER_ENABLE: u16 = 1 << 2;

        pub const WRITABLE_BITS: u16 = 0x077F;
    }

    /// Status Register Constants.
    pub mod status {
        /// The device has a list of capabilities starting at
        /// [`CAPABILITIES_POINTER`](super::offset::CAPABILITIES_POINTER).
        pub const CAPABILITIES: u16 = 1 << 4;
    }

    /// PCI class constants.
    pub mod class {
        pub const NETWORK: u8 = 0x2;
        pub const BRIDGE: u8 = 0x6;
        pub const SERIAL: u8 = 0xc;
        pub const UNASSIGNED: u8 = 0xFF;
    }

    /// PCI sub-class constants.
    pub mod subclass {
        pub const HOST_BRIDGE: u8 = 0x0;
        pub const PCI_TO_PCI_BRIDGE: u8 = 0x4;
        pub const ETHERNET: u8 = 0x0;
        pub const SERIAL_USB: u8 = 0x03;
        pub const UNASSIGNED: u8 = 0xFF;
    }

    /// PCI programming interface constants.
    pub mod progif {
        pub const USB_XHCI: u8 = 0x30;
    }

    /// PCI header type.
    ///
    /// This is usually type 0, except for PCI-to-PCI bridges and other exotic devices such as
    /// Cardbus bridges.
    pub mod header_type {
        pub const TYPE_00: u8 = 0;
        pub const TYPE_01: u8 = 1;
        pub const MULTIFUNCTION: u8 = 1 << 7;
    }

    /// IDs for PCI Capabilities.
    pub mod capability_id {
        pub const MSI: u8 = 0x05;
        pub const VENDOR_SPECIFIC: u8 = 0x09;
        pub const MSI_X: u8 = 0x11;
    }

    /// Markers for iterating the list of capabilities.
    pub mod capability_list {
        pub const END_OF_LIST: u8 = 0;

        /// Offset of the next pointer relative to the capability ID.
        pub const NEXT: u16 = 1;

        /// Offset of the length byte of a vendor-specific capability.
        pub const VENDOR_LENGTH: u16 = 2;
    }

    /// Constants for the MSI capability.
    pub mod msi {
        /// The size of the capability with a 32-bit address, rounded up to whole dwords.
        pub const BASE_SIZE: usize = 12;
        /// The additional size of the high address part.
        pub const ADDRESS_HIGH_SIZE: usize = 4;
        /// The additional size of the Mask Bits and Pending Bits registers.
        pub const MASKING_SIZE: usize = 8;

        /// The offset of the message control register.
        pub const CONTROL: u16 = 2;
        /// The offset of the lower address part.
        pub const ADDRESS_LOW: u16 = 4;
        /// The offset of the high address part of a 64 bit address.
        pub const ADDRESS_HIGH: u16 = 8;
        /// The offset of the data field if the capability is 64-bit capable.
        pub const DATA_64: u16 = 12;
        /// The offset of the data field if the capability only has a 32-bit address.
        pub const DATA_32: u16 = 8;

        /// Constants for the Control field.
        pub mod control {
            pub const ENABLE: u16 = 1 << 0;
            pub const MULTIPLE_MESSAGE_CAPABLE: u16 = 0b111 << 1;
            pub const MULTIPLE_MESSAGE_ENABLE: u16 = 0b111 << 4;
            pub const ADDRESS_64: u16 = 1 << 7;
            pub const PER_VECTOR_MASKING: u16 = 1 << 8;
        }
    }

    /// Constants for the MSI-X capability.
    pub mod msix {
        /// The size of the MSI-X capability.
        pub const SIZE: usize = 12;

        /// The maximum number of MSI-X vectors.
        ///
        /// Note that the table size field in the [`control`] register contains the _last valid
        /// index_, not the maximum number.
        pub const MAX_VECTORS: u16 = 0x800;

        /// The offset of the message control register.
        pub const CONTROL: u16 = 2;
        /// The offset for MSI-X Table Offset and BAR indicator.
        pub const TABLE_INFO: u16 = 4;
        /// The offset for MSI-X Pending Bit Array Offset and BAR indicator.
        pub const PBA_INFO: u16 = 8;

        /// Masks of the table and PBA info fields.
        pub mod table_info {
            pub const REGION: u32 = 0b111;
            pub const OFFSET: u32 = !0b111;
        }

        /// Constants for the Control field.
        pub mod control {
            pub const TABLE_SIZE: u16 = 0x7ff;
            pub const ENABLE: u16 = 1 << 15;
            pub const FUNCTION_MASK: u16 = 1 << 14;

            pub const WRITABLE_BITS: u16 = ENABLE | FUNCTION_MASK;
        }
    }
}

/// Layout of the MSI-X structures that live in device memory.
pub mod msix_table {
    /// The size of a single "row" of the MSI-X table in bytes.
    pub const ENTRY_SIZE: usize = 16;

    /// The Pending Bit Array is accessed in quadwords of 64 vectors each.
    pub const PBA_CHUNK_BYTES: usize = 8;

    /// Offsets of fields in an MSI-X table entry.
    pub mod offset {
        pub const ADDRESS_LOW: usize = 0;
        pub const ADDRESS_HIGH: usize = 4;
        pub const DATA: usize = 8;
        pub const CONTROL: usize = 12;
    }

    /// A bit in the Control Word that indicates whether this vector is masked.
    pub const CONTROL_MASKED: u32 = 1 << 0;
}
