//! # Emulated PCI Functions
//!
//! An [`EmulatedFunction`] is the Configuration Space of a single PCI function with BARs that
//! size themselves like hardware does, optional MSI/MSI-X/vendor capabilities and hooks to make
//! accesses fail. Use [`EmulatedFunctionBuilder`] to create one.

use std::collections::BTreeSet;

use super::{
    bus::{Request, RequestSize, SingleThreadedBusDevice},
    register_set::{RegisterSet, RegisterSetBuilder},
};
use crate::pci::constants::config_space::{
    self, capability_id, command, header_type, mask, msi, msix, offset, status, MAX_BARS,
};

/// The offset at which we start to allocate capabilities.
const INITIAL_CAPABILITY_OFFSET: usize = 0x40;

/// The size of the capability header (ID and next pointer).
const CAPABILITY_HEADER_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarLayout {
    Io,
    Memory32 { prefetchable: bool },
    Memory64 { prefetchable: bool },
    /// The upper half of a 64-bit BAR.
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BarInfo {
    layout: BarLayout,
    size: u64,
    address: u64,
}

/// A builder for [`EmulatedFunction`] objects.
#[derive(Debug, Clone)]
pub struct EmulatedFunctionBuilder {
    reg_builder: RegisterSetBuilder<{ config_space::SIZE }>,
    header_type: u8,
    multifunction: bool,
    interrupt_pin: u8,
    command: u16,

    bars: [Option<BarInfo>; MAX_BARS],

    /// The offset in the Configuration Space where we add the next capability. Always 4-byte
    /// aligned.
    next_capability_offset: usize,

    /// The offset where the capability pointer needs to be updated when we add a capability.
    last_capability_pointer: u8,
}

impl EmulatedFunctionBuilder {
    /// Create a builder for a single-function type 0 device with an undefined class.
    #[must_use]
    pub fn new(vendor: u16, device: u16) -> Self {
        let mut reg_builder = RegisterSetBuilder::<{ config_space::SIZE }>::new();

        reg_builder
            .u16_le_ro_at(offset::VENDOR.into(), vendor)
            .u16_le_ro_at(offset::DEVICE.into(), device)
            .u8_ro_at(offset::REVISION.into(), 0)
            .u8_rw_at(offset::CACHE_LINE_SIZE.into(), 0)
            .u8_rw_at(offset::LATENCY_TIMER.into(), 0)
            .u8_ro_at(offset::BIST.into(), 0)
            .u16_le_ro_at(offset::SUBSYSTEM_VENDOR_ID.into(), vendor)
            .u16_le_ro_at(offset::SUBSYSTEM_ID.into(), device)
            .u32_le_ro_at(offset::ROM_BAR.into(), 0)
            .u8_ro_at(offset::MIN_GNT.into(), 0)
            .u8_ro_at(offset::MAX_LAT.into(), 0);

        Self {
            reg_builder,
            header_type: header_type::TYPE_00,
            multifunction: false,
            interrupt_pin: 0,
            command: 0,
            bars: [None; MAX_BARS],
            next_capability_offset: INITIAL_CAPABILITY_OFFSET,
            last_capability_pointer: offset::CAPABILITIES_POINTER as u8,
        }
    }

    /// Configure the class, subclass and programming interface.
    ///
    /// They default to `0xFF`, the undefined device class.
    #[must_use]
    pub fn class(mut self, class: u8, subclass: u8, prog_if: u8) -> Self {
        self.reg_builder
            .u8_ro_at(offset::CLASS.into(), class)
            .u8_ro_at(offset::SUBCLASS.into(), subclass)
            .u8_ro_at(offset::PROG_IF.into(), prog_if);

        self
    }

    /// Override the header layout, e.g. [`header_type::TYPE_01`] for a bridge.
    #[must_use]
    pub fn header_type(mut self, layout: u8) -> Self {
        self.header_type = layout & mask::HEADER_TYPE;
        self
    }

    /// Mark the device as a multifunction device.
    #[must_use]
    pub fn multifunction(mut self) -> Self {
        self.multifunction = true;
        self
    }

    /// Connect the device to a legacy interrupt pin (1 = INTA# .. 4 = INTD#).
    #[must_use]
    pub fn interrupt_pin(mut self, pin: u8) -> Self {
        self.interrupt_pin = pin;
        self
    }

    /// Set the initial value of the Command register.
    #[must_use]
    pub fn command(mut self, value: u16) -> Self {
        self.command = value & command::WRITABLE_BITS;
        self
    }

    fn add_bar(&mut self, index: usize, layout: BarLayout, size: u64) {
        assert!(index < MAX_BARS);
        assert_eq!(self.bars[index], None, "BAR {index} is already in use");
        assert!(size.is_power_of_two());

        self.bars[index] = Some(BarInfo {
            layout,
            size,
            address: 0,
        });
    }

    /// Add an I/O BAR. Size must be a power of two between 4 bytes and 64 KiB.
    #[must_use]
    pub fn io_bar(mut self, index: usize, size: u32) -> Self {
        assert!((4..=0x10000).contains(&size));

        self.add_bar(index, BarLayout::Io, size.into());
        self
    }

    /// Add a 32-bit memory BAR. Size must be a power of two of at least 16 bytes.
    #[must_use]
    pub fn mem32_bar(mut self, index: usize, size: u32, prefetchable: bool) -> Self {
        assert!(size >= 16);

        self.add_bar(index, BarLayout::Memory32 { prefetchable }, size.into());
        self
    }

    /// Add a 64-bit memory BAR that occupies `index` and `index + 1`.
    ///
    /// Use [`last_slot_mem64_bar`](Self::last_slot_mem64_bar) to model the broken case of a
    /// 64-bit BAR in the last slot.
    #[must_use]
    pub fn mem64_bar(mut self, index: usize, size: u64, prefetchable: bool) -> Self {
        assert!(size >= 16);
        assert!(index + 1 < MAX_BARS);

        self.add_bar(index, BarLayout::Memory64 { prefetchable }, size);
        self.add_bar(index + 1, BarLayout::Upper, 1);
        self
    }

    /// Add a 64-bit memory BAR in the last slot, which has no room for its upper half.
    #[must_use]
    pub fn last_slot_mem64_bar(mut self, size: u32) -> Self {
        self.add_bar(
            MAX_BARS - 1,
            BarLayout::Memory64 {
                prefetchable: false,
            },
            size.into(),
        );
        self
    }

    /// Preset the address of a BAR, as firmware would have done.
    #[must_use]
    pub fn bar_address(mut self, index: usize, address: u64) -> Self {
        let bar = self.bars[index]
            .as_mut()
            .unwrap_or_else(|| panic!("BAR {index} does not exist"));

        assert_eq!(address % bar.size, 0, "BAR address must be size aligned");
        bar.address = address;
        self
    }

    /// Add a PCI capability with the given body.
    ///
    /// The body must not contain the generic capability header. It is added automatically.
    #[must_use]
    pub fn capability<const CAP_SIZE: usize>(
        mut self,
        id: u8,
        regs: &RegisterSet<CAP_SIZE>,
    ) -> Self {
        let body = self.place_capability(id, CAP_SIZE);

        self.reg_builder.register_set_at(body, regs);
        self
    }

    /// Allocate space for a capability, link it into the list and return the offset of its body.
    fn place_capability(&mut self, id: u8, body_size: usize) -> usize {
        let start = self.next_capability_offset;
        let end = start + CAPABILITY_HEADER_SIZE + body_size;
        assert!(end <= config_space::SIZE, "capabilities exceed Configuration Space");

        let offset = start as u8;
        self.next_capability_offset = end.next_multiple_of(4);

        self.reg_builder
            .u8_ro_at(self.last_capability_pointer.into(), offset)
            .u8_ro_at(offset.into(), id);

        self.last_capability_pointer = offset + 1;
        usize::from(offset) + CAPABILITY_HEADER_SIZE
    }

    /// Add an MSI capability for a single vector.
    #[must_use]
    pub fn msi_capability(self, address_64: bool) -> Self {
        let writable_control = msi::control::ENABLE | msi::control::MULTIPLE_MESSAGE_ENABLE;

        if address_64 {
            let msi_cap: RegisterSet<14> = RegisterSetBuilder::<14>::new()
                .u16_le_at(0, msi::control::ADDRESS_64, writable_control)
                .u32_le_at(2, 0, 0xffff_fffc)
                .u32_le_rw_at(6, 0)
                .u16_le_rw_at(10, 0)
                .u16_le_ro_at(12, 0)
                .into();

            self.capability(capability_id::MSI, &msi_cap)
        } else {
            let msi_cap: RegisterSet<10> = RegisterSetBuilder::<10>::new()
                .u16_le_at(0, 0, writable_control)
                .u32_le_at(2, 0, 0xffff_fffc)
                .u16_le_rw_at(6, 0)
                .u16_le_ro_at(8, 0)
                .into();

            self.capability(capability_id::MSI, &msi_cap)
        }
    }

    /// Add an MSI-X capability.
    ///
    /// # Parameters
    ///
    /// - `count`: The number of MSI-X vectors.
    /// - `table_bar`/`table_offset`: The BAR and offset of the MSI-X table.
    /// - `pba_bar`/`pba_offset`: The BAR and offset of the Pending Bit Array.
    ///
    /// The BARs are not checked, so tests can describe broken devices.
    #[must_use]
    pub fn msix_capability(
        self,
        count: u16,
        table_bar: u8,
        table_offset: u32,
        pba_bar: u8,
        pba_offset: u32,
    ) -> Self {
        assert!(count > 0 && count <= msix::MAX_VECTORS);
        assert_eq!(table_offset & msix::table_info::REGION, 0);
        assert_eq!(pba_offset & msix::table_info::REGION, 0);

        let msix_cap: RegisterSet<10> = RegisterSetBuilder::<10>::new()
            // The capability stores the last valid table index.
            .u16_le_at(0, count - 1, msix::control::WRITABLE_BITS)
            .u32_le_ro_at(2, table_offset | u32::from(table_bar))
            .u32_le_ro_at(6, pba_offset | u32::from(pba_bar))
            .into();

        self.capability(capability_id::MSI_X, &msix_cap)
    }

    /// Add a vendor-specific capability. The length byte is computed from `payload`.
    #[must_use]
    pub fn vendor_capability(mut self, payload: &[u8]) -> Self {
        // ID, next pointer and the length byte itself.
        let length = u8::try_from(payload.len() + 3).expect("vendor capability too large");
        let body = self.place_capability(capability_id::VENDOR_SPECIFIC, payload.len() + 1);

        self.reg_builder.u8_ro_at(body, length);
        for (i, &byte) in payload.iter().enumerate() {
            self.reg_builder.u8_ro_at(body + 1 + i, byte);
        }

        self
    }

    fn finalize_bars(&mut self) {
        for (index, bar) in self.bars.iter().enumerate() {
            let pos = usize::from(offset::bar(index));

            let Some(bar) = bar else {
                // Unimplemented BARs are hardwired to zero.
                self.reg_builder.u32_le_ro_at(pos, 0);
                continue;
            };

            let size_mask = !(bar.size - 1);
            let prefetch = |prefetchable: bool| {
                if prefetchable {
                    mask::MMIO_BAR_PREFETCHABLE
                } else {
                    0
                }
            };

            match bar.layout {
                BarLayout::Io => {
                    self.reg_builder.u32_le_at(
                        pos,
                        (bar.address as u32 & mask::PIO_BAR_ADDRESS) | mask::PIO_BAR_MARKER,
                        size_mask as u32 & mask::PIO_BAR_ADDRESS,
                    );
                }
                BarLayout::Memory32 { prefetchable } => {
                    self.reg_builder.u32_le_at(
                        pos,
                        (bar.address as u32 & mask::MMIO_BAR_ADDRESS)
                            | mask::MMIO_BAR_TYPE_32
                            | prefetch(prefetchable),
                        size_mask as u32 & mask::MMIO_BAR_ADDRESS,
                    );
                }
                BarLayout::Memory64 { prefetchable } => {
                    self.reg_builder.u32_le_at(
                        pos,
                        (bar.address as u32 & mask::MMIO_BAR_ADDRESS)
                            | mask::MMIO_BAR_TYPE_64
                            | prefetch(prefetchable),
                        size_mask as u32 & mask::MMIO_BAR_ADDRESS,
                    );
                }
                BarLayout::Upper => {
                    let lower = self.bars[index - 1].expect("upper half without lower half");
                    let lower_mask = !(lower.size - 1);

                    self.reg_builder.u32_le_at(
                        pos,
                        (lower.address >> 32) as u32,
                        (lower_mask >> 32) as u32,
                    );
                }
            }
        }
    }

    /// Create the finalized function.
    #[must_use]
    pub fn build(mut self) -> EmulatedFunction {
        self.finalize_bars();

        let has_capabilities = self.next_capability_offset != INITIAL_CAPABILITY_OFFSET;

        let regs = self
            .reg_builder
            .u16_le_at(offset::COMMAND.into(), self.command, command::WRITABLE_BITS)
            // The error bits are write-one-to-clear in hardware. We never set them, so read-only
            // zero is the same.
            .u16_le_ro_at(
                offset::STATUS.into(),
                if has_capabilities {
                    status::CAPABILITIES
                } else {
                    0
                },
            )
            .u8_ro_at(
                offset::HEADER_TYPE.into(),
                self.header_type
                    | if self.multifunction {
                        header_type::MULTIFUNCTION
                    } else {
                        0
                    },
            )
            // 255 means "not connected" until firmware routes the interrupt.
            .u8_rw_at(offset::IRQ_LINE.into(), 0xff)
            .u8_ro_at(offset::IRQ_PIN.into(), self.interrupt_pin)
            // End the capability chain.
            .u8_ro_at(self.last_capability_pointer.into(), 0)
            .build();

        EmulatedFunction {
            regs,
            read_faults: BTreeSet::new(),
            write_faults: BTreeSet::new(),
            writes: Vec::new(),
        }
    }
}

/// A write the emulated function has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigWrite {
    /// The Configuration Space offset.
    pub offset: u16,
    /// The width of the access.
    pub size: RequestSize,
    /// The written value.
    pub value: u64,
}

/// The Configuration Space of an emulated PCI function.
#[derive(Debug, Clone)]
pub struct EmulatedFunction {
    regs: RegisterSet<{ config_space::SIZE }>,

    /// Dword offsets at which reads fail.
    read_faults: BTreeSet<u16>,

    /// Dword offsets at which writes fail.
    write_faults: BTreeSet<u16>,

    writes: Vec<ConfigWrite>,
}

/// An access hit an offset that was marked as failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedFault;

fn dword_of(offset: u16) -> u16 {
    offset & !0x3
}

impl EmulatedFunction {
    /// Make every access touching the dword that contains `offset` fail on read.
    pub fn fail_reads_at(&mut self, offset: u16) {
        self.read_faults.insert(dword_of(offset));
    }

    /// Make every access touching the dword that contains `offset` fail on write.
    pub fn fail_writes_at(&mut self, offset: u16) {
        self.write_faults.insert(dword_of(offset));
    }

    /// Remove all injected faults.
    pub fn clear_faults(&mut self) {
        self.read_faults.clear();
        self.write_faults.clear();
    }

    /// Overwrite a byte regardless of its writability.
    pub fn poke_u8(&mut self, offset: u16, value: u8) {
        self.regs
            .write_direct(Request::new(offset.into(), RequestSize::Size1), value.into());
    }

    /// Read a value without going through fault injection.
    #[must_use]
    pub fn peek(&self, offset: u16, size: RequestSize) -> u64 {
        self.regs.read(Request::new(offset.into(), size))
    }

    /// All successful writes in the order they happened.
    #[must_use]
    pub fn writes(&self) -> &[ConfigWrite] {
        &self.writes
    }

    /// Forget recorded writes.
    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    fn check(faults: &BTreeSet<u16>, req: Request) -> Result<(), InjectedFault> {
        if req
            .iter_bytes()
            .any(|byte| faults.contains(&dword_of(byte.addr as u16)))
        {
            Err(InjectedFault)
        } else {
            Ok(())
        }
    }

    /// Read with fault injection.
    pub fn read(&mut self, req: Request) -> Result<u64, InjectedFault> {
        Self::check(&self.read_faults, req)?;

        Ok(self.regs.read(req))
    }

    /// Write with fault injection. Successful writes are recorded.
    pub fn write(&mut self, req: Request, value: u64) -> Result<(), InjectedFault> {
        Self::check(&self.write_faults, req)?;

        self.writes.push(ConfigWrite {
            offset: req.addr as u16,
            size: req.size,
            value,
        });
        SingleThreadedBusDevice::write(&mut self.regs, req, value);
        Ok(())
    }
}
