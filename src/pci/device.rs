//! # PCI Devices
//!
//! A [`Device`] is a probed type 0 function. It keeps the decoded Configuration Space header, the
//! sized BARs and the capability list, and implements the device side of resource allocation and
//! interrupt setup.
//!
//! The expected order of operations is:
//!
//! 1. [`Device::probe`] for every location a bus walker finds,
//! 2. [`Device::get_bar_alloc_requests`] and [`Device::assign_resource`] once an allocator has
//!    picked addresses,
//! 3. [`Device::enable`],
//! 4. one of [`Device::allocate_irq`], [`Device::allocate_msi`] or [`Device::allocate_msix`].

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use tracing::{debug, debug_span, error, info, span::EnteredSpan, trace, warn, Span};

use super::{
    bar::{
        io_size_from_probe, mem32_size_from_probe, mem64_size_from_probe, Bar, BarKind, BarTable,
    },
    capability::{
        init_msi_capability, init_msix_capability, msix_table_count, Capability, CapabilityKind,
        MsixStructure,
    },
    config::{AccessError, ConfigAccess, ConfigAccessRef, ConfigSnapshot},
    constants::config_space::{
        capability_list, class, command, header_type, mask, msi, msix, offset, status, subclass,
        vendor, BRIDGE_BARS, HEADER_SIZE, MAX_BARS, SIZE,
    },
    location::Location,
    msix_table::{pba_bytes, table_bytes, MsixEntry, MsixTable},
    platform::{AccessRights, InterruptPlatform, MappedRegion, PhysicalMapper, VectorReservation},
    resource::{BarSizes, ResourceKind, ResourceRequest},
};
use crate::{interval::Interval, Error, Result, Violation};

/// Disables I/O and memory decoding while alive and restores the Command register on drop.
///
/// BAR sizing writes all ones into the BARs. With decoding enabled, the device would respond to
/// accesses anywhere in the address space in the meantime.
#[derive(Debug)]
struct DecodeDisabled<'a> {
    access: &'a dyn ConfigAccess,
    location: Location,
    command: u16,
}

impl<'a> DecodeDisabled<'a> {
    fn new(access: &'a dyn ConfigAccess, location: Location) -> Result<Self, AccessError> {
        let command = access.read_u16(location, offset::COMMAND)?;

        access.write_u16(
            location,
            offset::COMMAND,
            command & !(command::IO_ENABLE | command::MEMORY_ENABLE),
        )?;

        Ok(Self {
            access,
            location,
            command,
        })
    }
}

impl Drop for DecodeDisabled<'_> {
    fn drop(&mut self) {
        if let Err(e) = self
            .access
            .write_u16(self.location, offset::COMMAND, self.command)
        {
            error!("failed to restore command register {:#x}: {e}", self.command);
        }
    }
}

/// A BAR with the given attributes, or the invalid BAR if the probe found no writable bits.
fn sized_bar(bar: Bar) -> Bar {
    if bar.size == 0 {
        Bar::default()
    } else {
        Bar { valid: true, ..bar }
    }
}

fn probe_io_bar(
    access: &dyn ConfigAccess,
    location: Location,
    index: usize,
    raw: u32,
) -> Result<Bar, AccessError> {
    let reg = offset::bar(index);

    // I/O space is decoded with 16 bits.
    access.write_u32(location, reg, u32::from(u16::MAX))?;
    let readback = access.read_u32(location, reg)?;
    access.write_u32(location, reg, raw)?;

    Ok(sized_bar(Bar {
        io: true,
        addr: u64::from(raw & !mask::PIO_BAR_FLAGS),
        size: io_size_from_probe(readback),
        ..Default::default()
    }))
}

fn probe_mem32_bar(
    access: &dyn ConfigAccess,
    location: Location,
    index: usize,
    raw: u32,
) -> Result<Bar, AccessError> {
    let reg = offset::bar(index);

    access.write_u32(location, reg, u32::MAX)?;
    let readback = access.read_u32(location, reg)?;
    access.write_u32(location, reg, raw)?;

    Ok(sized_bar(Bar {
        prefetchable: raw & mask::MMIO_BAR_PREFETCHABLE != 0,
        addr: u64::from(raw & mask::MMIO_BAR_ADDRESS),
        size: mem32_size_from_probe(readback),
        ..Default::default()
    }))
}

fn probe_mem64_bar(
    access: &dyn ConfigAccess,
    location: Location,
    index: usize,
    raw_low: u32,
    raw_high: u32,
) -> Result<Bar, AccessError> {
    let low = offset::bar(index);
    let high = offset::bar(index + 1);

    access.write_u32(location, low, u32::MAX)?;
    let readback_low = access.read_u32(location, low)?;
    access.write_u32(location, high, u32::MAX)?;
    let readback_high = access.read_u32(location, high)?;

    access.write_u32(location, low, raw_low)?;
    access.write_u32(location, high, raw_high)?;

    Ok(sized_bar(Bar {
        size_64: true,
        prefetchable: raw_low & mask::MMIO_BAR_PREFETCHABLE != 0,
        addr: (u64::from(raw_high) << 32) | u64::from(raw_low & mask::MMIO_BAR_ADDRESS),
        size: mem64_size_from_probe((u64::from(readback_high) << 32) | u64::from(readback_low)),
        ..Default::default()
    }))
}

/// A probed PCI type 0 function.
#[derive(Debug)]
pub struct Device {
    location: Location,
    parent: Option<Location>,
    access: ConfigAccessRef,

    config: ConfigSnapshot,
    bars: BarTable,

    /// All capabilities in discovery order.
    capabilities: Vec<Capability>,
    /// Index into `capabilities` of the validated MSI capability.
    msi_cap: Option<usize>,
    /// Index into `capabilities` of the validated MSI-X capability.
    msix_cap: Option<usize>,

    /// The mapped MSI-X structures once MSI-X is allocated.
    msix_table: Option<MsixTable>,

    span: Span,
}

impl Device {
    /// Probe the function at `location` and construct a [`Device`] for it.
    ///
    /// Returns [`Error::NotFound`] for empty slots, unreadable functions and header layouts other
    /// than type 0. PCI-to-PCI bridges are [`Error::NotSupported`]. Failures to size the BARs or
    /// to walk the capability list are logged, the device is still returned.
    pub fn probe(
        access: ConfigAccessRef,
        location: Location,
        parent: Option<Location>,
    ) -> Result<Self> {
        let span = debug_span!("pci", %location);
        let _entered = span.enter();

        let vendor_id = access
            .read_u16(location, offset::VENDOR)
            .map_err(|_| Error::NotFound)?;
        if vendor_id == vendor::INVALID {
            return Err(Error::NotFound);
        }

        let read = |off| access.read_u8(location, off).map_err(|_| Error::NotFound);
        let base_class = read(offset::CLASS)?;
        let sub_class = read(offset::SUBCLASS)?;
        let layout = read(offset::HEADER_TYPE)? & mask::HEADER_TYPE;

        if layout != header_type::TYPE_00 {
            debug!("skipping header type {layout:#x}");
            return Err(Error::NotFound);
        }

        if base_class == class::BRIDGE && sub_class == subclass::PCI_TO_PCI_BRIDGE {
            debug!("PCI-to-PCI bridge, not a leaf device");
            return Err(Error::NotSupported);
        }

        let mut device = Self {
            location,
            parent,
            access,
            config: ConfigSnapshot::default(),
            bars: BarTable::default(),
            capabilities: Vec::new(),
            msi_cap: None,
            msix_cap: None,
            msix_table: None,
            span: span.clone(),
        };

        device.load_config()?;

        if let Err(e) = device.load_bars() {
            warn!("failed to load BARs: {e}");
        }

        if let Err(e) = device.probe_capabilities() {
            warn!("failed to probe capabilities: {e}");
        }

        info!(
            "found {:04x}:{:04x} class {:02x}:{:02x}:{:02x}",
            device.vendor_id(),
            device.device_id(),
            device.base_class(),
            device.sub_class(),
            device.interface()
        );

        Ok(device)
    }

    fn enter(&self) -> EnteredSpan {
        self.span.clone().entered()
    }

    /// Re-read the complete Configuration Space header.
    pub fn load_config(&mut self) -> Result<()> {
        self.config = self.access.read_config(self.location)?;
        Ok(())
    }

    /// The number of BARs the header layout has.
    fn bar_count(&self) -> Result<usize> {
        match self.header_type() {
            header_type::TYPE_00 => Ok(MAX_BARS),
            header_type::TYPE_01 => Ok(BRIDGE_BARS),
            other => {
                warn!("no BAR layout for header type {other:#x}");
                Err(Error::NotSupported)
            }
        }
    }

    /// Decode and size all BARs from the current configuration snapshot.
    ///
    /// I/O and memory decoding are disabled while the BARs are sized. The Command register is
    /// restored on every return path. The BAR table is only replaced if all BARs could be
    /// sized.
    pub fn load_bars(&mut self) -> Result<()> {
        let _span = self.enter();
        let count = self.bar_count()?;
        let access = Arc::clone(&self.access);
        let raw = self.config.base_addresses;

        let _decode = DecodeDisabled::new(access.as_ref(), self.location)?;
        let mut bars = BarTable::default();

        let mut index = 0;
        while index < count {
            match BarKind::from_raw(raw[index]) {
                Some(BarKind::Io) => {
                    bars[index] = probe_io_bar(access.as_ref(), self.location, index, raw[index])?;
                }
                Some(BarKind::Memory32) => {
                    bars[index] =
                        probe_mem32_bar(access.as_ref(), self.location, index, raw[index])?;
                }
                Some(BarKind::Memory64) if index + 1 >= count => {
                    warn!("BAR {index}: 64-bit BAR in the last slot, ignoring it");
                }
                Some(BarKind::Memory64) => {
                    bars[index] = probe_mem64_bar(
                        access.as_ref(),
                        self.location,
                        index,
                        raw[index],
                        raw[index + 1],
                    )?;
                    // The upper half stays invalid.
                    index += 1;
                }
                None => {
                    warn!("BAR {index}: reserved memory type in {:#x}", raw[index]);
                }
            }

            index += 1;
        }

        for (i, bar) in bars.iter().enumerate().filter(|(_, b)| b.valid) {
            trace!("BAR {i}: {bar}");

            for (j, other) in bars.iter().enumerate().skip(i + 1) {
                if bar.addr != 0
                    && other.valid
                    && other.io == bar.io
                    && bar.address_range().overlaps(&other.address_range())
                {
                    warn!("BAR {i} and BAR {j} overlap");
                }
            }
        }

        self.bars = bars;
        Ok(())
    }

    /// Walk the capability list and validate MSI and MSI-X capabilities.
    ///
    /// Previously found capabilities are discarded. If the walk fails, the capabilities found up
    /// to that point are kept.
    pub fn probe_capabilities(&mut self) -> Result<()> {
        let _span = self.enter();

        self.capabilities.clear();
        self.msi_cap = None;
        self.msix_cap = None;

        if self.config.status & status::CAPABILITIES == 0 {
            trace!("no capabilities");
            return Ok(());
        }

        let mut visited = [false; SIZE];
        let mut next = self.config.capabilities_ptr & mask::CAPABILITIES_POINTER;

        while next != capability_list::END_OF_LIST {
            let slot = usize::from(next);
            if slot < HEADER_SIZE || visited[slot] {
                warn!("capability list loops or points into the header at {next:#x}");
                return Err(Error::MalformedCapabilityList { offset: next });
            }
            visited[slot] = true;

            let id = self.access.read_u8(self.location, next.into())?;
            let cap = Capability::new(id, next);
            debug!("{cap}");

            self.capabilities.push(cap);
            let index = self.capabilities.len() - 1;

            match cap.kind() {
                CapabilityKind::Msi => {
                    match init_msi_capability(self.access.as_ref(), self.location, &cap) {
                        Ok(()) => self.msi_cap = Some(index),
                        Err(e) => warn!("ignoring MSI capability: {e}"),
                    }
                }
                CapabilityKind::Msix => {
                    match init_msix_capability(self.access.as_ref(), self.location, &cap) {
                        Ok(()) => self.msix_cap = Some(index),
                        Err(e) => warn!("ignoring MSI-X capability: {e}"),
                    }
                }
                CapabilityKind::VendorSpecific | CapabilityKind::Other => {}
            }

            next = self
                .access
                .read_u8(self.location, cap.register(capability_list::NEXT))?
                & mask::CAPABILITIES_POINTER;
        }

        Ok(())
    }

    /// Enable I/O and memory decoding and bus mastering.
    pub fn enable(&mut self) -> Result<()> {
        let _span = self.enter();

        let current = self.access.read_u16(self.location, offset::COMMAND)?;
        let enabled =
            current | command::IO_ENABLE | command::MEMORY_ENABLE | command::BUS_MASTER_ENABLE;

        self.access
            .write_u16(self.location, offset::COMMAND, enabled)?;
        self.config.command = enabled;

        debug!("command {current:#x} -> {enabled:#x}");
        Ok(())
    }

    /// Render the device, its BARs and its capabilities for diagnostics.
    #[must_use]
    pub fn dump(&self, indent: usize) -> String {
        Dump {
            device: self,
            indent,
        }
        .to_string()
    }

    /// Add the space the valid BARs need to `sizes`.
    pub fn compute_bar_sizes(&self, sizes: &mut BarSizes) {
        for bar in self.bars.iter().filter(|b| b.valid) {
            sizes.add_bar(bar);
        }
    }

    /// Append one request per valid BAR to `out`, in BAR order.
    pub fn get_bar_alloc_requests(&self, out: &mut impl Extend<ResourceRequest>) {
        let _span = self.enter();

        out.extend(
            self.bars
                .iter()
                .enumerate()
                .filter(|(_, bar)| bar.valid)
                .map(|(index, bar)| {
                    let request = ResourceRequest::for_bar(self.location, index as u8, bar);
                    debug!("{request}");
                    request
                }),
        );
    }

    /// Program `address` into the BAR of `request` and reload the device state.
    ///
    /// Only the address bits are written. The type bits of the BAR are read-only in hardware.
    /// `request` must come from [`get_bar_alloc_requests`](Self::get_bar_alloc_requests) of
    /// this device and `address` must honor its alignment.
    pub fn assign_resource(&mut self, request: &ResourceRequest, address: u64) -> Result<()> {
        let _span = self.enter();

        if request.location != self.location {
            error!("request of {} assigned to this device", request.location);
            return Err(Violation::ForeignRequest.into());
        }

        if !request.is_aligned(address) {
            error!("{address:#x} violates the alignment of {request}");
            return Err(Violation::UnalignedAddress {
                address,
                align: request.align,
            }
            .into());
        }

        let reg = offset::bar(request.bar_num.into());
        debug!("BAR {}: {} at {address:#x}", request.bar_num, request.kind);

        match request.kind {
            ResourceKind::IoRange => {
                self.access
                    .write_u32(self.location, reg, address as u32 & mask::PIO_BAR_ADDRESS)?;
            }
            ResourceKind::MmioRange => {
                self.access
                    .write_u32(self.location, reg, address as u32 & mask::MMIO_BAR_ADDRESS)?;
            }
            ResourceKind::Mmio64Range => {
                self.access
                    .write_u32(self.location, reg, address as u32 & mask::MMIO_BAR_ADDRESS)?;
                self.access
                    .write_u32(self.location, reg + 4, (address >> 32) as u32)?;
            }
        }

        self.load_config()?;
        self.load_bars()
    }

    /// A copy of the current BAR table.
    #[must_use]
    pub const fn read_bars(&self) -> BarTable {
        self.bars
    }

    /// Copy the `index`-th vendor-specific capability into `buf`.
    ///
    /// The copy starts at the capability ID and is truncated to the buffer. Returns the length
    /// the capability reports for itself.
    pub fn read_vendor_capability(&self, index: usize, buf: &mut [u8]) -> Result<usize> {
        let cap = self
            .capabilities
            .iter()
            .filter(|c| c.kind() == CapabilityKind::VendorSpecific)
            .nth(index)
            .ok_or(Error::NotFound)?;

        let length = usize::from(
            self.access
                .read_u8(self.location, cap.register(capability_list::VENDOR_LENGTH))?,
        );
        let copied = length.min(buf.len());

        for (i, byte) in buf[..copied].iter_mut().enumerate() {
            *byte = self.access.read_u8(self.location, cap.register(i as u16))?;
        }

        Ok(length)
    }

    /// Route the legacy interrupt pin of the device and return the platform vector.
    pub fn allocate_irq(&self, platform: &dyn InterruptPlatform) -> Result<u32> {
        let _span = self.enter();

        let pin = self.access.read_u8(self.location, offset::IRQ_PIN)?;
        if pin == 0 {
            debug!("no legacy interrupt pin");
            return Err(Error::NoResources);
        }

        let vector = platform.pin_to_vector(pin)?;
        self.access
            .write_u8(self.location, offset::IRQ_LINE, vector as u8)?;

        debug!("pin {pin} -> vector {vector}");
        Ok(vector)
    }

    fn check_vector_count(count: usize) -> Result<()> {
        if count != 1 {
            error!("{count} vectors requested");
            return Err(Violation::UnsupportedVectorCount(count).into());
        }

        Ok(())
    }

    /// Set up MSI with `count` vectors and return the first one.
    ///
    /// Only a single vector is supported. The vectors are returned to the platform if any later
    /// step fails.
    pub fn allocate_msi(&self, platform: &dyn InterruptPlatform, count: usize) -> Result<u32> {
        let _span = self.enter();

        Self::check_vector_count(count)?;
        let cap = self.msi_capability().ok_or(Error::NotSupported)?;

        let reservation = VectorReservation::allocate(platform, count)?;
        let message = platform.compute_msi_message(reservation.base(), 0, true)?;

        let control = self
            .access
            .read_u16(self.location, cap.register(msi::CONTROL))?;
        let address_64 = control & msi::control::ADDRESS_64 != 0;

        if !address_64 && message.address_high() != 0 {
            warn!("message address {:#x} needs 64-bit MSI", message.address);
            return Err(Error::InvalidArgument);
        }

        self.access.write_u16(
            self.location,
            cap.register(msi::CONTROL),
            control & !msi::control::ENABLE,
        )?;
        self.access.write_u32(
            self.location,
            cap.register(msi::ADDRESS_LOW),
            message.address_low(),
        )?;

        if address_64 {
            self.access.write_u32(
                self.location,
                cap.register(msi::ADDRESS_HIGH),
                message.address_high(),
            )?;
            self.access
                .write_u16(self.location, cap.register(msi::DATA_64), message.data)?;
        } else {
            self.access
                .write_u16(self.location, cap.register(msi::DATA_32), message.data)?;
        }

        self.access.write_u16(
            self.location,
            cap.register(msi::CONTROL),
            (control & !msi::control::MULTIPLE_MESSAGE_ENABLE) | msi::control::ENABLE,
        )?;
        self.access
            .write_u8(self.location, offset::IRQ_LINE, reservation.base() as u8)?;

        debug!(
            "MSI vector {} address {:#x} data {:#x}",
            reservation.base(),
            message.address,
            message.data
        );
        Ok(reservation.commit())
    }

    fn map_msix_structure(
        &self,
        mapper: &dyn PhysicalMapper,
        name: &str,
        structure: MsixStructure,
        length: usize,
        access: AccessRights,
    ) -> Result<MappedRegion> {
        let bar = self
            .bars
            .get(usize::from(structure.bar))
            .filter(|bar| bar.valid && !bar.io)
            .ok_or_else(|| {
                warn!("{name} in unusable BAR {}", structure.bar);
                Error::InvalidArgument
            })?;

        let start = u64::from(structure.offset);
        let end = start + length as u64;
        if !(0..bar.size).contains_interval(&(start..end)) {
            warn!("{name} at {start:#x}+{length:#x} exceeds BAR {}", structure.bar);
            return Err(Error::InvalidArgument);
        }

        let phys = bar.addr.checked_add(start).ok_or_else(|| {
            warn!("{name} at {start:#x} wraps BAR {} at {:#x}", structure.bar, bar.addr);
            Error::InvalidArgument
        })?;

        MappedRegion::map(mapper, name, phys, length, access)
    }

    /// Set up MSI-X with `count` vectors and return the first one.
    ///
    /// The table and PBA are mapped through `mapper`. All table entries are masked before the
    /// requested ones are programmed. Only a single vector is supported.
    pub fn allocate_msix(
        &mut self,
        platform: &dyn InterruptPlatform,
        mapper: &dyn PhysicalMapper,
        count: usize,
    ) -> Result<u32> {
        let _span = self.enter();

        Self::check_vector_count(count)?;
        let cap = self.msix_capability().ok_or(Error::NotSupported)?;

        let control = self
            .access
            .read_u16(self.location, cap.register(msix::CONTROL))?;
        let table_count = msix_table_count(control);
        let table_info = MsixStructure::from_info(
            self.access
                .read_u32(self.location, cap.register(msix::TABLE_INFO))?,
        );
        let pba_info = MsixStructure::from_info(
            self.access
                .read_u32(self.location, cap.register(msix::PBA_INFO))?,
        );
        trace!("MSI-X: {table_count} entries, table {table_info:?}, pba {pba_info:?}");

        if count > usize::from(table_count) {
            debug!("{count} vectors requested, table has {table_count}");
            return Err(Error::NoResources);
        }

        let reservation = VectorReservation::allocate(platform, count)?;

        let table = self.map_msix_structure(
            mapper,
            "msix table",
            table_info,
            table_bytes(table_count),
            AccessRights::ReadWrite,
        )?;
        let pba = self.map_msix_structure(
            mapper,
            "msix pba",
            pba_info,
            pba_bytes(table_count),
            AccessRights::ReadOnly,
        )?;
        let table = MsixTable::new(table, pba, table_count);

        let message = platform.compute_msi_message(reservation.base(), 0, true)?;

        table.mask_all()?;
        for vector in 0..count as u16 {
            table.program(vector, message)?;
        }

        self.access.write_u16(
            self.location,
            cap.register(msix::CONTROL),
            (control | msix::control::ENABLE) & !msix::control::FUNCTION_MASK,
        )?;
        self.access
            .write_u8(self.location, offset::IRQ_LINE, reservation.base() as u8)?;

        debug!(
            "MSI-X vector {} address {:#x} data {:#x}",
            reservation.base(),
            message.address,
            message.data
        );
        self.msix_table = Some(table);
        Ok(reservation.commit())
    }

    /// Read back an entry of the MSI-X table. Requires a prior [`allocate_msix`](Self::allocate_msix).
    pub fn msix_entry(&self, vector: u16) -> Result<MsixEntry> {
        self.msix_table.as_ref().ok_or(Error::NotFound)?.entry(vector)
    }

    /// Check the pending bit of an MSI-X vector. Requires a prior
    /// [`allocate_msix`](Self::allocate_msix).
    pub fn msix_pending(&self, vector: u16) -> Result<bool> {
        self.msix_table
            .as_ref()
            .ok_or(Error::NotFound)?
            .pending(vector)
    }

    /// The location of the device.
    #[must_use]
    pub const fn location(&self) -> Location {
        self.location
    }

    /// The location of the bridge the device is behind, if any.
    #[must_use]
    pub const fn parent(&self) -> Option<Location> {
        self.parent
    }

    /// The decoded Configuration Space header.
    #[must_use]
    pub const fn config(&self) -> &ConfigSnapshot {
        &self.config
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn vendor_id(&self) -> u16 {
        self.config.vendor_id
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn device_id(&self) -> u16 {
        self.config.device_id
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn base_class(&self) -> u8 {
        self.config.base_class
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn sub_class(&self) -> u8 {
        self.config.sub_class
    }

    /// The programming interface.
    #[must_use]
    pub const fn interface(&self) -> u8 {
        self.config.prog_if
    }

    /// The header layout without the multifunction bit.
    #[must_use]
    pub const fn header_type(&self) -> u8 {
        self.config.header_type & mask::HEADER_TYPE
    }

    /// All capabilities in list order.
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// The validated MSI capability.
    #[must_use]
    pub fn msi_capability(&self) -> Option<Capability> {
        self.msi_cap.map(|i| self.capabilities[i])
    }

    /// The validated MSI-X capability.
    #[must_use]
    pub fn msix_capability(&self) -> Option<Capability> {
        self.msix_cap.map(|i| self.capabilities[i])
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn has_msi(&self) -> bool {
        self.msi_cap.is_some()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn has_msix(&self) -> bool {
        self.msix_cap.is_some()
    }
}

struct Dump<'a> {
    device: &'a Device,
    indent: usize,
}

impl Display for Dump<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let d = self.device;
        let pad = "";

        writeln!(
            f,
            "{pad:w$}{} {:04x}:{:04x} class {:02x}:{:02x}:{:02x}{}{}",
            d.location,
            d.vendor_id(),
            d.device_id(),
            d.base_class(),
            d.sub_class(),
            d.interface(),
            if d.has_msi() { " msi" } else { "" },
            if d.has_msix() { " msix" } else { "" },
            w = self.indent
        )?;

        for (i, bar) in d.bars.iter().enumerate().filter(|(_, b)| b.valid) {
            writeln!(f, "{pad:w$}BAR {i}: {bar}", w = self.indent + 2)?;
        }

        for cap in &d.capabilities {
            writeln!(f, "{pad:w$}{cap}", w = self.indent + 4)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::{
        emulation::{
            bus::RequestSize,
            function::{ConfigWrite, EmulatedFunction, EmulatedFunctionBuilder},
            platform::{EmulatedPlatform, FIRST_DYNAMIC_VECTOR, LEGACY_VECTOR_BASE},
            segment::EmulatedSegment,
        },
        pci::{
            constants::config_space::capability_id, msi_message::MsiMessage, resource::WindowSize,
        },
    };

    const LOC: Location = Location::new(0, 3, 0);

    fn segment_with(function: EmulatedFunction) -> Arc<EmulatedSegment> {
        Arc::new(EmulatedSegment::new().with_function(LOC, function))
    }

    fn probe(segment: &Arc<EmulatedSegment>) -> Result<Device> {
        Device::probe(segment.clone(), LOC, None)
    }

    fn nic() -> EmulatedFunctionBuilder {
        EmulatedFunctionBuilder::new(vendor::REALTEK, 0x8139).class(
            class::NETWORK,
            subclass::ETHERNET,
            0,
        )
    }

    fn peek(segment: &EmulatedSegment, offset: u16, size: RequestSize) -> u64 {
        segment.function(LOC).peek(offset, size)
    }

    #[test]
    fn memory_bar_of_64k_is_decoded() {
        let segment = segment_with(nic().mem32_bar(0, 0x10000, false).build());
        let device = probe(&segment).unwrap();

        let bar = device.read_bars()[0];
        assert!(bar.valid);
        assert!(!bar.io);
        assert!(!bar.size_64);
        assert_eq!(bar.size, 0x10000);
        assert!(device.read_bars()[1..].iter().all(|b| !b.valid));
    }

    #[test]
    fn empty_slots_are_not_found() {
        let segment = segment_with(nic().build());

        assert_eq!(
            Device::probe(segment, Location::new(0, 4, 0), None).map(|d| d.location()),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn unreadable_functions_are_not_found() {
        let segment = segment_with(nic().build());
        segment.function(LOC).fail_reads_at(offset::CLASS);

        assert_eq!(probe(&segment).map(|d| d.location()), Err(Error::NotFound));
    }

    #[test]
    fn other_header_types_are_not_found() {
        let segment = segment_with(nic().header_type(header_type::TYPE_01).build());

        assert_eq!(probe(&segment).map(|d| d.location()), Err(Error::NotFound));
    }

    #[test]
    fn multifunction_bit_is_ignored() {
        let segment = segment_with(nic().multifunction().build());
        let device = probe(&segment).unwrap();

        assert_eq!(device.header_type(), header_type::TYPE_00);
        assert_eq!(device.config().header_type, header_type::MULTIFUNCTION);
    }

    #[test]
    fn bridges_are_not_supported() {
        let segment = segment_with(
            EmulatedFunctionBuilder::new(vendor::REDHAT, 0x0001)
                .class(class::BRIDGE, subclass::PCI_TO_PCI_BRIDGE, 0)
                .build(),
        );

        assert_eq!(
            probe(&segment).map(|d| d.location()),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn config_load_failure_fails_probe() {
        let segment = segment_with(nic().build());
        segment.function(LOC).fail_reads_at(offset::ROM_BAR);

        assert_eq!(
            probe(&segment).map(|d| d.location()),
            Err(Error::Access(AccessError::read(LOC, offset::ROM_BAR)))
        );
    }

    #[test]
    fn bar_sizing_restores_device_state() {
        let initial = command::IO_ENABLE | command::MEMORY_ENABLE | command::BUS_MASTER_ENABLE;
        let segment = segment_with(
            nic()
                .command(initial)
                .io_bar(0, 0x100)
                .mem32_bar(1, 0x1000, false)
                .bar_address(0, 0xc000)
                .bar_address(1, 0xfebf_1000)
                .build(),
        );
        let _device = probe(&segment).unwrap();

        let writes = segment.function(LOC).writes().to_vec();
        assert_eq!(
            writes.first(),
            Some(&ConfigWrite {
                offset: offset::COMMAND,
                size: RequestSize::Size2,
                value: u64::from(command::BUS_MASTER_ENABLE)
            })
        );
        assert_eq!(
            writes.last(),
            Some(&ConfigWrite {
                offset: offset::COMMAND,
                size: RequestSize::Size2,
                value: u64::from(initial)
            })
        );
        assert_eq!(peek(&segment, offset::bar(0), RequestSize::Size4), 0xc001);
        assert_eq!(
            peek(&segment, offset::bar(1), RequestSize::Size4),
            0xfebf_1000
        );
    }

    #[test]
    fn command_is_restored_when_sizing_fails() {
        let initial = command::IO_ENABLE | command::MEMORY_ENABLE;
        let segment = segment_with(
            nic()
                .command(initial)
                .mem32_bar(0, 0x1000, false)
                .mem32_bar(2, 0x1000, false)
                .build(),
        );
        let mut device = probe(&segment).unwrap();
        let bars = device.read_bars();

        segment.function(LOC).fail_writes_at(offset::bar(2));
        assert_eq!(
            device.load_bars(),
            Err(Error::Access(AccessError::write(LOC, offset::bar(2))))
        );

        assert_eq!(
            peek(&segment, offset::COMMAND, RequestSize::Size2),
            u64::from(initial)
        );
        // The table is not partially updated.
        assert_eq!(device.read_bars(), bars);
    }

    #[test]
    fn bar_failures_do_not_fail_probe() {
        let segment = segment_with(nic().mem32_bar(0, 0x1000, false).build());
        segment.function(LOC).fail_writes_at(offset::bar(0));

        let device = probe(&segment).unwrap();
        assert!(device.read_bars().iter().all(|b| !b.valid));
    }

    #[test]
    fn bar_64_consumes_two_slots() {
        let segment = segment_with(
            nic()
                .mem64_bar(0, 0x20_0000, true)
                .bar_address(0, 0x8_0000_0000)
                .io_bar(2, 0x20)
                .build(),
        );
        let bars = probe(&segment).unwrap().read_bars();

        assert_eq!(
            bars[0],
            Bar {
                valid: true,
                io: false,
                size_64: true,
                prefetchable: true,
                addr: 0x8_0000_0000,
                size: 0x20_0000
            }
        );
        assert!(!bars[1].valid);
        assert!(bars[2].valid && bars[2].io);
        assert_eq!(bars[2].size, 0x20);
    }

    #[test]
    fn bar_64_in_last_slot_is_skipped() {
        let segment = segment_with(nic().last_slot_mem64_bar(0x1000).build());
        let bars = probe(&segment).unwrap().read_bars();

        assert!(bars.iter().all(|b| !b.valid));
    }

    /// Make a BAR read back `value` no matter what is written to it.
    fn hardwire_bar(segment: &EmulatedSegment, index: usize, value: u32) {
        let mut function = segment.function(LOC);
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            function.poke_u8(offset::bar(index) + i as u16, byte);
        }
    }

    #[test]
    fn hardwired_bars_are_sized_by_their_lowest_address_bit() {
        let segment = segment_with(nic().build());
        hardwire_bar(&segment, 0, 0x14);
        let device = probe(&segment).unwrap();

        let bar = device.read_bars()[0];
        assert!(bar.valid);
        assert!(bar.size_64);
        assert_eq!(bar.addr, 0x10);
        assert_eq!(bar.size, 0x10);
        assert!(!device.read_bars()[1].valid);

        let mut sizes = BarSizes::default();
        device.compute_bar_sizes(&mut sizes);
        assert_eq!(sizes.mmio64, WindowSize { size: 0x1000, align: 12 });

        let mut requests = Vec::new();
        device.get_bar_alloc_requests(&mut requests);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].size, 0x1000);
        assert_eq!(requests[0].align, 12);
    }

    #[test]
    fn gaps_in_writable_bar_bits_are_ignored() {
        let segment = segment_with(nic().build());
        hardwire_bar(&segment, 2, 0xf0f0_000c);
        hardwire_bar(&segment, 3, 0x8000_0000);
        let device = probe(&segment).unwrap();

        let bar = device.read_bars()[2];
        assert!(bar.valid);
        assert_eq!(bar.addr, 0x8000_0000_f0f0_0000);
        assert_eq!(bar.size, 0x10_0000);

        let mut requests = Vec::new();
        device.get_bar_alloc_requests(&mut requests);
        assert_eq!(requests[0].size, 0x10_0000);
        assert_eq!(requests[0].align, 20);
    }

    #[test]
    fn capability_chain_is_walked_in_order() {
        let segment = segment_with(
            nic()
                .mem32_bar(0, 0x4000, false)
                .msi_capability(true)
                .msix_capability(4, 0, 0, 0, 0x2000)
                .build(),
        );
        let device = probe(&segment).unwrap();

        assert!(device.has_msi());
        assert!(device.has_msix());
        assert_eq!(
            device.capabilities(),
            &[Capability::new(0x05, 0x40), Capability::new(0x11, 0x50)]
        );
    }

    #[test]
    fn no_capability_flag_means_no_capabilities() {
        let segment = segment_with(nic().build());
        let device = probe(&segment).unwrap();

        assert!(device.capabilities().is_empty());
        assert!(!device.has_msi());
        assert!(!device.has_msix());
    }

    #[test]
    fn failed_capability_reads_keep_earlier_capabilities() {
        let segment = segment_with(
            nic()
                .msi_capability(true)
                .msix_capability(4, 0, 0, 0, 0x2000)
                .build(),
        );
        let mut device = probe(&segment).unwrap();

        segment.function(LOC).fail_reads_at(0x50);
        assert_eq!(
            device.probe_capabilities(),
            Err(Error::Access(AccessError::read(LOC, 0x50)))
        );

        assert_eq!(device.capabilities(), &[Capability::new(0x05, 0x40)]);
        // The MSI capability overlaps the failing dword and is not validated.
        assert!(!device.has_msi());
        assert!(!device.has_msix());
    }

    #[test]
    fn looping_capability_lists_are_rejected() {
        let segment = segment_with(
            nic()
                .msi_capability(true)
                .msix_capability(4, 0, 0, 0, 0x2000)
                .build(),
        );
        let mut device = probe(&segment).unwrap();

        segment.function(LOC).poke_u8(0x51, 0x40);
        assert_eq!(
            device.probe_capabilities(),
            Err(Error::MalformedCapabilityList { offset: 0x40 })
        );
        assert_eq!(device.capabilities().len(), 2);

        segment.function(LOC).poke_u8(0x51, 0x10);
        assert_eq!(
            device.probe_capabilities(),
            Err(Error::MalformedCapabilityList { offset: 0x10 })
        );
    }

    #[test]
    fn self_referencing_capability_does_not_hang_probe() {
        let segment = segment_with(nic().vendor_capability(&[0xaa]).build());
        segment.function(LOC).poke_u8(0x41, 0x40);

        let device = probe(&segment).unwrap();
        assert_eq!(device.capabilities(), &[Capability::new(0x09, 0x40)]);
    }

    /// Link an MSI capability with the given Message Control value at `0xf0` behind the vendor
    /// capability at `0x40`.
    fn msi_at_end_of_config_space(control: u16) -> Arc<EmulatedSegment> {
        let segment = segment_with(nic().vendor_capability(&[0xaa]).build());
        {
            let mut function = segment.function(LOC);
            function.poke_u8(0x41, 0xf0);
            function.poke_u8(0xf0, capability_id::MSI);
            function.poke_u8(0xf1, capability_list::END_OF_LIST);
            function.poke_u8(0xf2, control as u8);
            function.poke_u8(0xf3, (control >> 8) as u8);
        }
        segment
    }

    #[test]
    fn msi_32_fits_at_the_end_of_config_space() {
        let segment = msi_at_end_of_config_space(0);
        let device = probe(&segment).unwrap();

        assert_eq!(
            device.capabilities(),
            &[Capability::new(0x09, 0x40), Capability::new(0x05, 0xf0)]
        );
        assert!(device.has_msi());
        assert_eq!(device.msi_capability(), Some(Capability::new(0x05, 0xf0)));
        assert!(device.allocate_msi(&EmulatedPlatform::new(), 1).is_ok());
    }

    #[test]
    fn msi_with_masking_does_not_fit_at_the_end_of_config_space() {
        let segment =
            msi_at_end_of_config_space(msi::control::ADDRESS_64 | msi::control::PER_VECTOR_MASKING);
        let device = probe(&segment).unwrap();

        assert_eq!(device.capabilities().len(), 2);
        assert!(!device.has_msi());
    }

    #[test]
    fn vendor_capabilities_are_indexed_among_themselves() {
        let segment = segment_with(
            nic()
                .vendor_capability(&[0x11, 0x22])
                .msi_capability(false)
                .vendor_capability(&[0x33, 0x44, 0x55, 0x66])
                .build(),
        );
        let device = probe(&segment).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(device.read_vendor_capability(1, &mut buf), Ok(7));
        assert_eq!(buf[0], 0x09);
        assert_eq!(&buf[2..7], &[7, 0x33, 0x44, 0x55, 0x66]);

        let mut short = [0u8; 3];
        assert_eq!(device.read_vendor_capability(0, &mut short), Ok(5));
        assert_eq!(short[2], 5);

        assert_eq!(
            device.read_vendor_capability(2, &mut buf),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn enable_turns_on_decoding_and_bus_mastering() {
        let segment = segment_with(nic().build());
        let mut device = probe(&segment).unwrap();

        device.enable().unwrap();

        assert_eq!(
            peek(&segment, offset::COMMAND, RequestSize::Size2),
            u64::from(command::IO_ENABLE | command::MEMORY_ENABLE | command::BUS_MASTER_ENABLE)
        );
    }

    #[test]
    fn requests_follow_bar_order() {
        let segment = segment_with(nic().mem64_bar(0, 0x20_0000, true).io_bar(2, 0x20).build());
        let device = probe(&segment).unwrap();

        let mut requests = Vec::new();
        device.get_bar_alloc_requests(&mut requests);

        assert_eq!(
            requests,
            vec![
                ResourceRequest {
                    location: LOC,
                    bar_num: 0,
                    kind: ResourceKind::Mmio64Range,
                    size: 0x20_0000,
                    align: 21,
                    prefetchable: true,
                },
                ResourceRequest {
                    location: LOC,
                    bar_num: 2,
                    kind: ResourceKind::IoRange,
                    size: 0x20,
                    align: 4,
                    prefetchable: false,
                },
            ]
        );
    }

    #[test]
    fn bar_sizes_are_accumulated() {
        let segment = segment_with(
            nic()
                .mem32_bar(0, 0x100, false)
                .mem32_bar(1, 0x4000, false)
                .io_bar(2, 0x8)
                .build(),
        );
        let device = probe(&segment).unwrap();

        let mut sizes = BarSizes::default();
        device.compute_bar_sizes(&mut sizes);

        assert_eq!(sizes.mmio, WindowSize { size: 0x5000, align: 14 });
        assert_eq!(sizes.io, WindowSize { size: 0x10, align: 4 });
        assert_eq!(sizes.prefetchable64, WindowSize::default());
    }

    #[test]
    fn assigned_addresses_are_visible() {
        let segment = segment_with(
            nic()
                .mem64_bar(0, 0x20_0000, true)
                .io_bar(2, 0x20)
                .mem32_bar(3, 0x1000, false)
                .build(),
        );
        let mut device = probe(&segment).unwrap();
        let raw_before = device.config().base_addresses;

        let mut requests = Vec::new();
        device.get_bar_alloc_requests(&mut requests);

        for (request, address) in requests
            .iter()
            .zip([0x8_0020_0000_u64, 0xc020, 0xfebf_2000])
        {
            device.assign_resource(request, address).unwrap();
        }

        let bars = device.read_bars();
        assert_eq!(bars[0].addr, 0x8_0020_0000);
        assert_eq!(bars[2].addr, 0xc020);
        assert_eq!(bars[3].addr, 0xfebf_2000);

        let raw_after = device.config().base_addresses;
        for (i, bar) in bars.iter().enumerate().filter(|(_, b)| b.valid) {
            let flags = if bar.io {
                mask::PIO_BAR_FLAGS
            } else {
                mask::MMIO_BAR_FLAGS
            };
            assert_eq!(raw_before[i] & flags, raw_after[i] & flags);
        }
    }

    #[test]
    fn unaligned_assignments_are_contract_violations() {
        let segment = segment_with(nic().mem32_bar(0, 0x4000, false).build());
        let mut device = probe(&segment).unwrap();

        let mut requests = Vec::new();
        device.get_bar_alloc_requests(&mut requests);
        segment.function(LOC).clear_writes();

        assert_eq!(
            device.assign_resource(&requests[0], 0xfebf_1000),
            Err(Error::ContractViolation(Violation::UnalignedAddress {
                address: 0xfebf_1000,
                align: 14
            }))
        );
        assert!(segment.function(LOC).writes().is_empty());
    }

    #[test]
    fn foreign_requests_are_contract_violations() {
        let segment = segment_with(nic().mem32_bar(0, 0x4000, false).build());
        let mut device = probe(&segment).unwrap();

        let mut requests = Vec::new();
        device.get_bar_alloc_requests(&mut requests);
        requests[0].location = Location::new(0, 4, 0);

        assert_eq!(
            device.assign_resource(&requests[0], 0xfebf_0000),
            Err(Error::ContractViolation(Violation::ForeignRequest))
        );
    }

    #[test]
    fn no_interrupt_pin_means_no_legacy_interrupt() {
        let segment = segment_with(nic().build());
        let device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();
        segment.function(LOC).clear_writes();

        assert_eq!(device.allocate_irq(&platform), Err(Error::NoResources));
        assert!(segment.function(LOC).writes().is_empty());
    }

    #[test]
    fn legacy_interrupts_are_routed() {
        let segment = segment_with(nic().interrupt_pin(2).build());
        let device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();

        assert_eq!(device.allocate_irq(&platform), Ok(LEGACY_VECTOR_BASE + 1));
        assert_eq!(
            peek(&segment, offset::IRQ_LINE, RequestSize::Size1),
            u64::from(LEGACY_VECTOR_BASE + 1)
        );
    }

    #[test]
    fn msi_needs_the_capability() {
        let segment = segment_with(nic().build());
        let device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();

        assert_eq!(device.allocate_msi(&platform, 1), Err(Error::NotSupported));
        assert_eq!(
            device.allocate_msi(&platform, 2),
            Err(Error::ContractViolation(Violation::UnsupportedVectorCount(2)))
        );
    }

    #[test]
    fn msi_64_is_programmed_and_enabled() {
        let segment = segment_with(nic().msi_capability(true).build());
        let device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();

        let vector = device.allocate_msi(&platform, 1).unwrap();
        assert_eq!(vector, FIRST_DYNAMIC_VECTOR);

        let control = peek(&segment, 0x42, RequestSize::Size2) as u16;
        assert_ne!(control & msi::control::ENABLE, 0);
        assert_eq!(control & msi::control::MULTIPLE_MESSAGE_ENABLE, 0);
        assert_eq!(peek(&segment, 0x44, RequestSize::Size4), 0xfee0_0000);
        assert_eq!(peek(&segment, 0x48, RequestSize::Size4), 0);
        assert_eq!(peek(&segment, 0x4c, RequestSize::Size2), u64::from(vector));
        assert_eq!(
            peek(&segment, offset::IRQ_LINE, RequestSize::Size1),
            u64::from(vector)
        );
        assert!(platform.freed_vectors().is_empty());
    }

    #[test]
    fn msi_32_puts_data_after_the_address() {
        let segment = segment_with(nic().msi_capability(false).build());
        let device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();

        let vector = device.allocate_msi(&platform, 1).unwrap();

        assert_eq!(peek(&segment, 0x44, RequestSize::Size4), 0xfee0_0000);
        assert_eq!(peek(&segment, 0x48, RequestSize::Size2), u64::from(vector));
    }

    #[test]
    fn msi_vectors_are_returned_on_failure() {
        let segment = segment_with(nic().msi_capability(true).build());
        let device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();
        platform.fail_msi_messages();

        assert_eq!(device.allocate_msi(&platform, 1), Err(Error::NotSupported));
        assert_eq!(platform.freed_vectors(), vec![(FIRST_DYNAMIC_VECTOR, 1)]);

        let segment = segment_with(nic().msi_capability(true).build());
        let device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();
        segment.function(LOC).fail_writes_at(0x44);

        assert!(matches!(
            device.allocate_msi(&platform, 1),
            Err(Error::Access(_))
        ));
        assert_eq!(platform.freed_vectors(), vec![(FIRST_DYNAMIC_VECTOR, 1)]);
    }

    const MSIX_BAR: u64 = 0xfebf_0000;

    fn msix_nic(table_bar: u8) -> Arc<EmulatedSegment> {
        segment_with(
            nic()
                .mem32_bar(0, 0x4000, false)
                .bar_address(0, MSIX_BAR)
                .msi_capability(true)
                .msix_capability(8, table_bar, 0x1000, 0, 0x2000)
                .build(),
        )
    }

    #[test]
    fn msix_masks_everything_but_the_requested_vectors() {
        let segment = msix_nic(0);
        let mut device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();
        platform
            .memory()
            .fill(MSIX_BAR + 0x1000, table_bytes(8), 0xdead_beef);

        let vector = device.allocate_msix(&platform, &platform, 1).unwrap();

        assert_eq!(
            device.msix_entry(0),
            Ok(MsixEntry {
                message: MsiMessage::new(0xfee0_0000, vector as u16),
                masked: false
            })
        );
        for v in 1..8 {
            assert_eq!(
                device.msix_entry(v),
                Ok(MsixEntry {
                    message: MsiMessage::default(),
                    masked: true
                })
            );
        }
        assert_eq!(device.msix_pending(0), Ok(false));

        let control = peek(&segment, 0x52, RequestSize::Size2) as u16;
        assert_ne!(control & msix::control::ENABLE, 0);
        assert_eq!(control & msix::control::FUNCTION_MASK, 0);
        assert_eq!(
            peek(&segment, offset::IRQ_LINE, RequestSize::Size1),
            u64::from(vector)
        );
        assert_eq!(
            platform.mappings(),
            vec![(MSIX_BAR + 0x1000, 0x1000), (MSIX_BAR + 0x2000, 0x1000)]
        );
    }

    #[test]
    fn msix_in_missing_bar_is_invalid() {
        let segment = msix_nic(1);
        let mut device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();

        assert_eq!(
            device.allocate_msix(&platform, &platform, 1),
            Err(Error::InvalidArgument)
        );
        assert_eq!(platform.freed_vectors(), vec![(FIRST_DYNAMIC_VECTOR, 1)]);
        assert_eq!(device.msix_entry(0), Err(Error::NotFound));
    }

    #[test]
    fn msix_mapping_failures_return_the_vector() {
        let segment = msix_nic(0);
        let mut device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();
        platform.fail_mappings();

        assert_eq!(
            device.allocate_msix(&platform, &platform, 1),
            Err(Error::NoMemory)
        );
        assert_eq!(platform.freed_vectors(), vec![(FIRST_DYNAMIC_VECTOR, 1)]);
    }

    #[test]
    fn msix_structures_that_wrap_the_address_space_are_invalid() {
        let segment = msix_nic(0);
        let mut device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();
        device.bars[0].addr = u64::MAX - 0xfff;

        assert_eq!(
            device.allocate_msix(&platform, &platform, 1),
            Err(Error::InvalidArgument)
        );
        assert!(platform.mappings().is_empty());
        assert_eq!(platform.freed_vectors(), vec![(FIRST_DYNAMIC_VECTOR, 1)]);
    }

    #[test]
    fn msix_needs_the_capability() {
        let segment = segment_with(nic().msi_capability(true).build());
        let mut device = probe(&segment).unwrap();
        let platform = EmulatedPlatform::new();

        assert_eq!(
            device.allocate_msix(&platform, &platform, 1),
            Err(Error::NotSupported)
        );
        assert_eq!(
            device.allocate_msix(&platform, &platform, 0),
            Err(Error::ContractViolation(Violation::UnsupportedVectorCount(0)))
        );
    }

    #[test]
    fn dump_lists_bars_and_capabilities() {
        let segment = msix_nic(0);
        let device = probe(&segment).unwrap();

        assert_eq!(
            device.dump(2),
            "  00:03.0 10ec:8139 class 02:00:00 msi msix\n\
             \x20   BAR 0: mem32 addr 0xfebf0000 size 0x4000\n\
             \x20     capability: offset 0x40 id 0x5\n\
             \x20     capability: offset 0x50 id 0x11\n"
        );
    }

    fn arbitrary_function() -> impl Strategy<Value = EmulatedFunction> {
        (
            prop::option::of(12u32..20),
            prop::option::of(2u32..9),
            prop::option::of((12u32..33, any::<bool>())),
        )
            .prop_map(|(mem32, io, mem64)| {
                let mut builder = nic();
                if let Some(log2) = mem32 {
                    builder = builder.mem32_bar(0, 1 << log2, false);
                }
                if let Some(log2) = io {
                    builder = builder.io_bar(1, 1 << log2);
                }
                if let Some((log2, prefetchable)) = mem64 {
                    builder = builder.mem64_bar(2, 1 << log2, prefetchable);
                }
                builder.build()
            })
    }

    proptest! {
        #[test]
        fn load_bars_is_idempotent(function in arbitrary_function()) {
            let segment = segment_with(function);
            let mut device = probe(&segment).unwrap();
            let first = device.read_bars();

            device.load_bars().unwrap();
            prop_assert_eq!(device.read_bars(), first);
        }

        #[test]
        fn bar_sizes_are_well_formed(function in arbitrary_function()) {
            let segment = segment_with(function);
            let device = probe(&segment).unwrap();
            let bars = device.read_bars();

            for bar in bars.iter().filter(|b| b.valid) {
                prop_assert!(bar.size.is_power_of_two());
                if bar.io {
                    prop_assert!(bar.size >= 4);
                }
            }

            let mut requests = Vec::new();
            device.get_bar_alloc_requests(&mut requests);
            for request in &requests {
                match request.kind {
                    ResourceKind::IoRange => prop_assert_eq!(request.size % 16, 0),
                    _ => prop_assert!(request.size >= crate::pci::constants::PAGE_SIZE),
                }
            }
        }

        #[test]
        fn upper_halves_are_never_valid(function in arbitrary_function()) {
            let segment = segment_with(function);
            let bars = probe(&segment).unwrap().read_bars();

            for (i, bar) in bars.iter().enumerate() {
                if bar.valid && bar.size_64 {
                    prop_assert!(!bars[i + 1].valid);
                }
            }
        }
    }
}
