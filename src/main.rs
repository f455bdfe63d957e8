mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use pcidev::{
    emulation::{
        function::EmulatedFunctionBuilder, platform::EmulatedPlatform, segment::EmulatedSegment,
    },
    pci::{
        constants::config_space::{class, progif, subclass, vendor},
        device::Device,
        location::Location,
        resource::{checked_round_up, BarSizes, ResourceKind, ResourceRequest},
    },
    Error,
};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// The number of device slots on a bus.
const DEVICES_PER_BUS: u8 = 32;

/// Hands out addresses from the I/O and memory windows in increasing order.
#[derive(Debug)]
struct BumpAllocator {
    mmio: u64,
    io: u64,
}

impl BumpAllocator {
    /// Returns `None` once the window is exhausted.
    fn allocate(&mut self, request: &ResourceRequest) -> Option<u64> {
        let cursor = match request.kind {
            ResourceKind::IoRange => &mut self.io,
            ResourceKind::MmioRange | ResourceKind::Mmio64Range => &mut self.mmio,
        };

        let address = checked_round_up(*cursor, 1 << request.align)?;
        *cursor = address.checked_add(request.size)?;
        Some(address)
    }
}

/// The machine the tool runs against.
fn example_segment() -> EmulatedSegment {
    EmulatedSegment::new()
        .with_function(
            Location::new(0, 0, 0),
            EmulatedFunctionBuilder::new(vendor::INTEL, 0x29c0)
                .class(class::BRIDGE, subclass::HOST_BRIDGE, 0)
                .build(),
        )
        .with_function(
            Location::new(0, 1, 0),
            EmulatedFunctionBuilder::new(vendor::REDHAT, 0x000c)
                .class(class::BRIDGE, subclass::PCI_TO_PCI_BRIDGE, 0)
                .build(),
        )
        .with_function(
            Location::new(0, 2, 0),
            EmulatedFunctionBuilder::new(vendor::REALTEK, 0x8139)
                .class(class::NETWORK, subclass::ETHERNET, 0)
                .interrupt_pin(1)
                .io_bar(0, 0x100)
                .mem32_bar(1, 0x4000, false)
                .msi_capability(true)
                .msix_capability(4, 1, 0x1000, 1, 0x2000)
                .build(),
        )
        .with_function(
            Location::new(0, 3, 0),
            EmulatedFunctionBuilder::new(vendor::REDHAT, 0x000d)
                .class(class::SERIAL, subclass::SERIAL_USB, progif::USB_XHCI)
                .interrupt_pin(2)
                .mem64_bar(0, 0x20_0000, true)
                .vendor_capability(&[0x01, 0x00, 0x10, 0x00])
                .build(),
        )
}

/// Probe every slot of bus 0.
fn probe_bus(segment: &Arc<EmulatedSegment>) -> Result<Vec<Device>> {
    let mut devices = Vec::new();

    for slot in 0..DEVICES_PER_BUS {
        let location = Location::new(0, slot, 0);

        match Device::probe(segment.clone(), location, None) {
            Ok(device) => devices.push(device),
            Err(Error::NotFound) => {}
            Err(Error::NotSupported) => info!("{location}: skipping bridge"),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to probe {location}"));
            }
        }
    }

    Ok(devices)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    let segment = Arc::new(example_segment());
    let platform = EmulatedPlatform::new();

    let mut devices = probe_bus(&segment)?;
    info!("found {} device(s)", devices.len());

    let mut sizes = BarSizes::default();
    let mut requests = Vec::new();
    for device in &devices {
        device.compute_bar_sizes(&mut sizes);
        device.get_bar_alloc_requests(&mut requests);
    }
    info!("bus 0 needs {sizes}");

    // Place large requests first to waste less space on alignment.
    requests.sort_by(|a, b| b.size.cmp(&a.size));

    let mut allocator = BumpAllocator {
        mmio: args.mmio_base,
        io: args.io_base,
    };

    for request in &requests {
        let address = allocator
            .allocate(request)
            .with_context(|| format!("No space left for {request}"))?;
        debug!("{request} -> {address:#x}");

        let device = devices
            .iter_mut()
            .find(|d| d.location() == request.location)
            .context("Request without device")?;
        device
            .assign_resource(request, address)
            .with_context(|| format!("Failed to assign {address:#x} to {}", request.location))?;
    }

    for device in &mut devices {
        device
            .enable()
            .with_context(|| format!("Failed to enable {}", device.location()))?;

        let vector = if args.msix && device.has_msix() {
            device.allocate_msix(&platform, &platform, 1)
        } else if device.has_msi() {
            device.allocate_msi(&platform, 1)
        } else {
            device.allocate_irq(&platform)
        };

        match vector {
            Ok(vector) => info!("{}: interrupt vector {vector}", device.location()),
            Err(e) => warn!("{}: no interrupt: {e}", device.location()),
        }
    }

    for device in &devices {
        print!("{}", device.dump(0));
    }

    Ok(())
}
