//! # Resource Requests
//!
//! After probing, an allocator collects the address space needs of all devices, picks addresses
//! and hands them back. Devices describe their needs as [`ResourceRequest`]s. A parent bridge
//! that has to size its own forwarding window before descending uses [`BarSizes`] instead.

use std::fmt::{self, Display, Formatter};

use super::{bar::Bar, constants::PAGE_SIZE, location::Location};

/// Granularity of I/O window sizes.
pub const IO_GRANULARITY: u64 = 16;

/// The alignment, as power-of-two exponent, of every I/O window.
pub const IO_ALIGN: u8 = 4;

/// The address space of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Port I/O range.
    IoRange,
    /// Memory range below 4 GiB.
    MmioRange,
    /// Memory range anywhere in 64-bit memory space.
    Mmio64Range,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IoRange => "io",
            Self::MmioRange => "mmio",
            Self::Mmio64Range => "mmio64",
        })
    }
}

/// Round `value` up to a multiple of the power of two `granularity`.
///
/// Returns `None` if the result does not fit into 64 bits.
#[must_use]
pub const fn checked_round_up(value: u64, granularity: u64) -> Option<u64> {
    debug_assert!(granularity.is_power_of_two());

    match value.checked_add(granularity - 1) {
        Some(value) => Some(value & !(granularity - 1)),
        None => None,
    }
}

/// Round `value` up to a multiple of the power of two `granularity`.
///
/// Saturates at the largest multiple of `granularity` if the result does not fit into 64 bits.
/// Use [`checked_round_up`] where that matters.
#[must_use]
pub const fn round_up(value: u64, granularity: u64) -> u64 {
    match checked_round_up(value, granularity) {
        Some(value) => value,
        None => u64::MAX & !(granularity - 1),
    }
}

/// Round `value` down to a multiple of the power of two `granularity`.
#[must_use]
pub const fn round_down(value: u64, granularity: u64) -> u64 {
    debug_assert!(granularity.is_power_of_two());

    value & !(granularity - 1)
}

/// The rounded size and alignment exponent a valid BAR needs.
///
/// BAR sizes are powers of two of at most 2^63, so rounding them never saturates.
fn size_and_align(bar: &Bar) -> (u64, u8) {
    if bar.io {
        (round_up(bar.size, IO_GRANULARITY), IO_ALIGN)
    } else {
        let size = round_up(bar.size, PAGE_SIZE);
        (size, size.trailing_zeros() as u8)
    }
}

/// A request for address space of a single BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    /// The device that emitted this request.
    pub location: Location,
    /// The BAR slot the assigned address goes to.
    pub bar_num: u8,
    /// The address space the request is for.
    pub kind: ResourceKind,
    /// Size in bytes, already rounded to the allocation granularity.
    pub size: u64,
    /// The required alignment as power-of-two exponent.
    pub align: u8,
    /// Whether the range may be placed in a prefetchable window.
    pub prefetchable: bool,
}

impl ResourceRequest {
    /// Build the request for a valid BAR.
    #[must_use]
    pub fn for_bar(location: Location, bar_num: u8, bar: &Bar) -> Self {
        debug_assert!(bar.valid);

        let (size, align) = size_and_align(bar);
        let kind = if bar.io {
            ResourceKind::IoRange
        } else if bar.size_64 {
            ResourceKind::Mmio64Range
        } else {
            ResourceKind::MmioRange
        };

        Self {
            location,
            bar_num,
            kind,
            size,
            align,
            prefetchable: !bar.io && bar.prefetchable,
        }
    }

    /// Check whether `address` satisfies the alignment of this request.
    #[must_use]
    pub const fn is_aligned(&self, address: u64) -> bool {
        address & ((1u64 << self.align) - 1) == 0
    }
}

impl Display for ResourceRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BAR alloc request: device {} type {} pref {} size {:#x} align {} bar {}",
            self.location,
            self.kind,
            u8::from(self.prefetchable),
            self.size,
            self.align,
            self.bar_num
        )
    }
}

/// Accumulated size and alignment of one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    /// Sum of the rounded sizes.
    pub size: u64,
    /// The largest alignment exponent seen.
    pub align: u8,
}

impl WindowSize {
    /// A window that would exceed the 64-bit address space saturates at `u64::MAX`.
    fn add(&mut self, size: u64, align: u8) {
        self.size = self.size.saturating_add(size);
        self.align = self.align.max(align);
    }
}

impl Display for WindowSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{}", self.size, self.align)
    }
}

/// The space needed behind a bridge, split by window class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct BarSizes {
    pub io: WindowSize,
    pub mmio: WindowSize,
    pub mmio64: WindowSize,
    pub prefetchable: WindowSize,
    pub prefetchable64: WindowSize,
}

impl BarSizes {
    /// Add a valid BAR to the class it belongs to.
    pub fn add_bar(&mut self, bar: &Bar) {
        debug_assert!(bar.valid);

        let (size, align) = size_and_align(bar);
        let class = match (bar.io, bar.size_64, bar.prefetchable) {
            (true, _, _) => &mut self.io,
            (false, true, true) => &mut self.prefetchable64,
            (false, true, false) => &mut self.mmio64,
            (false, false, true) => &mut self.prefetchable,
            (false, false, false) => &mut self.mmio,
        };

        class.add(size, align);
    }
}

impl Display for BarSizes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "io {} mmio {} mmio64 {} pref {} pref64 {}",
            self.io, self.mmio, self.mmio64, self.prefetchable, self.prefetchable64
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mem_bar(size: u64, size_64: bool, prefetchable: bool) -> Bar {
        Bar {
            valid: true,
            size_64,
            prefetchable,
            size,
            ..Default::default()
        }
    }

    fn io_bar(size: u64) -> Bar {
        Bar {
            valid: true,
            io: true,
            size,
            ..Default::default()
        }
    }

    #[test]
    fn rounding_works() {
        assert_eq!(round_up(0x10, 0x1000), 0x1000);
        assert_eq!(round_up(0x1000, 0x1000), 0x1000);
        assert_eq!(round_up(0x1001, 0x1000), 0x2000);
        assert_eq!(round_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(checked_round_up(u64::MAX - 0x10, 0x1000), None);
        assert_eq!(round_up(u64::MAX - 0x10, 0x1000), 0xffff_ffff_ffff_f000);
        assert_eq!(round_down(0, 0x1000), 0);
    }

    #[test]
    fn io_requests_round_to_16_with_fixed_alignment() {
        let loc = Location::new(0, 2, 0);
        let req = ResourceRequest::for_bar(loc, 2, &io_bar(0x8));

        assert_eq!(req.kind, ResourceKind::IoRange);
        assert_eq!(req.size, 0x10);
        assert_eq!(req.align, 4);
        assert!(!req.prefetchable);
    }

    #[test]
    fn small_memory_bars_round_to_a_page() {
        let loc = Location::new(0, 2, 0);
        let req = ResourceRequest::for_bar(loc, 0, &mem_bar(0x100, false, false));

        assert_eq!(req.kind, ResourceKind::MmioRange);
        assert_eq!(req.size, 0x1000);
        assert_eq!(req.align, 12);
    }

    #[test]
    fn large_64bit_bars_align_to_their_size() {
        let loc = Location::new(0, 2, 0);
        let req = ResourceRequest::for_bar(loc, 0, &mem_bar(0x20_0000, true, true));

        assert_eq!(req.kind, ResourceKind::Mmio64Range);
        assert_eq!(req.size, 0x20_0000);
        assert_eq!(req.align, 21);
        assert!(req.prefetchable);
    }

    #[test]
    fn alignment_check() {
        let req = ResourceRequest::for_bar(Location::default(), 0, &mem_bar(0x4000, false, false));

        assert!(req.is_aligned(0xfe00_4000));
        assert!(!req.is_aligned(0xfe00_1000));
    }

    #[test]
    fn bar_sizes_are_accumulated_per_class() {
        let mut sizes = BarSizes::default();

        for bar in [
            io_bar(0x20),
            io_bar(0x4),
            mem_bar(0x100, false, false),
            mem_bar(0x4000, false, false),
            mem_bar(0x20_0000, true, true),
            mem_bar(0x1000, true, false),
            mem_bar(0x8000, false, true),
        ] {
            sizes.add_bar(&bar);
        }

        assert_eq!(sizes.io, WindowSize { size: 0x30, align: 4 });
        assert_eq!(sizes.mmio, WindowSize { size: 0x5000, align: 14 });
        assert_eq!(sizes.mmio64, WindowSize { size: 0x1000, align: 12 });
        assert_eq!(
            sizes.prefetchable64,
            WindowSize {
                size: 0x20_0000,
                align: 21
            }
        );
        assert_eq!(
            sizes.prefetchable,
            WindowSize {
                size: 0x8000,
                align: 15
            }
        );
    }

    #[test]
    fn huge_bars_saturate_the_window() {
        let mut sizes = BarSizes::default();
        let huge = mem_bar(1 << 63, true, false);

        let req = ResourceRequest::for_bar(Location::default(), 0, &huge);
        assert_eq!(req.size, 1 << 63);
        assert_eq!(req.align, 63);

        sizes.add_bar(&huge);
        sizes.add_bar(&huge);
        assert_eq!(sizes.mmio64, WindowSize { size: u64::MAX, align: 63 });
    }

    #[test]
    fn requests_render_for_diagnostics() {
        let req = ResourceRequest::for_bar(Location::new(1, 0, 0), 2, &io_bar(0x20));

        assert_eq!(
            req.to_string(),
            "BAR alloc request: device 01:00.0 type io pref 0 size 0x20 align 4 bar 2"
        );
    }

    proptest! {
        #[test]
        fn memory_requests_are_page_multiples(log2 in 4u32..40) {
            let req = ResourceRequest::for_bar(
                Location::default(), 0, &mem_bar(1 << log2, true, false));

            prop_assert!(req.size.is_power_of_two());
            prop_assert!(req.size >= PAGE_SIZE);
            prop_assert_eq!(1u64 << req.align, req.size);
        }

        #[test]
        fn io_requests_are_16_byte_multiples(log2 in 2u32..16) {
            let req = ResourceRequest::for_bar(Location::default(), 0, &io_bar(1 << log2));

            prop_assert_eq!(req.size % IO_GRANULARITY, 0);
            prop_assert!(req.size >= 4);
        }
    }
}
