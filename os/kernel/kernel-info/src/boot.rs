//! # Boot Memory Map
//!
//! The bootloader reports physical memory as an ordered list of
//! `(base, length, type)` entries. The type codes follow the multiboot2
//! memory map tag; anything the kernel does not recognise is treated as
//! reserved.

use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// Region type of a boot memory map entry.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// RAM free for the kernel to use.
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    BadMemory = 5,
}

impl MemoryRegionKind {
    /// Decodes a raw multiboot2 type code. Unknown codes map to [`Self::Reserved`].
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Reserved,
        }
    }
}

/// One entry of the boot memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::from_base_len(self.base, self.length)
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable) && self.length > 0
    }
}

/// The boot memory map together with the physical end of the kernel image.
#[derive(Debug, Copy, Clone)]
pub struct BootMemoryMap<'a> {
    regions: &'a [MemoryRegion],
    kernel_end: PhysicalAddress,
}

impl<'a> BootMemoryMap<'a> {
    #[must_use]
    pub const fn new(regions: &'a [MemoryRegion], kernel_end: PhysicalAddress) -> Self {
        Self {
            regions,
            kernel_end,
        }
    }

    #[must_use]
    pub const fn regions(&self) -> &'a [MemoryRegion] {
        self.regions
    }

    /// First physical byte past the kernel image.
    #[must_use]
    pub const fn kernel_end(&self) -> PhysicalAddress {
        self.kernel_end
    }

    /// Sum of the lengths of all usable regions.
    #[must_use]
    pub fn usable_total(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.length)
            .sum()
    }

    /// End of the highest usable region; zero if there is none.
    #[must_use]
    pub fn usable_end(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.is_usable())
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(0)
    }

    fn is_covered(&self, pa: u64) -> bool {
        self.regions
            .iter()
            .any(|r| r.length > 0 && r.base <= pa && pa < r.end())
    }

    /// Every range below [`usable_end`](Self::usable_end) that must never be
    /// handed out: all non-usable entries, followed by the holes the map does
    /// not describe at all.
    ///
    /// Ranges may overlap each other and are not sorted.
    pub fn reserved_ranges(&self) -> impl Iterator<Item = PhysicalRange> + Clone + 'a {
        let regions = self.regions;
        let map = *self;
        let top = self.usable_end();

        let explicit = regions
            .iter()
            .filter(|r| !r.is_usable() && r.length > 0)
            .map(MemoryRegion::range);

        // A hole starts at 0 or at the end of an entry, provided no entry
        // covers that address, and runs up to the next entry above it.
        let ends = regions
            .iter()
            .enumerate()
            .filter(move |&(i, r)| r.length > 0 && regions[..i].iter().all(|p| p.end() != r.end()))
            .map(|(_, r)| r.end());
        let holes = core::iter::once(0)
            .chain(ends)
            .filter(move |&start| start < top && !map.is_covered(start))
            .filter_map(move |start| {
                let end = regions
                    .iter()
                    .filter(|r| r.length > 0 && r.base > start)
                    .map(|r| r.base)
                    .min()?
                    .min(top);
                Some(PhysicalRange::new(PhysicalAddress::new(start), PhysicalAddress::new(end)))
            });

        explicit.chain(holes)
    }
}
