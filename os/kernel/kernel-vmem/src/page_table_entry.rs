use crate::PageFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// One 64-bit x86-64 page table entry, valid at every level.
///
/// | Bits   | Field            | Meaning |
/// |--------|------------------|---------|
/// | 0      | `present`        | Entry is valid |
/// | 1      | `writable`       | Writes allowed |
/// | 2      | `user`           | CPL3 access allowed |
/// | 3      | `write_through`  | PWT |
/// | 4      | `cache_disabled` | PCD |
/// | 5      | `accessed`       | Set by the CPU on access |
/// | 6      | `dirty`          | Set by the CPU on write (leaf only) |
/// | 7      | `huge_page`      | PS: 1 GiB leaf in a PDPT, 2 MiB leaf in a PD |
/// | 8      | `global`         | Survives CR3 reloads (leaf only) |
/// | 9–11   | `os_low`         | Ignored by hardware |
/// | 12–51  | frame            | Physical address bits 51:12 |
/// | 52–58  | `os_high`        | Ignored by hardware |
/// | 59–62  | `protection_key` | PKU key, or ignored |
/// | 63     | `no_execute`     | Instruction fetch disabled |
///
/// When `present` is clear, every other bit is meaningless and the frame
/// field must not be followed.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge_page: bool,
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    #[bits(40)]
    frame: u64,
    #[bits(7)]
    pub os_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Bits 12..=51.
    pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// A not-present entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Parent entry pointing at the table in `frame`.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalAddress) -> Self {
        Self::leaf(frame, PageFlags::TABLE)
    }

    /// Entry mapping `frame` with exactly `flags`; nothing is added.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, flags: PageFlags) -> Self {
        Self::from_bits((frame.as_u64() & Self::ADDRESS_MASK) | flags.bits())
    }

    /// The address stored in bits 12..=51.
    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        self.set_frame((pa.as_u64() & Self::ADDRESS_MASK) >> 12);
    }

    /// The permission bits expressible as [`PageFlags`].
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }
}
