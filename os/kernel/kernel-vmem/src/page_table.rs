use crate::PageTableEntry;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// Index into a 512-entry table (`0..512`).
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// # Panics
    /// Debug builds panic if `index >= 512`; release builds wrap.
    #[inline]
    #[must_use]
    pub const fn new(index: u16) -> Self {
        debug_assert!((index as usize) < ENTRIES);
        Self(index & 0x1FF)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One level of the four-level hierarchy, top to bottom.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageTableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl PageTableLevel {
    /// All levels in walk order.
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Lowest virtual address bit of this level's index field.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// The level whose tables this level's entries point at.
    #[inline]
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }
}

impl fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

/// The four table indices of a virtual address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageTableIndices {
    pub pml4: TableIndex,
    pub pdpt: TableIndex,
    pub pd: TableIndex,
    pub pt: TableIndex,
}

impl PageTableIndices {
    #[inline]
    #[must_use]
    pub const fn of(va: VirtualAddress) -> Self {
        Self {
            pml4: PageTableLevel::Pml4.index_of(va),
            pdpt: PageTableLevel::Pdpt.index_of(va),
            pd: PageTableLevel::Pd.index_of(va),
            pt: PageTableLevel::Pt.index_of(va),
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, level: PageTableLevel) -> TableIndex {
        match level {
            PageTableLevel::Pml4 => self.pml4,
            PageTableLevel::Pdpt => self.pdpt,
            PageTableLevel::Pd => self.pd,
            PageTableLevel::Pt => self.pt,
        }
    }
}

/// A 4 KiB page table frame, usable at any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES],
        }
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, entry: PageTableEntry) {
        self.entries[i.as_usize()] = entry;
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        (0..ENTRIES).map(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let idx = TableIndex::new(i as u16);
            (idx, self.entries[i])
        })
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}
