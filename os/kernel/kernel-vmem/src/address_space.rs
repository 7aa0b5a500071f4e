//! # Address Space (x86-64, PML4-rooted)
//!
//! One table hierarchy, reached through a [`PhysMapper`].
//!
//! - [`AddressSpace::map_page`] creates missing intermediate tables on the
//!   way down and installs a 4 KiB leaf. The walk is a transaction: if a
//!   table cannot be allocated, every table created by this call is unlinked
//!   and returned to the allocator before the error is reported.
//! - [`AddressSpace::unmap_page`] never creates tables and never frees them;
//!   emptied intermediate tables stay linked.
//! - [`AddressSpace::translate`] resolves 4 KiB, 2 MiB and 1 GiB leaves.
//!
//! None of these touch the translation cache; the caller invalidates.

use crate::{
    FrameAlloc, PageFlags, PageTable, PageTableEntry, PageTableIndices, PageTableLevel,
    PagingHardware, PhysMapper, TableIndex,
};
use kernel_memory_addresses::{PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};

/// Why [`AddressSpace::map_page`] refused or failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for a new table at this level.
    #[error("out of memory allocating a {0} table")]
    OutOfMemory(PageTableLevel),
    /// Virtual or physical address not 4 KiB aligned.
    #[error("unaligned mapping {virt} -> {phys}")]
    Unaligned {
        virt: VirtualAddress,
        phys: PhysicalAddress,
    },
    /// The walk hit a huge-page leaf where a table was expected.
    #[error("{virt} lies inside a huge page mapped at the {level} level")]
    HugePageConflict {
        virt: VirtualAddress,
        level: PageTableLevel,
    },
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
}

/// Parent links installed by one `map_page` call, in creation order.
#[derive(Default)]
struct NewTables {
    links: [(PhysicalAddress, TableIndex, PhysicalAddress); 3],
    len: usize,
}

impl NewTables {
    const fn push(&mut self, parent: PhysicalAddress, index: TableIndex, table: PhysicalAddress) {
        self.links[self.len] = (parent, index, table);
        self.len += 1;
    }
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an existing hierarchy rooted at `root`.
    ///
    /// # Safety
    /// - `root` must be a 4 KiB frame holding a valid top-level table.
    /// - `mapper` must make `root` and every table reachable from it
    ///   accessible for as long as the address space is used.
    #[inline]
    pub const unsafe fn new(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self { root, mapper }
    }

    /// View the hierarchy the CPU is currently walking.
    ///
    /// # Safety
    /// Same as [`new`](Self::new), for the root reported by `hw`.
    #[inline]
    pub unsafe fn from_hardware<H: PagingHardware>(mapper: &'m M, hw: &H) -> Self {
        unsafe { Self::new(mapper, hw.active_root()) }
    }

    /// Allocate and clear a fresh top-level table.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if `alloc` has no frame.
    ///
    /// # Safety
    /// `mapper` must make every frame handed out by `alloc` accessible.
    pub unsafe fn create<A: FrameAlloc>(mapper: &'m M, alloc: &A) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfMemory(PageTableLevel::Pml4))?;
        let this = unsafe { Self::new(mapper, root) };
        this.table_mut(root).zero();
        Ok(this)
    }

    /// Physical address of the top-level table.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Borrow the table in frame `pa`.
    ///
    /// The returned borrow must end before another table is borrowed.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, pa: PhysicalAddress) -> &mut PageTable {
        // SAFETY: construction guarantees every reachable table frame is mapped.
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    /// Map the 4 KiB page at `virt` to the frame at `phys`.
    ///
    /// Missing intermediate tables are allocated from `alloc`, zeroed and
    /// linked with [`PageFlags::TABLE`]. The leaf becomes `phys | flags`;
    /// include [`PageFlags::PRESENT`] for a usable mapping. An existing leaf
    /// is overwritten.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if either address is not 4 KiB aligned.
    /// - [`MapError::HugePageConflict`] if `virt` is covered by a huge page.
    /// - [`MapError::OutOfMemory`] if a table could not be allocated; tables
    ///   created by this call are released again.
    pub fn map_page<A: FrameAlloc>(
        &mut self,
        alloc: &A,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !virt.is_aligned::<Size4K>() || !phys.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned { virt, phys });
        }

        let idx = PageTableIndices::of(virt);
        let mut created = NewTables::default();
        let mut table = self.root;

        for (level, child) in [
            (PageTableLevel::Pml4, PageTableLevel::Pdpt),
            (PageTableLevel::Pdpt, PageTableLevel::Pd),
            (PageTableLevel::Pd, PageTableLevel::Pt),
        ] {
            let i = idx.get(level);
            let entry = self.table_mut(table).entry(i);

            if entry.present() {
                if entry.huge_page() {
                    self.rollback(alloc, &created);
                    return Err(MapError::HugePageConflict { virt, level });
                }
                table = entry.physical_address();
                continue;
            }

            let Some(frame) = alloc.alloc_4k() else {
                log::debug!("map {virt}: no frame for {child} table, rolling back");
                self.rollback(alloc, &created);
                return Err(MapError::OutOfMemory(child));
            };
            self.table_mut(frame).zero();
            self.table_mut(table).set(i, PageTableEntry::table(frame));
            created.push(table, i, frame);
            table = frame;
        }

        self.table_mut(table)
            .set(idx.pt, PageTableEntry::leaf(phys, flags));
        log::trace!("mapped {virt} -> {phys} ({flags:?})");
        Ok(())
    }

    fn rollback<A: FrameAlloc>(&self, alloc: &A, created: &NewTables) {
        for &(parent, index, table) in created.links[..created.len].iter().rev() {
            self.table_mut(parent).set(index, PageTableEntry::zero());
            alloc.free_4k(table);
        }
    }

    /// The leaf table for `virt`, if the walk reaches one without creating
    /// anything and without meeting a huge page.
    fn leaf_table(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let idx = PageTableIndices::of(virt);
        let mut table = self.root;
        for level in [PageTableLevel::Pml4, PageTableLevel::Pdpt, PageTableLevel::Pd] {
            let entry = self.table_mut(table).entry(idx.get(level));
            if !entry.present() || entry.huge_page() {
                return None;
            }
            table = entry.physical_address();
        }
        Some(table)
    }

    /// Clear the 4 KiB leaf for `virt`.
    ///
    /// Returns the frame that was mapped, or `None` (and changes nothing) if
    /// no 4 KiB mapping exists. Intermediate tables are kept.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let table = self.leaf_table(virt)?;
        let i = PageTableLevel::Pt.index_of(virt);
        let pt = self.table_mut(table);
        let entry = pt.entry(i);
        if !entry.present() {
            return None;
        }
        pt.set(i, PageTableEntry::zero());
        log::trace!("unmapped {virt} (was {})", entry.physical_address());
        Some(entry.physical_address())
    }

    /// Translate `virt` to the physical address it maps to.
    ///
    /// Handles 1 GiB and 2 MiB leaves by adding the matching in-page offset.
    #[must_use]
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let idx = PageTableIndices::of(virt);
        let mut table = self.root;
        for level in PageTableLevel::ALL {
            let entry = self.table_mut(table).entry(idx.get(level));
            if !entry.present() {
                return None;
            }
            let base = entry.physical_address();
            match level {
                PageTableLevel::Pt => return Some(base + virt.page_offset::<Size4K>()),
                PageTableLevel::Pdpt if entry.huge_page() => {
                    return Some(base.align_down::<Size1G>() + virt.page_offset::<Size1G>());
                }
                PageTableLevel::Pd if entry.huge_page() => {
                    return Some(base.align_down::<Size2M>() + virt.page_offset::<Size2M>());
                }
                _ => table = base,
            }
        }
        None
    }

    /// The raw leaf entry for `virt`, if a 4 KiB leaf table exists.
    #[must_use]
    pub fn leaf_entry(&self, virt: VirtualAddress) -> Option<PageTableEntry> {
        let table = self.leaf_table(virt)?;
        let index = PageTableLevel::Pt.index_of(virt);
        Some(self.table_mut(table).entry(index))
    }
}
