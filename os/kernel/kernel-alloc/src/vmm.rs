//! # Virtual Memory Manager
//!
//! Owns the kernel's view of one address space: page-table updates go
//! through [`AddressSpace`], table frames come from the frame allocator, and
//! every change to a live leaf is followed by a TLB invalidation on this CPU.
//!
//! The manager itself is not synchronized; share it behind a
//! [`SpinLock`](kernel_sync::SpinLock).

use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, PageFlags, PagingHardware, PhysMapper};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("no frame left to back {0}")]
    OutOfFrames(VirtualAddress),
    #[error("{0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("{pages} pages at {start} overflow the address space")]
    InvalidRange { start: VirtualAddress, pages: usize },
}

pub struct Vmm<'m, M: PhysMapper, A: FrameAlloc, H: PagingHardware> {
    aspace: AddressSpace<'m, M>,
    frames: &'m A,
    hw: H,
}

impl<'m, M: PhysMapper, A: FrameAlloc, H: PagingHardware> Vmm<'m, M, A, H> {
    /// Adopt the hierarchy the CPU is currently using.
    ///
    /// # Safety
    /// `mapper` must reach every table of the active hierarchy and every
    /// frame `frames` hands out.
    pub unsafe fn from_current(mapper: &'m M, frames: &'m A, hw: H) -> Self {
        let aspace = unsafe { AddressSpace::from_hardware(mapper, &hw) };
        log::info!("VMM: using active PML4 at {}", aspace.root());
        Self { aspace, frames, hw }
    }

    /// Manage the hierarchy rooted at `root`.
    ///
    /// # Safety
    /// As [`from_current`](Self::from_current); `root` must be a valid PML4.
    pub const unsafe fn with_root(
        mapper: &'m M,
        frames: &'m A,
        hw: H,
        root: PhysicalAddress,
    ) -> Self {
        Self {
            aspace: unsafe { AddressSpace::new(mapper, root) },
            frames,
            hw,
        }
    }

    /// Start a fresh, empty hierarchy with a root table from `frames`.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for the root.
    ///
    /// # Safety
    /// `mapper` must reach every frame `frames` hands out.
    pub unsafe fn create(mapper: &'m M, frames: &'m A, hw: H) -> Result<Self, VmmError> {
        let aspace = unsafe { AddressSpace::create(mapper, frames) }?;
        log::debug!("VMM: created PML4 at {}", aspace.root());
        Ok(Self { aspace, frames, hw })
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.aspace.root()
    }

    #[must_use]
    pub const fn frame_allocator(&self) -> &'m A {
        self.frames
    }

    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    /// Map `virt` to `phys` and invalidate the page.
    ///
    /// Returns `virt` on success. An existing mapping is replaced.
    ///
    /// # Errors
    /// Alignment, huge-page conflicts and table exhaustion, as [`MapError`].
    /// Nothing is left half-built on failure.
    pub fn map_page(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<VirtualAddress, VmmError> {
        self.aspace.map_page(self.frames, virt, phys, flags)?;
        self.hw.invalidate_page(virt);
        log::trace!("VMM: mapped {virt} -> {phys}");
        Ok(virt)
    }

    /// Remove the mapping of `virt`, returning the frame it pointed to.
    ///
    /// The frame is not freed. `None` if nothing was mapped.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let old = self.aspace.unmap_page(virt)?;
        self.hw.invalidate_page(virt);
        log::trace!("VMM: unmapped {virt} (was {old})");
        Some(old)
    }

    /// Physical address `virt` translates to, offset included.
    #[must_use]
    pub fn virt_to_phys(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.aspace.translate(virt)
    }

    /// Back `pages` pages from `start` with fresh frames.
    ///
    /// All or nothing: on failure every page mapped by this call is unmapped
    /// and its frame returned.
    ///
    /// # Errors
    /// [`Unaligned`](VmmError::Unaligned), [`InvalidRange`](VmmError::InvalidRange),
    /// [`OutOfFrames`](VmmError::OutOfFrames) or a [`Map`](VmmError::Map) failure.
    pub fn map_anon_pages(
        &mut self,
        start: VirtualAddress,
        pages: usize,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        if !start.is_aligned::<Size4K>() {
            return Err(VmmError::Unaligned(start));
        }
        (pages as u64)
            .checked_mul(FRAME_SIZE)
            .and_then(|len| start.checked_add(len))
            .ok_or(VmmError::InvalidRange { start, pages })?;

        for i in 0..pages {
            let va = start + i as u64 * FRAME_SIZE;
            if let Err(e) = self.back_page(va, flags) {
                log::debug!("VMM: backing {pages} pages at {start} failed at {va}: {e}");
                self.unmap_anon_pages(start, i);
                return Err(e);
            }
        }
        Ok(())
    }

    fn back_page(&mut self, va: VirtualAddress, flags: PageFlags) -> Result<(), VmmError> {
        let frame = self.frames.alloc_4k().ok_or(VmmError::OutOfFrames(va))?;
        if let Err(e) = self.map_page(va, frame, flags) {
            self.frames.free_4k(frame);
            return Err(e);
        }
        Ok(())
    }

    /// Unmap `pages` pages from `start` and free the frames behind them.
    ///
    /// Holes are skipped.
    pub fn unmap_anon_pages(&mut self, start: VirtualAddress, pages: usize) {
        for i in 0..pages {
            let va = start + i as u64 * FRAME_SIZE;
            if let Some(frame) = self.unmap_page(va) {
                self.frames.free_4k(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BuddyFrameAllocator;
    use crate::test_support::{TestPaging, TestPhys};
    use kernel_vmem::PageTableLevel;

    const VA: VirtualAddress = VirtualAddress::new(0xFFFF_8000_0040_0000);
    const FLAGS: PageFlags = PageFlags::KERNEL_DATA;

    type TestVmm<'a, 'b> = Vmm<'a, TestPhys, BuddyFrameAllocator<'b, TestPhys>, TestPaging>;

    /// Runs `f` against a VMM with a fresh root over `frames` frames of RAM.
    fn with_vmm(frames: usize, f: impl FnOnce(&mut TestVmm<'_, '_>)) {
        let phys = TestPhys::with_frames(frames);
        let pfa = unsafe {
            BuddyFrameAllocator::new(&phys, frames as u64 * FRAME_SIZE, PhysicalAddress::zero())
        }
        .unwrap();
        let mut vmm =
            unsafe { Vmm::create(&phys, &pfa, TestPaging::new(PhysicalAddress::zero())) }.unwrap();
        f(&mut vmm);
    }

    #[test]
    fn map_translate_unmap() {
        with_vmm(64, |vmm| {
            let pa = PhysicalAddress::new(0x0020_0000);
            assert_eq!(vmm.map_page(VA, pa, FLAGS), Ok(VA));
            assert_eq!(vmm.virt_to_phys(VA + 0x123), Some(pa + 0x123));
            assert_eq!(vmm.hardware().flushed(), [VA]);

            assert_eq!(vmm.unmap_page(VA), Some(pa));
            assert_eq!(vmm.virt_to_phys(VA), None);
            assert_eq!(vmm.hardware().flushed(), [VA, VA]);

            assert_eq!(vmm.unmap_page(VA), None);
            assert_eq!(vmm.hardware().flushed().len(), 2);
        });
    }

    #[test]
    fn anonymous_pages_get_distinct_frames() {
        with_vmm(64, |vmm| {
            let free0 = vmm.frame_allocator().free_memory();
            vmm.map_anon_pages(VA, 4, FLAGS).unwrap();

            let mut frames: Vec<_> = (0..4)
                .map(|i| vmm.virt_to_phys(VA + i * FRAME_SIZE).unwrap())
                .collect();
            frames.sort();
            frames.dedup();
            assert_eq!(frames.len(), 4);
            // Three new tables plus four data frames.
            assert_eq!(vmm.frame_allocator().free_memory(), free0 - 7 * FRAME_SIZE);

            vmm.unmap_anon_pages(VA, 4);
            assert!((0..4).all(|i| vmm.virt_to_phys(VA + i * FRAME_SIZE).is_none()));
            assert_eq!(vmm.frame_allocator().free_memory(), free0 - 3 * FRAME_SIZE);
        });
    }

    #[test]
    fn anonymous_mapping_rolls_back_when_frames_run_out() {
        // 15 managed frames, one for the root: 3 tables and 11 data frames fit.
        with_vmm(16, |vmm| {
            let free0 = vmm.frame_allocator().free_memory();
            assert_eq!(
                vmm.map_anon_pages(VA, 20, FLAGS),
                Err(VmmError::OutOfFrames(VA + 11 * FRAME_SIZE))
            );
            assert!((0..20).all(|i| vmm.virt_to_phys(VA + i * FRAME_SIZE).is_none()));
            assert_eq!(vmm.frame_allocator().free_memory(), free0 - 3 * FRAME_SIZE);
        });
    }

    #[test]
    fn table_exhaustion_is_reported() {
        with_vmm(16, |vmm| {
            let pfa = vmm.frame_allocator();
            while pfa.alloc_page().is_ok() {}
            assert_eq!(
                vmm.map_page(VA, PhysicalAddress::new(0x1000), FLAGS),
                Err(VmmError::Map(MapError::OutOfMemory(PageTableLevel::Pdpt)))
            );
            assert!(vmm.hardware().flushed().is_empty());
        });
    }

    #[test]
    fn rejects_bad_ranges() {
        with_vmm(16, |vmm| {
            assert_eq!(
                vmm.map_anon_pages(VA + 0x10, 1, FLAGS),
                Err(VmmError::Unaligned(VA + 0x10))
            );
            let top = VirtualAddress::new(0xFFFF_FFFF_FFFF_F000);
            assert_eq!(
                vmm.map_anon_pages(top, 2, FLAGS),
                Err(VmmError::InvalidRange {
                    start: top,
                    pages: 2
                })
            );
            assert!(matches!(
                vmm.map_page(VA, PhysicalAddress::new(0x1001), FLAGS),
                Err(VmmError::Map(MapError::Unaligned { .. }))
            ));
        });
    }
}
