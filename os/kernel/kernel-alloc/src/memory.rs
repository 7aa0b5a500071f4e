//! # Memory Subsystem Bring-up
//!
//! Order matters: the frame allocator comes first (it only needs the kernel
//! window), the VMM adopts the boot page tables and draws its table frames
//! from it, and the heap maps its pages through the VMM.
//!
//! On bare metal [`init_memory`] wires the three together as `'static`
//! singletons; [`KernelGlobalAlloc`] then serves `alloc` from the heap:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: kernel_alloc::memory::KernelGlobalAlloc =
//!     kernel_alloc::memory::KernelGlobalAlloc;
//! ```

use crate::frame_alloc::{BuddyFrameAllocator, FrameAllocError};
use crate::heap::{HeapBacking, HeapError, KernelHeap};
use crate::vmm::{Vmm, VmmError};
use kernel_info::boot::BootMemoryMap;
use kernel_info::memory::MemoryLayout;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PageFlags, PagingHardware, PhysMapper};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryInitError {
    #[error("memory subsystem already initialized")]
    AlreadyInitialized,
    #[error("boot memory map has no usable memory inside the kernel window")]
    NoUsableMemory,
    #[error("frame allocator: {0}")]
    Frames(#[from] FrameAllocError),
    #[error("kernel heap: {0}")]
    Heap(#[from] HeapError),
}

/// [`HeapBacking`] that maps fresh frames through a shared [`Vmm`].
pub struct VmmHeapBacking<'v, 'm, M, A, H>
where
    M: PhysMapper,
    A: FrameAlloc,
    H: PagingHardware,
{
    vmm: &'v SpinLock<Vmm<'m, M, A, H>>,
    flags: PageFlags,
}

impl<'v, 'm, M, A, H> VmmHeapBacking<'v, 'm, M, A, H>
where
    M: PhysMapper,
    A: FrameAlloc,
    H: PagingHardware,
{
    pub const fn new(vmm: &'v SpinLock<Vmm<'m, M, A, H>>, flags: PageFlags) -> Self {
        Self { vmm, flags }
    }
}

impl<M, A, H> HeapBacking for VmmHeapBacking<'_, '_, M, A, H>
where
    M: PhysMapper,
    A: FrameAlloc,
    H: PagingHardware,
{
    fn map_pages(&mut self, start: VirtualAddress, pages: usize) -> Result<(), VmmError> {
        self.vmm.lock_irq().map_anon_pages(start, pages, self.flags)
    }
}

/// Physical memory the frame allocator should manage: the top of usable RAM,
/// clipped to what the kernel window can reach.
///
/// # Errors
/// [`NoUsableMemory`](MemoryInitError::NoUsableMemory) if nothing is left.
pub fn managed_memory(
    map: &BootMemoryMap<'_>,
    layout: &MemoryLayout,
) -> Result<u64, MemoryInitError> {
    let end = map.usable_end();
    let total = end.min(layout.kernel_window_size);
    if total == 0 {
        return Err(MemoryInitError::NoUsableMemory);
    }
    if total < end {
        log::warn!(
            "memory: {:#x} bytes above the kernel window are ignored",
            end - total
        );
    }
    Ok(total)
}

/// Build the frame allocator for `map`, keeping every non-usable region and
/// hole reserved.
///
/// # Errors
/// As [`managed_memory`] and [`BuddyFrameAllocator::with_reserved`].
///
/// # Safety
/// As [`BuddyFrameAllocator::with_reserved`]; `map` must describe the
/// machine and `kernel_end` must cover everything loaded at boot.
pub unsafe fn frames_from_boot_map<'m, M: PhysMapper>(
    mapper: &'m M,
    map: &BootMemoryMap<'_>,
    layout: &MemoryLayout,
) -> Result<BuddyFrameAllocator<'m, M>, MemoryInitError> {
    let total = managed_memory(map, layout)?;
    log::info!(
        "memory: {:#x} bytes usable, managing [0, {total:#x}), kernel ends at {}",
        map.usable_total(),
        map.kernel_end()
    );
    let frames = unsafe {
        BuddyFrameAllocator::with_reserved(mapper, total, map.kernel_end(), map.reserved_ranges())
    }?;
    Ok(frames)
}

/// Create the kernel heap of `layout`, backed by `vmm`.
///
/// # Errors
/// As [`KernelHeap::with_layout`].
pub fn heap_over_vmm<'v, 'm, M, A, H>(
    vmm: &'v SpinLock<Vmm<'m, M, A, H>>,
    layout: &MemoryLayout,
) -> Result<KernelHeap<VmmHeapBacking<'v, 'm, M, A, H>>, MemoryInitError>
where
    M: PhysMapper,
    A: FrameAlloc,
    H: PagingHardware,
{
    let backing = VmmHeapBacking::new(vmm, PageFlags::KERNEL_DATA);
    Ok(KernelHeap::with_layout(backing, layout)?)
}

#[cfg(target_arch = "x86_64")]
pub use kernel_singletons::*;

#[cfg(target_arch = "x86_64")]
mod kernel_singletons {
    use super::{MemoryInitError, VmmHeapBacking, frames_from_boot_map, heap_over_vmm};
    use crate::frame_alloc::BuddyFrameAllocator;
    use crate::heap::KernelHeap;
    use crate::phys_mapper::KernelWindowMapper;
    use crate::vmm::Vmm;
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr;
    use kernel_info::boot::BootMemoryMap;
    use kernel_info::memory::MemoryLayout;
    use kernel_sync::{SpinLock, SyncOnceCell};
    use kernel_vmem::X86Paging;

    pub type KernelFrameAllocator = BuddyFrameAllocator<'static, KernelWindowMapper>;
    pub type KernelVmm = Vmm<'static, KernelWindowMapper, KernelFrameAllocator, X86Paging>;
    pub type KernelHeapAllocator = KernelHeap<
        VmmHeapBacking<'static, 'static, KernelWindowMapper, KernelFrameAllocator, X86Paging>,
    >;

    static MAPPER: SyncOnceCell<KernelWindowMapper> = SyncOnceCell::new();
    static FRAMES: SyncOnceCell<KernelFrameAllocator> = SyncOnceCell::new();
    static VMM: SyncOnceCell<SpinLock<KernelVmm>> = SyncOnceCell::new();
    static HEAP: SyncOnceCell<KernelHeapAllocator> = SyncOnceCell::new();

    /// Bring up frame allocator, VMM and heap, in that order.
    ///
    /// A failure part-way leaves the earlier singletons in place; a second
    /// call reports [`AlreadyInitialized`](MemoryInitError::AlreadyInitialized).
    ///
    /// # Errors
    /// See [`MemoryInitError`].
    ///
    /// # Safety
    /// - Call once, at CPL0, on the boot CPU, with the boot page tables active.
    /// - The kernel window at `layout.kernel_virtual_base` must map all
    ///   usable RAM below `layout.kernel_window_size` writable.
    /// - `map` must be accurate and `map.kernel_end()` must lie past
    ///   everything the loader placed in memory.
    pub unsafe fn init_memory(
        map: &BootMemoryMap<'_>,
        layout: &MemoryLayout,
    ) -> Result<&'static KernelHeapAllocator, MemoryInitError> {
        let mapper = MAPPER
            .set(KernelWindowMapper::with_offset(layout.kernel_virtual_base))
            .map_err(|_| MemoryInitError::AlreadyInitialized)?;

        let frames = unsafe { frames_from_boot_map(mapper, map, layout) }?;
        let frames = FRAMES
            .set(frames)
            .map_err(|_| MemoryInitError::AlreadyInitialized)?;

        let vmm = unsafe { Vmm::from_current(mapper, frames, X86Paging::new()) };
        let vmm = VMM
            .set(SpinLock::new(vmm))
            .map_err(|_| MemoryInitError::AlreadyInitialized)?;

        let heap = heap_over_vmm(vmm, layout)?;
        let heap = HEAP
            .set(heap)
            .map_err(|_| MemoryInitError::AlreadyInitialized)?;

        log::info!(
            "memory: ready, {:#x} of {:#x} bytes free, heap at {}",
            frames.free_memory(),
            frames.total_memory(),
            heap.start()
        );
        Ok(heap)
    }

    #[must_use]
    pub fn frame_allocator() -> Option<&'static KernelFrameAllocator> {
        FRAMES.get()
    }

    #[must_use]
    pub fn kernel_vmm() -> Option<&'static SpinLock<KernelVmm>> {
        VMM.get()
    }

    #[must_use]
    pub fn kernel_heap() -> Option<&'static KernelHeapAllocator> {
        HEAP.get()
    }

    /// `#[global_allocator]` front for the kernel heap.
    ///
    /// Returns null until [`init_memory`] has completed.
    #[derive(Debug, Copy, Clone, Default)]
    pub struct KernelGlobalAlloc;

    unsafe impl GlobalAlloc for KernelGlobalAlloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            HEAP.get()
                .map_or(ptr::null_mut(), |h| unsafe { h.alloc(layout) })
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            HEAP.get()
                .map_or(ptr::null_mut(), |h| unsafe { h.alloc_zeroed(layout) })
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if let Some(h) = HEAP.get() {
                unsafe { h.dealloc(ptr, layout) };
            }
        }

        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            HEAP.get().map_or(ptr::null_mut(), |h| unsafe {
                GlobalAlloc::realloc(h, ptr, layout, new_size)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
    use kernel_memory_addresses::PhysicalAddress;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn managed_memory_is_clipped_to_the_window() {
        let regions = [
            MemoryRegion::new(0, 0x9_F000, MemoryRegionKind::Usable),
            MemoryRegion::new(MIB, 4096 * MIB, MemoryRegionKind::Usable),
        ];
        let map = BootMemoryMap::new(&regions, PhysicalAddress::new(2 * MIB));
        assert_eq!(
            managed_memory(&map, &MemoryLayout::DEFAULT),
            Ok(MemoryLayout::DEFAULT.kernel_window_size)
        );

        let small = MemoryLayout {
            kernel_window_size: 64 * MIB,
            ..MemoryLayout::DEFAULT
        };
        assert_eq!(managed_memory(&map, &small), Ok(64 * MIB));
    }

    #[test]
    fn no_usable_memory() {
        let regions = [MemoryRegion::new(0, MIB, MemoryRegionKind::Reserved)];
        let map = BootMemoryMap::new(&regions, PhysicalAddress::zero());
        assert_eq!(
            managed_memory(&map, &MemoryLayout::DEFAULT),
            Err(MemoryInitError::NoUsableMemory)
        );
    }
}
