//! # Kernel-window `PhysMapper`
//!
//! The boot code maps low physical memory at a fixed offset
//! ([`KERNEL_VIRTUAL_BASE`]), so any physical address inside the window is
//! reachable at `pa + offset`. The frame allocator uses this to reach its
//! bitmap and free-list nodes, the VMM to reach page tables.

use kernel_info::memory::KERNEL_VIRTUAL_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] adding a constant offset to physical addresses.
///
/// The window must actually be mapped, writable, for every physical address
/// passed in; nothing is checked here.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelWindowMapper {
    offset: u64,
}

impl KernelWindowMapper {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_offset(KERNEL_VIRTUAL_BASE)
    }

    #[must_use]
    pub const fn with_offset(offset: u64) -> Self {
        Self { offset }
    }

    /// Window address of `pa`.
    #[inline]
    #[must_use]
    pub const fn virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64().wrapping_add(self.offset))
    }
}

impl Default for KernelWindowMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysMapper for KernelWindowMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        self.virt(pa).as_mut_ptr()
    }
}
