//! # Virtual Memory Support
//!
//! x86-64 four-level paging: the hardware entry format, the 512-entry
//! tables, and an [`AddressSpace`] that maps, unmaps and translates 4 KiB
//! pages inside one table hierarchy.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each field indexes one level of 512 eight-byte entries. A present entry
//! holds the physical address of the next table in bits 12‒51; at the PDPT
//! and PD levels the `PS` bit may instead terminate the walk with a 1 GiB or
//! 2 MiB leaf.
//!
//! ## Seams
//!
//! The crate never touches physical memory or the CPU directly:
//! * [`FrameAlloc`] hands out 4 KiB frames for new tables,
//! * [`PhysMapper`] makes a physical frame addressable,
//! * [`PagingHardware`] reports the active root table and invalidates
//!   translation cache entries.
//!
//! Host tests provide all three over a plain `Vec` of frames.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod page_flags;
mod page_table;
mod page_table_entry;
mod paging;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::page_flags::PageFlags;
pub use crate::page_table::{PageTable, PageTableIndices, PageTableLevel, TableIndex};
pub use crate::page_table_entry::PageTableEntry;
pub use crate::paging::PagingHardware;
#[cfg(target_arch = "x86_64")]
pub use crate::paging::X86Paging;
pub use kernel_memory_addresses as addresses;

use kernel_memory_addresses::PhysicalAddress;

/// Source of 4 KiB physical frames for page tables.
///
/// Returned frames must be 4 KiB aligned; their contents are unspecified.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when exhausted.
    fn alloc_4k(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, frame: PhysicalAddress);
}

/// Converts physical addresses into pointers in the current address space
/// (identity map in a loader, a fixed-offset window in the kernel, a plain
/// buffer in tests).
pub trait PhysMapper {
    /// Pointer through which the byte at `pa` can be accessed.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Borrow the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable and suitably aligned for `T`.
    /// - The bytes at `pa` must be a valid `T`.
    /// - No other reference to the same memory may be live for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }
}
