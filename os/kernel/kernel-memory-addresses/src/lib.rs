//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers around raw `u64` addresses used by the frame
//! allocator, the page-table code and the kernel heap.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address in the current (paged) address space. |
//! | [`PhysicalFrame`] | A 4 KiB aligned physical frame, identified by its frame number. |
//! | [`PhysicalRange`] | A half-open `[start, end)` range of physical addresses. |
//!
//! Page sizes are expressed through marker types implementing [`PageSize`]
//! ([`Size4K`], [`Size2M`], [`Size1G`]) so alignment checks read as
//! `addr.is_aligned::<Size2M>()` rather than as magic masks.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0030_1234);
//! assert_eq!(pa.align_down::<Size4K>().as_u64(), 0x0030_1000);
//! assert_eq!(pa.page_offset::<Size4K>(), 0x234);
//!
//! let frame = PhysicalFrame::containing(pa);
//! assert_eq!(frame.number(), 0x301);
//! assert_eq!(frame.start_address().as_u64(), 0x0030_1000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_size;
mod physical_address;
mod physical_frame;
mod physical_range;
mod virtual_address;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_frame::PhysicalFrame;
pub use physical_range::PhysicalRange;
pub use virtual_address::VirtualAddress;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two. Returns `None` if the result
/// does not fit into a `u64`.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
