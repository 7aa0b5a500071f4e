//! # Kernel Memory Management
//!
//! The three allocators of the kernel and their bring-up:
//!
//! * [`frame_alloc`]: buddy allocator for 4 KiB physical frames, blocks of
//!   up to 1024 frames, with a per-frame bitmap and intrusive free lists.
//! * [`vmm`]: page mapping on top of [`kernel_vmem::AddressSpace`], with
//!   table frames taken from the frame allocator and TLB invalidation.
//! * [`heap`]: first-fit kernel heap over a reserved virtual range that
//!   grows by mapping pages through the VMM; also a [`GlobalAlloc`](core::alloc::GlobalAlloc).
//! * [`memory`]: boot-time wiring of the three from the bootloader's memory map.
//!
//! Physical memory is only ever touched through a
//! [`PhysMapper`](kernel_vmem::PhysMapper); [`phys_mapper::KernelWindowMapper`]
//! is the fixed-offset window used at run time.
//!
//! ## Locking
//!
//! Frame allocator and heap each hold their state behind a
//! [`SpinLock`](kernel_sync::SpinLock) taken with interrupts disabled. The
//! heap acquires its backing (and through it the VMM and the frame
//! allocator) before its own block list, never the other way round.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod bitmap;
pub mod frame_alloc;
pub mod heap;
pub mod memory;
pub mod phys_mapper;
pub mod vmm;

#[cfg(test)]
mod test_support;

pub use bitmap::FrameBitmap;
pub use frame_alloc::{BuddyFrameAllocator, FrameAllocError};
pub use heap::{HeapBacking, HeapError, KernelHeap};
pub use memory::{MemoryInitError, VmmHeapBacking};
pub use phys_mapper::KernelWindowMapper;
pub use vmm::{Vmm, VmmError};
