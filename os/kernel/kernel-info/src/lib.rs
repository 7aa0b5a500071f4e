//! # Kernel Memory Configuration and Boot Interface
//!
//! The single source of truth for the memory layout shared by the frame
//! allocator, the virtual memory manager and the kernel heap.
//!
//! * [`memory`] holds the compile-time layout constants (frame size, buddy
//!   order limit, kernel window, heap placement) together with the runtime
//!   [`MemoryLayout`](memory::MemoryLayout) handed to boot-time
//!   initialization.
//! * [`boot`] models the bootloader-provided physical memory map and derives
//!   the quantities the allocators consume: the top of usable RAM and the
//!   ranges that must never be handed out.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! 0x0000_7FFF_FFFF_FFFF ├─────────────────────────────────┤
//!                       │   (non-canonical hole)          │
//! KERNEL_HEAP_START     ├─────────────────────────────────┤ 0xFFFF_FF00_0000_0000
//!                       │   Kernel Heap (reserved range,  │
//!                       │   mapped on demand)             │
//!                       ├─────────────────────────────────┤
//! KERNEL_VIRTUAL_BASE   ├─────────────────────────────────┤ 0xFFFF_FFFF_8000_0000
//!                       │   Kernel window: pa + base      │
//!                       │   (image, bitmap, page tables)  │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
