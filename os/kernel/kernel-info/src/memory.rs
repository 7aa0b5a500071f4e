//! # Memory Layout

/// Size of a physical frame and of a base page, in bytes.
pub const FRAME_SIZE: u64 = 4096;

/// `log2(FRAME_SIZE)`.
pub const FRAME_SHIFT: u32 = 12;

/// Number of buddy orders. Blocks range from order 0 (one frame) to
/// order `MAX_ORDER - 1` (1024 frames, 4 MiB).
pub const MAX_ORDER: usize = 11;

/// Largest buddy block, in frames.
pub const MAX_BLOCK_FRAMES: usize = 1 << (MAX_ORDER - 1);

/// Base of the kernel window: physical address `pa` is reachable at
/// `KERNEL_VIRTUAL_BASE + pa`. The kernel image runs here as well.
pub const KERNEL_VIRTUAL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Amount of physical memory covered by the kernel window (the top 2 GiB
/// of the address space).
pub const KERNEL_WINDOW_SIZE: u64 = 0u64.wrapping_sub(KERNEL_VIRTUAL_BASE);

/// Start of the virtual range reserved for the kernel heap.
///
/// Sits in its own top-level slot, below the kernel window, so that heap
/// mappings never shadow the window.
pub const KERNEL_HEAP_START: u64 = 0xffff_ff00_0000_0000;

/// Size of the virtual range reserved for the kernel heap.
pub const KERNEL_HEAP_SIZE: u64 = 512 * 1024 * 1024;

/// Pages mapped for the heap at boot.
pub const KERNEL_HEAP_INITIAL_PAGES: usize = 16;

/// Alignment of every heap payload and heap block header.
pub const HEAP_ALIGN: usize = 16;

/// A free heap block is only split if the remainder can hold a header plus
/// at least this many payload bytes.
pub const HEAP_MIN_SPLIT: usize = 64;

const _: () = {
    assert!(FRAME_SIZE == 1 << FRAME_SHIFT);
    assert!(MAX_ORDER > 0 && MAX_ORDER <= 20);
    assert!(KERNEL_VIRTUAL_BASE.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_WINDOW_SIZE == 2 * 1024 * 1024 * 1024);
    assert!(KERNEL_HEAP_START.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_HEAP_SIZE.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_HEAP_START + KERNEL_HEAP_SIZE <= KERNEL_VIRTUAL_BASE);
    assert!((KERNEL_HEAP_INITIAL_PAGES as u64) * FRAME_SIZE <= KERNEL_HEAP_SIZE);
    assert!(HEAP_ALIGN.is_power_of_two());
};

/// Runtime view of the layout, passed to boot-time memory initialization.
///
/// [`MemoryLayout::DEFAULT`] mirrors the constants of this module; boards or
/// tests that need a different split construct their own value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    /// Offset added to a physical address to reach it through the kernel window.
    pub kernel_virtual_base: u64,
    /// Bytes of physical memory reachable through the kernel window.
    pub kernel_window_size: u64,
    /// First virtual address of the heap range.
    pub heap_start: u64,
    /// Size of the reserved heap range, in bytes.
    pub heap_size: u64,
    /// Pages mapped when the heap is created.
    pub heap_initial_pages: usize,
    /// Whether the heap maps further pages of its range when it runs dry.
    pub heap_auto_grow: bool,
}

impl MemoryLayout {
    pub const DEFAULT: Self = Self {
        kernel_virtual_base: KERNEL_VIRTUAL_BASE,
        kernel_window_size: KERNEL_WINDOW_SIZE,
        heap_start: KERNEL_HEAP_START,
        heap_size: KERNEL_HEAP_SIZE,
        heap_initial_pages: KERNEL_HEAP_INITIAL_PAGES,
        heap_auto_grow: true,
    };
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_constants() {
        let l = MemoryLayout::default();
        assert_eq!(l.kernel_virtual_base, KERNEL_VIRTUAL_BASE);
        assert_eq!(l.heap_start, KERNEL_HEAP_START);
        assert_eq!(l.heap_initial_pages, 16);
        assert!(l.heap_auto_grow);
    }

    #[test]
    fn largest_block_is_four_mib() {
        assert_eq!(MAX_BLOCK_FRAMES as u64 * FRAME_SIZE, 4 * 1024 * 1024);
    }
}
