//! # Kernel Heap
//!
//! A first-fit, address-ordered block list over a reserved virtual range.
//!
//! ```text
//! start                                   start + mapped      start + size
//! | hdr | payload | hdr | payload | ...   |  (unmapped) ...    |
//! ```
//!
//! * Every block starts with a 32-byte [`BlockHeader`] and is followed
//!   immediately by the next one; the blocks tile `[start, start + mapped)`
//!   without gaps.
//! * Payloads and headers are 16-byte aligned; requests round up to 16.
//! * A free block is split if the remainder can hold a header plus
//!   [`HEAP_MIN_SPLIT`] bytes.
//! * `free` merges with both neighbours, so no two free blocks are adjacent.
//! * When no block fits, the heap maps more pages of its range through a
//!   [`HeapBacking`] and retries (if growth is enabled).
//!
//! Headers carry a magic value and are cross-checked against their
//! neighbours' links before a pointer is trusted, which catches most wild
//! and repeated frees.

use crate::vmm::VmmError;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::{FRAME_SIZE, HEAP_ALIGN, HEAP_MIN_SPLIT, MemoryLayout};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_sync::SpinLock;

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = FRAME_SIZE as usize;

/// Supplies mapped memory for the heap range.
pub trait HeapBacking {
    /// Make `pages` pages from `start` readable and writable.
    ///
    /// # Errors
    /// The mapping failure; nothing may stay mapped in that case.
    fn map_pages(&mut self, start: VirtualAddress, pages: usize) -> Result<(), VmmError>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("allocation size overflows")]
    Overflow,
    #[error("no free block for {0} bytes")]
    OutOfMemory(usize),
    #[error("{0:#x} is not a live heap allocation")]
    InvalidPointer(usize),
    #[error("{0:#x} was already freed")]
    DoubleFree(usize),
    #[error("growing by {requested} bytes exceeds the {limit} byte heap range")]
    CapacityExceeded { requested: usize, limit: usize },
    #[error("heap range {start} (+{size:#x} bytes, {initial_pages} initial pages) is unusable")]
    InvalidConfig {
        start: VirtualAddress,
        size: usize,
        initial_pages: usize,
    },
    #[error("mapping heap pages failed: {0}")]
    Growth(#[from] VmmError),
}

#[repr(C, align(16))]
#[derive(Debug, Copy, Clone)]
struct BlockHeader {
    /// Payload bytes following the header.
    size: usize,
    /// Offset of the previous block's header, or [`NIL`].
    prev: usize,
    /// Offset of the next block's header, or [`NIL`].
    next: usize,
    magic: u32,
    state: u32,
}

const HEADER: usize = size_of::<BlockHeader>();
const NIL: usize = usize::MAX;
const MAGIC: u32 = 0x4B48_4550;
const FREE: u32 = 0x0000_F4EE;
const USED: u32 = 0x0000_05ED;

const _: () = {
    assert!(HEADER.is_multiple_of(HEAP_ALIGN));
    assert!(PAGE.is_multiple_of(HEAP_ALIGN));
};

/// The block list; offsets are relative to `base`.
struct HeapState {
    base: VirtualAddress,
    mapped: usize,
    limit: usize,
}

impl HeapState {
    fn ptr(&self, off: usize) -> *mut u8 {
        (self.base + off as u64).as_mut_ptr()
    }

    fn address(&self, off: usize) -> usize {
        self.ptr(off).addr()
    }

    /// Header at `off` if it is in bounds, aligned and carries the magic.
    #[allow(clippy::cast_ptr_alignment)]
    fn read(&self, off: usize) -> Option<BlockHeader> {
        if !off.is_multiple_of(HEAP_ALIGN) || off.checked_add(HEADER)? > self.mapped {
            return None;
        }
        // Safety: in bounds of the mapped range and aligned for the header.
        let h = unsafe { self.ptr(off).cast::<BlockHeader>().read() };
        (h.magic == MAGIC && (h.state == FREE || h.state == USED)).then_some(h)
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn write(&mut self, off: usize, h: BlockHeader) {
        debug_assert!(off + HEADER <= self.mapped);
        // Safety: as in `read`; the lock gives us exclusive access.
        unsafe { self.ptr(off).cast::<BlockHeader>().write(h) }
    }

    /// Wipe the header at `off` after it was absorbed by a neighbour.
    fn clear(&mut self, off: usize) {
        self.write(
            off,
            BlockHeader {
                size: 0,
                prev: NIL,
                next: NIL,
                magic: 0,
                state: 0,
            },
        );
    }

    fn set_prev(&mut self, off: usize, prev: usize) {
        if let Some(mut h) = self.read(off) {
            h.prev = prev;
            self.write(off, h);
        }
    }

    fn blocks(&self) -> impl Iterator<Item = (usize, BlockHeader)> + '_ {
        let mut next = if self.mapped >= HEADER { 0 } else { NIL };
        core::iter::from_fn(move || {
            if next == NIL {
                return None;
            }
            let off = next;
            let h = self.read(off)?;
            next = h.next;
            Some((off, h))
        })
    }

    /// Header offset and header for the payload at `ptr`, after checking it
    /// against the block list.
    fn lookup(&self, ptr: NonNull<u8>) -> Result<(usize, BlockHeader), HeapError> {
        let addr = ptr.as_ptr().addr();
        let invalid = HeapError::InvalidPointer(addr);
        let payload = addr
            .checked_sub(self.address(0))
            .filter(|&p| p >= HEADER && p < self.mapped)
            .ok_or(invalid)?;
        let off = payload - HEADER;
        let h = self.read(off).ok_or(invalid)?;

        let linked = if h.prev == NIL {
            off == 0
        } else {
            self.read(h.prev).is_some_and(|p| p.next == off)
        };
        let tiled = if h.next == NIL {
            off + HEADER + h.size == self.mapped
        } else {
            h.next == off + HEADER + h.size
        };
        if !linked || !tiled {
            return Err(invalid);
        }
        Ok((off, h))
    }

    /// First fit; returns the payload offset and the block's usable size.
    fn allocate(&mut self, size: usize) -> Option<(usize, usize)> {
        let (off, mut h) = self
            .blocks()
            .find(|(_, h)| h.state == FREE && h.size >= size)?;

        if h.size >= size + HEADER + HEAP_MIN_SPLIT {
            let split = off + HEADER + size;
            self.write(
                split,
                BlockHeader {
                    size: h.size - size - HEADER,
                    prev: off,
                    next: h.next,
                    magic: MAGIC,
                    state: FREE,
                },
            );
            if h.next != NIL {
                self.set_prev(h.next, split);
            }
            h.size = size;
            h.next = split;
        }

        h.state = USED;
        self.write(off, h);
        Some((off + HEADER, h.size))
    }

    /// Free the block at header `off`, merging with free neighbours.
    /// Returns the payload size that was in use.
    fn release(&mut self, off: usize, mut h: BlockHeader) -> Result<usize, HeapError> {
        if h.state == FREE {
            return Err(HeapError::DoubleFree(self.address(off + HEADER)));
        }
        let freed = h.size;
        h.state = FREE;

        if let Some(next) = self.read(h.next).filter(|n| n.state == FREE) {
            let absorbed = h.next;
            h.size += HEADER + next.size;
            h.next = next.next;
            if next.next != NIL {
                self.set_prev(next.next, off);
            }
            self.clear(absorbed);
        }

        match self.read(h.prev).filter(|p| p.state == FREE) {
            Some(mut prev) => {
                prev.size += HEADER + h.size;
                prev.next = h.next;
                if h.next != NIL {
                    self.set_prev(h.next, h.prev);
                }
                self.write(h.prev, prev);
                self.clear(off);
            }
            None => self.write(off, h),
        }
        Ok(freed)
    }

    /// Account for `bytes` newly mapped bytes at the end of the range.
    fn extend(&mut self, bytes: usize) {
        let old_end = self.mapped;
        let tail = self.blocks().last();
        self.mapped += bytes;

        match tail {
            Some((off, mut tail)) if tail.state == FREE => {
                tail.size += bytes;
                self.write(off, tail);
            }
            tail => {
                let prev = tail.map_or(NIL, |(off, _)| off);
                self.write(
                    old_end,
                    BlockHeader {
                        size: bytes - HEADER,
                        prev,
                        next: NIL,
                        magic: MAGIC,
                        state: FREE,
                    },
                );
                if let Some((off, mut t)) = tail {
                    t.next = old_end;
                    self.write(off, t);
                }
            }
        }
    }
}

/// Kernel heap over `[start, start + size)`.
pub struct KernelHeap<B: HeapBacking> {
    state: SpinLock<HeapState>,
    /// Taken before `state` when growing.
    backing: SpinLock<B>,
    used: AtomicUsize,
    auto_grow: bool,
}

impl<B: HeapBacking> KernelHeap<B> {
    /// Map `initial_pages` pages at `start` and lay out one free block.
    ///
    /// # Errors
    /// [`InvalidConfig`](HeapError::InvalidConfig) for an unaligned start or
    /// size, zero pages or more pages than the range holds;
    /// [`Growth`](HeapError::Growth) if the pages cannot be mapped.
    pub fn new(
        mut backing: B,
        start: VirtualAddress,
        size: usize,
        initial_pages: usize,
        auto_grow: bool,
    ) -> Result<Self, HeapError> {
        let invalid = HeapError::InvalidConfig {
            start,
            size,
            initial_pages,
        };
        let initial = initial_pages.checked_mul(PAGE).ok_or(invalid)?;
        if start.as_u64() == 0
            || !start.is_aligned::<Size4K>()
            || !size.is_multiple_of(PAGE)
            || initial == 0
            || initial > size
            || start.checked_add(size as u64).is_none()
        {
            return Err(invalid);
        }

        backing.map_pages(start, initial_pages)?;

        let mut state = HeapState {
            base: start,
            mapped: 0,
            limit: size,
        };
        state.extend(initial);
        log::info!(
            "heap: {start} with {initial_pages} of {} pages mapped{}",
            size / PAGE,
            if auto_grow { ", growing on demand" } else { "" }
        );

        Ok(Self {
            state: SpinLock::new(state),
            backing: SpinLock::new(backing),
            used: AtomicUsize::new(0),
            auto_grow,
        })
    }

    /// [`new`](Self::new) with the heap fields of `layout`.
    ///
    /// # Errors
    /// As [`new`](Self::new).
    pub fn with_layout(backing: B, layout: &MemoryLayout) -> Result<Self, HeapError> {
        let size = usize::try_from(layout.heap_size).map_err(|_| HeapError::Overflow)?;
        Self::new(
            backing,
            VirtualAddress::new(layout.heap_start),
            size,
            layout.heap_initial_pages,
            layout.heap_auto_grow,
        )
    }

    /// Allocate `size` bytes, 16-byte aligned.
    ///
    /// # Errors
    /// [`ZeroSize`](HeapError::ZeroSize), [`Overflow`](HeapError::Overflow)
    /// or [`OutOfMemory`](HeapError::OutOfMemory) once growth is off or fails.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let size = size
            .checked_next_multiple_of(HEAP_ALIGN)
            .ok_or(HeapError::Overflow)?;

        if let Some(ptr) = self.try_allocate(size) {
            return Ok(ptr);
        }
        if !self.auto_grow {
            return Err(HeapError::OutOfMemory(size));
        }

        let pages = size
            .checked_add(HEADER)
            .ok_or(HeapError::Overflow)?
            .div_ceil(PAGE);
        if let Err(e) = self.extend(pages) {
            log::debug!("heap: cannot grow for {size} bytes: {e}");
            return Err(HeapError::OutOfMemory(size));
        }
        self.try_allocate(size).ok_or(HeapError::OutOfMemory(size))
    }

    fn try_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let mut state = self.state.lock_irq();
        let (payload, block) = state.allocate(size)?;
        self.used.fetch_add(block, Ordering::Relaxed);
        NonNull::new(state.ptr(payload))
    }

    /// Map `pages` more pages at the end of the heap.
    ///
    /// # Errors
    /// [`CapacityExceeded`](HeapError::CapacityExceeded) past the reserved
    /// range, [`Growth`](HeapError::Growth) if mapping fails.
    pub fn extend(&self, pages: usize) -> Result<(), HeapError> {
        let bytes = pages.checked_mul(PAGE).ok_or(HeapError::Overflow)?;
        let mut backing = self.backing.lock_irq();

        let (end, room) = {
            let state = self.state.lock_irq();
            (state.base + state.mapped as u64, state.limit - state.mapped)
        };
        if bytes == 0 {
            return Ok(());
        }
        if bytes > room {
            return Err(HeapError::CapacityExceeded {
                requested: bytes,
                limit: self.capacity(),
            });
        }

        backing.map_pages(end, pages)?;
        self.state.lock_irq().extend(bytes);
        drop(backing);
        log::debug!("heap: grew by {pages} pages at {end}");
        Ok(())
    }

    /// Allocate `num * size` zeroed bytes.
    ///
    /// # Errors
    /// [`Overflow`](HeapError::Overflow) if the product overflows, otherwise
    /// as [`malloc`](Self::malloc).
    pub fn calloc(&self, num: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let total = num.checked_mul(size).ok_or(HeapError::Overflow)?;
        let ptr = self.malloc(total)?;
        // Safety: fresh block of at least `total` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Ok(ptr)
    }

    /// Resize the allocation at `ptr`.
    ///
    /// * null `ptr` behaves like [`malloc`](Self::malloc);
    /// * `new_size == 0` frees `ptr` and returns `None`;
    /// * if the block already holds `new_size` bytes it is returned as is;
    /// * otherwise the contents move to a new block and the old one is freed.
    ///
    /// On error the original allocation is untouched.
    ///
    /// # Errors
    /// As [`malloc`](Self::malloc) and [`free`](Self::free).
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this heap.
    pub unsafe fn realloc(
        &self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.malloc(new_size).map(Some);
        };
        if new_size == 0 {
            unsafe { self.free(ptr) }?;
            return Ok(None);
        }

        let (_, header) = self.state.lock_irq().lookup(old)?;
        if header.state != USED {
            return Err(HeapError::InvalidPointer(ptr.addr()));
        }
        if header.size >= new_size {
            return Ok(Some(old));
        }

        let new = self.malloc(new_size)?;
        // Safety: both blocks are live, distinct, and `header.size < new_size`.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), header.size) };
        unsafe { self.free(ptr) }?;
        Ok(Some(new))
    }

    /// Return the allocation at `ptr` to the heap. Null is a no-op.
    ///
    /// # Errors
    /// [`InvalidPointer`](HeapError::InvalidPointer) for anything that is not
    /// the start of a block, [`DoubleFree`](HeapError::DoubleFree) for a
    /// block that is already free. The heap is unchanged in both cases.
    ///
    /// # Safety
    /// `ptr` must not be used after a successful free.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        let mut state = self.state.lock_irq();
        let (off, header) = state.lookup(ptr)?;
        let freed = state.release(off, header)?;
        self.used.fetch_sub(freed, Ordering::Relaxed);
        Ok(())
    }

    /// Payload bytes currently handed out.
    #[must_use]
    pub fn get_used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Payload bytes available in free blocks, without growing.
    #[must_use]
    pub fn get_free(&self) -> usize {
        let state = self.state.lock_irq();
        state
            .blocks()
            .filter(|(_, h)| h.state == FREE)
            .map(|(_, h)| h.size)
            .sum()
    }

    /// Number of blocks, free and used.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock_irq().blocks().count()
    }

    /// Bytes of the range currently mapped.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.state.lock_irq().mapped
    }

    /// Size of the reserved range.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock_irq().limit
    }

    #[must_use]
    pub fn start(&self) -> VirtualAddress {
        self.state.lock_irq().base
    }
}

unsafe impl<B: HeapBacking> GlobalAlloc for KernelHeap<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        self.malloc(layout.size().max(1))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        self.calloc(1, layout.size().max(1))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(e) = unsafe { self.free(ptr) } {
            log::warn!("heap: rejected dealloc: {e}");
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        match unsafe { Self::realloc(self, ptr, new_size.max(1)) } {
            Ok(Some(p)) => p.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }
}
