//! # Buddy Physical Frame Allocator
//!
//! Manages `[0, total_memory)` in 4 KiB frames, grouped into power-of-two
//! blocks of order `0..MAX_ORDER` (1 to 1024 frames).
//!
//! ```text
//! 0          kernel_end   bitmap end            total_memory
//! |  kernel  |  bitmap    | managed frames ...  |
//! ```
//!
//! * A bitmap at `kernel_end` records one bit per frame (`1` = used).
//!   Frames below the end of the bitmap are never handed out.
//! * Each order has an intrusive singly linked free list. The list node
//!   lives in the first bytes of the free block itself and is reached
//!   through a [`PhysMapper`].
//! * A block of order `k` starts at a multiple of `4 KiB << k`; its buddy is
//!   `addr ^ (4 KiB << k)`. Freeing merges with free buddies as far as
//!   possible.
//!
//! All state lives behind one [`SpinLock`], taken with interrupts disabled.

use crate::bitmap::FrameBitmap;
use kernel_info::memory::{FRAME_SIZE, MAX_BLOCK_FRAMES, MAX_ORDER};
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("zero frames requested")]
    ZeroCount,
    #[error("{count} frames exceed the largest block of {max} frames")]
    TooLarge { count: usize, max: usize },
    #[error("no free block of order {order} or above")]
    OutOfMemory { order: usize },
    #[error("{addr} is not aligned for an order {order} block")]
    Misaligned { addr: PhysicalAddress, order: usize },
    #[error("{addr} (order {order}) lies outside managed memory")]
    OutOfRange { addr: PhysicalAddress, order: usize },
    #[error("{addr} (order {order}) is already free")]
    DoubleFree { addr: PhysicalAddress, order: usize },
    #[error("frame bitmap for {total_memory:#x} bytes does not fit above {kernel_end}")]
    BitmapDoesNotFit {
        total_memory: u64,
        kernel_end: PhysicalAddress,
    },
    #[error("invalid region {start}..{end}")]
    InvalidRegion {
        start: PhysicalAddress,
        end: PhysicalAddress,
    },
}

/// Smallest order whose block holds `count` frames.
///
/// # Errors
/// [`ZeroCount`](FrameAllocError::ZeroCount) for `0`,
/// [`TooLarge`](FrameAllocError::TooLarge) above `2^(MAX_ORDER-1)` frames.
pub fn order_for(count: usize) -> Result<usize, FrameAllocError> {
    if count == 0 {
        return Err(FrameAllocError::ZeroCount);
    }
    let too_large = FrameAllocError::TooLarge {
        count,
        max: MAX_BLOCK_FRAMES,
    };
    let order = count
        .checked_next_power_of_two()
        .ok_or(too_large)?
        .trailing_zeros() as usize;
    if order >= MAX_ORDER {
        return Err(too_large);
    }
    Ok(order)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn frame_index(pa: PhysicalAddress) -> usize {
    (pa.as_u64() / FRAME_SIZE) as usize
}

#[inline]
const fn frame_address(frame: usize) -> PhysicalAddress {
    PhysicalAddress::new(frame as u64 * FRAME_SIZE)
}

#[inline]
const fn block_bytes(order: usize) -> u64 {
    FRAME_SIZE << order
}

/// Free-list node stored in the first bytes of every free block.
#[repr(C)]
#[derive(Copy, Clone)]
struct FreeBlock {
    next: u64,
    order: u64,
}

const NIL: u64 = u64::MAX;

struct BuddyState<'m, M: PhysMapper> {
    mapper: &'m M,
    bitmap: FrameBitmap<'m>,
    heads: [Option<PhysicalAddress>; MAX_ORDER],
    lengths: [usize; MAX_ORDER],
    free_frames: usize,
}

impl<M: PhysMapper> BuddyState<'_, M> {
    #[allow(clippy::cast_ptr_alignment)]
    fn read_node(&self, block: PhysicalAddress) -> FreeBlock {
        // Safety: `block` heads a free block inside managed RAM, written by `push`.
        unsafe { self.mapper.phys_to_ptr(block).cast::<FreeBlock>().read() }
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn write_node(&self, block: PhysicalAddress, node: FreeBlock) {
        // Safety: `block` is a frame-aligned free block owned by the allocator.
        unsafe {
            self.mapper
                .phys_to_ptr(block)
                .cast::<FreeBlock>()
                .write(node)
        }
    }

    fn next_of(&self, block: PhysicalAddress, order: usize) -> Option<PhysicalAddress> {
        let node = self.read_node(block);
        debug_assert_eq!(node.order, order as u64, "free list corrupted at {block}");
        (node.next != NIL).then(|| PhysicalAddress::new(node.next))
    }

    fn set_next(&self, block: PhysicalAddress, order: usize, next: Option<PhysicalAddress>) {
        self.write_node(
            block,
            FreeBlock {
                next: next.map_or(NIL, PhysicalAddress::as_u64),
                order: order as u64,
            },
        );
    }

    fn push(&mut self, order: usize, block: PhysicalAddress) {
        self.set_next(block, order, self.heads[order]);
        self.heads[order] = Some(block);
        self.lengths[order] += 1;
    }

    fn pop(&mut self, order: usize) -> Option<PhysicalAddress> {
        let block = self.heads[order]?;
        self.heads[order] = self.next_of(block, order);
        self.lengths[order] -= 1;
        Some(block)
    }

    /// Unlink `block` from the order-`order` list; `false` if it is not there.
    fn remove(&mut self, order: usize, block: PhysicalAddress) -> bool {
        let mut prev = None;
        let mut cur = self.heads[order];
        while let Some(c) = cur {
            let next = self.next_of(c, order);
            if c == block {
                match prev {
                    None => self.heads[order] = next,
                    Some(p) => self.set_next(p, order, next),
                }
                self.lengths[order] -= 1;
                return true;
            }
            prev = Some(c);
            cur = next;
        }
        false
    }

    /// Any listed block overlapping frames `[start, end)`, with its order.
    fn find_overlapping(&self, start: usize, end: usize) -> Option<(usize, PhysicalAddress)> {
        for order in 0..MAX_ORDER {
            let mut cur = self.heads[order];
            while let Some(c) = cur {
                let first = frame_index(c);
                if first < end && start < first + (1 << order) {
                    return Some((order, c));
                }
                cur = self.next_of(c, order);
            }
        }
        None
    }

    /// List a block whose frames are already free in the bitmap, merging
    /// with free buddies first.
    fn insert(&mut self, mut block: PhysicalAddress, mut order: usize) {
        while order + 1 < MAX_ORDER {
            let buddy = block ^ block_bytes(order);
            if self.bitmap.is_used(frame_index(buddy)) || !self.remove(order, buddy) {
                break;
            }
            block = block.min(buddy);
            order += 1;
        }
        self.push(order, block);
    }

    fn alloc(&mut self, order: usize) -> Result<PhysicalAddress, FrameAllocError> {
        let found = (order..MAX_ORDER)
            .find(|&o| self.heads[o].is_some())
            .ok_or(FrameAllocError::OutOfMemory { order })?;
        let block = self
            .pop(found)
            .ok_or(FrameAllocError::OutOfMemory { order })?;

        // Hand the upper halves back, largest first.
        for o in (order..found).rev() {
            self.push(o, block + block_bytes(o));
        }

        let frames = 1 << order;
        self.bitmap.set_range(frame_index(block), frames, true);
        self.free_frames -= frames;
        Ok(block)
    }

    fn free(
        &mut self,
        block: PhysicalAddress,
        order: usize,
        managed_start: usize,
    ) -> Result<(), FrameAllocError> {
        if !block.is_aligned_to(block_bytes(order)) {
            return Err(FrameAllocError::Misaligned { addr: block, order });
        }
        let first = frame_index(block);
        let frames = 1 << order;
        if first < managed_start || first + frames > self.bitmap.frames() {
            return Err(FrameAllocError::OutOfRange { addr: block, order });
        }
        if !self.bitmap.all_used(first, frames) {
            return Err(FrameAllocError::DoubleFree { addr: block, order });
        }

        self.bitmap.set_range(first, frames, false);
        self.free_frames += frames;
        self.insert(block, order);
        Ok(())
    }

    /// Free frames `[start, end)`, all currently used and unlisted, as the
    /// largest aligned blocks that fit.
    fn seed(&mut self, start: usize, end: usize) {
        let mut frame = start;
        while frame < end {
            let mut order = MAX_ORDER - 1;
            while order > 0 && (!frame.is_multiple_of(1 << order) || frame + (1 << order) > end) {
                order -= 1;
            }
            let frames = 1 << order;
            self.bitmap.set_range(frame, frames, false);
            self.free_frames += frames;
            self.insert(frame_address(frame), order);
            frame += frames;
        }
    }

    /// [`seed`](Self::seed) `[start, end)` while skipping `reserved`.
    fn seed_excluding<I>(&mut self, start: usize, end: usize, reserved: &I)
    where
        I: Iterator<Item = PhysicalRange> + Clone,
    {
        let mut cursor = start;
        while cursor < end {
            let next = reserved
                .clone()
                .map(|r| r.frames_outward())
                .map(|r| (frame_index(r.start), frame_index(r.end)))
                .filter(|&(s, e)| s < e && e > cursor && s < end)
                .min_by_key(|&(s, _)| s);

            match next {
                None => {
                    self.seed(cursor, end);
                    return;
                }
                Some((s, e)) => {
                    if s > cursor {
                        self.seed(cursor, s);
                    }
                    cursor = e;
                }
            }
        }
    }

    /// Mark frames `[start, end)` used, splitting any free block that straddles
    /// the edges and returning its outside parts to the free lists.
    fn carve_out(&mut self, start: usize, end: usize) {
        while let Some((order, block)) = self.find_overlapping(start, end) {
            self.remove(order, block);
            let first = frame_index(block);
            let frames = 1 << order;
            self.bitmap.set_range(first, frames, true);
            self.free_frames -= frames;

            if first < start {
                self.seed(first, start);
            }
            if first + frames > end {
                self.seed(end, first + frames);
            }
        }
    }
}

/// Buddy allocator over `[0, total_memory)`.
pub struct BuddyFrameAllocator<'m, M: PhysMapper> {
    total_frames: usize,
    managed_start: usize,
    state: SpinLock<BuddyState<'m, M>>,
}

impl<'m, M: PhysMapper> BuddyFrameAllocator<'m, M> {
    /// Build the allocator, treating everything above the bitmap as free RAM.
    ///
    /// # Errors
    /// [`BitmapDoesNotFit`](FrameAllocError::BitmapDoesNotFit) when the
    /// bitmap would end above `total_memory`.
    ///
    /// # Safety
    /// See [`with_reserved`](Self::with_reserved).
    pub unsafe fn new(
        mapper: &'m M,
        total_memory: u64,
        kernel_end: PhysicalAddress,
    ) -> Result<Self, FrameAllocError> {
        unsafe { Self::with_reserved(mapper, total_memory, kernel_end, core::iter::empty()) }
    }

    /// Build the allocator; frames overlapping any `reserved` range stay used.
    ///
    /// The bitmap is placed at `kernel_end` rounded up to a frame. Every
    /// other frame in `[bitmap end, total_memory)` outside `reserved` is
    /// seeded into the free lists.
    ///
    /// # Errors
    /// [`BitmapDoesNotFit`](FrameAllocError::BitmapDoesNotFit) when the
    /// bitmap would end above `total_memory`.
    ///
    /// # Safety
    /// - `mapper` must map all of `[0, total_memory)` writable for `'m`.
    /// - Nothing else may use the bitmap location or any frame that is not
    ///   in `reserved` and lies above the bitmap.
    pub unsafe fn with_reserved<I>(
        mapper: &'m M,
        total_memory: u64,
        kernel_end: PhysicalAddress,
        reserved: I,
    ) -> Result<Self, FrameAllocError>
    where
        I: IntoIterator<Item = PhysicalRange>,
        I::IntoIter: Clone,
    {
        let does_not_fit = FrameAllocError::BitmapDoesNotFit {
            total_memory,
            kernel_end,
        };
        let total_frames = frame_index(PhysicalAddress::new(total_memory));
        let words = FrameBitmap::words_for(total_frames);

        let bitmap_start = kernel_end.align_up::<Size4K>().ok_or(does_not_fit)?;
        let managed_start = bitmap_start
            .checked_add(words as u64 * 8)
            .and_then(PhysicalAddress::align_up::<Size4K>)
            .filter(|end| end.as_u64() <= total_memory)
            .ok_or(does_not_fit)?;

        // Safety: the caller hands us `[bitmap_start, managed_start)`, frame aligned.
        #[allow(clippy::cast_ptr_alignment)]
        let slice = unsafe {
            core::slice::from_raw_parts_mut(mapper.phys_to_ptr(bitmap_start).cast::<u64>(), words)
        };
        let mut bitmap = FrameBitmap::new(slice, total_frames);
        bitmap.fill_used();

        let mut state = BuddyState {
            mapper,
            bitmap,
            heads: [None; MAX_ORDER],
            lengths: [0; MAX_ORDER],
            free_frames: 0,
        };
        let managed_start = frame_index(managed_start);
        state.seed_excluding(managed_start, total_frames, &reserved.into_iter());

        log::info!(
            "PFA: {} frames total, bitmap at {bitmap_start} ({words} words), {} frames free",
            total_frames,
            state.free_frames
        );

        Ok(Self {
            total_frames,
            managed_start,
            state: SpinLock::new(state),
        })
    }

    /// Allocate a block of `count.next_power_of_two()` contiguous frames,
    /// aligned to its own size.
    ///
    /// # Errors
    /// [`ZeroCount`](FrameAllocError::ZeroCount),
    /// [`TooLarge`](FrameAllocError::TooLarge) or
    /// [`OutOfMemory`](FrameAllocError::OutOfMemory).
    pub fn alloc_pages(&self, count: usize) -> Result<PhysicalAddress, FrameAllocError> {
        let order = order_for(count)?;
        let block = self.state.lock_irq().alloc(order)?;
        log::trace!("PFA: allocated {block} (order {order})");
        Ok(block)
    }

    /// Return a block obtained from [`alloc_pages`](Self::alloc_pages) with the same `count`.
    ///
    /// # Errors
    /// Rejects misaligned, out-of-range and already free blocks without
    /// touching any state.
    pub fn free_pages(&self, addr: PhysicalAddress, count: usize) -> Result<(), FrameAllocError> {
        let order = order_for(count)?;
        let result = self.state.lock_irq().free(addr, order, self.managed_start);
        match result {
            Ok(()) => log::trace!("PFA: freed {addr} (order {order})"),
            Err(e) => log::warn!("PFA: rejected free: {e}"),
        }
        result
    }

    /// Single-frame [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Errors
    /// [`OutOfMemory`](FrameAllocError::OutOfMemory).
    #[inline]
    pub fn alloc_page(&self) -> Result<PhysicalAddress, FrameAllocError> {
        self.alloc_pages(1)
    }

    /// Single-frame [`free_pages`](Self::free_pages).
    ///
    /// # Errors
    /// As [`free_pages`](Self::free_pages).
    #[inline]
    pub fn free_page(&self, addr: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.free_pages(addr, 1)
    }

    /// Take `[start, end)` out of circulation, rounded outward to frames.
    ///
    /// Frames that are already used stay used.
    ///
    /// # Errors
    /// [`InvalidRegion`](FrameAllocError::InvalidRegion) if `start > end`.
    pub fn mark_region_used(
        &self,
        start: PhysicalAddress,
        end: PhysicalAddress,
    ) -> Result<(), FrameAllocError> {
        if start > end {
            return Err(FrameAllocError::InvalidRegion { start, end });
        }
        let range = PhysicalRange::new(start, end).frames_outward();
        let first = frame_index(range.start).min(self.total_frames);
        let last = frame_index(range.end).min(self.total_frames);

        self.state.lock_irq().carve_out(first, last);
        log::debug!("PFA: marked {range:?} used");
        Ok(())
    }

    /// Put `[start, end)` back into circulation, rounded inward to frames and
    /// clamped to the managed range.
    ///
    /// # Errors
    /// [`InvalidRegion`](FrameAllocError::InvalidRegion) if `start > end`.
    pub fn mark_region_free(
        &self,
        start: PhysicalAddress,
        end: PhysicalAddress,
    ) -> Result<(), FrameAllocError> {
        if start > end {
            return Err(FrameAllocError::InvalidRegion { start, end });
        }
        let range = PhysicalRange::new(start, end).frames_inward();
        let first = frame_index(range.start).clamp(self.managed_start, self.total_frames);
        let last = frame_index(range.end).clamp(self.managed_start, self.total_frames);
        if first >= last {
            return Ok(());
        }

        let mut state = self.state.lock_irq();
        state.carve_out(first, last);
        state.seed(first, last);
        drop(state);
        log::debug!("PFA: marked {range:?} free");
        Ok(())
    }

    /// Bytes tracked by the bitmap, bitmap and kernel included.
    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.total_frames as u64 * FRAME_SIZE
    }

    #[must_use]
    pub fn free_memory(&self) -> u64 {
        self.state.lock_irq().free_frames as u64 * FRAME_SIZE
    }

    #[must_use]
    pub fn used_memory(&self) -> u64 {
        self.total_memory() - self.free_memory()
    }

    /// Frames that can ever be handed out: `[bitmap end, total_memory)`.
    #[must_use]
    pub const fn managed_range(&self) -> PhysicalRange {
        PhysicalRange::new(
            frame_address(self.managed_start),
            frame_address(self.total_frames),
        )
    }

    /// Number of listed free blocks per order.
    #[must_use]
    pub fn free_block_counts(&self) -> [usize; MAX_ORDER] {
        self.state.lock_irq().lengths
    }
}

impl<M: PhysMapper> FrameAlloc for BuddyFrameAllocator<'_, M> {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        self.alloc_page().ok()
    }

    fn free_4k(&self, frame: PhysicalAddress) {
        // Already logged by `free_pages`.
        let freed = self.free_page(frame);
        debug_assert!(freed.is_ok(), "table frame {frame} was not allocated here");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestPhys;

    const MIB: u64 = 1024 * 1024;

    fn buddy(phys: &TestPhys, total: u64, kernel_end: u64) -> BuddyFrameAllocator<'_, TestPhys> {
        unsafe { BuddyFrameAllocator::new(phys, total, pa(kernel_end)) }.unwrap()
    }

    /// 16 frames; the bitmap takes frame 0, so frames 1..16 are managed:
    /// order 0 at 1, order 1 at 2, order 2 at 4, order 3 at 8.
    fn small(phys: &TestPhys) -> BuddyFrameAllocator<'_, TestPhys> {
        buddy(phys, 16 * FRAME_SIZE, 0)
    }

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn order_for_rounds_up() {
        assert_eq!(order_for(1), Ok(0));
        assert_eq!(order_for(2), Ok(1));
        assert_eq!(order_for(3), Ok(2));
        assert_eq!(order_for(1024), Ok(10));
        assert_eq!(order_for(0), Err(FrameAllocError::ZeroCount));
        assert_eq!(
            order_for(1025),
            Err(FrameAllocError::TooLarge {
                count: MAX_BLOCK_FRAMES + 1,
                max: MAX_BLOCK_FRAMES
            })
        );
        assert!(order_for(usize::MAX).is_err());
    }

    #[test]
    fn seeds_largest_aligned_blocks() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        assert_eq!(pfa.total_memory(), 16 * FRAME_SIZE);
        assert_eq!(pfa.free_memory(), 15 * FRAME_SIZE);
        assert_eq!(
            pfa.managed_range(),
            PhysicalRange::new(pa(0x1000), pa(0x10000))
        );
        assert_eq!(&pfa.free_block_counts()[..5], &[1, 1, 1, 1, 0]);
    }

    #[test]
    fn sixteen_mib_scenario() {
        let phys = TestPhys::with_frames(4096);
        let pfa = buddy(&phys, 16 * MIB, 0);
        assert_eq!(pfa.total_memory(), 16 * MIB);
        let free0 = pfa.free_memory();
        assert_eq!(free0, 16 * MIB - FRAME_SIZE);
        let counts0 = pfa.free_block_counts();

        let block = pfa.alloc_pages(3).unwrap();
        assert!(block.is_aligned_to(4 * FRAME_SIZE));
        assert_eq!(pfa.free_memory(), free0 - 4 * FRAME_SIZE);
        assert_eq!(pfa.used_memory(), 16 * MIB - free0 + 4 * FRAME_SIZE);

        pfa.free_pages(block, 3).unwrap();
        assert_eq!(pfa.free_memory(), free0);
        assert_eq!(pfa.free_block_counts(), counts0);
    }

    #[test]
    fn split_hands_out_lowest_half() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        assert_eq!(pfa.alloc_page(), Ok(pa(0x1000)));
        // Order 0 is empty now; the order 1 block at frame 2 splits.
        assert_eq!(pfa.alloc_page(), Ok(pa(0x2000)));
        assert_eq!(pfa.alloc_page(), Ok(pa(0x3000)));
        assert_eq!(&pfa.free_block_counts()[..4], &[0, 0, 1, 1]);
    }

    #[test]
    fn buddies_merge_in_either_order() {
        for reverse in [false, true] {
            let phys = TestPhys::with_frames(16);
            let pfa = small(&phys);
            let counts0 = pfa.free_block_counts();

            assert_eq!(pfa.alloc_pages(2), Ok(pa(0x2000)));
            let a = pfa.alloc_pages(2).unwrap();
            let b = pfa.alloc_pages(2).unwrap();
            assert_eq!((a, b), (pa(0x4000), pa(0x6000)));
            assert_eq!(pfa.free_block_counts()[2], 0);

            let (first, second) = if reverse { (b, a) } else { (a, b) };
            pfa.free_pages(first, 2).unwrap();
            pfa.free_pages(second, 2).unwrap();
            assert_eq!(pfa.free_block_counts()[2], 1);

            pfa.free_pages(pa(0x2000), 2).unwrap();
            assert_eq!(pfa.free_block_counts(), counts0);
        }
    }

    #[test]
    fn rejects_bad_frees() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        let block = pfa.alloc_pages(2).unwrap();
        let free0 = pfa.free_memory();

        assert_eq!(
            pfa.free_pages(block + FRAME_SIZE, 2),
            Err(FrameAllocError::Misaligned {
                addr: block + FRAME_SIZE,
                order: 1
            })
        );
        assert_eq!(
            pfa.free_page(pa(0x10000)),
            Err(FrameAllocError::OutOfRange {
                addr: pa(0x10000),
                order: 0
            })
        );
        assert_eq!(
            pfa.free_page(pa(0)),
            Err(FrameAllocError::OutOfRange {
                addr: pa(0),
                order: 0
            })
        );
        assert_eq!(
            pfa.free_pages(pa(0x8000), 8),
            Err(FrameAllocError::DoubleFree {
                addr: pa(0x8000),
                order: 3
            })
        );
        assert_eq!(pfa.free_pages(block, 0), Err(FrameAllocError::ZeroCount));
        assert_eq!(pfa.free_memory(), free0);

        pfa.free_pages(block, 2).unwrap();
        assert_eq!(
            pfa.free_pages(block, 2),
            Err(FrameAllocError::DoubleFree {
                addr: block,
                order: 1
            })
        );
    }

    #[test]
    fn exhaustion_and_recovery() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        let counts0 = pfa.free_block_counts();

        let frames: Vec<_> = core::iter::from_fn(|| pfa.alloc_page().ok()).collect();
        assert_eq!(frames.len(), 15);
        assert_eq!(pfa.free_memory(), 0);
        assert_eq!(
            pfa.alloc_page(),
            Err(FrameAllocError::OutOfMemory { order: 0 })
        );

        let mut sorted = frames.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 15);

        for f in frames.into_iter().rev() {
            pfa.free_page(f).unwrap();
        }
        assert_eq!(pfa.free_block_counts(), counts0);
    }

    #[test]
    fn too_large_request() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        assert_eq!(
            pfa.alloc_pages(16),
            Err(FrameAllocError::OutOfMemory { order: 4 })
        );
        assert!(matches!(pfa.alloc_pages(2048), Err(FrameAllocError::TooLarge { .. })));
    }

    #[test]
    fn mark_region_used_and_free() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        let counts0 = pfa.free_block_counts();

        // Straddles the order 3 block at frame 8 and is not frame aligned.
        pfa.mark_region_used(pa(0x9800), pa(0xA800)).unwrap();
        assert_eq!(pfa.free_memory(), 13 * FRAME_SIZE);

        let frames: Vec<_> = core::iter::from_fn(|| pfa.alloc_page().ok()).collect();
        assert_eq!(frames.len(), 13);
        assert!(!frames.contains(&pa(0x9000)));
        assert!(!frames.contains(&pa(0xA000)));
        for f in frames {
            pfa.free_page(f).unwrap();
        }

        // Inward rounding: only frames 9 and 10 are fully covered.
        pfa.mark_region_free(pa(0x8800), pa(0xB800)).unwrap();
        assert_eq!(pfa.free_memory(), 15 * FRAME_SIZE);
        assert_eq!(pfa.free_block_counts(), counts0);
    }

    #[test]
    fn mark_region_free_is_idempotent_and_clamped() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        let counts0 = pfa.free_block_counts();

        pfa.mark_region_free(pa(0), pa(0x20000)).unwrap();
        assert_eq!(pfa.free_memory(), 15 * FRAME_SIZE);
        assert_eq!(pfa.free_block_counts(), counts0);

        assert_eq!(
            pfa.mark_region_used(pa(0x2000), pa(0x1000)),
            Err(FrameAllocError::InvalidRegion {
                start: pa(0x2000),
                end: pa(0x1000)
            })
        );
    }

    #[test]
    fn table_frames_round_trip_through_frame_alloc() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        let free0 = pfa.free_memory();

        let frame = pfa.alloc_4k().unwrap();
        assert_eq!(pfa.free_memory(), free0 - FRAME_SIZE);
        pfa.free_4k(frame);
        assert_eq!(pfa.free_memory(), free0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "was not allocated here")]
    fn freeing_a_foreign_table_frame_asserts() {
        let phys = TestPhys::with_frames(16);
        let pfa = small(&phys);
        pfa.free_4k(pa(0x3000));
    }

    #[test]
    fn reserved_ranges_are_never_handed_out() {
        let phys = TestPhys::with_frames(16);
        let reserved = [
            PhysicalRange::from_base_len(0x4000, 0x1800),
            PhysicalRange::from_base_len(0xF000, 0x1000),
        ];
        let pfa = unsafe {
            BuddyFrameAllocator::with_reserved(
                &phys,
                16 * FRAME_SIZE,
                PhysicalAddress::zero(),
                reserved,
            )
        }
        .unwrap();
        assert_eq!(pfa.free_memory(), 12 * FRAME_SIZE);

        let frames: Vec<_> = core::iter::from_fn(|| pfa.alloc_page().ok()).collect();
        assert_eq!(frames.len(), 12);
        for r in reserved {
            assert!(frames.iter().all(|f| !r.frames_outward().contains(*f)));
        }
    }

    #[test]
    fn bitmap_after_kernel() {
        let phys = TestPhys::with_frames(16);
        let pfa = buddy(&phys, 16 * FRAME_SIZE, 0x2345);
        assert_eq!(pfa.managed_range().start, pa(0x4000));
        assert_eq!(pfa.free_memory(), 12 * FRAME_SIZE);
        assert_eq!(
            pfa.free_page(pa(0x3000)),
            Err(FrameAllocError::OutOfRange {
                addr: pa(0x3000),
                order: 0
            })
        );
    }

    #[test]
    fn bitmap_must_fit() {
        let phys = TestPhys::with_frames(2);
        let result = unsafe { BuddyFrameAllocator::new(&phys, 2 * FRAME_SIZE, pa(0x1800)) };
        assert!(matches!(result, Err(FrameAllocError::BitmapDoesNotFit { .. })));
    }

    #[test]
    fn concurrent_alloc_free() {
        let phys = TestPhys::with_frames(1024);
        let pfa = buddy(&phys, 1024 * FRAME_SIZE, 0);
        let free0 = pfa.free_memory();
        let counts0 = pfa.free_block_counts();

        std::thread::scope(|s| {
            for t in 0..4 {
                let pfa = &pfa;
                s.spawn(move || {
                    for i in 0..200 {
                        let count = 1 + (i + t) % 4;
                        let block = pfa.alloc_pages(count).unwrap();
                        let align = count.next_power_of_two() as u64 * FRAME_SIZE;
                        assert!(block.is_aligned_to(align));
                        pfa.free_pages(block, count).unwrap();
                    }
                });
            }
        });

        assert_eq!(pfa.free_memory(), free0);
        assert_eq!(pfa.free_block_counts(), counts0);
    }
}
