use crate::{PhysicalAddress, Size4K};
use core::fmt;

/// Half-open physical address range `[start, end)`.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct PhysicalRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl PhysicalRange {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    /// Builds `[base, base + len)`, saturating at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn from_base_len(base: u64, len: u64) -> Self {
        Self {
            start: PhysicalAddress::new(base),
            end: PhysicalAddress::new(base.saturating_add(len)),
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end.as_u64() <= self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        self.start.as_u64() <= pa.as_u64() && pa.as_u64() < self.end.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Grows the range to whole frames: start rounds down, end rounds up.
    #[must_use]
    pub fn frames_outward(&self) -> Self {
        Self {
            start: self.start.align_down::<Size4K>(),
            end: self
                .end
                .align_up::<Size4K>()
                .unwrap_or_else(|| PhysicalAddress::new(u64::MAX).align_down::<Size4K>()),
        }
    }

    /// Shrinks the range to whole frames: start rounds up, end rounds down.
    #[must_use]
    pub fn frames_inward(&self) -> Self {
        let start = self.start.align_up::<Size4K>().unwrap_or(self.end);
        let end = self.end.align_down::<Size4K>();
        if end.as_u64() < start.as_u64() {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }
}

impl fmt::Debug for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}
