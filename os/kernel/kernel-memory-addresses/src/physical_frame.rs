use crate::{PageSize, PhysicalAddress, Size4K};
use core::fmt;

/// A 4 KiB physical frame, identified by its frame number (`address >> 12`).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(u64);

impl PhysicalFrame {
    /// Frame size in bytes.
    pub const SIZE: u64 = Size4K::SIZE;

    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self(number)
    }

    /// The frame that contains `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64() >> Size4K::SHIFT)
    }

    /// The frame starting exactly at `pa`, or `None` if `pa` is not frame aligned.
    #[inline]
    #[must_use]
    pub const fn from_start_address(pa: PhysicalAddress) -> Option<Self> {
        if pa.is_aligned::<Size4K>() {
            Some(Self::containing(pa))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn start_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << Size4K::SHIFT)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame#{} ({})", self.0, self.start_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_start_address_rejects_unaligned() {
        let unaligned = PhysicalAddress::new(0x1001);
        assert_eq!(PhysicalFrame::from_start_address(unaligned), None);
        let f = PhysicalFrame::from_start_address(PhysicalAddress::new(0x5000)).unwrap();
        assert_eq!(f.number(), 5);
        assert_eq!(PhysicalFrame::containing(PhysicalAddress::new(0x5FFF)), f);
    }
}
