use crate::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign};

/// Virtual memory address.
///
/// No canonical-form validation happens on construction; use
/// [`is_canonical`](Self::is_canonical) where that matters.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Captures the address of `ptr`, exposing its provenance so that
    /// [`as_mut_ptr`](Self::as_mut_ptr) may later turn it back into a pointer.
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.expose_provenance() as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Reinterprets the address as a raw pointer in the current address space.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        core::ptr::with_exposed_provenance_mut(self.0 as usize)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & S::OFFSET_MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !S::OFFSET_MASK)
    }

    /// The byte offset into the `S`-sized page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0 & S::OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Whether bits 48..=63 are copies of bit 47 (4-level paging).
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let high = self.0 >> 47;
        high == 0 || high == 0x1_FFFF
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Size4K;

    #[test]
    fn canonical_form() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0xFFFF_7FFF_FFFF_FFFF).is_canonical());
    }

    #[test]
    fn pointer_round_trip_keeps_address() {
        let mut value = 17_u32;
        let va = VirtualAddress::from_ptr(&raw mut value);
        unsafe { va.as_mut_ptr::<u32>().write(42) };
        assert_eq!(value, 42);
    }

    #[test]
    fn page_offset_masks_low_bits() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1ABC);
        assert_eq!(va.page_offset::<Size4K>(), 0xABC);
        assert_eq!(va.align_down::<Size4K>().as_u64(), 0xFFFF_FFFF_8000_1000);
    }
}
