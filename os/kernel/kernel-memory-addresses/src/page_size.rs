use core::fmt;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the x86-64 page sizes.
///
/// Only the three architectural sizes implement it: 4 KiB leaves in a page
/// table, 2 MiB leaves in a page directory and 1 GiB leaves in a page
/// directory pointer table.
pub trait PageSize: sealed::Sealed + Copy + Eq + Ord + fmt::Debug {
    /// Page size in bytes (power of two).
    const SIZE: u64;

    /// `log2(SIZE)`, the number of in-page offset bits.
    const SHIFT: u32;

    /// Mask selecting the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($label)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, the base paging granularity and the frame size.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB huge page.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB giant page.
    Size1G, 30, "1G"
);

const _: () = {
    assert!(Size4K::SIZE == 4096);
    assert!(Size2M::SIZE == 512 * Size4K::SIZE);
    assert!(Size1G::SIZE == 512 * Size2M::SIZE);
};
