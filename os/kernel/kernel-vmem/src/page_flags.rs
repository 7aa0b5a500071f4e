bitflags::bitflags! {
    /// Caller-facing mapping permissions.
    ///
    /// Each flag sits at its architectural bit position, so a leaf entry is
    /// just `frame | flags`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// The mapping is valid. Without it the CPU faults on any access.
        const PRESENT = 1 << 0;

        /// Writes are allowed (subject to `CR0.WP` in supervisor mode).
        const WRITABLE = 1 << 1;

        /// Accessible from CPL3. Must also be set on every parent entry.
        const USER = 1 << 2;

        /// Instruction fetches fault (requires `EFER.NXE`).
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Flags of a parent entry linking to a freshly created table.
    pub const TABLE: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Kernel read/write data, never executable.
    pub const KERNEL_DATA: Self = Self::TABLE.union(Self::NO_EXECUTE);
}
