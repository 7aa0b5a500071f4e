#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, Size4K};

/// CR3 with PCID disabled (`CR4.PCIDE = 0`).
///
/// Bits 12..=51 hold the physical frame of the active top-level page table.
#[bitfield(u64)]
pub struct Cr3 {
    #[bits(3)]
    __: u8,

    /// Page-level write-through for accesses to the top-level table.
    pub pwt: bool,

    /// Page-level cache disable for accesses to the top-level table.
    pub pcd: bool,

    #[bits(7)]
    __: u8,

    /// Top-level table physical address `>> 12`.
    #[bits(40)]
    root_frame: u64,

    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` as the top-level table, write-back cached.
    ///
    /// `root` must be 4 KiB aligned.
    #[must_use]
    pub const fn with_root(root: PhysicalAddress) -> Self {
        debug_assert!(root.is_aligned::<Size4K>(), "root table must be 4K aligned");
        Self::new().with_root_frame(root.as_u64() >> 12)
    }

    /// Physical address of the active top-level table.
    #[must_use]
    pub const fn root_table(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_frame() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
