use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// The two pieces of CPU state the memory manager depends on.
pub trait PagingHardware {
    /// Physical address of the top-level table the CPU is currently using.
    fn active_root(&self) -> PhysicalAddress;

    /// Drop any cached translation for the page containing `va` on this CPU.
    fn invalidate_page(&self, va: VirtualAddress);
}

/// The real thing: `CR3` and `invlpg`.
#[cfg(target_arch = "x86_64")]
#[derive(Debug)]
pub struct X86Paging {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl X86Paging {
    /// # Safety
    /// The returned handle executes privileged instructions; it may only be
    /// created and used at CPL0 with paging enabled.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86_64")]
impl PagingHardware for X86Paging {
    fn active_root(&self) -> PhysicalAddress {
        use kernel_registers::{Cr3, LoadRegisterUnsafe};
        // SAFETY: constructing `X86Paging` requires CPL0.
        unsafe { Cr3::load_unsafe() }.root_table()
    }

    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        // SAFETY: constructing `X86Paging` requires CPL0.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}
