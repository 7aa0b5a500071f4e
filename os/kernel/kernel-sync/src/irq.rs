//! Interrupt masking.
//!
//! On bare-metal x86-64 (`target_os = "none"`) these functions execute
//! `cli`/`sti` and read `RFLAGS.IF`. Hosted builds (unit tests, tools) have no
//! interrupts to mask; there the guard only tracks a per-thread flag so tests
//! can observe that a critical section ran with "interrupts off".

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// `RFLAGS.IF`, the interrupt enable flag.
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r & RFLAGS_IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    extern crate std;

    use core::cell::Cell;

    std::thread_local! {
        static DISABLED: Cell<bool> = const { Cell::new(false) };
    }

    #[inline]
    pub fn interrupts_enabled() -> bool {
        !DISABLED.with(Cell::get)
    }

    #[inline]
    pub fn disable() {
        DISABLED.with(|d| d.set(true));
    }

    #[inline]
    pub fn enable() {
        DISABLED.with(|d| d.set(false));
    }
}

/// Whether maskable interrupts are currently enabled (`RFLAGS.IF`).
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::interrupts_enabled()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Nests: only the outermost guard (the one that observed `IF = 1`)
/// re-enables interrupts.
///
/// # Privilege
///
/// On bare metal this must run at CPL0; `cli` faults in user mode.
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = arch::interrupts_enabled();
        if were_enabled {
            arch::disable();
        }
        Self { were_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}
