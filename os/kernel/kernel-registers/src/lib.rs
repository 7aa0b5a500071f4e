//! # Typed `x86_64` Control Registers
//!
//! Only what the memory core needs: [`Cr3`], the page-table base register.
//! Register access is gated behind the `asm` feature so the bit layouts stay
//! usable (and testable) on any host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cr3;

pub use cr3::Cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires CPL0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires CPL0. Writing a
    /// control register changes global CPU state.
    unsafe fn store_unsafe(self);
}
