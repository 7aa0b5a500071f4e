//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: busy-waiting mutual exclusion for short critical sections.
//!   Use [`SpinLock::lock_irq`] for any lock an interrupt handler may also
//!   take; it keeps interrupts disabled while the lock is held.
//! * [`IrqGuard`]: RAII interrupt disable/restore.
//! * [`SyncOnceCell`]: write-once cell for boot-time singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
