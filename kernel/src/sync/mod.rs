//! Synchronization primitives for single-CPU kernel state.
//!
//! The kernel runs on a single CPU (see `Non-goals`), so these locks exist
//! to guard against re-entrancy from interrupt handlers, not from other
//! cores. [`SpinLock`] is a plain test-and-test-and-set spinlock; its guard
//! does nothing to interrupts, so it must not be held across a path that an
//! ISR can also take. [`IrqSpinLock`] additionally disables interrupts for
//! the lifetime of the guard, which is what the PFA bitmap, the scheduler's
//! process list, and the keyboard ring buffer actually need, since all three
//! are touched from ISR context.

mod spinlock;
mod irq_spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
