//! Interrupt-level synchronization.
//!
//! On a single core the only lock is "interrupts off". [`IntrGuard`] turns
//! that into an RAII critical section and hands out the
//! [`CriticalSection`] token that unlocks state kept in a
//! `critical_section::Mutex<RefCell<T>>`.

#[cfg(not(feature = "std"))]
pub use alloc::sync::Arc;
#[cfg(feature = "std")]
pub use std::sync::Arc;

use critical_section::CriticalSection;

use crate::platform::{IntrLevel, Interrupts};

/// Disables interrupts for its lifetime and restores the previous level on
/// drop.
pub struct IntrGuard<'a, I: Interrupts + ?Sized> {
    intr: &'a I,
    previous: IntrLevel,
}

impl<'a, I: Interrupts + ?Sized> IntrGuard<'a, I> {
    pub fn new(intr: &'a I) -> Self {
        let previous = intr.disable();
        Self { intr, previous }
    }

    /// Token valid for as long as the guard keeps interrupts disabled.
    pub fn cs(&self) -> CriticalSection<'_> {
        // SAFETY: interrupts stay off until the guard is dropped, and on a
        // single core nothing else can run in the meantime.
        unsafe { CriticalSection::new() }
    }
}

impl<I: Interrupts + ?Sized> Drop for IntrGuard<'_, I> {
    fn drop(&mut self) {
        self.intr.set_level(self.previous);
    }
}
