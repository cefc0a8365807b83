//! RFLAGS.IF based interrupt level control.

use kthread::IntrLevel;
use x86_64::instructions::interrupts;

pub fn level() -> IntrLevel {
    if interrupts::are_enabled() {
        IntrLevel::On
    } else {
        IntrLevel::Off
    }
}

/// Sets the interrupt flag and returns the previous level.
pub fn set_level(level: IntrLevel) -> IntrLevel {
    let previous = self::level();
    match level {
        IntrLevel::On => interrupts::enable(),
        IntrLevel::Off => interrupts::disable(),
    }
    previous
}

/// `sti; hlt`: the one-instruction shadow of `sti` guarantees that no
/// interrupt is taken between the two.
pub fn wait_for_interrupt() {
    interrupts::enable_and_hlt();
}
