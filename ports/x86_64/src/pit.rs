//! 8254 programmable interval timer.

use x86_64::instructions::port::Port;

/// Input clock of the PIT in hertz.
pub const PIT_HZ: u32 = 1_193_180;

/// Interrupt vector the PIT is routed to after PIC remapping.
pub const PIT_VECTOR: u8 = 0x20;

const COMMAND_PORT: u16 = 0x43;
const CHANNEL0_PORT: u16 = 0x40;
/// Counter 0, LSB then MSB, mode 2 (rate generator), binary.
const RATE_GENERATOR: u8 = 0x34;

/// Counter reload value for a `hz` interrupt rate, rounded to nearest.
///
/// # Panics
///
/// Panics below 19 Hz, where the divisor no longer fits 16 bits.
pub fn divisor(hz: u32) -> u16 {
    assert!(hz >= 19, "8254 timer requires at least 19 Hz, got {hz}");
    ((PIT_HZ + hz / 2) / hz) as u16
}

/// Handle to channel 0 of the PIT.
#[derive(Debug, Default)]
pub struct Pit;

impl Pit {
    pub const fn new() -> Self {
        Self
    }

    /// Starts periodic interrupts at `hz`.
    pub fn program(&self, hz: u32) {
        let count = divisor(hz);
        let mut command = Port::<u8>::new(COMMAND_PORT);
        let mut channel0 = Port::<u8>::new(CHANNEL0_PORT);
        // SAFETY: these ports belong to the PIT, which only this handle
        // programs.
        unsafe {
            command.write(RATE_GENERATOR);
            channel0.write((count & 0xff) as u8);
            channel0.write((count >> 8) as u8);
        }
        log::debug!("PIT channel 0 divisor {count} for {hz} Hz");
    }
}
