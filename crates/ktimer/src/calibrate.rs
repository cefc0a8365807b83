//! Busy-wait calibration and sub-tick delays.

use kthread::Tick;

/// Loop count the calibration search starts from.
pub const CALIBRATION_SEED: u32 = 1 << 10;

/// Finds the number of [`busy_wait`] iterations that fit in one tick.
///
/// `too_many` runs the given number of loops and reports whether a tick
/// boundary passed meanwhile. The search first finds the largest power of
/// two that fits, then refines the bits below it one at a time down to
/// 1/512 of that power, keeping each bit whose addition still fits.
///
/// # Panics
///
/// Panics if the loop count overflows, i.e. `too_many` never reports true.
pub fn calibrate_loops(mut too_many: impl FnMut(u32) -> bool) -> u32 {
    let mut loops_per_tick = CALIBRATION_SEED;
    while !too_many(loops_per_tick << 1) {
        loops_per_tick <<= 1;
        assert!(loops_per_tick != 0, "loops_per_tick overflowed during calibration");
    }

    let high_bit = loops_per_tick;
    let mut test_bit = high_bit >> 1;
    while test_bit != high_bit >> 10 {
        if !too_many(loops_per_tick | test_bit) {
            loops_per_tick |= test_bit;
        }
        test_bit >>= 1;
    }
    loops_per_tick
}

/// Spins for `loops` iterations.
///
/// Kept out of line so every call site times the same code that was
/// calibrated.
#[inline(never)]
pub fn busy_wait(loops: i64) {
    let mut remaining = loops;
    while remaining > 0 {
        remaining = core::hint::black_box(remaining - 1);
    }
}

/// How a real-time delay of `num / denom` seconds is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepPlan {
    /// At least one tick: block on the sleep queue for this many ticks.
    Ticks(Tick),
    /// Shorter than a tick: spin for this many busy-wait loops.
    Spin(i64),
}

impl SleepPlan {
    /// # Panics
    ///
    /// Panics for sub-tick delays whose `denom` is not a multiple of 1000.
    pub fn for_duration(num: i64, denom: i64, hz: u32, loops_per_tick: u32) -> Self {
        let hz = i64::from(hz);
        let ticks = num * hz / denom;
        if ticks > 0 {
            return Self::Ticks(ticks);
        }
        assert!(denom % 1000 == 0, "sub-tick delay denominator {denom} is not a multiple of 1000");
        // Scaled down by 1000 first so the product cannot overflow.
        Self::Spin(i64::from(loops_per_tick) * num / 1000 * hz / (denom / 1000))
    }
}
