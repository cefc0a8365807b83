//! # ktimer - System Timer
//!
//! Periodic tick counter for the `kthread` scheduler. Every tick the
//! interrupt handler advances the counter, charges the tick to the running
//! thread's time slice and wakes threads whose sleep has expired.
//!
//! ## Module Overview
//!
//! - [`timer`] - Tick counter, interrupt handler and sleep APIs
//! - [`calibrate`] - Busy-wait calibration and sub-tick delays

#![cfg_attr(not(feature = "std"), no_std)]

pub mod calibrate;
pub mod timer;

pub use calibrate::{busy_wait, calibrate_loops, SleepPlan};
pub use timer::Timer;
