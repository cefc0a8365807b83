//! x86-64 port of `kthread`.
//!
//! Provides the CPU half of [`kthread::Platform`]: interrupt flag control,
//! `sti; hlt` idling, CR3 switching and a context switch that saves the full
//! register set as an interrupt frame and resumes the next thread with
//! `iretq`. The 8254 PIT serves as the [`kthread::TimerDevice`]. Interrupt
//! controller bookkeeping and page allocation come from a [`Board`].

#![no_std]
#![cfg(target_arch = "x86_64")]

pub mod context;
pub mod cpu;
pub mod pit;
pub mod platform;

pub use context::{IntrFrame, Selectors};
pub use pit::Pit;
pub use platform::{Board, X86_64};
