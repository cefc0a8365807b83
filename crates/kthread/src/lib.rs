//! # kthread - Preemptive Single-Core Thread Scheduling
//!
//! Thread control blocks, the priority-ordered ready queue, the
//! wakeup-ordered sleep queue and the dispatcher of a small kernel.
//!
//! ## Architecture
//!
//! **Threads**: every thread owns one page; the control block sits at its
//! bottom and the stack grows down from the top. A canary at the end of the
//! control block catches stack overflows.
//!
//! **Dispatcher**: strict priority. The front of the ready queue runs, the
//! idle thread runs when the queue is empty. Preemption raised from
//! interrupt context is deferred to interrupt return.
//!
//! **Platform**: interrupt control, page allocation, the context switch and
//! address-space activation are traits implemented by a port. The `std`
//! feature adds [`sim::SimPlatform`], which runs the scheduler on a host.
//!
//! ## Module Overview
//!
//! - [`thread`] - Control block, priorities, identifiers
//! - [`scheduler`] - Dispatcher, block/unblock, sleep/wake, tick hook
//! - [`platform`] - Hardware traits and the opaque saved context
//! - [`sync`] - Interrupt-disabling critical sections
//! - [`config`] - Scheduler configuration and builder

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod platform;
mod queue;
pub mod scheduler;
#[cfg(feature = "std")]
pub mod sim;
pub mod sync;
pub mod thread;

pub use config::{KernelConfig, KernelConfigBuilder, TieOrder};
pub use error::{ConfigError, ThreadError};
pub use platform::{
    AddressSpace, Context, IntrLevel, Interrupts, Page, PageAllocator, Platform, Switch,
    TimerDevice, PAGE_SIZE,
};
pub use scheduler::{Scheduler, ThreadStats};
pub use thread::{Priority, ThreadRef, ThreadStatus, Tick, Tid};

#[cfg(all(test, feature = "std"))]
mod tests;
