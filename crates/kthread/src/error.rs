//! Recoverable errors reported by the thread layer.
//!
//! Contract violations (wrong interrupt level, unblocking a thread that is
//! not blocked, a clobbered canary) are not represented here: they panic.

use thiserror::Error;

/// Errors returned by thread creation and scheduler start-up.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// The page allocator has no free page for a new control block and stack.
    #[error("no free page available for a new thread")]
    OutOfPages,
}

/// Errors returned by [`KernelConfigBuilder::build`](crate::config::KernelConfigBuilder::build).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("timer frequency {0} Hz outside supported range 19..=1000")]
    TimerFrequency(u32),
    #[error("time slice must be at least one tick")]
    ZeroTimeSlice,
}
