//! Scheduler configuration.

use crate::error::ConfigError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lowest timer frequency the 8254 divisor can express.
pub const MIN_TIMER_HZ: u32 = 19;
/// Highest recommended timer frequency.
pub const MAX_TIMER_HZ: u32 = 1000;

/// Placement of a newly readied thread relative to ready threads of equal
/// priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TieOrder {
    /// Behind earlier equals: equal priorities share the CPU round-robin.
    #[default]
    Fifo,
    /// Ahead of earlier equals: the most recently readied thread runs first.
    Lifo,
}

/// Configuration for the scheduler and the timer built on it.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Ticks a thread may run before a preemption is requested.
    pub time_slice: u32,
    /// Periodic timer interrupt frequency.
    pub timer_hz: u32,
    pub tie_order: TieOrder,
    pub idle_name: &'static str,
    pub initial_name: &'static str,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            time_slice: 4,
            timer_hz: 100,
            tie_order: TieOrder::Fifo,
            idle_name: "idle",
            initial_name: "main",
        }
    }
}

impl KernelConfig {
    /// Creates a new configuration builder seeded with the defaults.
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    /// Checks the invariants every scheduler relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_TIMER_HZ..=MAX_TIMER_HZ).contains(&self.timer_hz) {
            return Err(ConfigError::TimerFrequency(self.timer_hz));
        }
        if self.time_slice == 0 {
            return Err(ConfigError::ZeroTimeSlice);
        }
        Ok(())
    }
}

/// Builder for [`KernelConfig`].
#[derive(Debug, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn time_slice(mut self, ticks: u32) -> Self {
        self.config.time_slice = ticks;
        self
    }

    pub fn timer_hz(mut self, hz: u32) -> Self {
        self.config.timer_hz = hz;
        self
    }

    pub fn tie_order(mut self, order: TieOrder) -> Self {
        self.config.tie_order = order;
        self
    }

    /// Sets the name given to the idle thread created by `start`.
    pub fn idle_name(mut self, name: &'static str) -> Self {
        self.config.idle_name = name;
        self
    }

    /// Sets the name given to the boot thread adopted by `init`.
    pub fn initial_name(mut self, name: &'static str) -> Self {
        self.config.initial_name = name;
        self
    }

    pub fn build(self) -> Result<KernelConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
