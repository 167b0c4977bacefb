//! Scheduler configuration
//!
//! Compile-time defaults for the scheduler. A [`SchedConfig`] is handed to
//! [`Kernel::new`](crate::Kernel::new) and never changes afterwards.

use rtk_core::{Priority, Time};

pub use rtk_core::{MAX_PRIO, PRIO_LEVELS};

/// Maximum number of CPUs supported.
pub const MAX_CPUS: usize = 8;

/// Default scheduler tick (1ms).
pub const DEFAULT_GRANULARITY: Time = 1_000;

/// Default timesharing quantum (10ms).
pub const DEFAULT_QUANTUM: Time = 10_000;

/// Default priority of new contexts.
pub const DEFAULT_PRIO: Priority = 128;

/// Scheduler configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedConfig {
    /// Scheduler tick in microseconds. Quanta are rounded up to it.
    pub granularity: Time,
    /// Quantum of a new context's default timeslice.
    pub default_quantum: Time,
    /// Priority of a new context's default timeslice.
    pub default_prio: Priority,
    /// Maximum controlled priority of a new context.
    pub default_mcp: Priority,
    /// Charge CPU time at every switch instead of once per tick.
    pub fine_grained_cputime: bool,
    /// Number of CPUs that may be brought up.
    pub max_cpus: usize,
}

impl SchedConfig {
    /// Default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            granularity: DEFAULT_GRANULARITY,
            default_quantum: DEFAULT_QUANTUM,
            default_prio: DEFAULT_PRIO,
            default_mcp: MAX_PRIO,
            fine_grained_cputime: false,
            max_cpus: MAX_CPUS,
        }
    }

    /// Use a different scheduler tick.
    #[must_use]
    pub const fn with_granularity(mut self, granularity: Time) -> Self {
        self.granularity = granularity;
        self
    }

    /// Use a different default quantum.
    #[must_use]
    pub const fn with_default_quantum(mut self, quantum: Time) -> Self {
        self.default_quantum = quantum;
        self
    }

    /// Charge CPU time at every switch.
    #[must_use]
    pub const fn with_fine_grained_cputime(mut self, on: bool) -> Self {
        self.fine_grained_cputime = on;
        self
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}
