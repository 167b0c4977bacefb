//! Scheduler error types
//!
//! Only the scheduling-parameter and lifecycle operations report errors.
//! Invariant violations inside the scheduler are kernel bugs and panic;
//! redundant requests (double enqueue, switch to a non-ready context) are
//! silent no-ops.

use core::fmt;

/// Errors returned by scheduling-parameter and lifecycle operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use = "scheduler errors must be handled"]
pub enum SchedError {
    /// The context reference does not name a live context.
    InvalidContext,

    /// No scheduling context with the requested id exists on the context.
    InvalidSchedContext,

    /// The requested priority exceeds the context's maximum controlled
    /// priority.
    PriorityAboveMcp,

    /// The context is in periodic mode or has a deadline armed.
    ///
    /// Real-time timeslices cannot be added or removed and periodic
    /// execution cannot be started twice.
    PeriodicActive,

    /// The context is not in periodic mode.
    NotPeriodic,

    /// The requested start of the first period already lies in the past.
    ClockInPast,

    /// The timeslice id given to a yield does not match the active one.
    IdMismatch,

    /// The context still holds locks on other contexts.
    ContextLocked,

    /// The context is running on its CPU.
    ContextRunning,

    /// The object table is full.
    OutOfMemory,
}

impl SchedError {
    /// Get a short description of the error.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidContext => "invalid context",
            Self::InvalidSchedContext => "no such scheduling context",
            Self::PriorityAboveMcp => "priority above maximum controlled priority",
            Self::PeriodicActive => "periodic mode active",
            Self::NotPeriodic => "not in periodic mode",
            Self::ClockInPast => "period start lies in the past",
            Self::IdMismatch => "timeslice id mismatch",
            Self::ContextLocked => "context still holds locks",
            Self::ContextRunning => "context is running",
            Self::OutOfMemory => "out of memory",
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_as_str() {
        let e = SchedError::PriorityAboveMcp;
        assert_eq!(format!("{e}"), e.as_str());
        assert_eq!(SchedError::ClockInPast.as_str(), "period start lies in the past");
    }
}
