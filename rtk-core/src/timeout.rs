//! Timeout objects
//!
//! A timeout is a future wakeup owned by a CPU's timeout queue. The kind
//! selects what happens on expiry; the set of kinds is closed, so expiry is
//! dispatched with a `match` rather than through a trait object.

use crate::refs::{ContextRef, CpuId, Time};

/// What a timeout does when it expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Blocking IPC of `owner` timed out.
    Ipc {
        /// Blocked context.
        owner: ContextRef,
    },
    /// Timesharing slice of `owner` ended.
    Sched {
        /// Context whose slice ended.
        owner: ContextRef,
    },
    /// Period boundary or deadline of `owner` reached.
    Deadline {
        /// Real-time context.
        owner: ContextRef,
    },
    /// The CPU's charged timeslice ran out.
    Timeslice,
}

impl TimeoutKind {
    /// Owning context, if the kind has one.
    #[must_use]
    pub const fn owner(self) -> Option<ContextRef> {
        match self {
            Self::Ipc { owner } | Self::Sched { owner } | Self::Deadline { owner } => Some(owner),
            Self::Timeslice => None,
        }
    }

    /// Short name for log output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ipc { .. } => "ipc",
            Self::Sched { .. } => "sched",
            Self::Deadline { .. } => "deadline",
            Self::Timeslice => "timeslice",
        }
    }
}

/// Timeout object.
#[derive(Clone, Debug)]
pub struct Timeout {
    /// Expiry action.
    pub kind: TimeoutKind,
    /// CPU whose queue holds the timeout.
    pub cpu: CpuId,
    /// Absolute expiry time.
    pub wakeup: Time,
    set: bool,
    hit: bool,
}

impl Timeout {
    /// Create an unarmed timeout.
    #[inline]
    #[must_use]
    pub const fn new(kind: TimeoutKind, cpu: CpuId) -> Self {
        Self {
            kind,
            cpu,
            wakeup: 0,
            set: false,
            hit: false,
        }
    }

    /// Check if the timeout is armed.
    #[inline]
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.set
    }

    /// Check if the timeout expired since it was last armed.
    #[inline]
    #[must_use]
    pub const fn has_hit(&self) -> bool {
        self.hit
    }

    /// Arm for `wakeup`.
    pub fn arm(&mut self, wakeup: Time) {
        self.wakeup = wakeup;
        self.set = true;
        self.hit = false;
    }

    /// Disarm without expiring.
    pub fn disarm(&mut self) {
        self.set = false;
    }

    /// Record expiry.
    pub fn fire(&mut self) {
        self.set = false;
        self.hit = true;
    }

    /// Signed time left until `wakeup`.
    #[must_use]
    pub const fn remaining(&self, now: Time) -> i64 {
        self.wakeup as i64 - now as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_fire_disarm() {
        let mut t = Timeout::new(TimeoutKind::Timeslice, 0);
        assert!(!t.is_set());
        assert!(!t.has_hit());

        t.arm(100);
        assert!(t.is_set());
        assert_eq!(t.remaining(40), 60);
        assert_eq!(t.remaining(140), -40);

        t.fire();
        assert!(!t.is_set());
        assert!(t.has_hit());

        t.arm(200);
        assert!(!t.has_hit());
        t.disarm();
        assert!(!t.is_set());
        assert!(!t.has_hit());
    }

    #[test]
    fn test_kind_owner() {
        let owner = ContextRef::from_index(3);
        assert_eq!(TimeoutKind::Deadline { owner }.owner(), Some(owner));
        assert_eq!(TimeoutKind::Timeslice.owner(), None);
        assert_eq!(TimeoutKind::Ipc { owner }.name(), "ipc");
    }
}
