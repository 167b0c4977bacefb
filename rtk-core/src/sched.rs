//! Scheduling contexts
//!
//! A scheduling context is one timeslice a thread can be charged against:
//! a priority, a nominal quantum and the budget left in the current period.
//!
//! # Timeslice Ring
//!
//! Every context owns a default timeslice with id 0 (timesharing). Real-time
//! threads can attach further timeslices with ids 1, 2, ... All timeslices of
//! one owner form a ring through `next`/`prev`, so rotating to `next` round
//! robins among the owner's slices. A lone default slice links to itself.

use crate::refs::{ContextRef, SchedRef, Time};

/// Thread priority (0 = lowest, 255 = highest).
pub type Priority = u8;

/// Highest priority.
pub const MAX_PRIO: Priority = 255;

/// Number of priority levels (one ready ring per level).
pub const PRIO_LEVELS: usize = MAX_PRIO as usize + 1;

/// Scheduling context object.
#[derive(Clone, Debug)]
pub struct SchedContext {
    /// Context this timeslice belongs to.
    pub owner: ContextRef,
    /// Timeslice id; 0 is the default timesharing slice.
    pub id: u16,
    /// Priority.
    pub prio: Priority,
    /// Nominal timeslice length.
    pub quantum: Time,
    /// Budget left in the current period.
    pub left: Time,
    /// Next timeslice of the same owner.
    pub next: SchedRef,
    /// Previous timeslice of the same owner.
    pub prev: SchedRef,
}

impl SchedContext {
    /// Create a timeslice linked only to itself.
    #[inline]
    #[must_use]
    pub const fn new(
        me: SchedRef,
        owner: ContextRef,
        id: u16,
        prio: Priority,
        quantum: Time,
    ) -> Self {
        Self {
            owner,
            id,
            prio,
            quantum,
            left: quantum,
            next: me,
            prev: me,
        }
    }

    /// Check if this is the owner's default timeslice.
    #[inline]
    #[must_use]
    pub const fn is_default(&self) -> bool {
        self.id == 0
    }

    /// Refill the budget to a full quantum.
    #[inline]
    pub fn replenish(&mut self) {
        self.left = self.quantum;
    }

    /// Check if the budget is full.
    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.left == self.quantum
    }

    /// Set the quantum. The budget is not touched.
    #[inline]
    pub fn set_quantum(&mut self, quantum: Time) {
        self.quantum = quantum;
    }

    /// Charge `amount` against the budget, saturating at zero.
    pub fn consume(&mut self, amount: Time) -> Time {
        let taken = amount.min(self.left);
        self.left -= taken;
        taken
    }
}
