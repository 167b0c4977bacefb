//! Fixed-priority scheduler
//!
//! Strict highest-priority-first scheduling with round robin inside a
//! priority band, timeslice accounting through scheduling contexts, and
//! time donation to lock holders.
//!
//! # Key Concepts
//!
//! - **Ready queue**: one ring per priority, see [`ready_queue`].
//! - **Current timeslice**: the scheduling context the CPU charges time to.
//!   It is usually the running context's active slice, but a helping
//!   context runs on the slice of the context it helps.
//! - **Timeslice timeout**: armed for the end of the current timeslice at
//!   every slice change. It must always be armed while a context runs.
//! - **Helping**: a switch to a locked context goes to its lock holder
//!   instead, see [`helping`].

use rtk_core::{ContextRef, CpuId, CpuLock, SchedRef, Time, TimeoutRef};

use crate::timeout::TimeoutQueue;

pub mod helping;
pub mod ready_queue;
pub mod switch;

pub use helping::SwitchTarget;
pub use ready_queue::ReadyQueue;

// -- Per-CPU Scheduler State

/// Per-CPU scheduler state.
pub struct PerCpuSched {
    /// CPU number.
    pub(crate) cpu: CpuId,
    /// Context running on this CPU.
    pub(crate) current: ContextRef,
    /// Idle context of this CPU.
    pub(crate) idle: ContextRef,
    /// Timeslice charged with CPU time (NULL after invalidation).
    pub(crate) current_sched: SchedRef,
    /// Ready rings.
    pub(crate) ready: ReadyQueue,
    /// Set while `schedule` has the CPU lock dropped.
    pub(crate) schedule_in_progress: bool,
    /// Time of the last switch.
    pub(crate) switch_time: Time,
    /// Timeout for the end of the current timeslice.
    pub(crate) timeslice_timeout: TimeoutRef,
    /// Armed timeouts of this CPU.
    pub(crate) timeouts: TimeoutQueue,
    /// CPU lock.
    pub(crate) lock: CpuLock,
}

impl PerCpuSched {
    /// Create scheduler state for `cpu`.
    pub(crate) fn new(cpu: CpuId, timeslice_timeout: TimeoutRef, now: Time) -> Self {
        Self {
            cpu,
            current: ContextRef::NULL,
            idle: ContextRef::NULL,
            current_sched: SchedRef::NULL,
            ready: ReadyQueue::new(),
            schedule_in_progress: false,
            switch_time: now,
            timeslice_timeout,
            timeouts: TimeoutQueue::new(),
            lock: CpuLock::new(),
        }
    }

    /// CPU number.
    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Context running on this CPU.
    #[inline]
    #[must_use]
    pub const fn current(&self) -> ContextRef {
        self.current
    }

    /// Idle context of this CPU.
    #[inline]
    #[must_use]
    pub const fn idle(&self) -> ContextRef {
        self.idle
    }

    /// Timeslice charged with CPU time, if any.
    #[inline]
    #[must_use]
    pub const fn current_sched(&self) -> SchedRef {
        self.current_sched
    }

    /// Ready rings.
    #[inline]
    #[must_use]
    pub const fn ready(&self) -> &ReadyQueue {
        &self.ready
    }

    /// Check if `schedule` is waiting for interrupts.
    #[inline]
    #[must_use]
    pub const fn schedule_in_progress(&self) -> bool {
        self.schedule_in_progress
    }

    /// Time of the last switch.
    #[inline]
    #[must_use]
    pub const fn switch_time(&self) -> Time {
        self.switch_time
    }

    /// Timeout for the end of the current timeslice.
    #[inline]
    #[must_use]
    pub const fn timeslice_timeout(&self) -> TimeoutRef {
        self.timeslice_timeout
    }

    /// Armed timeouts.
    #[inline]
    #[must_use]
    pub const fn timeouts(&self) -> &TimeoutQueue {
        &self.timeouts
    }

    /// CPU lock.
    #[inline]
    #[must_use]
    pub const fn lock(&self) -> &CpuLock {
        &self.lock
    }
}
