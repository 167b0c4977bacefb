//! Collaborator interfaces
//!
//! The scheduler does not touch hardware. Everything below the switch
//! decision is delegated to a [`Platform`], which bundles:
//!
//! - [`Timer`]: monotonic clock
//! - [`Fpu`]: lazy FPU ownership and register save/restore
//! - [`Proc`]: interrupt window and the low-level register switch
//! - [`Preemption`]: delivery of deadline-miss and overrun events
//!
//! The timer backend that calls
//! [`Kernel::handle_timer_interrupt`](crate::Kernel::handle_timer_interrupt)
//! belongs to the platform as well.

use rtk_core::{ContextRef, CpuId, FpuState, SchedRef, SpaceId, Time};

/// Monotonic time source.
pub trait Timer {
    /// Current system time in microseconds.
    fn system_clock(&self) -> Time;
}

/// FPU ownership and state transfer.
pub trait Fpu {
    /// Context whose registers are live in the FPU of `cpu` (NULL if none).
    fn fpu_owner(&self, cpu: CpuId) -> ContextRef;

    /// Check if `ctx` owns the FPU of `cpu`.
    fn is_owner(&self, cpu: CpuId, ctx: ContextRef) -> bool {
        self.fpu_owner(cpu) == ctx
    }

    /// Record the new owner of the FPU of `cpu`.
    fn set_owner(&mut self, cpu: CpuId, ctx: ContextRef);

    /// Allow FPU use on `cpu`.
    fn enable(&mut self, cpu: CpuId);

    /// Trap the next FPU use on `cpu`.
    fn disable(&mut self, cpu: CpuId);

    /// Save the live registers into `state`.
    fn save_state(&mut self, cpu: CpuId, state: &mut FpuState);

    /// Load the registers from `state`.
    fn restore_state(&mut self, cpu: CpuId, state: &FpuState);
}

/// Processor control.
pub trait Proc {
    /// Open a short window for pending interrupts on `cpu`.
    fn irq_chance(&mut self, cpu: CpuId);

    /// Switch registers and address space from `from` to `to`.
    fn switch_cpu(&mut self, cpu: CpuId, from: ContextRef, to: ContextRef, space: SpaceId);
}

/// Preemption event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreemptionKind {
    /// A real-time context did not wait for its next period in time.
    DeadlineMiss,
    /// A real-time timeslice ran out before the context yielded.
    TimesliceOverrun,
}

/// Preemption event delivery.
pub trait Preemption {
    /// Queue an event for delivery to `owner`'s preemption handler.
    fn queue(&mut self, owner: ContextRef, kind: PreemptionKind, time: Time, sched: SchedRef);
}

/// Everything the scheduler needs from the platform.
pub trait Platform: Timer + Fpu + Proc + Preemption {}

impl<T: Timer + Fpu + Proc + Preemption> Platform for T {}
