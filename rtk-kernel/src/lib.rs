//! RTK Real-Time Scheduler
//!
//! Fixed-priority, preemptive scheduling core of the RTK microkernel. The
//! crate decides which execution context runs on each CPU, charges CPU
//! time to scheduling contexts, expires timeouts and lends CPU time to
//! lock holders. Hardware access goes through the [`hal`] traits.
//!
//! # Overview
//!
//! ```text
//! timer tick ──> handle_timer_interrupt ──> do_timeouts ──> schedule
//!                                                             │
//! system calls ──> params (priorities, periods, yield) ───────┤
//!                                                             v
//!                                   switch_to_locked ──> switch_exec_locked
//!                                                             │
//!                                                        Platform::switch_cpu
//! ```
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`kernel`] | [`Kernel`], CPU bring-up, context lifecycle |
//! | [`sched`] | Ready queue, scheduling decision, helping |
//! | [`timeout`] | Timeout arming and expiry |
//! | [`params`] | Timeslice parameters, periodic mode, yield |
//! | [`entry`] | Timer interrupt and FPU trap entry points |
//! | [`hal`] | Platform collaborator traits |
//! | [`config`] | Scheduler configuration |
//!
//! # Locking
//!
//! Each CPU's state is serialized by its CPU lock. Operations ending in
//! `_locked`, the ready-queue operations and timeout expiry expect the
//! caller to hold it; the others take it themselves.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod entry;
pub mod hal;
pub mod kernel;
pub mod params;
pub mod sched;
pub mod timeout;

#[cfg(test)]
mod testing;

pub use config::SchedConfig;
pub use hal::{Fpu, Platform, Preemption, PreemptionKind, Proc, Timer};
pub use kernel::Kernel;
pub use params::round_quantum;
pub use sched::{PerCpuSched, ReadyQueue, SwitchTarget};
pub use timeout::TimeoutQueue;
