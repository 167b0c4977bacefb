//! RTK kernel objects
//!
//! Object definitions for the RTK real-time scheduling core. The scheduler
//! itself lives in `rtk-kernel`; this crate only knows what the objects
//! look like and how to mutate a single object consistently.
//!
//! # Objects
//!
//! | Object | Type | Reference |
//! |--------|------|-----------|
//! | Execution context | [`Context`] | [`ContextRef`] |
//! | Scheduling context | [`SchedContext`] | [`SchedRef`] |
//! | Timeout | [`Timeout`] | [`TimeoutRef`] |
//!
//! Objects live in [`ObjectTable`]s and refer to each other by index, so
//! the ready ring, the timeslice ring and the helping links carry no
//! pointers.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod context;
pub mod error;
pub mod lock;
pub mod refs;
pub mod sched;
pub mod table;
pub mod timeout;

pub use context::{Context, FPU_STATE_SIZE, FpuState, HelpingMode, SchedMode, ThreadState};
pub use error::{SchedError, SchedResult};
pub use lock::{CpuLock, Held};
pub use refs::{ContextRef, CpuId, ObjectKey, SchedRef, SpaceId, Time, TimeoutRef};
pub use sched::{MAX_PRIO, PRIO_LEVELS, Priority, SchedContext};
pub use table::ObjectTable;
pub use timeout::{Timeout, TimeoutKind};
