//! Execution contexts
//!
//! The execution context is the scheduler's view of a thread: its state
//! word, lock count, ready-ring links, helping links and the scheduling
//! contexts it owns.
//!
//! # State Word
//!
//! The state word is an atomic [`ThreadState`] bit set. Code that does not
//! hold the CPU lock mutates it with compare-and-swap loops; code holding
//! the lock uses the `_dirty` variants, which take a [`Held`] token and
//! use plain loads and stores.
//!
//! An empty state word means the context does not exist.
//!
//! # Helping
//!
//! When a thread blocks on a lock held by another context it lends its time
//! to the holder: the blocked thread's `donatee` is the holder, and the
//! holder's `helper` records whom to resume once the lock is released.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::lock::Held;
use crate::refs::{ContextRef, CpuId, SchedRef, SpaceId, Time, TimeoutRef};
use crate::sched::Priority;

bitflags! {
    /// Thread state bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ThreadState: u32 {
        /// Runnable.
        const READY = 1 << 0;
        /// Torn down or never activated.
        const DEAD = 1 << 1;
        /// Cancellation requested.
        const CANCEL = 1 << 2;
        /// Blocked in an IPC operation.
        const IPC_IN_PROGRESS = 1 << 3;
        /// Waiting to receive.
        const RECEIVING = 1 << 4;
        /// Polling a partner.
        const POLLING = 1 << 5;
        /// Waiting for the start of the next period.
        const DELAYED_DEADLINE = 1 << 6;
        /// Waiting for the next period inside an IPC.
        const DELAYED_IPC = 1 << 7;
    }
}

bitflags! {
    /// Real-time scheduling mode.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SchedMode: u8 {
        /// Strictly periodic execution.
        const PERIODIC = 1 << 0;
        /// Periodic, but deadline misses are tolerated.
        const NONSTRICT = 1 << 1;
    }
}

/// What to record in the target's helper link on a switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelpingMode {
    /// The switching context helps the target; resume it afterwards.
    Helping,
    /// No helping relation; the target resumes itself.
    NotHelping,
    /// Leave the helper link as it is.
    IgnoreHelping,
}

/// Size of the FPU register save area in bytes.
pub const FPU_STATE_SIZE: usize = 512;

/// Opaque FPU register save area.
///
/// Filled and consumed by the FPU collaborator only.
#[repr(C, align(16))]
pub struct FpuState {
    /// Raw register image.
    pub bytes: [u8; FPU_STATE_SIZE],
}

impl FpuState {
    /// Create a zeroed save area.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [0; FPU_STATE_SIZE],
        }
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FpuState { .. }")
    }
}

/// Execution context object.
#[derive(Debug)]
pub struct Context {
    /// This context's own reference.
    pub id: ContextRef,
    state: AtomicU32,
    lock_cnt: u32,

    /// Next context in the ready ring; NULL when not enqueued.
    pub ready_next: ContextRef,
    /// Previous context in the ready ring.
    pub ready_prev: ContextRef,

    /// Context to resume after this one releases a lock.
    pub helper: ContextRef,
    /// Context this one lends its time to (its lock holder).
    pub donatee: ContextRef,

    /// Owned id-0 timeslice.
    pub default_sched: SchedRef,
    /// Active timeslice.
    pub sched: SchedRef,

    /// Real-time period length.
    pub period: Time,
    /// Real-time mode.
    pub mode: SchedMode,
    /// Maximum controlled priority.
    pub mcp: Priority,
    /// Accumulated CPU time.
    pub consumed_time: Time,

    /// FPU register save area.
    pub fpu_state: FpuState,
    /// Address space handed to the low-level switch.
    pub space: SpaceId,
    /// CPU this context runs on.
    pub cpu: CpuId,

    /// Owned deadline timeout.
    pub deadline_timeout: TimeoutRef,
    /// Armed IPC timeout, if any.
    pub ipc_timeout: TimeoutRef,
    /// Armed timesharing timeout, if any.
    pub sched_timeout: TimeoutRef,
}

impl Context {
    /// Create a dead context without scheduling contexts or timeouts.
    #[must_use]
    pub fn new(id: ContextRef, cpu: CpuId, space: SpaceId, mcp: Priority) -> Self {
        Self {
            id,
            state: AtomicU32::new(ThreadState::DEAD.bits()),
            lock_cnt: 0,
            ready_next: ContextRef::NULL,
            ready_prev: ContextRef::NULL,
            helper: id,
            donatee: ContextRef::NULL,
            default_sched: SchedRef::NULL,
            sched: SchedRef::NULL,
            period: 0,
            mode: SchedMode::empty(),
            mcp,
            consumed_time: 0,
            fpu_state: FpuState::new(),
            space,
            cpu,
            deadline_timeout: TimeoutRef::NULL,
            ipc_timeout: TimeoutRef::NULL,
            sched_timeout: TimeoutRef::NULL,
        }
    }

    // -- State word

    /// Current state bits.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    /// Check if the context exists (state word non-empty).
    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        !self.state().is_empty()
    }

    /// Check if the context is runnable.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().contains(ThreadState::READY)
    }

    /// Set `bits`. Returns true if none of them were set before.
    pub fn state_add(&self, bits: ThreadState) -> bool {
        let old = ThreadState::from_bits_retain(self.state.fetch_or(bits.bits(), Ordering::AcqRel));
        !old.intersects(bits)
    }

    /// Clear `bits`. Returns true if all of them were set before.
    pub fn state_del(&self, bits: ThreadState) -> bool {
        let old =
            ThreadState::from_bits_retain(self.state.fetch_and(!bits.bits(), Ordering::AcqRel));
        old.contains(bits)
    }

    /// Replace the state with `(state & mask) | bits`.
    ///
    /// Returns true if every bit removed by `mask` was set and every bit
    /// added by `bits` was clear.
    pub fn state_change(&self, mask: ThreadState, bits: ThreadState) -> bool {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            let new = (old & mask.bits()) | bits.bits();
            match self
                .state
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return change_ok(old, mask, bits),
                Err(actual) => old = actual,
            }
        }
    }

    /// Like [`state_change`](Self::state_change), but leaves the state
    /// untouched and returns false unless the change condition holds.
    pub fn state_change_safely(&self, mask: ThreadState, bits: ThreadState) -> bool {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            if !change_ok(old, mask, bits) {
                return false;
            }
            let new = (old & mask.bits()) | bits.bits();
            match self
                .state
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    /// [`state_add`](Self::state_add) under the CPU lock.
    pub fn state_add_dirty(&self, _held: Held, bits: ThreadState) -> bool {
        let old = self.state.load(Ordering::Relaxed);
        self.state.store(old | bits.bits(), Ordering::Relaxed);
        !ThreadState::from_bits_retain(old).intersects(bits)
    }

    /// [`state_del`](Self::state_del) under the CPU lock.
    pub fn state_del_dirty(&self, _held: Held, bits: ThreadState) -> bool {
        let old = self.state.load(Ordering::Relaxed);
        self.state.store(old & !bits.bits(), Ordering::Relaxed);
        ThreadState::from_bits_retain(old).contains(bits)
    }

    /// [`state_change`](Self::state_change) under the CPU lock.
    pub fn state_change_dirty(&self, _held: Held, mask: ThreadState, bits: ThreadState) -> bool {
        let old = self.state.load(Ordering::Relaxed);
        self.state
            .store((old & mask.bits()) | bits.bits(), Ordering::Relaxed);
        change_ok(old, mask, bits)
    }

    /// Mark the context as nonexistent.
    pub fn invalidate(&self) {
        self.state.store(0, Ordering::Release);
    }

    // -- Lock count

    /// Number of contexts this context has locked.
    #[inline]
    #[must_use]
    pub const fn lock_cnt(&self) -> u32 {
        self.lock_cnt
    }

    /// Account for a newly taken lock.
    pub fn inc_lock_cnt(&mut self) {
        self.lock_cnt += 1;
    }

    /// Account for a released lock.
    ///
    /// # Panics
    ///
    /// Panics if the context holds no locks.
    pub fn dec_lock_cnt(&mut self) {
        assert!(self.lock_cnt > 0, "lock count underflow on {}", self.id);
        self.lock_cnt -= 1;
    }

    // -- Links

    /// Check if the context sits in a ready ring.
    #[inline]
    #[must_use]
    pub const fn in_ready_list(&self) -> bool {
        self.ready_next.is_valid()
    }

    /// Record who should run after this context releases a lock.
    pub fn set_helper(&mut self, mode: HelpingMode, current: ContextRef) {
        match mode {
            HelpingMode::Helping => self.helper = current,
            HelpingMode::NotHelping => self.helper = self.id,
            HelpingMode::IgnoreHelping => {}
        }
    }

    /// Check if this context is locked by someone who helps it.
    #[inline]
    #[must_use]
    pub fn is_helped(&self) -> bool {
        self.helper != self.id
    }
}

/// Change condition shared by the CAS and dirty paths.
fn change_ok(old: u32, mask: ThreadState, bits: ThreadState) -> bool {
    let removed = !mask.bits();
    (old & bits.bits() & mask.bits()) == 0 && (old & removed) == removed & ThreadState::all().bits()
}
