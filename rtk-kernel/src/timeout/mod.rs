//! Timeouts
//!
//! Every CPU keeps a [`TimeoutQueue`] of armed timeouts. The timer
//! interrupt calls [`Kernel::do_timeouts`], which expires everything that
//! is due and reports whether any expiry needs a reschedule.
//!
//! # Timeout Kinds
//!
//! | Kind | Armed for | On expiry | Reschedule when |
//! |------|-----------|-----------|-----------------|
//! | IPC | end of a blocking IPC | owner becomes ready | no charged slice, or the owner's priority is higher |
//! | Sched | end of a timesharing slice | owner rotates to its next slice | no charged slice, or the new slice's priority is higher |
//! | Deadline | next period boundary | next period starts, or a miss is reported | the owner can preempt the running context |
//! | Timeslice | end of the charged slice | round robin, or overrun report | always |

use rtk_core::{
    ContextRef, CpuId, SchedError, SchedMode, SchedResult, ThreadState, Time, Timeout,
    TimeoutKind, TimeoutRef,
};

use crate::Kernel;
use crate::hal::{Platform, Preemption, PreemptionKind};

pub mod queue;

pub use queue::TimeoutQueue;

impl<P: Platform> Kernel<P> {
    // -- Arming

    /// Arm `timeout` for `wakeup`, replacing an earlier arming.
    pub fn set_timeout(&mut self, timeout: TimeoutRef, wakeup: Time) {
        let t = &mut self.timeouts[timeout];
        let cpu = t.cpu;
        let was_set = t.is_set();
        t.arm(wakeup);

        let queue = &mut self.cpus[cpu].timeouts;
        if was_set {
            queue.remove(timeout);
        }
        queue.push(timeout, wakeup);
    }

    /// Disarm `timeout`. No-op if it is not armed.
    pub fn reset_timeout(&mut self, timeout: TimeoutRef) {
        let t = &mut self.timeouts[timeout];
        if !t.is_set() {
            return;
        }
        t.disarm();
        let cpu = t.cpu;
        self.cpus[cpu].timeouts.remove(timeout);
    }

    /// Check if `timeout` is armed.
    #[must_use]
    pub fn timeout_is_set(&self, timeout: TimeoutRef) -> bool {
        self.timeouts[timeout].is_set()
    }

    /// Check if `timeout` expired since it was last armed.
    #[must_use]
    pub fn timeout_has_hit(&self, timeout: TimeoutRef) -> bool {
        self.timeouts[timeout].has_hit()
    }

    /// Signed time left until `timeout` expires.
    #[must_use]
    pub fn timeout_remaining(&self, timeout: TimeoutRef) -> i64 {
        self.timeouts[timeout].remaining(self.clock())
    }

    /// Arm the IPC timeout of `ctx` for `wakeup`, creating it on first use.
    pub fn arm_ipc_timeout(&mut self, ctx: ContextRef, wakeup: Time) -> SchedResult<TimeoutRef> {
        let c = &self.contexts[ctx];
        let timeout = if c.ipc_timeout.is_valid() {
            c.ipc_timeout
        } else {
            let t = self
                .timeouts
                .insert(Timeout::new(TimeoutKind::Ipc { owner: ctx }, c.cpu))
                .ok_or(SchedError::OutOfMemory)?;
            self.contexts[ctx].ipc_timeout = t;
            t
        };
        self.set_timeout(timeout, wakeup);
        Ok(timeout)
    }

    /// Disarm and free the IPC timeout of `ctx`, clearing its back-reference.
    pub fn release_ipc_timeout(&mut self, ctx: ContextRef) {
        let timeout = self.contexts[ctx].ipc_timeout;
        if timeout.is_null() {
            return;
        }
        self.reset_timeout(timeout);
        self.timeouts.remove(timeout);
        self.contexts[ctx].ipc_timeout = TimeoutRef::NULL;
    }

    /// Arm the timesharing timeout of `ctx` for `wakeup`, creating it on
    /// first use.
    pub fn arm_sched_timeout(&mut self, ctx: ContextRef, wakeup: Time) -> SchedResult<TimeoutRef> {
        let c = &self.contexts[ctx];
        let timeout = if c.sched_timeout.is_valid() {
            c.sched_timeout
        } else {
            let t = self
                .timeouts
                .insert(Timeout::new(TimeoutKind::Sched { owner: ctx }, c.cpu))
                .ok_or(SchedError::OutOfMemory)?;
            self.contexts[ctx].sched_timeout = t;
            t
        };
        self.set_timeout(timeout, wakeup);
        Ok(timeout)
    }

    /// Disarm and free the timesharing timeout of `ctx`.
    pub fn cancel_sched_timeout(&mut self, ctx: ContextRef) {
        let timeout = self.contexts[ctx].sched_timeout;
        if timeout.is_null() {
            return;
        }
        self.reset_timeout(timeout);
        self.timeouts.remove(timeout);
        self.contexts[ctx].sched_timeout = TimeoutRef::NULL;
    }

    // -- Expiry

    /// Expire every timeout of `cpu` that is due.
    ///
    /// Returns true if any expiry asked for a reschedule.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is not held.
    pub fn do_timeouts(&mut self, cpu: CpuId) -> bool {
        self.cpus[cpu].lock.held();
        let now = self.clock();

        let mut due = alloc::vec::Vec::new();
        while let Some(timeout) = self.cpus[cpu].timeouts.pop_expired(now) {
            self.timeouts[timeout].fire();
            due.push(timeout);
        }

        let mut reschedule = false;
        for timeout in due {
            reschedule |= self.expire(timeout);
        }
        reschedule
    }

    /// Run the expiry action of `timeout`.
    fn expire(&mut self, timeout: TimeoutRef) -> bool {
        let Timeout { kind, cpu, wakeup, .. } = self.timeouts[timeout];
        log::trace!("cpu{}: {} timeout {} expired at {}", cpu, kind.name(), timeout, wakeup);

        match kind {
            TimeoutKind::Ipc { owner } => self.ipc_expired(owner),
            TimeoutKind::Sched { owner } => self.sched_expired(owner),
            TimeoutKind::Deadline { owner } => self.deadline_expired(timeout, owner),
            TimeoutKind::Timeslice => self.timeslice_expired(cpu),
        }
    }

    /// Wake `owner` from its timed-out IPC.
    pub(crate) fn ipc_expired(&mut self, owner: ContextRef) -> bool {
        let cpu = self.contexts[owner].cpu;
        let held = self.cpus[cpu].lock.held();

        self.contexts[owner].state_change_dirty(held, !ThreadState::IPC_IN_PROGRESS, ThreadState::READY);
        self.ready_enqueue(owner);

        let cs = self.cpus[cpu].current_sched;
        cs.is_null() || self.prio_of(owner) > self.scheds[cs].prio
    }

    /// Rotate `owner` to its next timeslice.
    pub(crate) fn sched_expired(&mut self, owner: ContextRef) -> bool {
        let cpu = self.contexts[owner].cpu;
        let next = self.scheds[self.contexts[owner].sched].next;
        self.switch_sched(owner, next);

        let cs = self.cpus[cpu].current_sched;
        cs.is_null() || self.prio_of(owner) > self.scheds[cs].prio
    }

    /// Period boundary of `owner`.
    ///
    /// If `owner` waits for its next period it enters periodic mode; unless
    /// it also sits in an IPC, the deadline is rearmed one period later, it
    /// rotates to its next timeslice and becomes ready. Otherwise it missed
    /// its deadline: the miss is reported and a periodic owner rotates and
    /// rearms regardless.
    pub(crate) fn deadline_expired(&mut self, timeout: TimeoutRef, owner: ContextRef) -> bool {
        let cpu = self.contexts[owner].cpu;
        let held = self.cpus[cpu].lock.held();
        let wakeup = self.timeouts[timeout].wakeup;
        let state = self.contexts[owner].state();

        if state.contains(ThreadState::DELAYED_DEADLINE) {
            self.contexts[owner].mode.insert(SchedMode::PERIODIC);

            if state.contains(ThreadState::DELAYED_IPC) {
                self.contexts[owner].state_del_dirty(held, ThreadState::DELAYED_DEADLINE);
                return false;
            }

            self.next_period(timeout, owner, wakeup);
            self.contexts[owner].state_change_dirty(held, !ThreadState::DELAYED_DEADLINE, ThreadState::READY);
            self.ready_enqueue(owner);
        } else {
            let sched = self.contexts[owner].sched;
            log::warn!("cpu{}: {} missed its deadline at {}", cpu, owner, wakeup);
            self.platform.queue(owner, PreemptionKind::DeadlineMiss, wakeup, sched);

            if self.contexts[owner].mode.contains(SchedMode::PERIODIC) {
                self.next_period(timeout, owner, wakeup);
            }
        }

        self.can_preempt_current(self.contexts[owner].sched)
    }

    /// Rearm the deadline one period after `wakeup` and rotate timeslices.
    fn next_period(&mut self, timeout: TimeoutRef, owner: ContextRef, wakeup: Time) {
        let period = self.contexts[owner].period;
        self.set_timeout(timeout, wakeup + period);
        let next = self.scheds[self.contexts[owner].sched].next;
        self.switch_sched(owner, next);
    }

    /// The charged timeslice of `cpu` ran out.
    ///
    /// A default timeslice is refilled and its owner goes to the end of its
    /// band. A real-time timeslice overran: the overrun is reported and the
    /// owner rotates to its next timeslice.
    pub(crate) fn timeslice_expired(&mut self, cpu: CpuId) -> bool {
        let cs = self.cpus[cpu].current_sched;
        if cs.is_null() {
            return true;
        }

        let sched = &self.scheds[cs];
        let owner = sched.owner;
        if sched.is_default() {
            self.switch_sched(owner, cs);
        } else {
            let next = sched.next;
            let wakeup = self.timeouts[self.cpus[cpu].timeslice_timeout].wakeup;
            log::warn!("cpu{}: {} overran timeslice {}", cpu, owner, cs);
            self.platform.queue(owner, PreemptionKind::TimesliceOverrun, wakeup, cs);
            self.switch_sched(owner, next);
        }
        true
    }
}
