//! Scheduling parameters
//!
//! Operations behind the thread-scheduling system calls: timeslice
//! parameters, real-time timeslices, periodic execution and yielding.
//!
//! # Periodic Execution
//!
//! ```text
//! set_period ─> begin_periodic ─> wait_for_next_period ─┐
//!                                        ^              │ deadline expires:
//!                                        │              │ PERIODIC, next slice,
//!                                        └──── runs <───┘ READY
//! ```
//!
//! `end_periodic` leaves periodic mode from any point of the cycle.

use rtk_core::{
    ContextRef, CpuId, HelpingMode, Priority, SchedContext, SchedError, SchedMode, SchedResult,
    ThreadState, Time,
};

use crate::Kernel;
use crate::hal::Platform;

/// Round `quantum` up to a multiple of the scheduler tick.
///
/// A zero quantum becomes one tick.
#[must_use]
pub const fn round_quantum(quantum: Time, granularity: Time) -> Time {
    let q = if quantum == 0 { 1 } else { quantum };
    if granularity == 0 {
        return q;
    }
    q.div_ceil(granularity) * granularity
}

impl<P: Platform> Kernel<P> {
    fn check_prio(&self, ctx: ContextRef, prio: Priority) -> SchedResult<()> {
        if prio > self.contexts[ctx].mcp {
            return Err(SchedError::PriorityAboveMcp);
        }
        Ok(())
    }

    fn periodic_or_armed(&self, ctx: ContextRef) -> bool {
        let c = &self.contexts[ctx];
        c.mode.contains(SchedMode::PERIODIC) || self.timeouts[c.deadline_timeout].is_set()
    }

    /// Set the maximum controlled priority of `ctx`.
    pub fn set_mcp(&mut self, ctx: ContextRef, mcp: Priority) -> SchedResult<()> {
        self.check_context(ctx)?;
        self.contexts[ctx].mcp = mcp;
        Ok(())
    }

    /// Change priority and quantum of timeslice `id` of `ctx`.
    ///
    /// An active timeslice changing priority moves to its new band. Only
    /// inactive timeslices are refilled with the new quantum; the active one
    /// keeps its remaining budget.
    pub fn set_sched_param(
        &mut self,
        ctx: ContextRef,
        id: u16,
        prio: Priority,
        quantum: Time,
    ) -> SchedResult<()> {
        self.check_context(ctx)?;
        self.check_prio(ctx, prio)?;
        let sched = self.find_sched(ctx, id)?;
        let quantum = round_quantum(quantum, self.config.granularity);
        let cpu = self.contexts[ctx].cpu;

        let took_lock = !self.cpus[cpu].lock.test();
        if took_lock {
            self.cpus[cpu].lock.lock();
        }

        let active = self.contexts[ctx].sched == sched;
        let moves = active && self.scheds[sched].prio != prio;
        if moves {
            self.ready_dequeue(ctx);
        }

        let s = &mut self.scheds[sched];
        s.prio = prio;
        s.set_quantum(quantum);
        if !active {
            s.replenish();
        }

        if moves {
            self.ready_enqueue(ctx);
        }

        if took_lock {
            self.cpus[cpu].lock.clear();
        }

        log::debug!("{}: timeslice {} prio {} quantum {}", ctx, id, prio, quantum);
        Ok(())
    }

    /// Attach a real-time timeslice to `ctx`, returning its id.
    ///
    /// The new timeslice is appended to the ring, i.e. it sits right before
    /// the default timeslice.
    pub fn add_realtime_sched(
        &mut self,
        ctx: ContextRef,
        prio: Priority,
        quantum: Time,
    ) -> SchedResult<u16> {
        self.check_context(ctx)?;
        if self.periodic_or_armed(ctx) {
            return Err(SchedError::PeriodicActive);
        }
        self.check_prio(ctx, prio)?;

        let quantum = round_quantum(quantum, self.config.granularity);
        let default = self.contexts[ctx].default_sched;
        let last = self.scheds[default].prev;
        let id = self.scheds[last].id + 1;

        let sched = self
            .scheds
            .insert_with(|me| {
                let mut s = SchedContext::new(me, ctx, id, prio, quantum);
                s.next = default;
                s.prev = last;
                s
            })
            .ok_or(SchedError::OutOfMemory)?;
        self.scheds[last].next = sched;
        self.scheds[default].prev = sched;

        log::debug!("{}: added timeslice {} prio {} quantum {}", ctx, id, prio, quantum);
        Ok(id)
    }

    /// Free all real-time timeslices of `ctx`.
    pub fn remove_realtime_scheds(&mut self, ctx: ContextRef) -> SchedResult<()> {
        self.check_context(ctx)?;
        if self.periodic_or_armed(ctx) {
            return Err(SchedError::PeriodicActive);
        }

        let cpu = self.contexts[ctx].cpu;
        let took_lock = !self.cpus[cpu].lock.test();
        if took_lock {
            self.cpus[cpu].lock.lock();
        }

        let default = self.contexts[ctx].default_sched;
        if self.contexts[ctx].sched != default {
            self.switch_sched(ctx, default);
        }

        let mut s = self.scheds[default].next;
        while s != default {
            if self.cpus[cpu].current_sched == s {
                self.invalidate_sched(cpu);
            }
            let next = self.scheds[s].next;
            self.scheds.remove(s);
            s = next;
        }

        let d = &mut self.scheds[default];
        d.next = default;
        d.prev = default;

        if took_lock {
            self.cpus[cpu].lock.clear();
        }
        log::debug!("{}: removed real-time timeslices", ctx);
        Ok(())
    }

    /// Set the real-time period of `ctx`.
    pub fn set_period(&mut self, ctx: ContextRef, period: Time) -> SchedResult<()> {
        self.check_context(ctx)?;
        self.contexts[ctx].period = period;
        Ok(())
    }

    /// Start periodic execution of `ctx` with the first period at `clock`.
    ///
    /// `clock == 0` starts the first period now. The context enters
    /// periodic mode once it waits for a period start for the first time.
    pub fn begin_periodic(&mut self, ctx: ContextRef, clock: Time, nonstrict: bool) -> SchedResult<()> {
        self.check_context(ctx)?;
        if self.periodic_or_armed(ctx) {
            return Err(SchedError::PeriodicActive);
        }

        let now = self.clock();
        let start = if clock == 0 { now } else { clock };
        if start < now {
            return Err(SchedError::ClockInPast);
        }

        self.contexts[ctx].mode = if nonstrict {
            SchedMode::NONSTRICT
        } else {
            SchedMode::empty()
        };
        let deadline = self.contexts[ctx].deadline_timeout;
        self.set_timeout(deadline, start);

        log::debug!("{}: periodic from {} (period {})", ctx, start, self.contexts[ctx].period);
        Ok(())
    }

    /// Leave periodic execution.
    ///
    /// Returns to the default timeslice and disarms the deadline. A context
    /// waiting for its next period is released; if it waits in an IPC as
    /// well, only the period wait ends.
    pub fn end_periodic(&mut self, ctx: ContextRef) -> SchedResult<()> {
        self.check_context(ctx)?;
        if !self.periodic_or_armed(ctx) {
            return Err(SchedError::NotPeriodic);
        }

        let cpu = self.contexts[ctx].cpu;
        let took_lock = !self.cpus[cpu].lock.test();
        if took_lock {
            self.cpus[cpu].lock.lock();
        }
        let held = self.cpus[cpu].lock.held();

        let c = &mut self.contexts[ctx];
        c.mode = SchedMode::empty();
        let default = c.default_sched;
        if c.sched != default {
            self.switch_sched(ctx, default);
        }
        self.reset_timeout(self.contexts[ctx].deadline_timeout);

        let c = &self.contexts[ctx];
        let state = c.state();
        if state.contains(ThreadState::DELAYED_DEADLINE | ThreadState::DELAYED_IPC) {
            c.state_del_dirty(held, ThreadState::DELAYED_DEADLINE);
        } else if state.contains(ThreadState::DELAYED_DEADLINE) {
            c.state_change_dirty(held, !ThreadState::DELAYED_DEADLINE, ThreadState::READY);
            self.ready_enqueue(ctx);
        }

        if took_lock {
            self.cpus[cpu].lock.clear();
        }
        log::debug!("{}: periodic mode ended", ctx);
        Ok(())
    }

    /// Block `ctx` until its next period starts.
    ///
    /// With `with_ipc` the context also waits in an IPC; the period start
    /// then only clears the period wait. A running context schedules away.
    pub fn wait_for_next_period(&mut self, ctx: ContextRef, with_ipc: bool) -> SchedResult<()> {
        self.check_context(ctx)?;
        if !self.timeouts[self.contexts[ctx].deadline_timeout].is_set() {
            return Err(SchedError::NotPeriodic);
        }

        let cpu = self.contexts[ctx].cpu;
        let held = self.lock_cpu(cpu);

        let mut bits = ThreadState::DELAYED_DEADLINE;
        if with_ipc {
            bits |= ThreadState::DELAYED_IPC;
        }
        self.contexts[ctx].state_change_dirty(held, !ThreadState::READY, bits);
        self.ready_dequeue(ctx);

        let default = self.contexts[ctx].default_sched;
        if self.contexts[ctx].sched != default {
            self.switch_sched(ctx, default);
        }

        if self.cpus[cpu].current == ctx {
            self.schedule(cpu);
        }
        self.unlock_cpu(cpu);
        Ok(())
    }

    /// Yield system call of the running `caller`.
    ///
    /// - No destination: give up the rest of the caller's timeslice `id`
    ///   and rotate to its next one (a default timeslice goes to the end of
    ///   its band). Returns the time that was left.
    /// - Ready destination: donate the CPU to it. Returns `None`.
    /// - Otherwise, or if the donation is aborted: the CPU's charged
    ///   timeslice is yielded on behalf of its owner. Returns `None`.
    ///
    /// Finishes with a scheduling decision unless the CPU was donated.
    pub fn thread_switch(
        &mut self,
        caller: ContextRef,
        dst: Option<ContextRef>,
        id: u16,
    ) -> SchedResult<Option<Time>> {
        self.check_context(caller)?;
        if let Some(d) = dst {
            self.check_context(d)?;
        }
        let cpu = self.contexts[caller].cpu;
        assert_eq!(self.cpus[cpu].current, caller, "yield from non-running {}", caller);

        let sched = self.contexts[caller].sched;
        let mut left = None;

        match dst {
            None => {
                if self.scheds[sched].id != id {
                    return Err(SchedError::IdMismatch);
                }
                self.lock_cpu(cpu);
                let remaining = if self.cpus[cpu].current_sched == sched {
                    self.timeout_remaining(self.cpus[cpu].timeslice_timeout).max(0) as Time
                } else {
                    self.scheds[sched].left
                };
                left = Some(remaining);

                let s = &self.scheds[sched];
                let next = if s.is_default() { sched } else { s.next };
                self.switch_sched(caller, next);
            }
            Some(d) => {
                self.lock_cpu(cpu);
                if d != caller
                    && self.contexts[d].is_ready()
                    && self.switch_exec_locked(caller, d, HelpingMode::NotHelping)
                {
                    self.unlock_cpu(cpu);
                    return Ok(None);
                }
                self.yield_current_sched(cpu);
            }
        }

        self.schedule(cpu);
        self.unlock_cpu(cpu);
        Ok(left)
    }

    /// Give up the CPU's charged timeslice on behalf of its owner.
    fn yield_current_sched(&mut self, cpu: CpuId) {
        let cs = self.cpus[cpu].current_sched;
        if cs.is_valid() {
            let owner = self.scheds[cs].owner;
            if self.contexts[owner].sched == cs {
                self.switch_sched(owner, cs);
            }
        }
    }
}
