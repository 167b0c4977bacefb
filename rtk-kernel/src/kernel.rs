//! Kernel state and context lifecycle
//!
//! [`Kernel`] owns every scheduler object and the per-CPU state. All links
//! between objects are table references, so operations borrow the tables
//! they touch field by field instead of chasing pointers.
//!
//! # Lifecycle
//!
//! ```text
//! create_context ──> DEAD ──activate──> READY ... ──kill_context──> DEAD
//!                                                           │
//!                                              destroy_context (removed)
//! ```
//!
//! Each CPU brought up with [`Kernel::add_cpu`] gets an idle context at
//! priority 0 that is always ready, so the ready queue is never empty.

use alloc::vec::Vec;

use rtk_core::{
    Context, ContextRef, CpuId, Held, ObjectTable, Priority, SchedContext, SchedError, SchedMode,
    SchedRef, SchedResult, SpaceId, ThreadState, Time, Timeout, TimeoutKind, TimeoutRef,
};

use crate::config::SchedConfig;
use crate::hal::{Fpu, Platform, Timer};
use crate::sched::PerCpuSched;

/// Scheduler state of all CPUs.
pub struct Kernel<P: Platform> {
    pub(crate) contexts: ObjectTable<ContextRef, Context>,
    pub(crate) scheds: ObjectTable<SchedRef, SchedContext>,
    pub(crate) timeouts: ObjectTable<TimeoutRef, Timeout>,
    pub(crate) cpus: Vec<PerCpuSched>,
    pub(crate) platform: P,
    pub(crate) config: SchedConfig,
}

impl<P: Platform> Kernel<P> {
    /// Create a kernel without CPUs.
    pub fn new(platform: P, config: SchedConfig) -> Self {
        Self {
            contexts: ObjectTable::new(),
            scheds: ObjectTable::new(),
            timeouts: ObjectTable::new(),
            cpus: Vec::new(),
            platform,
            config,
        }
    }

    // -- Accessors

    /// Scheduler configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Platform collaborators.
    #[inline]
    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Platform collaborators, mutably.
    #[inline]
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Look up a context.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` does not name a live context.
    #[must_use]
    pub fn context(&self, ctx: ContextRef) -> &Context {
        &self.contexts[ctx]
    }

    /// Look up a context, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` does not name a live context.
    pub fn context_mut(&mut self, ctx: ContextRef) -> &mut Context {
        &mut self.contexts[ctx]
    }

    /// Look up a scheduling context.
    ///
    /// # Panics
    ///
    /// Panics if `sched` does not name a live scheduling context.
    #[must_use]
    pub fn sched(&self, sched: SchedRef) -> &SchedContext {
        &self.scheds[sched]
    }

    /// Look up a timeout.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` does not name a live timeout.
    #[must_use]
    pub fn timeout(&self, timeout: TimeoutRef) -> &Timeout {
        &self.timeouts[timeout]
    }

    /// Scheduler state of `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` was not brought up.
    #[must_use]
    pub fn cpu(&self, cpu: CpuId) -> &PerCpuSched {
        &self.cpus[cpu]
    }

    /// Number of CPUs brought up.
    #[inline]
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Context running on `cpu`.
    #[must_use]
    pub fn current(&self, cpu: CpuId) -> ContextRef {
        self.cpus[cpu].current
    }

    /// Timeslice charged on `cpu` (NULL after invalidation).
    #[must_use]
    pub fn current_sched(&self, cpu: CpuId) -> SchedRef {
        self.cpus[cpu].current_sched
    }

    /// Active timeslice of `ctx`.
    #[must_use]
    pub fn active_sched(&self, ctx: ContextRef) -> SchedRef {
        self.contexts[ctx].sched
    }

    /// Priority of the active timeslice of `ctx`.
    #[must_use]
    pub fn prio_of(&self, ctx: ContextRef) -> Priority {
        self.scheds[self.contexts[ctx].sched].prio
    }

    /// Timeslices of `ctx` in ring order, starting with the default one.
    pub fn scheds_of(&self, ctx: ContextRef) -> impl Iterator<Item = SchedRef> + '_ {
        let first = self.contexts[ctx].default_sched;
        let mut cur = first;
        core::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            let out = cur;
            cur = self.scheds[cur].next;
            if cur == first {
                cur = SchedRef::NULL;
            }
            Some(out)
        })
    }

    /// Find the timeslice of `ctx` with the given id.
    pub fn find_sched(&self, ctx: ContextRef, id: u16) -> SchedResult<SchedRef> {
        self.scheds_of(ctx)
            .find(|&s| self.scheds[s].id == id)
            .ok_or(SchedError::InvalidSchedContext)
    }

    pub(crate) fn clock(&self) -> Time {
        self.platform.system_clock()
    }

    pub(crate) fn check_context(&self, ctx: ContextRef) -> SchedResult<()> {
        match self.contexts.get(ctx) {
            Some(c) if c.exists() => Ok(()),
            _ => Err(SchedError::InvalidContext),
        }
    }

    // -- CPU lock

    /// Take the CPU lock of `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if the lock is already held.
    pub fn lock_cpu(&self, cpu: CpuId) -> Held {
        self.cpus[cpu].lock.lock()
    }

    /// Release the CPU lock of `cpu`.
    pub fn unlock_cpu(&self, cpu: CpuId) {
        self.cpus[cpu].lock.clear();
    }

    /// Token for the held CPU lock of `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held.
    #[track_caller]
    pub fn held(&self, cpu: CpuId) -> Held {
        self.cpus[cpu].lock.held()
    }

    // -- CPU bring-up

    /// Bring up the next CPU with an idle context in `idle_space`.
    ///
    /// The idle context runs at priority 0, is current and enqueued, and its
    /// timeslice is charged from now on.
    pub fn add_cpu(&mut self, idle_space: SpaceId) -> SchedResult<CpuId> {
        let cpu = self.cpus.len();
        if cpu >= self.config.max_cpus {
            return Err(SchedError::OutOfMemory);
        }

        let timeslice = self
            .timeouts
            .insert(Timeout::new(TimeoutKind::Timeslice, cpu))
            .ok_or(SchedError::OutOfMemory)?;
        let now = self.clock();
        self.cpus.push(PerCpuSched::new(cpu, timeslice, now));

        let idle = self.new_context(cpu, idle_space, 0, 0)?;
        self.contexts[idle].state_change(ThreadState::empty(), ThreadState::READY);

        let per_cpu = &mut self.cpus[cpu];
        per_cpu.idle = idle;
        per_cpu.current = idle;

        self.lock_cpu(cpu);
        self.ready_enqueue(idle);
        self.set_current_sched(self.contexts[idle].sched);
        self.unlock_cpu(cpu);

        log::debug!("cpu{}: up, idle context {}", cpu, idle);
        Ok(cpu)
    }

    // -- Context lifecycle

    /// Create a context on `cpu` with the default priority and quantum.
    ///
    /// The context starts out `DEAD`; [`activate`](Self::activate) makes it
    /// runnable.
    pub fn create_context(&mut self, cpu: CpuId, space: SpaceId) -> SchedResult<ContextRef> {
        assert!(cpu < self.cpus.len(), "cpu{} not up", cpu);
        let ctx = self.new_context(
            cpu,
            space,
            self.config.default_prio,
            self.config.default_mcp,
        )?;
        log::debug!("cpu{}: created context {}", cpu, ctx);
        Ok(ctx)
    }

    fn new_context(
        &mut self,
        cpu: CpuId,
        space: SpaceId,
        prio: Priority,
        mcp: Priority,
    ) -> SchedResult<ContextRef> {
        let quantum = crate::params::round_quantum(self.config.default_quantum, self.config.granularity);

        let ctx = self
            .contexts
            .insert_with(|me| Context::new(me, cpu, space, mcp))
            .ok_or(SchedError::OutOfMemory)?;

        let Some(sched) = self
            .scheds
            .insert_with(|me| SchedContext::new(me, ctx, 0, prio, quantum))
        else {
            self.contexts.remove(ctx);
            return Err(SchedError::OutOfMemory);
        };

        let Some(deadline) = self
            .timeouts
            .insert(Timeout::new(TimeoutKind::Deadline { owner: ctx }, cpu))
        else {
            self.scheds.remove(sched);
            self.contexts.remove(ctx);
            return Err(SchedError::OutOfMemory);
        };

        let c = &mut self.contexts[ctx];
        c.default_sched = sched;
        c.sched = sched;
        c.deadline_timeout = deadline;
        Ok(ctx)
    }

    /// Make a dead context runnable and enqueue it.
    ///
    /// Returns true if the context may preempt the running one; the caller
    /// should then call [`schedule`](Self::schedule).
    pub fn activate(&mut self, ctx: ContextRef) -> SchedResult<bool> {
        self.check_context(ctx)?;
        let c = &self.contexts[ctx];
        if !c.state().contains(ThreadState::DEAD) {
            return Err(SchedError::InvalidContext);
        }
        let cpu = c.cpu;
        c.state_change(ThreadState::empty(), ThreadState::READY);

        self.lock_cpu(cpu);
        self.ready_enqueue(ctx);
        let preempt = self.can_preempt_current(self.contexts[ctx].sched);
        self.unlock_cpu(cpu);

        log::debug!("cpu{}: activated {}", cpu, ctx);
        Ok(preempt)
    }

    /// Tear down the scheduling state of `ctx` and mark it `DEAD`.
    ///
    /// Cancels its timeouts, leaves periodic mode, drops the lock another
    /// context holds on it, returns to the default timeslice and takes the
    /// context out of the ready queue. If the CPU was charging one of its
    /// timeslices, the running context's own timeslice is charged instead.
    pub fn kill_context(&mut self, ctx: ContextRef) -> SchedResult<()> {
        self.check_context(ctx)?;
        let cpu = self.contexts[ctx].cpu;
        if ctx == self.cpus[cpu].idle {
            return Err(SchedError::InvalidContext);
        }
        if ctx == self.cpus[cpu].current {
            return Err(SchedError::ContextRunning);
        }

        let held = self.lock_cpu(cpu);
        self.release_sched_state(held, ctx);
        self.unlock_cpu(cpu);
        log::debug!("cpu{}: killed {}", cpu, ctx);
        Ok(())
    }

    /// Remove `ctx` and everything it owns.
    ///
    /// Tears down its scheduling state like
    /// [`kill_context`](Self::kill_context), whatever its state, and
    /// releases FPU ownership if held. Contexts that would resume `ctx`
    /// after a lock release resume themselves instead.
    pub fn destroy_context(&mut self, ctx: ContextRef) -> SchedResult<()> {
        let c = self.contexts.get(ctx).ok_or(SchedError::InvalidContext)?;
        let cpu = c.cpu;
        if ctx == self.cpus[cpu].idle {
            return Err(SchedError::InvalidContext);
        }
        if ctx == self.cpus[cpu].current {
            return Err(SchedError::ContextRunning);
        }
        if c.lock_cnt() > 0 {
            return Err(SchedError::ContextLocked);
        }

        // A halted context is DEAD but may still sit in its ready ring
        let held = self.lock_cpu(cpu);
        self.release_sched_state(held, ctx);
        self.unlock_cpu(cpu);

        let helped: Vec<ContextRef> = self
            .contexts
            .iter()
            .filter(|&(other, o)| other != ctx && o.helper == ctx)
            .map(|(other, _)| other)
            .collect();
        for other in helped {
            self.contexts[other].helper = other;
        }

        if self.platform.is_owner(cpu, ctx) {
            self.platform.set_owner(cpu, ContextRef::NULL);
            self.platform.disable(cpu);
        }

        let slices: Vec<SchedRef> = self.scheds_of(ctx).collect();
        for s in slices {
            self.scheds.remove(s);
        }

        let c = &self.contexts[ctx];
        for t in [c.deadline_timeout, c.ipc_timeout, c.sched_timeout] {
            if t.is_valid() {
                self.cpus[cpu].timeouts.remove(t);
                self.timeouts.remove(t);
            }
        }

        self.contexts[ctx].invalidate();
        self.contexts.remove(ctx);
        log::debug!("cpu{}: destroyed {}", cpu, ctx);
        Ok(())
    }

    /// Mark `ctx` `DEAD` and detach it from the scheduler.
    ///
    /// Cancels its timeouts, releases the lock its holder has on it, takes
    /// it out of the ready queue and returns it to its default timeslice.
    /// If the CPU was charging one of its timeslices, the running context's
    /// own timeslice is charged instead.
    fn release_sched_state(&mut self, held: Held, ctx: ContextRef) {
        let cpu = self.contexts[ctx].cpu;

        // Before the slice change, which would enqueue a ready context
        self.contexts[ctx].state_change_dirty(held, ThreadState::empty(), ThreadState::DEAD);

        self.reset_timeout(self.contexts[ctx].deadline_timeout);
        self.release_ipc_timeout(ctx);
        self.cancel_sched_timeout(ctx);
        self.ready_dequeue(ctx);

        let holder = self.contexts[ctx].donatee;
        if holder.is_valid() && holder != ctx {
            self.contexts[holder].dec_lock_cnt();
        }

        let c = &mut self.contexts[ctx];
        c.mode = SchedMode::empty();
        c.donatee = ContextRef::NULL;
        c.helper = ctx;

        let default = c.default_sched;
        if c.sched != default {
            self.switch_sched(ctx, default);
        }

        let cs = self.cpus[cpu].current_sched;
        if cs.is_valid() && self.scheds[cs].owner == ctx {
            let current = self.cpus[cpu].current;
            self.switch_to_locked(current);
        }
    }

    /// Stop `ctx`: clear `READY` and mark it `CANCEL | DEAD`.
    ///
    /// Returns false without changing anything if the context was not
    /// ready. A running context schedules away until it is ready again.
    pub fn halt(&mut self, ctx: ContextRef) -> bool {
        let c = &self.contexts[ctx];
        if !c.state_change_safely(!ThreadState::READY, ThreadState::CANCEL | ThreadState::DEAD) {
            return false;
        }
        let cpu = c.cpu;
        log::debug!("cpu{}: halted {}", cpu, ctx);

        while self.cpus[cpu].current == ctx && !self.contexts[ctx].is_ready() {
            self.schedule(cpu);
        }
        true
    }
}
