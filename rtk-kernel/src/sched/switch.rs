//! Scheduling decision and timeslice switching
//!
//! # Sections
//!
//! - Timeslice selection: `switch_sched`, `set_current_sched`
//! - Decision: `schedule`, `can_preempt_current`
//! - Switch: `switch_to`, `switch_to_locked` and the low-level FPU and CPU
//!   switch used by [`helping`](super::helping)

use rtk_core::{ContextRef, CpuId, HelpingMode, SchedRef};

use crate::Kernel;
use crate::hal::{Fpu, Platform, Proc};

impl<P: Platform> Kernel<P> {
    // -- Timeslice selection

    /// Make `next` the active timeslice of `ctx`.
    ///
    /// The old timeslice is parked with a full budget. If the CPU was
    /// charging it, the CPU's current timeslice is invalidated so the next
    /// switch installs a fresh one.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is not held or `next` has no full budget.
    pub fn switch_sched(&mut self, ctx: ContextRef, next: SchedRef) {
        let cpu = self.contexts[ctx].cpu;
        self.cpus[cpu].lock.held();

        let old = self.contexts[ctx].sched;
        if self.cpus[cpu].current_sched == old {
            self.invalidate_sched(cpu);
        }

        self.scheds[old].replenish();
        assert!(
            self.scheds[next].is_full(),
            "switch to partially used timeslice {}",
            next
        );

        let old_prio = self.scheds[old].prio;
        let new_prio = self.scheds[next].prio;

        if !self.contexts[ctx].in_ready_list() {
            self.contexts[ctx].sched = next;
            self.ready_enqueue(ctx);
        } else if old_prio != new_prio
            || self.cpus[cpu].ready.head(old_prio) != ctx
            || old_prio == 0
        {
            self.ready_dequeue(ctx);
            self.contexts[ctx].sched = next;
            self.ready_enqueue(ctx);
        } else {
            let c = &mut self.contexts[ctx];
            c.sched = next;
            let successor = c.ready_next;
            self.cpus[cpu].ready.set_head(new_prio, successor);
        }

        log::debug!(
            "cpu{}: {} switched timeslice {} -> {} (prio {})",
            cpu,
            ctx,
            old,
            next,
            new_prio
        );
    }

    /// Charge the CPU's time to `sched` from now on.
    ///
    /// The outgoing timeslice keeps what is left of it, or is refilled if
    /// it ran out. The timeslice timeout is rearmed for the end of `sched`.
    pub fn set_current_sched(&mut self, sched: SchedRef) {
        let cpu = self.contexts[self.scheds[sched].owner].cpu;
        self.cpus[cpu].lock.held();

        let now = self.clock();
        let timeslice = self.cpus[cpu].timeslice_timeout;

        let old = self.cpus[cpu].current_sched;
        if old.is_valid() {
            let left = self.timeouts[timeslice].remaining(now);
            if left > 0 {
                self.scheds[old].left = left as u64;
            } else {
                self.scheds[old].replenish();
            }
        }

        self.reset_timeout(timeslice);
        self.set_timeout(timeslice, now + self.scheds[sched].left);
        self.cpus[cpu].current_sched = sched;
    }

    /// Forget the timeslice charged on `cpu`.
    pub fn invalidate_sched(&mut self, cpu: CpuId) {
        self.cpus[cpu].current_sched = SchedRef::NULL;
    }

    // -- Decision

    /// Check if `sched` may preempt the running context of its CPU.
    ///
    /// Equal priority never preempts: the running context wins ties.
    /// Otherwise `sched` wins against no charged timeslice, a lower
    /// priority one, or itself.
    #[must_use]
    pub fn can_preempt_current(&self, sched: SchedRef) -> bool {
        let s = &self.scheds[sched];
        let cpu = self.contexts[s.owner].cpu;
        let per_cpu = &self.cpus[cpu];

        // No priority boosting: the running context keeps the CPU on ties
        if self.prio_of(per_cpu.current) >= s.prio {
            return false;
        }

        let cs = per_cpu.current_sched;
        cs.is_null() || self.scheds[cs].prio < s.prio || cs == sched
    }

    /// Run the highest-priority ready context of `cpu`.
    ///
    /// Takes the CPU lock unless the caller holds it already. Stale ready
    /// entries are dropped, opening an interrupt window after each.
    ///
    /// # Panics
    ///
    /// Panics if called while a schedule on `cpu` waits for interrupts, or
    /// if the ready queue is empty.
    pub fn schedule(&mut self, cpu: CpuId) {
        assert!(
            !self.cpus[cpu].schedule_in_progress,
            "cpu{}: schedule reentered",
            cpu
        );

        let took_lock = !self.cpus[cpu].lock.test();
        if took_lock {
            self.cpus[cpu].lock.lock();
        }

        let current = self.cpus[cpu].current;
        if self.contexts[current].is_ready() {
            self.ready_enqueue(current);
        }

        let next = loop {
            let next = self.cpus[cpu].ready.first();
            assert!(next.is_valid(), "cpu{}: ready queue empty", cpu);

            if self.contexts[next].is_ready() {
                break next;
            }

            log::debug!("cpu{}: dropping stale ready entry {}", cpu, next);
            self.ready_dequeue(next);

            let per_cpu = &mut self.cpus[cpu];
            per_cpu.schedule_in_progress = true;
            per_cpu.lock.clear();
            self.platform.irq_chance(cpu);
            let per_cpu = &mut self.cpus[cpu];
            per_cpu.lock.lock();
            per_cpu.schedule_in_progress = false;
        };

        self.switch_to_locked(next);

        if took_lock {
            self.cpus[cpu].lock.clear();
        }
    }

    // -- Switch

    /// [`switch_to_locked`](Self::switch_to_locked) taking the CPU lock.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is already held.
    pub fn switch_to(&mut self, target: ContextRef) {
        let cpu = self.contexts[target].cpu;
        self.cpus[cpu].lock.lock();
        self.switch_to_locked(target);
        self.cpus[cpu].lock.clear();
    }

    /// Charge `target`'s timeslice and run `target`.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is not held.
    pub fn switch_to_locked(&mut self, target: ContextRef) {
        let cpu = self.contexts[target].cpu;
        self.cpus[cpu].lock.held();

        let sched = self.contexts[target].sched;
        if sched != self.cpus[cpu].current_sched {
            self.set_current_sched(sched);
        }

        let current = self.cpus[cpu].current;
        if target != current {
            self.switch_exec_locked(current, target, HelpingMode::NotHelping);
        }
    }

    /// Enable the FPU if `to` owns it, trap the next use otherwise.
    pub(crate) fn switch_fpu(&mut self, cpu: CpuId, to: ContextRef) {
        if self.platform.is_owner(cpu, to) {
            self.platform.enable(cpu);
        } else {
            self.platform.disable(cpu);
        }
    }

    /// Account CPU time and hand the CPU from `from` to `to`.
    pub(crate) fn switch_cpu(&mut self, cpu: CpuId, from: ContextRef, to: ContextRef) {
        let now = self.clock();
        if self.config.fine_grained_cputime {
            let spent = now.saturating_sub(self.cpus[cpu].switch_time);
            self.contexts[from].consumed_time += spent;
        }
        self.cpus[cpu].switch_time = now;
        self.cpus[cpu].current = to;

        log::trace!("cpu{}: switch {} -> {}", cpu, from, to);
        let space = self.contexts[to].space;
        self.platform.switch_cpu(cpu, from, to, space);
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::*;

    #[test]
    fn test_schedule_picks_highest_and_round_robins() {
        let mut k = kernel();
        let _low = spawn(&mut k, 5);
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 10);

        k.schedule(0);
        assert_eq!(k.current(0), a);

        // Timeslice of `a` ends: rotate within the band
        expire_timeslice(&mut k, 0);
        assert_eq!(k.current(0), b);

        expire_timeslice(&mut k, 0);
        assert_eq!(k.current(0), a);

        expire_timeslice(&mut k, 0);
        assert_eq!(k.current(0), b);
    }

    #[test]
    fn test_running_context_reenqueued_as_head() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 10);

        k.schedule(0);
        assert_eq!(k.current(0), a);

        // Pull the running context out and put it back
        k.lock_cpu(0);
        k.ready_dequeue(a);
        assert_eq!(ring(&k, 0, 10), vec![b]);
        k.ready_enqueue(a);
        k.unlock_cpu(0);

        assert_eq!(ring(&k, 0, 10), vec![a, b]);
    }

    #[test]
    fn test_enqueue_before_head() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 10);
        let c = spawn(&mut k, 10);

        assert_eq!(ring(&k, 0, 10), vec![a, b, c]);
        assert_eq!(k.cpu(0).ready().head(10), a);
    }

    #[test]
    fn test_enqueue_noops() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);

        k.lock_cpu(0);
        // Already enqueued
        k.ready_enqueue(a);
        assert_eq!(ring(&k, 0, 10), vec![a]);

        // Not ready
        k.ready_dequeue(a);
        k.context(a).state_del(rtk_core::ThreadState::READY);
        k.ready_enqueue(a);
        assert!(!k.in_ready_list(a));

        // No budget left
        k.context(a).state_add(rtk_core::ThreadState::READY);
        let s = k.active_sched(a);
        k.scheds[s].left = 0;
        k.ready_enqueue(a);
        assert!(!k.in_ready_list(a));

        // Dequeue of an unqueued context
        k.ready_dequeue(a);
        k.unlock_cpu(0);
        assert_eq!(k.cpu(0).ready().prio_highest(), 0);
    }

    #[test]
    fn test_prio_highest_tracks_rings() {
        let mut k = kernel();
        let a = spawn(&mut k, 40);
        let b = spawn(&mut k, 20);
        assert_eq!(k.cpu(0).ready().prio_highest(), 40);

        k.lock_cpu(0);
        k.ready_dequeue(a);
        assert_eq!(k.cpu(0).ready().prio_highest(), 20);
        k.ready_dequeue(b);
        // Idle stays enqueued at priority 0
        assert_eq!(k.cpu(0).ready().prio_highest(), 0);
        assert_eq!(k.cpu(0).ready().head(0), k.cpu(0).idle());
        k.unlock_cpu(0);
    }

    #[test]
    fn test_ready_queue_invariant() {
        let mut k = kernel();
        let ctxs: Vec<_> = [3, 7, 7, 12].iter().map(|&p| spawn(&mut k, p)).collect();
        k.schedule(0);
        expire_timeslice(&mut k, 0);
        k.kill_context(ctxs[1]).unwrap();

        for (c, ctx) in k.contexts.iter() {
            if ctx.in_ready_list() {
                assert!(ctx.is_ready(), "{} enqueued but not ready", c);
                assert!(k.sched(ctx.sched).left > 0, "{} enqueued without budget", c);
            }
        }
    }

    #[test]
    fn test_schedule_drops_stale_entries() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 5);

        // `a` loses readiness without leaving the queue
        k.context(a).state_del(rtk_core::ThreadState::READY);
        k.schedule(0);

        assert_eq!(k.current(0), b);
        assert!(!k.in_ready_list(a));
        assert_eq!(k.platform().irq_chances, 1);
        assert!(!k.cpu(0).schedule_in_progress());
        assert!(!k.cpu(0).lock().test());
    }

    #[test]
    fn test_schedule_keeps_lock_if_held() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);

        k.lock_cpu(0);
        k.schedule(0);
        assert!(k.cpu(0).lock().test());
        k.unlock_cpu(0);
        assert_eq!(k.current(0), a);
    }

    #[test]
    #[should_panic(expected = "ready queue empty")]
    fn test_schedule_empty_queue_panics() {
        let mut k = kernel();
        let idle = k.cpu(0).idle();
        k.context(idle).state_del(rtk_core::ThreadState::READY);
        k.lock_cpu(0);
        k.ready_dequeue(idle);
        k.schedule(0);
    }

    #[test]
    fn test_switch_sched_twice_refills_previous() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let rt = k.add_realtime_sched(a, 10, 3_000).unwrap();
        let rt = k.find_sched(a, rt).unwrap();
        let default = k.context(a).default_sched;

        k.schedule(0);
        k.platform_mut().advance(4_000);

        k.lock_cpu(0);
        k.switch_sched(a, rt);
        assert_eq!(k.sched(default).left, k.sched(default).quantum);
        k.switch_sched(a, default);
        assert_eq!(k.sched(rt).left, k.sched(rt).quantum);
        assert_eq!(k.active_sched(a), default);
        k.unlock_cpu(0);
    }

    #[test]
    fn test_switch_sched_invalidates_current_sched() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        k.schedule(0);
        assert_eq!(k.current_sched(0), k.active_sched(a));

        let rt = k.add_realtime_sched(a, 20, 3_000).unwrap();
        let rt = k.find_sched(a, rt).unwrap();
        k.lock_cpu(0);
        k.switch_sched(a, rt);
        k.unlock_cpu(0);

        assert!(k.current_sched(0).is_null());
        // Moved to the priority-20 band
        assert_eq!(k.cpu(0).ready().head(20), a);
        assert!(k.cpu(0).ready().head(10).is_null());
    }

    #[test]
    fn test_switch_sched_in_place_slide() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 10);
        let rt = k.add_realtime_sched(a, 10, 3_000).unwrap();
        let rt = k.find_sched(a, rt).unwrap();
        assert_eq!(k.cpu(0).ready().head(10), a);

        k.lock_cpu(0);
        k.switch_sched(a, rt);
        k.unlock_cpu(0);

        // Same band, was head: head slides to the successor
        assert_eq!(k.active_sched(a), rt);
        assert_eq!(k.cpu(0).ready().head(10), b);
        assert_eq!(ring(&k, 0, 10), vec![b, a]);
    }

    #[test]
    fn test_can_preempt_current() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        k.schedule(0);
        assert_eq!(k.current(0), a);

        let b = spawn(&mut k, 10);
        let c = spawn(&mut k, 11);
        let d = spawn(&mut k, 9);
        let e = spawn(&mut k, 11);

        k.lock_cpu(0);
        assert!(!k.can_preempt_current(k.active_sched(b)), "equal priority");
        assert!(k.can_preempt_current(k.active_sched(c)));
        assert!(!k.can_preempt_current(k.active_sched(d)));

        // Charged timeslice at the candidate's priority blocks preemption
        let hi = k.active_sched(c);
        let e = k.active_sched(e);
        k.cpus[0].current_sched = hi;
        assert!(!k.can_preempt_current(e));
        assert!(k.can_preempt_current(hi));

        k.invalidate_sched(0);
        assert!(k.can_preempt_current(e));
        k.unlock_cpu(0);
    }

    #[test]
    fn test_switch_accounts_fine_grained_time() {
        let mut k = kernel_with(crate::SchedConfig::new().with_fine_grained_cputime(true));
        let idle = k.cpu(0).idle();
        k.platform_mut().advance(700);
        let a = spawn(&mut k, 10);
        k.schedule(0);

        assert_eq!(k.current(0), a);
        assert_eq!(k.context(idle).consumed_time, 700);
        assert_eq!(k.cpu(0).switch_time(), 700);
        assert_eq!(k.platform().switches.last(), Some(&(0, idle, a)));
    }

    #[test]
    fn test_switch_to_sets_current_sched() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        k.switch_to(a);

        assert_eq!(k.current(0), a);
        assert_eq!(k.current_sched(0), k.active_sched(a));
        let ts = k.cpu(0).timeslice_timeout();
        assert!(k.timeout(ts).is_set());
        assert_eq!(k.timeout(ts).wakeup, k.sched(k.active_sched(a)).left);
    }

    #[test]
    fn test_set_current_sched_banks_remaining_time() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 20);
        k.switch_to(a);
        let sa = k.active_sched(a);

        k.platform_mut().advance(4_000);
        k.switch_to(b);

        let quantum = k.sched(sa).quantum;
        assert_eq!(k.sched(sa).left, quantum - 4_000);
        let ts = k.cpu(0).timeslice_timeout();
        assert_eq!(k.timeout(ts).wakeup, 4_000 + k.sched(k.active_sched(b)).left);
    }
}
