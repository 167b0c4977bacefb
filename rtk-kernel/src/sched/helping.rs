//! Time donation to lock holders
//!
//! A context that is locked by another context cannot make progress on its
//! own. Switching to it switches to whoever holds its lock instead, so the
//! holder runs on the waiter's time and releases the lock sooner.
//!
//! # Links
//!
//! - `donatee`: the context holding this context's lock (NULL if unlocked).
//!   Following `donatee` links yields the chain of lock holders.
//! - `helper`: the context to resume once this context releases a lock.
//! - `lock_cnt`: number of contexts this context holds locked.
//!
//! # Chain Walk
//!
//! [`Kernel::resolve_switch_target`] walks the chain without changing any
//! state and returns the decision; [`Kernel::switch_exec_locked`] only acts
//! on it afterwards.

use rtk_core::{ContextRef, HelpingMode};

use crate::Kernel;
use crate::hal::Platform;

/// Outcome of the donation-chain walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchTarget {
    /// Switch to this context.
    To(ContextRef),
    /// Stay on the caller.
    Abort,
}

impl<P: Platform> Kernel<P> {
    /// Find the context that actually runs when `caller` switches to
    /// `target`.
    ///
    /// Follows lock holders from `target`. If the chain reaches `caller`,
    /// the context `caller` holds locked is chosen when it owns locks
    /// itself, so it can release them; otherwise the switch is aborted.
    /// A non-ready final context aborts as well, and so does a lock cycle
    /// that does not pass through `caller`.
    #[must_use]
    pub fn resolve_switch_target(&self, caller: ContextRef, target: ContextRef) -> SwitchTarget {
        let mut t = target;
        // A chain visits every context at most once unless it is a cycle
        let mut steps = self.contexts.len();
        loop {
            let donatee = self.contexts[t].donatee;
            if donatee.is_null() || donatee == t {
                break;
            }
            if donatee == caller {
                if self.contexts[t].lock_cnt() > 0 {
                    break;
                }
                return SwitchTarget::Abort;
            }
            if steps == 0 {
                log::warn!("lock cycle through {} reached from {}", t, target);
                return SwitchTarget::Abort;
            }
            steps -= 1;
            t = donatee;
        }

        if self.contexts[t].is_ready() {
            SwitchTarget::To(t)
        } else {
            SwitchTarget::Abort
        }
    }

    /// [`switch_exec_locked`](Self::switch_exec_locked) taking the CPU lock.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is already held.
    pub fn switch_exec(&mut self, caller: ContextRef, target: ContextRef, mode: HelpingMode) -> bool {
        let cpu = self.contexts[caller].cpu;
        self.cpus[cpu].lock.lock();
        let switched = self.switch_exec_locked(caller, target, mode);
        self.cpus[cpu].lock.clear();
        switched
    }

    /// Switch the CPU from the running `caller` to `target`, or to the lock
    /// holder `target` waits for.
    ///
    /// Returns true if a switch happened.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is not held, `caller` is not running,
    /// `target` is `caller`, or no timeslice timeout is armed.
    pub fn switch_exec_locked(
        &mut self,
        caller: ContextRef,
        target: ContextRef,
        mode: HelpingMode,
    ) -> bool {
        let cpu = self.contexts[caller].cpu;
        self.cpus[cpu].lock.held();
        assert_ne!(caller, target, "switch to self");
        assert_eq!(
            self.cpus[cpu].current, caller,
            "cpu{}: switch from non-running {}",
            cpu, caller
        );
        assert!(
            self.timeout_is_set(self.cpus[cpu].timeslice_timeout),
            "cpu{}: no timeslice timeout armed",
            cpu
        );

        let t = match self.resolve_switch_target(caller, target) {
            SwitchTarget::To(t) => t,
            SwitchTarget::Abort => return false,
        };

        self.contexts[t].set_helper(mode, caller);
        self.update_ready_list(caller);
        self.switch_fpu(cpu, t);
        self.switch_cpu(cpu, caller, t);
        true
    }

    /// Keep a still-ready running context represented in the ready queue.
    fn update_ready_list(&mut self, ctx: ContextRef) {
        if self.contexts[ctx].is_ready() {
            self.ready_enqueue(ctx);
        }
    }

    // -- Locks between contexts

    /// Let `holder` lock `target`.
    ///
    /// Returns true if the lock was taken. If another context holds it, the
    /// running `holder` helps that context instead and returns false; the
    /// caller retries once it runs again.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is not held.
    pub fn lock_context(&mut self, holder: ContextRef, target: ContextRef) -> bool {
        let cpu = self.contexts[holder].cpu;
        self.cpus[cpu].lock.held();

        let owner = self.contexts[target].donatee;
        if owner.is_null() || owner == holder {
            if owner.is_null() {
                self.contexts[target].donatee = holder;
                self.contexts[holder].inc_lock_cnt();
            }
            return true;
        }

        if self.cpus[cpu].current == holder {
            self.switch_exec_locked(holder, owner, HelpingMode::Helping);
        }
        false
    }

    /// Release the lock `holder` has on `target` and switch back to whoever
    /// helped `holder`.
    ///
    /// # Panics
    ///
    /// Panics if the CPU lock is not held or `holder` does not hold
    /// `target`'s lock.
    pub fn unlock_context(&mut self, holder: ContextRef, target: ContextRef) {
        let cpu = self.contexts[holder].cpu;
        self.cpus[cpu].lock.held();
        assert_eq!(
            self.contexts[target].donatee, holder,
            "{} does not hold the lock of {}",
            holder, target
        );

        self.contexts[target].donatee = ContextRef::NULL;
        self.contexts[holder].dec_lock_cnt();

        if self.cpus[cpu].current == holder {
            self.release_lock_switch(holder);
        }
    }

    /// Hand the CPU back after the running `owner` released a lock.
    ///
    /// Switches to `owner`'s helper without touching its helper link. If
    /// `owner` holds no more locks but is still locked itself, reschedules.
    pub fn release_lock_switch(&mut self, owner: ContextRef) {
        let cpu = self.contexts[owner].cpu;
        self.cpus[cpu].lock.held();

        let helper = self.contexts[owner].helper;
        self.contexts[owner].helper = owner;

        if helper != owner && self.contexts.contains(helper) {
            self.switch_exec_locked(owner, helper, HelpingMode::IgnoreHelping);
        }

        let o = &self.contexts[owner];
        if o.lock_cnt() == 0 && o.donatee.is_valid() && self.cpus[cpu].current == owner {
            self.schedule(cpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use rtk_core::ThreadState;

    /// Let `holder` lock each of `locked` in turn.
    fn lock_all(k: &mut TestKernel, holder: ContextRef, locked: &[ContextRef]) {
        for &t in locked {
            k.context_mut(t).donatee = holder;
            k.context_mut(holder).inc_lock_cnt();
        }
    }

    #[test]
    fn test_unlocked_target_resolves_to_itself() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let idle = k.cpu(0).idle();
        assert_eq!(k.resolve_switch_target(idle, a), SwitchTarget::To(a));
    }

    #[test]
    fn test_chain_resolves_to_last_holder() {
        let mut k = kernel();
        let caller = k.cpu(0).idle();
        let c: Vec<_> = (0..4).map(|_| spawn(&mut k, 10)).collect();

        // c0 locked by c1, c1 by c2, c2 by c3
        lock_all(&mut k, c[1], &[c[0]]);
        lock_all(&mut k, c[2], &[c[1]]);
        lock_all(&mut k, c[3], &[c[2]]);

        assert_eq!(k.resolve_switch_target(caller, c[0]), SwitchTarget::To(c[3]));
        assert_eq!(k.resolve_switch_target(caller, c[2]), SwitchTarget::To(c[3]));
    }

    #[test]
    fn test_self_locked_context_ends_chain() {
        let mut k = kernel();
        let caller = k.cpu(0).idle();
        let a = spawn(&mut k, 10);
        k.context_mut(a).donatee = a;
        assert_eq!(k.resolve_switch_target(caller, a), SwitchTarget::To(a));
    }

    #[test]
    fn test_lock_cycle_aborts() {
        let mut k = kernel();
        let caller = spawn(&mut k, 20);
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 10);
        k.schedule(0);

        // a and b hold each other
        lock_all(&mut k, b, &[a]);
        lock_all(&mut k, a, &[b]);

        assert_eq!(k.resolve_switch_target(caller, a), SwitchTarget::Abort);
        k.lock_cpu(0);
        assert!(!k.switch_exec_locked(caller, a, HelpingMode::NotHelping));
        k.unlock_cpu(0);
        assert_eq!(k.current(0), caller);
    }

    #[test]
    fn test_chain_back_to_caller_with_locks_switches_to_predecessor() {
        let mut k = kernel();
        let caller = spawn(&mut k, 20);
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 10);
        k.schedule(0);
        assert_eq!(k.current(0), caller);

        // a waits for b, b is locked by the caller and holds a lock itself
        lock_all(&mut k, b, &[a]);
        lock_all(&mut k, caller, &[b]);

        assert_eq!(k.resolve_switch_target(caller, a), SwitchTarget::To(b));

        k.lock_cpu(0);
        assert!(k.switch_exec_locked(caller, a, HelpingMode::NotHelping));
        k.unlock_cpu(0);
        assert_eq!(k.current(0), b);
    }

    #[test]
    fn test_chain_back_to_caller_without_locks_aborts() {
        let mut k = kernel();
        let caller = spawn(&mut k, 20);
        let a = spawn(&mut k, 10);
        k.schedule(0);

        lock_all(&mut k, caller, &[a]);
        assert_eq!(k.resolve_switch_target(caller, a), SwitchTarget::Abort);

        let switches = k.platform().switches.len();
        k.lock_cpu(0);
        assert!(!k.switch_exec_locked(caller, a, HelpingMode::NotHelping));
        k.unlock_cpu(0);
        assert_eq!(k.current(0), caller);
        assert_eq!(k.platform().switches.len(), switches);
    }

    #[test]
    fn test_non_ready_target_aborts() {
        let mut k = kernel();
        let caller = spawn(&mut k, 20);
        let a = spawn(&mut k, 10);
        k.schedule(0);

        k.context(a).state_del(ThreadState::READY);
        k.lock_cpu(0);
        assert!(!k.switch_exec_locked(caller, a, HelpingMode::NotHelping));
        k.unlock_cpu(0);
        assert_eq!(k.current(0), caller);
    }

    #[test]
    fn test_switch_exec_records_helper() {
        let mut k = kernel();
        let caller = spawn(&mut k, 20);
        let a = spawn(&mut k, 10);
        k.schedule(0);

        assert!(k.switch_exec(caller, a, HelpingMode::Helping));
        assert_eq!(k.context(a).helper, caller);
        assert_eq!(k.current(0), a);
        // Caller stays represented in the ready queue
        assert!(k.in_ready_list(caller));
    }

    #[test]
    #[should_panic(expected = "no timeslice timeout armed")]
    fn test_switch_exec_requires_armed_timeslice() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let idle = k.cpu(0).idle();
        let ts = k.cpu(0).timeslice_timeout();

        k.lock_cpu(0);
        k.reset_timeout(ts);
        k.switch_exec_locked(idle, a, HelpingMode::NotHelping);
    }

    #[test]
    fn test_lock_helps_holder_and_unlock_returns() {
        let mut k = kernel();
        let waiter = spawn(&mut k, 20);
        let holder = spawn(&mut k, 5);
        let obj = spawn(&mut k, 1);
        k.schedule(0);
        assert_eq!(k.current(0), waiter);

        k.lock_cpu(0);
        // Holder takes the lock while it is not running
        assert!(k.lock_context(holder, obj));
        assert_eq!(k.context(holder).lock_cnt(), 1);

        // Waiter finds it locked and runs the holder instead
        assert!(!k.lock_context(waiter, obj));
        assert_eq!(k.current(0), holder);
        assert_eq!(k.context(holder).helper, waiter);

        // Release switches straight back to the waiter
        k.unlock_context(holder, obj);
        assert_eq!(k.current(0), waiter);
        assert_eq!(k.context(holder).lock_cnt(), 0);
        assert_eq!(k.context(holder).helper, holder);
        assert!(k.context(obj).donatee.is_null());

        assert!(k.lock_context(waiter, obj));
        k.unlock_cpu(0);
    }
}
