//! Kernel entry points driven by the platform
//!
//! The platform's timer backend calls [`Kernel::handle_timer_interrupt`]
//! once per scheduler tick; the FPU trap handler calls
//! [`Kernel::fpu_fault`] on the first FPU use after a switch.

use rtk_core::{ContextRef, CpuId};

use crate::Kernel;
use crate::hal::{Fpu, Platform};

impl<P: Platform> Kernel<P> {
    /// Timer tick on `cpu`.
    ///
    /// Charges the running context one tick unless time is accounted at
    /// every switch, expires due timeouts and reschedules if one of them
    /// asked for it.
    ///
    /// # Panics
    ///
    /// Panics if no timeslice timeout is armed afterwards.
    pub fn handle_timer_interrupt(&mut self, cpu: CpuId) {
        let took_lock = !self.cpus[cpu].lock.test();
        if took_lock {
            self.cpus[cpu].lock.lock();
        }

        if !self.config.fine_grained_cputime {
            let current = self.cpus[cpu].current;
            self.contexts[current].consumed_time += self.config.granularity;
        }

        if self.do_timeouts(cpu) && !self.cpus[cpu].schedule_in_progress {
            self.schedule(cpu);
            assert!(
                self.timeout_is_set(self.cpus[cpu].timeslice_timeout),
                "cpu{}: no timeslice timeout armed after tick",
                cpu
            );
        }

        if took_lock {
            self.cpus[cpu].lock.clear();
        }
    }

    /// First FPU use of the running `ctx` since it was switched to.
    ///
    /// Saves the previous owner's registers, loads `ctx`'s and makes `ctx`
    /// the owner.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` is not running.
    pub fn fpu_fault(&mut self, ctx: ContextRef) {
        let cpu = self.contexts[ctx].cpu;
        assert_eq!(self.cpus[cpu].current, ctx, "FPU fault of non-running {}", ctx);

        self.platform.enable(cpu);
        let owner = self.platform.fpu_owner(cpu);
        if owner == ctx {
            return;
        }

        if let Some(prev) = self.contexts.get_mut(owner) {
            self.platform.save_state(cpu, &mut prev.fpu_state);
        }
        self.platform.restore_state(cpu, &self.contexts[ctx].fpu_state);
        self.platform.set_owner(cpu, ctx);
        log::trace!("cpu{}: FPU {} -> {}", cpu, owner, ctx);
    }
}

#[cfg(test)]
mod tests {
    use crate::SchedConfig;
    use crate::testing::*;

    #[test]
    fn test_tick_charges_running_context() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        k.schedule(0);

        k.platform_mut().advance(1_000);
        k.handle_timer_interrupt(0);
        k.platform_mut().advance(1_000);
        k.handle_timer_interrupt(0);

        assert_eq!(k.context(a).consumed_time, 2_000);
        assert_eq!(k.current(0), a);
        assert!(!k.cpu(0).lock().test());
    }

    #[test]
    fn test_tick_without_expiry_does_not_schedule() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        k.schedule(0);
        // Higher priority context appears without a scheduling decision
        let _b = spawn(&mut k, 20);

        k.platform_mut().advance(1_000);
        k.handle_timer_interrupt(0);
        assert_eq!(k.current(0), a);
    }

    #[test]
    fn test_fine_grained_tick_charges_nothing() {
        let mut k = kernel_with(SchedConfig::new().with_fine_grained_cputime(true));
        let a = spawn(&mut k, 10);
        k.schedule(0);

        k.platform_mut().advance(1_000);
        k.handle_timer_interrupt(0);
        assert_eq!(k.context(a).consumed_time, 0);
    }

    #[test]
    fn test_timeslice_end_round_robins() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 10);
        k.schedule(0);

        advance_to(&mut k, 10_000);
        assert_eq!(k.current(0), b);
        let ts = k.cpu(0).timeslice_timeout();
        assert!(k.timeout_is_set(ts));
        assert_eq!(k.timeout(ts).wakeup, 20_000);

        advance_to(&mut k, 20_000);
        assert_eq!(k.current(0), a);
    }

    #[test]
    fn test_fpu_lazy_handover() {
        let mut k = kernel();
        let a = spawn(&mut k, 10);
        let b = spawn(&mut k, 10);
        k.schedule(0);

        k.context_mut(a).fpu_state.bytes[0] = 0xaa;
        k.fpu_fault(a);
        assert_eq!(k.platform().fpu_owner, a);
        assert_eq!(k.platform().fpu_regs[0], 0xaa);
        assert!(k.platform().fpu_enabled);

        // Switching away traps the next FPU use
        advance_to(&mut k, 10_000);
        assert_eq!(k.current(0), b);
        assert!(!k.platform().fpu_enabled);

        k.platform_mut().fpu_regs[0] = 0xbb;
        k.fpu_fault(b);
        assert_eq!(k.context(a).fpu_state.bytes[0], 0xbb);
        assert_eq!(k.platform().fpu_owner, b);

        advance_to(&mut k, 20_000);
        assert_eq!(k.current(0), a);
        assert!(!k.platform().fpu_enabled);

        // Back to the owner: no trap needed
        advance_to(&mut k, 30_000);
        assert_eq!(k.current(0), b);
        assert!(k.platform().fpu_enabled);
    }
}
