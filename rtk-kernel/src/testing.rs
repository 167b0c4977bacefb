//! Test platform and helpers

use alloc::vec::Vec;

use rtk_core::{ContextRef, CpuId, FPU_STATE_SIZE, FpuState, Priority, SchedRef, SpaceId, Time};

use crate::hal::{Fpu, Preemption, PreemptionKind, Proc, Timer};
use crate::{Kernel, SchedConfig};

/// Platform that records what the scheduler asks of it.
#[derive(Debug)]
pub struct MockPlatform {
    pub clock: Time,
    pub irq_chances: usize,
    pub switches: Vec<(CpuId, ContextRef, ContextRef)>,
    pub events: Vec<(ContextRef, PreemptionKind, Time, SchedRef)>,
    pub fpu_owner: ContextRef,
    pub fpu_enabled: bool,
    /// Live FPU registers.
    pub fpu_regs: [u8; FPU_STATE_SIZE],
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            clock: 0,
            irq_chances: 0,
            switches: Vec::new(),
            events: Vec::new(),
            fpu_owner: ContextRef::NULL,
            fpu_enabled: false,
            fpu_regs: [0; FPU_STATE_SIZE],
        }
    }

    pub fn advance(&mut self, dt: Time) {
        self.clock += dt;
    }

    pub fn set_clock(&mut self, t: Time) {
        self.clock = t;
    }
}

impl Timer for MockPlatform {
    fn system_clock(&self) -> Time {
        self.clock
    }
}

impl Fpu for MockPlatform {
    fn fpu_owner(&self, _cpu: CpuId) -> ContextRef {
        self.fpu_owner
    }

    fn set_owner(&mut self, _cpu: CpuId, ctx: ContextRef) {
        self.fpu_owner = ctx;
    }

    fn enable(&mut self, _cpu: CpuId) {
        self.fpu_enabled = true;
    }

    fn disable(&mut self, _cpu: CpuId) {
        self.fpu_enabled = false;
    }

    fn save_state(&mut self, _cpu: CpuId, state: &mut FpuState) {
        state.bytes = self.fpu_regs;
    }

    fn restore_state(&mut self, _cpu: CpuId, state: &FpuState) {
        self.fpu_regs = state.bytes;
    }
}

impl Proc for MockPlatform {
    fn irq_chance(&mut self, _cpu: CpuId) {
        self.irq_chances += 1;
    }

    fn switch_cpu(&mut self, cpu: CpuId, from: ContextRef, to: ContextRef, _space: SpaceId) {
        self.switches.push((cpu, from, to));
    }
}

impl Preemption for MockPlatform {
    fn queue(&mut self, owner: ContextRef, kind: PreemptionKind, time: Time, sched: SchedRef) {
        self.events.push((owner, kind, time, sched));
    }
}

pub type TestKernel = Kernel<MockPlatform>;

/// Kernel with CPU 0 up and the default configuration.
pub fn kernel() -> TestKernel {
    kernel_with(SchedConfig::new())
}

pub fn kernel_with(config: SchedConfig) -> TestKernel {
    let mut k = Kernel::new(MockPlatform::new(), config);
    k.add_cpu(SpaceId(0)).unwrap();
    k
}

/// Create and activate a context on CPU 0 at `prio` without scheduling.
pub fn spawn(k: &mut TestKernel, prio: Priority) -> ContextRef {
    let ctx = k.create_context(0, SpaceId(1)).unwrap();
    let quantum = k.config().default_quantum;
    k.set_sched_param(ctx, 0, prio, quantum).unwrap();
    k.activate(ctx).unwrap();
    ctx
}

/// Let the charged timeslice of `cpu` run out.
pub fn expire_timeslice(k: &mut TestKernel, cpu: CpuId) {
    let wakeup = k.timeout(k.cpu(cpu).timeslice_timeout()).wakeup;
    k.platform_mut().set_clock(wakeup);
    k.handle_timer_interrupt(cpu);
}

/// Move the clock to `t` and deliver a tick on CPU 0.
pub fn advance_to(k: &mut TestKernel, t: Time) {
    k.platform_mut().set_clock(t);
    k.handle_timer_interrupt(0);
}

/// Ring `prio` of `cpu` in round-robin order.
pub fn ring(k: &TestKernel, cpu: CpuId, prio: Priority) -> Vec<ContextRef> {
    k.cpu(cpu).ready().ring(&k.contexts, prio).collect()
}
