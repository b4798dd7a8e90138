// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The contract between the core and a scheduling policy.
//!
//! A policy implements [`SchedOps`]. Every callback gets a [`ScxCtx`], which
//! is the only way for the policy to act on the system: dispatching tasks,
//! consuming DSQs, kicking CPUs and raising errors.

use crate::cpumask::Cpumask;
use crate::exit::ExitInfo;
use crate::session::ScxSession;
use crate::task::TaskRef;
use crate::types::CpuId;
use crate::types::DeqFlags;
use crate::types::DsqId;
use crate::types::EnqFlags;
use crate::types::KickFlags;
use crate::types::OpsFlags;
use crate::types::Pid;
use crate::types::TimeNs;
use crate::types::WakeFlags;
use crate::types::SCX_SLICE_DFL;
use anyhow::Result;

/// Raise a policy error with a formatted message. The policy is torn down
/// once the current callback returns.
#[macro_export]
macro_rules! scx_bpf_error {
    ($ctx:expr, $($arg:tt)*) => {
        $ctx.error(format!($($arg)*))
    };
}

/// The callback that is currently executing. Decides what the dispatch
/// kfuncs are allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScxOp {
    Init,
    Exit,
    PrepEnable,
    Enable,
    Disable,
    SelectCpu,
    Enqueue,
    Dequeue,
    Dispatch,
    Runnable,
    Running,
    Stopping,
    Quiescent,
    Tick,
    UpdateIdle,
    Timer,
}

/// Scheduling policy callbacks.
///
/// Callbacks take `&self` and may run concurrently on different CPUs, so
/// policy state needs interior mutability. Everything except `name` and
/// `enqueue` has a default.
pub trait SchedOps: Send + Sync {
    fn name(&self) -> &str;

    fn flags(&self) -> OpsFlags {
        OpsFlags::NONE
    }

    /// Watchdog timeout. 0 selects the default.
    fn timeout_ms(&self) -> u32 {
        0
    }

    fn init(&self, _ctx: &ScxCtx) -> Result<()> {
        Ok(())
    }

    fn exit(&self, _info: &ExitInfo) {}

    /// A task is about to come under the policy. Failing keeps the task on
    /// the default class.
    fn prep_enable(&self, _ctx: &ScxCtx, _task: &TaskRef) -> Result<()> {
        Ok(())
    }

    fn enable(&self, _ctx: &ScxCtx, _task: &TaskRef) {}

    fn disable(&self, _ctx: &ScxCtx, _task: &TaskRef) {}

    /// Pick the CPU a waking task should be enqueued on. A dispatch issued
    /// from here bypasses ops.enqueue().
    fn select_cpu(
        &self,
        ctx: &ScxCtx,
        task: &TaskRef,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> CpuId {
        let (cpu, is_idle) = ctx.select_cpu_dfl(task, prev_cpu, wake_flags);
        if is_idle {
            ctx.dispatch(task, DsqId::LOCAL, SCX_SLICE_DFL, EnqFlags::NONE);
        }
        cpu
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags);

    fn dequeue(&self, _ctx: &ScxCtx, _task: &TaskRef, _deq_flags: DeqFlags) {}

    /// `cpu` ran out of work. Dispatch or consume something for it.
    fn dispatch(&self, _ctx: &ScxCtx, _cpu: CpuId, _prev: Option<&TaskRef>) {}

    fn runnable(&self, _ctx: &ScxCtx, _task: &TaskRef, _enq_flags: EnqFlags) {}

    fn running(&self, _ctx: &ScxCtx, _task: &TaskRef) {}

    fn stopping(&self, _ctx: &ScxCtx, _task: &TaskRef, _runnable: bool) {}

    fn quiescent(&self, _ctx: &ScxCtx, _task: &TaskRef, _deq_flags: DeqFlags) {}

    fn tick(&self, _ctx: &ScxCtx, _task: &TaskRef) {}

    fn update_idle(&self, _ctx: &ScxCtx, _cpu: CpuId, _idle: bool) {}

    /// Expiry of the timer armed with `ScxCtx::timer_start`.
    fn timer(&self, _ctx: &ScxCtx) {}
}

/// Handle passed to callbacks.
pub struct ScxCtx<'a> {
    sess: &'a ScxSession,
    cpu: CpuId,
    op: ScxOp,
}

impl<'a> ScxCtx<'a> {
    pub(crate) fn new(sess: &'a ScxSession, cpu: CpuId, op: ScxOp) -> Self {
        Self { sess, cpu, op }
    }

    /// CPU the callback runs on.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn op(&self) -> ScxOp {
        self.op
    }

    pub fn now(&self) -> TimeNs {
        self.sess.now()
    }

    pub fn nr_cpu_ids(&self) -> u32 {
        self.sess.nr_cpus()
    }

    /// Queue `task` on `dsq_id` in FIFO order. A `slice` of 0 keeps the
    /// task's current slice.
    pub fn dispatch(&self, task: &TaskRef, dsq_id: DsqId, slice: u64, enq_flags: EnqFlags) {
        self.sess
            .dispatch(self.cpu, self.op, task, dsq_id, slice, None, enq_flags);
    }

    /// Queue `task` on a custom DSQ ordered by `vtime`.
    pub fn dispatch_vtime(
        &self,
        task: &TaskRef,
        dsq_id: DsqId,
        slice: u64,
        vtime: u64,
        enq_flags: EnqFlags,
    ) {
        self.sess
            .dispatch(self.cpu, self.op, task, dsq_id, slice, Some(vtime), enq_flags);
    }

    /// Move the first task of `dsq_id` that can run here to this CPU's local
    /// DSQ. Only valid from ops.dispatch().
    pub fn consume(&self, dsq_id: DsqId) -> bool {
        self.sess.consume(self.cpu, self.op, dsq_id)
    }

    /// Number of dispatches ops.dispatch() may still issue in this round.
    pub fn dispatch_nr_slots(&self) -> u32 {
        self.sess.dispatch_nr_slots(self.cpu, self.op)
    }

    pub fn create_dsq(&self, dsq_id: DsqId, capacity: Option<usize>) -> Result<()> {
        self.sess.create_dsq(dsq_id, capacity)
    }

    pub fn destroy_dsq(&self, dsq_id: DsqId) {
        self.sess.destroy_dsq(self.cpu, dsq_id);
    }

    /// Queued tasks on a DSQ. `LOCAL` means this CPU. Unknown DSQs count 0.
    pub fn dsq_nr_queued(&self, dsq_id: DsqId) -> usize {
        self.sess.dsq_nr_queued(self.cpu, dsq_id)
    }

    pub fn kick_cpu(&self, cpu: CpuId, flags: KickFlags) {
        self.sess.kick_cpu(self.cpu, cpu, flags);
    }

    /// Abort the policy with `msg`.
    pub fn error(&self, msg: String) {
        self.sess.policy_error(msg);
    }

    /// Exit voluntarily with `code`.
    pub fn exit(&self, code: u64, msg: String) {
        self.sess.policy_exit(code, msg);
    }

    /// Default placement: `prev_cpu` if it is idle, else any idle CPU the
    /// task may use, else `prev_cpu`. The bool tells whether the CPU was
    /// claimed idle.
    pub fn select_cpu_dfl(
        &self,
        task: &TaskRef,
        prev_cpu: CpuId,
        _wake_flags: WakeFlags,
    ) -> (CpuId, bool) {
        if task.cpus_allowed.has(prev_cpu) && self.test_and_clear_cpu_idle(prev_cpu) {
            return (prev_cpu, true);
        }
        match self.pick_idle_cpu(&task.cpus_allowed) {
            Some(cpu) => (cpu, true),
            None => (prev_cpu, false),
        }
    }

    pub fn test_and_clear_cpu_idle(&self, cpu: CpuId) -> bool {
        self.sess.test_and_clear_cpu_idle(cpu)
    }

    /// Claim an idle CPU in `mask`.
    pub fn pick_idle_cpu(&self, mask: &Cpumask) -> Option<CpuId> {
        mask.iter().find(|&cpu| self.test_and_clear_cpu_idle(cpu))
    }

    /// An idle CPU in `mask` if there is one, otherwise any CPU in `mask`.
    pub fn pick_any_cpu(&self, mask: &Cpumask) -> Option<CpuId> {
        self.pick_idle_cpu(mask)
            .or_else(|| mask.iter().find(|cpu| cpu.0 < self.nr_cpu_ids()))
    }

    pub fn cpu_is_idle(&self, cpu: CpuId) -> bool {
        self.sess.cpu_is_idle(cpu)
    }

    /// Live task with `pid`, `None` once it exited.
    pub fn task_from_pid(&self, pid: Pid) -> Option<TaskRef> {
        self.sess.task(pid)
    }

    pub fn task_running(&self, task: &TaskRef) -> bool {
        self.sess.task_running(task)
    }

    pub fn task_cpu(&self, task: &TaskRef) -> CpuId {
        task.cpu()
    }

    /// Task currently executing on `cpu`.
    pub fn cpu_curr(&self, cpu: CpuId) -> Option<TaskRef> {
        self.sess.curr(cpu)
    }

    /// Arm the policy timer `delay` ns from now on this CPU, replacing any
    /// pending expiry.
    pub fn timer_start(&self, delay: u64) {
        self.sess.timer_start(self.cpu, delay);
    }
}
