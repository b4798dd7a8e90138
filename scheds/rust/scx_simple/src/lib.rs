// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A simple scheduler.
//!
//! By default it runs as a global weighted vtime scheduler and can be
//! switched to FIFO scheduling. Both modes queue every task on one shared
//! DSQ. A waking task that finds an idle CPU is dispatched straight to that
//! CPU's local DSQ.
//!
//! While very simple, this scheduler should work reasonably well on CPUs
//! with a uniform L3 cache topology. The lack of any load balancing makes
//! it a poor fit for multi-socket hosts or hosts with partitioned L3 caches.

use scx_core::vtime_before;
use scx_core::CpuId;
use scx_core::DsqId;
use scx_core::EnqFlags;
use scx_core::ExitInfo;
use scx_core::PerCpuCounters;
use scx_core::SchedOps;
use scx_core::ScxCtx;
use scx_core::TaskRef;
use scx_core::WakeFlags;
use scx_core::SCX_SLICE_DFL;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

pub const SHARED_DSQ: DsqId = DsqId(0);

const STAT_LOCAL: usize = 0;
const STAT_GLOBAL: usize = 1;
const NR_STATS: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleStats {
    pub local: u64,
    pub global: u64,
}

pub struct SimpleOps {
    fifo_sched: bool,
    vtime_now: AtomicU64,
    stats: PerCpuCounters,
    exit: Mutex<Option<ExitInfo>>,
}

impl SimpleOps {
    pub fn new(nr_cpus: u32, fifo_sched: bool) -> Self {
        Self {
            fifo_sched,
            vtime_now: AtomicU64::new(0),
            stats: PerCpuCounters::new(nr_cpus as usize, NR_STATS),
            exit: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> SimpleStats {
        let raw = self.stats.read();
        SimpleStats {
            local: raw[STAT_LOCAL],
            global: raw[STAT_GLOBAL],
        }
    }

    pub fn vtime_now(&self) -> u64 {
        self.vtime_now.load(Ordering::Relaxed)
    }

    /// The exit record handed to ops.exit(), if it ran.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.lock().ok().and_then(|exit| exit.clone())
    }
}

impl SchedOps for SimpleOps {
    fn name(&self) -> &str {
        "simple"
    }

    fn init(&self, ctx: &ScxCtx) -> anyhow::Result<()> {
        ctx.create_dsq(SHARED_DSQ, None)
    }

    fn exit(&self, info: &ExitInfo) {
        if let Ok(mut exit) = self.exit.lock() {
            *exit = Some(info.clone());
        }
    }

    fn select_cpu(
        &self,
        ctx: &ScxCtx,
        task: &TaskRef,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> CpuId {
        let (cpu, is_idle) = ctx.select_cpu_dfl(task, prev_cpu, wake_flags);
        if is_idle {
            self.stats.inc(ctx.cpu(), STAT_LOCAL);
            ctx.dispatch(task, DsqId::LOCAL, SCX_SLICE_DFL, EnqFlags::NONE);
        }
        cpu
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        self.stats.inc(ctx.cpu(), STAT_GLOBAL);

        if self.fifo_sched {
            ctx.dispatch(task, SHARED_DSQ, SCX_SLICE_DFL, enq_flags);
            return;
        }

        // Limit the budget an idling task can accumulate to one slice.
        let mut vtime = task.dsq_vtime();
        let floor = self.vtime_now().wrapping_sub(SCX_SLICE_DFL);
        if vtime_before(vtime, floor) {
            vtime = floor;
        }
        ctx.dispatch_vtime(task, SHARED_DSQ, SCX_SLICE_DFL, vtime, enq_flags);
    }

    fn dispatch(&self, ctx: &ScxCtx, _cpu: CpuId, _prev: Option<&TaskRef>) {
        ctx.consume(SHARED_DSQ);
    }

    fn running(&self, _ctx: &ScxCtx, task: &TaskRef) {
        if self.fifo_sched {
            return;
        }

        // Global vtime always progresses forward as tasks start executing.
        let vtime = task.dsq_vtime();
        let _ = self
            .vtime_now
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |now| {
                vtime_before(now, vtime).then_some(vtime)
            });
    }

    fn stopping(&self, _ctx: &ScxCtx, task: &TaskRef, _runnable: bool) {
        if self.fifo_sched {
            return;
        }

        // Scale the execution time by the inverse of the weight and charge.
        let used = SCX_SLICE_DFL.saturating_sub(task.slice());
        task.add_dsq_vtime(used * 100 / task.weight.max(1) as u64);
    }

    fn enable(&self, _ctx: &ScxCtx, task: &TaskRef) {
        task.set_dsq_vtime(self.vtime_now());
    }
}
