// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A central FIFO sched_ext scheduler.
//!
//! All scheduling decisions are made on the central CPU. Every other CPU
//! runs whatever the central CPU put on its local DSQ. When a CPU runs out
//! of work it raises its "gimme" flag and kicks the central CPU, which then
//! walks the CPUs round-robin and hands each one that asked the next task
//! from the central queue.
//!
//! Tasks run with an infinite slice. Slices are enforced from a periodic
//! timer on the central CPU, which preempts CPUs whose current task ran
//! past the slice while work is pending.
//!
//! Per-CPU kthreads bypass the central queue and are dispatched on their
//! own CPU with a preemption.

use anyhow::bail;
use anyhow::Result;
use scx_core::vtime_before;
use scx_core::BoundedQueue;
use scx_core::CpuId;
use scx_core::DsqId;
use scx_core::EnqFlags;
use scx_core::ExitInfo;
use scx_core::KickFlags;
use scx_core::PerCpu;
use scx_core::PerCpuCounters;
use scx_core::Pid;
use scx_core::SchedOps;
use scx_core::ScxCtx;
use scx_core::TaskRef;
use scx_core::WakeFlags;
use scx_core::SCX_SLICE_DFL;
use scx_core::SCX_SLICE_INF;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

pub const FALLBACK_DSQ: DsqId = DsqId(0);
pub const CENTRAL_TIMER_INTERVAL_NS: u64 = 1_000_000;
pub const CENTRAL_QUEUE_CAP_DFL: usize = 4096;

const STAT_TOTAL: usize = 0;
const STAT_LOCAL: usize = 1;
const STAT_QUEUED: usize = 2;
const STAT_LOST: usize = 3;
const STAT_OVERFLOW: usize = 4;
const STAT_STARTED: usize = 5;
const STAT_KICKED: usize = 6;
const NR_STATS: usize = 7;

#[derive(Debug, Clone)]
pub struct CentralConfig {
    pub central_cpu: CpuId,
    pub slice_ns: u64,
    pub queue_capacity: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            central_cpu: CpuId(0),
            slice_ns: SCX_SLICE_DFL,
            queue_capacity: CENTRAL_QUEUE_CAP_DFL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CentralStats {
    pub total: u64,
    pub local: u64,
    pub queued: u64,
    pub lost: u64,
    pub overflow: u64,
    pub started: u64,
    pub kicked: u64,
}

pub struct CentralOps {
    cfg: CentralConfig,
    nr_cpus: u32,
    central_q: BoundedQueue<Pid>,
    gimme_task: PerCpu<AtomicBool>,
    started_at: PerCpu<AtomicU64>,
    dispatch_cursor: AtomicU32,
    stats: PerCpuCounters,
    exit: Mutex<Option<ExitInfo>>,
}

impl CentralOps {
    pub fn new(nr_cpus: u32, cfg: CentralConfig) -> Result<Self> {
        if cfg.central_cpu.0 >= nr_cpus {
            bail!(
                "invalid central CPU id value, {} given ({} max)",
                cfg.central_cpu,
                nr_cpus.saturating_sub(1)
            );
        }
        if cfg.slice_ns == 0 {
            bail!("slice must be positive");
        }
        Ok(Self {
            nr_cpus,
            central_q: BoundedQueue::new(cfg.queue_capacity),
            gimme_task: PerCpu::new(nr_cpus as usize, |_| AtomicBool::new(false)),
            started_at: PerCpu::new(nr_cpus as usize, |_| AtomicU64::new(0)),
            dispatch_cursor: AtomicU32::new(0),
            stats: PerCpuCounters::new(nr_cpus as usize, NR_STATS),
            exit: Mutex::new(None),
            cfg,
        })
    }

    pub fn central_cpu(&self) -> CpuId {
        self.cfg.central_cpu
    }

    pub fn stats(&self) -> CentralStats {
        let raw = self.stats.read();
        CentralStats {
            total: raw[STAT_TOTAL],
            local: raw[STAT_LOCAL],
            queued: raw[STAT_QUEUED],
            lost: raw[STAT_LOST],
            overflow: raw[STAT_OVERFLOW],
            started: raw[STAT_STARTED],
            kicked: raw[STAT_KICKED],
        }
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.lock().ok().and_then(|exit| exit.clone())
    }

    /// Move the first queued task that may run on `cpu` to its local DSQ.
    /// Tasks that can't run there are bounced to the fallback DSQ.
    fn dispatch_to_cpu(&self, ctx: &ScxCtx, cpu: CpuId) -> bool {
        while let Some(pid) = self.central_q.pop() {
            let Some(task) = ctx.task_from_pid(pid) else {
                self.stats.inc(ctx.cpu(), STAT_LOST);
                continue;
            };

            if !task.cpus_allowed.has(cpu) {
                ctx.dispatch(&task, FALLBACK_DSQ, SCX_SLICE_INF, EnqFlags::NONE);
                continue;
            }

            ctx.dispatch(&task, DsqId::local_on(cpu), SCX_SLICE_INF, EnqFlags::NONE);
            self.stats.inc(ctx.cpu(), STAT_STARTED);
            if cpu != self.cfg.central_cpu {
                ctx.kick_cpu(cpu, KickFlags::IDLE);
            }
            return true;
        }
        false
    }
}

impl SchedOps for CentralOps {
    fn name(&self) -> &str {
        "central"
    }

    fn init(&self, ctx: &ScxCtx) -> Result<()> {
        ctx.create_dsq(FALLBACK_DSQ, None)?;
        ctx.timer_start(CENTRAL_TIMER_INTERVAL_NS);
        Ok(())
    }

    fn exit(&self, info: &ExitInfo) {
        if let Ok(mut exit) = self.exit.lock() {
            *exit = Some(info.clone());
        }
    }

    // Steer wakeups to the central CPU so that its dispatch sees them.
    fn select_cpu(
        &self,
        _ctx: &ScxCtx,
        _task: &TaskRef,
        _prev_cpu: CpuId,
        _wake_flags: WakeFlags,
    ) -> CpuId {
        self.cfg.central_cpu
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        self.stats.inc(ctx.cpu(), STAT_TOTAL);

        // Per-CPU kthreads go to the head of their CPU and preempt it.
        if task.kworker && task.nr_cpus_allowed() == 1 {
            self.stats.inc(ctx.cpu(), STAT_LOCAL);
            ctx.dispatch(
                task,
                DsqId::LOCAL,
                SCX_SLICE_INF,
                enq_flags | EnqFlags::PREEMPT,
            );
            return;
        }

        if self.central_q.push(task.pid).is_err() {
            self.stats.inc(ctx.cpu(), STAT_OVERFLOW);
            ctx.dispatch(task, FALLBACK_DSQ, SCX_SLICE_INF, enq_flags);
            return;
        }

        self.stats.inc(ctx.cpu(), STAT_QUEUED);
        if !ctx.task_running(task) {
            ctx.kick_cpu(self.cfg.central_cpu, KickFlags::PREEMPT);
        }
    }

    fn dispatch(&self, ctx: &ScxCtx, cpu: CpuId, _prev: Option<&TaskRef>) {
        if cpu != self.cfg.central_cpu {
            // Queued tasks still need a CPU while FALLBACK has traffic.
            if ctx.consume(FALLBACK_DSQ) && self.central_q.is_empty() {
                return;
            }
            self.gimme_task.get(cpu).store(true, Ordering::Release);
            // The central CPU finds a task for us on its next dispatch.
            ctx.kick_cpu(self.cfg.central_cpu, KickFlags::PREEMPT);
            return;
        }

        for _ in 0..self.nr_cpus {
            let curr = CpuId(self.dispatch_cursor.fetch_add(1, Ordering::Relaxed) % self.nr_cpus);
            if !self.gimme_task.get(curr).load(Ordering::Acquire) {
                continue;
            }
            if !self.dispatch_to_cpu(ctx, curr) {
                // Central queue is empty.
                break;
            }
            self.gimme_task.get(curr).store(false, Ordering::Release);
            if ctx.dispatch_nr_slots() == 0 {
                break;
            }
        }

        if !self.dispatch_to_cpu(ctx, cpu) {
            ctx.consume(FALLBACK_DSQ);
        }
    }

    fn running(&self, ctx: &ScxCtx, _task: &TaskRef) {
        // 0 means idle.
        self.started_at
            .get(ctx.cpu())
            .store(ctx.now().max(1), Ordering::Relaxed);
    }

    fn stopping(&self, ctx: &ScxCtx, _task: &TaskRef, _runnable: bool) {
        self.started_at.get(ctx.cpu()).store(0, Ordering::Relaxed);
    }

    fn timer(&self, ctx: &ScxCtx) {
        let now = ctx.now();
        let mut nr_to_kick = self.central_q.len();

        for i in 0..self.nr_cpus {
            let cpu = CpuId(i);
            if cpu == self.cfg.central_cpu {
                continue;
            }

            // Kick only if the current task exhausted its slice...
            let started_at = self.started_at.get(cpu).load(Ordering::Relaxed);
            if started_at != 0 && vtime_before(now, started_at.wrapping_add(self.cfg.slice_ns)) {
                continue;
            }

            // ...and something is waiting.
            let pending = ctx.dsq_nr_queued(FALLBACK_DSQ) > 0
                || ctx.dsq_nr_queued(DsqId::local_on(cpu)) > 0;
            if !pending {
                if nr_to_kick == 0 {
                    continue;
                }
                nr_to_kick -= 1;
            }

            self.stats.inc(ctx.cpu(), STAT_KICKED);
            ctx.kick_cpu(cpu, KickFlags::PREEMPT);
        }

        ctx.timer_start(CENTRAL_TIMER_INTERVAL_NS);
    }
}
