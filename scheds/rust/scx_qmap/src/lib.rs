// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A simple five-level FIFO queue scheduler.
//!
//! There are five FIFOs implemented as bounded rings. A task gets queued
//! into one of the rings according to its weight, and when a CPU is ready
//! to dispatch it pops from the rings in a weighted round robin, drawing
//! 1, 2, 4, 8 and 16 tasks from queue0 through queue4 respectively. A
//! queue that runs empty forfeits the rest of its share.
//!
//! Tasks are dispatched to the GLOBAL DSQ and consumed from there by the
//! core. A ring that is full sends the task straight to GLOBAL.
//!
//! This scheduler demonstrates:
//!
//! - BPF-side queueing using PIDs.
//! - Sleepable per-task storage allocation using ops.prep_enable().
//! - Keeping tasks away from the policy with `disallow`.
//!
//! It also has knobs to inject errors and stalls, which are used to test
//! the error and watchdog paths of the core.

use log::debug;
use scx_core::scx_bpf_error;
use scx_core::BoundedQueue;
use scx_core::CpuId;
use scx_core::DeqFlags;
use scx_core::DsqId;
use scx_core::EnqFlags;
use scx_core::ExitInfo;
use scx_core::PerCpu;
use scx_core::PerCpuCounters;
use scx_core::Pid;
use scx_core::SchedOps;
use scx_core::ScxCtx;
use scx_core::TaskCtxStore;
use scx_core::TaskRef;
use scx_core::WakeFlags;
use scx_core::Weight;
use scx_core::SCX_SLICE_DFL;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

pub const NR_QUEUES: usize = 5;
pub const QMAP_RING_CAP_DFL: usize = 4096;
pub const QMAP_MAX_TASKS: usize = 65536;
pub const QMAP_TIMEOUT_MS: u32 = 5000;

const STAT_ENQ: usize = 0;
const STAT_DSP: usize = 1;
const STAT_DEQ: usize = 2;
const STAT_OVERFLOW: usize = 3;
const NR_STATS: usize = 4;

/// Ring a task of `weight` is queued on. The default weight of 100 maps to
/// the middle ring.
pub fn weight_to_idx(weight: Weight) -> usize {
    if weight <= 25 {
        0
    } else if weight <= 50 {
        1
    } else if weight < 200 {
        2
    } else if weight < 400 {
        3
    } else {
        4
    }
}

#[derive(Debug, Clone)]
pub struct QmapConfig {
    pub slice_ns: u64,
    /// Trigger an error after this many enqueues. 0 disables.
    pub error_after: u64,
    /// Drop every Nth enqueue of a user task on the floor. 0 disables.
    pub stall_user_nth: u64,
    /// Same for kernel tasks.
    pub stall_kernel_nth: u64,
    pub disallow_tgid: Option<Pid>,
    pub ring_capacity: usize,
}

impl Default for QmapConfig {
    fn default() -> Self {
        Self {
            slice_ns: SCX_SLICE_DFL,
            error_after: 0,
            stall_user_nth: 0,
            stall_kernel_nth: 0,
            disallow_tgid: None,
            ring_capacity: QMAP_RING_CAP_DFL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QmapStats {
    pub enq: u64,
    pub dsp: u64,
    pub deq: u64,
    pub overflow: u64,
}

impl QmapStats {
    /// Tasks queued on the rings and not yet dispatched.
    pub fn delta(&self) -> i64 {
        self.enq as i64 - self.dsp as i64
    }
}

/// Per-CPU dispatch cursor implementing the 1:2:4:8:16 draw.
#[derive(Debug, Default)]
pub struct DspCursor {
    idx: usize,
    cnt: u64,
}

impl DspCursor {
    /// Ring to draw from. Moves on to the next ring once the current one
    /// used up its share.
    pub fn current(&mut self) -> usize {
        if self.cnt == 0 {
            self.idx = (self.idx + 1) % NR_QUEUES;
            self.cnt = 1 << self.idx;
        }
        self.idx
    }

    /// One task was drawn from the current ring.
    pub fn consumed(&mut self) {
        self.cnt = self.cnt.saturating_sub(1);
    }

    /// The current ring ran dry, give up the rest of its share.
    pub fn skip(&mut self) {
        self.cnt = 0;
    }
}

#[derive(Debug, Default)]
struct TaskCtx {
    force_local: AtomicBool,
}

pub struct QmapOps {
    cfg: QmapConfig,
    queues: Vec<BoundedQueue<Pid>>,
    cursors: PerCpu<Mutex<DspCursor>>,
    task_ctxs: TaskCtxStore<TaskCtx>,
    stats: PerCpuCounters,
    nr_enq_seen: AtomicU64,
    user_cnt: AtomicU64,
    kernel_cnt: AtomicU64,
    exit: Mutex<Option<ExitInfo>>,
}

impl QmapOps {
    pub fn new(nr_cpus: u32, cfg: QmapConfig) -> Self {
        let queues = (0..NR_QUEUES)
            .map(|_| BoundedQueue::new(cfg.ring_capacity))
            .collect();
        Self {
            cfg,
            queues,
            cursors: PerCpu::new(nr_cpus as usize, |_| Mutex::new(DspCursor::default())),
            task_ctxs: TaskCtxStore::new(QMAP_MAX_TASKS),
            stats: PerCpuCounters::new(nr_cpus as usize, NR_STATS),
            nr_enq_seen: AtomicU64::new(0),
            user_cnt: AtomicU64::new(0),
            kernel_cnt: AtomicU64::new(0),
            exit: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> QmapStats {
        let raw = self.stats.read();
        QmapStats {
            enq: raw[STAT_ENQ],
            dsp: raw[STAT_DSP],
            deq: raw[STAT_DEQ],
            overflow: raw[STAT_OVERFLOW],
        }
    }

    /// Number of pids sitting on each ring.
    pub fn queue_lens(&self) -> [usize; NR_QUEUES] {
        let mut lens = [0; NR_QUEUES];
        for (len, queue) in lens.iter_mut().zip(self.queues.iter()) {
            *len = queue.len();
        }
        lens
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.lock().ok().and_then(|exit| exit.clone())
    }

    fn should_stall(&self, task: &TaskRef) -> bool {
        let (nth, cnt) = if task.kworker {
            (self.cfg.stall_kernel_nth, &self.kernel_cnt)
        } else {
            (self.cfg.stall_user_nth, &self.user_cnt)
        };
        nth != 0 && (cnt.fetch_add(1, Ordering::Relaxed) + 1) % nth == 0
    }
}

impl SchedOps for QmapOps {
    fn name(&self) -> &str {
        "qmap"
    }

    fn timeout_ms(&self) -> u32 {
        QMAP_TIMEOUT_MS
    }

    fn exit(&self, info: &ExitInfo) {
        if let Ok(mut exit) = self.exit.lock() {
            *exit = Some(info.clone());
        }
    }

    fn prep_enable(&self, _ctx: &ScxCtx, task: &TaskRef) -> anyhow::Result<()> {
        if self.cfg.disallow_tgid == Some(task.tgid) {
            task.set_disallow(true);
        }
        self.task_ctxs.on_task_enable(task.pid, TaskCtx::default)?;
        Ok(())
    }

    fn disable(&self, _ctx: &ScxCtx, task: &TaskRef) {
        self.task_ctxs.on_task_disable(task.pid);
    }

    fn select_cpu(
        &self,
        ctx: &ScxCtx,
        task: &TaskRef,
        prev_cpu: CpuId,
        _wake_flags: WakeFlags,
    ) -> CpuId {
        let tctx = match self.task_ctxs.get(task.pid) {
            Some(tctx) => tctx,
            None => {
                scx_bpf_error!(ctx, "task_ctx lookup failed for {}", task.pid);
                return prev_cpu;
            }
        };

        if task.nr_cpus_allowed() == 1 || ctx.test_and_clear_cpu_idle(prev_cpu) {
            tctx.force_local.store(true, Ordering::Relaxed);
            return prev_cpu;
        }

        ctx.pick_idle_cpu(&task.cpus_allowed).unwrap_or(prev_cpu)
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        let seen = self.nr_enq_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if self.cfg.error_after != 0 && seen == self.cfg.error_after {
            scx_bpf_error!(ctx, "test triggering error");
        }

        if self.should_stall(task) {
            debug!("qmap: stalling {}[{}]", task.comm, task.pid);
            return;
        }

        let tctx = match self.task_ctxs.get(task.pid) {
            Some(tctx) => tctx,
            None => {
                scx_bpf_error!(ctx, "task_ctx lookup failed for {}", task.pid);
                return;
            }
        };

        // Waking up to an idle prev CPU or pinned: skip the rings.
        if tctx.force_local.swap(false, Ordering::Relaxed) {
            ctx.dispatch(task, DsqId::LOCAL, self.cfg.slice_ns, enq_flags);
            return;
        }

        let idx = weight_to_idx(task.weight);
        if self.queues[idx].push(task.pid).is_err() {
            self.stats.inc(ctx.cpu(), STAT_OVERFLOW);
            ctx.dispatch(task, DsqId::GLOBAL, self.cfg.slice_ns, enq_flags);
            return;
        }

        self.stats.inc(ctx.cpu(), STAT_ENQ);
    }

    // The pid stays on its ring. The core drops the stale entry when it is
    // dispatched.
    fn dequeue(&self, ctx: &ScxCtx, _task: &TaskRef, _deq_flags: DeqFlags) {
        self.stats.inc(ctx.cpu(), STAT_DEQ);
    }

    fn dispatch(&self, ctx: &ScxCtx, cpu: CpuId, _prev: Option<&TaskRef>) {
        let mut cursor = self
            .cursors
            .get(cpu)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for _ in 0..NR_QUEUES {
            let idx = cursor.current();
            while let Some(pid) = self.queues[idx].pop() {
                // Exited while queued.
                let Some(task) = ctx.task_from_pid(pid) else {
                    continue;
                };
                self.stats.inc(cpu, STAT_DSP);
                ctx.dispatch(&task, DsqId::GLOBAL, self.cfg.slice_ns, EnqFlags::NONE);
                cursor.consumed();
                return;
            }
            cursor.skip();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_to_idx() {
        let idxs: Vec<usize> = [1, 10, 25, 26, 40, 50, 51, 100, 199, 200, 300, 399, 400, 500, 10000]
            .into_iter()
            .map(weight_to_idx)
            .collect();
        assert_eq!(idxs, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);
    }

    #[test]
    fn test_cursor_draws_1_2_4_8_16() {
        let mut cursor = DspCursor::default();
        let mut drawn = [0; NR_QUEUES];
        for _ in 0..31 {
            let idx = cursor.current();
            drawn[idx] += 1;
            cursor.consumed();
        }
        assert_eq!(drawn, [1, 2, 4, 8, 16]);

        // The next round starts over at queue1.
        assert_eq!(cursor.current(), 1);
    }

    #[test]
    fn test_cursor_skips_empty_queue() {
        let mut cursor = DspCursor::default();
        assert_eq!(cursor.current(), 1);
        cursor.consumed();
        cursor.skip();
        assert_eq!(cursor.current(), 2);
        cursor.consumed();
        assert_eq!(cursor.current(), 2);
    }

    #[test]
    fn test_delta() {
        let stats = QmapStats {
            enq: 10,
            dsp: 7,
            deq: 1,
            overflow: 0,
        };
        assert_eq!(stats.delta(), 3);
    }
}
