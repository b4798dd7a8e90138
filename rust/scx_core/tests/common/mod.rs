// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
#![allow(dead_code)]

use scx_core::*;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

pub const MS: u64 = 1_000_000;

/// Log to the test harness. `try` semantics: only the first call installs.
pub fn init_logging() {
    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Warn, simplelog::Config::default());
}

/// A loaded and attached policy with an engine driving it.
pub struct Harness {
    pub engine: Engine,
    pub link: Option<ScxLink>,
    pub handle: SchedHandle,
}

impl Harness {
    pub fn new(ops: Arc<dyn SchedOps>, cfg: ScxConfig) -> Self {
        init_logging();
        let clock = Arc::new(SimClock::new(0));
        let handle = SchedHandle::open_and_load(ops, &cfg, clock.clone()).unwrap();
        let link = handle.attach().unwrap();
        let engine = Engine::new(handle.session().clone(), clock, cfg.tick_ns).unwrap();
        Self {
            engine,
            link: Some(link),
            handle,
        }
    }

    pub fn with_cpus(ops: Arc<dyn SchedOps>, nr_cpus: u32) -> Self {
        Self::new(
            ops,
            ScxConfig {
                nr_cpus,
                tick_ns: MS,
                ..Default::default()
            },
        )
    }

    pub fn sess(&self) -> &Arc<ScxSession> {
        self.handle.session()
    }

    pub fn add(&mut self, def: TaskDef) -> TaskRef {
        self.engine.add_task(&def).unwrap()
    }
}

/// Load a policy without an engine. Tasks are driven by hand.
pub fn load_bare(ops: Arc<dyn SchedOps>, nr_cpus: u32) -> (Arc<SimClock>, SchedHandle, ScxLink) {
    init_logging();
    let clock = Arc::new(SimClock::new(0));
    let cfg = ScxConfig {
        nr_cpus,
        tick_ns: MS,
        ..Default::default()
    };
    let handle = SchedHandle::open_and_load(ops, &cfg, clock.clone()).unwrap();
    let link = handle.attach().unwrap();
    (clock, handle, link)
}

pub fn attrs(pid: i32, comm: &str) -> TaskAttrs {
    TaskAttrs::new(Pid(pid), comm)
}

/// Keeps the task where it was, never dispatches from select_cpu.
pub fn keep_prev(_ctx: &ScxCtx, _task: &TaskRef, prev_cpu: CpuId) -> CpuId {
    prev_cpu
}

/// Everything goes to GLOBAL.
#[derive(Default)]
pub struct GlobalFifo {
    pub nr_enqueued: AtomicU64,
    pub nr_exits: AtomicU32,
    pub nr_disabled: AtomicU32,
}

impl SchedOps for GlobalFifo {
    fn name(&self) -> &str {
        "global_fifo"
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        self.nr_enqueued.fetch_add(1, Ordering::Relaxed);
        ctx.dispatch(task, DsqId::GLOBAL, SCX_SLICE_DFL, enq_flags);
    }

    fn disable(&self, _ctx: &ScxCtx, _task: &TaskRef) {
        self.nr_disabled.fetch_add(1, Ordering::Relaxed);
    }

    fn exit(&self, _info: &ExitInfo) {
        self.nr_exits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Accepts tasks and never dispatches them.
pub struct NoDispatch {
    pub timeout_ms: u32,
    pub nr_exits: AtomicU32,
}

impl NoDispatch {
    pub fn new(timeout_ms: u32) -> Self {
        Self {
            timeout_ms,
            nr_exits: AtomicU32::new(0),
        }
    }
}

impl SchedOps for NoDispatch {
    fn name(&self) -> &str {
        "no_dispatch"
    }

    fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    fn select_cpu(&self, ctx: &ScxCtx, task: &TaskRef, prev_cpu: CpuId, _: WakeFlags) -> CpuId {
        keep_prev(ctx, task, prev_cpu)
    }

    fn enqueue(&self, _ctx: &ScxCtx, _task: &TaskRef, _enq_flags: EnqFlags) {}

    fn exit(&self, _info: &ExitInfo) {
        self.nr_exits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sends every task to one CPU's local DSQ.
pub struct PinnedLocal {
    pub cpu: CpuId,
}

impl SchedOps for PinnedLocal {
    fn name(&self) -> &str {
        "pinned_local"
    }

    fn select_cpu(&self, ctx: &ScxCtx, task: &TaskRef, prev_cpu: CpuId, _: WakeFlags) -> CpuId {
        keep_prev(ctx, task, prev_cpu)
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        ctx.dispatch(task, DsqId::local_on(self.cpu), 0, enq_flags);
    }
}

pub const BOUNDED_DSQ: DsqId = DsqId(100);

/// Queues on a bounded custom DSQ that only ops.dispatch() drains.
pub struct Bounded {
    pub capacity: usize,
    pub drain: bool,
}

impl SchedOps for Bounded {
    fn name(&self) -> &str {
        "bounded"
    }

    fn init(&self, ctx: &ScxCtx) -> anyhow::Result<()> {
        ctx.create_dsq(BOUNDED_DSQ, Some(self.capacity))
    }

    fn select_cpu(&self, ctx: &ScxCtx, task: &TaskRef, prev_cpu: CpuId, _: WakeFlags) -> CpuId {
        keep_prev(ctx, task, prev_cpu)
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        ctx.dispatch(task, BOUNDED_DSQ, SCX_SLICE_DFL, enq_flags);
    }

    fn dispatch(&self, ctx: &ScxCtx, _cpu: CpuId, _prev: Option<&TaskRef>) {
        if self.drain {
            ctx.consume(BOUNDED_DSQ);
        }
    }
}

/// Keeps its own queue of task references and never removes entries on
/// dequeue.
#[derive(Default)]
pub struct StaleQueue {
    pub queue: Mutex<VecDeque<TaskRef>>,
}

impl SchedOps for StaleQueue {
    fn name(&self) -> &str {
        "stale_queue"
    }

    fn select_cpu(&self, ctx: &ScxCtx, task: &TaskRef, prev_cpu: CpuId, _: WakeFlags) -> CpuId {
        keep_prev(ctx, task, prev_cpu)
    }

    fn enqueue(&self, _ctx: &ScxCtx, task: &TaskRef, _enq_flags: EnqFlags) {
        self.queue.lock().unwrap().push_back(task.clone());
    }

    fn dispatch(&self, ctx: &ScxCtx, _cpu: CpuId, _prev: Option<&TaskRef>) {
        let next = self.queue.lock().unwrap().pop_front();
        if let Some(task) = next {
            ctx.dispatch(&task, DsqId::LOCAL, SCX_SLICE_DFL, EnqFlags::NONE);
        }
    }
}

/// Dispatches each task twice from ops.enqueue().
pub struct DoubleDispatch;

impl SchedOps for DoubleDispatch {
    fn name(&self) -> &str {
        "double_dispatch"
    }

    fn select_cpu(&self, ctx: &ScxCtx, task: &TaskRef, prev_cpu: CpuId, _: WakeFlags) -> CpuId {
        keep_prev(ctx, task, prev_cpu)
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        ctx.dispatch(task, DsqId::GLOBAL, SCX_SLICE_DFL, enq_flags);
        ctx.dispatch(task, DsqId::GLOBAL, SCX_SLICE_DFL, enq_flags);
    }
}

/// Raises an error on the `nth` enqueue.
pub struct ErrorAfter {
    pub nth: u64,
    pub seen: AtomicU64,
}

impl SchedOps for ErrorAfter {
    fn name(&self) -> &str {
        "error_after"
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        if self.seen.fetch_add(1, Ordering::Relaxed) + 1 == self.nth {
            scx_core::scx_bpf_error!(ctx, "enqueue {} reached", self.nth);
        }
        ctx.dispatch(task, DsqId::GLOBAL, SCX_SLICE_DFL, enq_flags);
    }
}
