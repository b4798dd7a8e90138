// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A multi-domain sched_ext scheduler.
//!
//! CPUs are grouped into scheduling domains, usually one per LLC, and
//! domains into NUMA nodes. Every domain has its own DSQ which is scheduled
//! in weighted vtime or, optionally, FIFO order. A task belongs to exactly
//! one domain at a time.
//!
//! Waking tasks are placed in the following order of preference: the
//! waker's CPU on a sync wakeup, the previous CPU if it is idle, an idle CPU
//! in the task's domain, then an idle under-utilized CPU in another domain
//! of the same node or, if allowed, of another node. A task that finds no
//! idle CPU is queued on its domain's DSQ. Idle CPUs whose own domain is
//! empty steal from domains that have enough queued tasks.
//!
//! The policy tracks the load of every domain and the duty cycle of every
//! task as running averages. User space reads those through the [`tuner`]
//! and [`load_balance`] modules, which adjust the greedy cpumasks and the
//! slice length and ask the policy to migrate tasks between domains.

pub mod domain;
pub use domain::DomainGroup;

pub mod load_balance;
pub mod stats;

pub mod tuner;
pub use tuner::Tuner;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use log::warn;
use scx_core::vtime_before;
use scx_core::CpuId;
use scx_core::Cpumask;
use scx_core::DeqFlags;
use scx_core::DsqId;
use scx_core::EnqFlags;
use scx_core::ExitInfo;
use scx_core::KickFlags;
use scx_core::PerCpuCounters;
use scx_core::Pid;
use scx_core::Ravg;
use scx_core::SchedOps;
use scx_core::ScxCtx;
use scx_core::TaskCtxStore;
use scx_core::TaskRef;
use scx_core::TimeNs;
use scx_core::WakeFlags;
use scx_core::SCX_SLICE_DFL;
use scx_core::USAGE_HALF_LIFE;
use static_assertions::const_assert;

pub const MAX_DOMS: usize = 64;
pub const MAX_NUMA_NODES: usize = 64;
pub const MAX_DOM_ACTIVE_PIDS: usize = 1024;
pub const MAX_TASKS: usize = 65536;
pub const LB_MAX_WEIGHT: u32 = 10000;

// Task domain masks are u64 bitmaps.
const_assert!(MAX_DOMS <= u64::BITS as usize);
const_assert!(MAX_DOM_ACTIVE_PIDS.is_power_of_two());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RustyStat {
    WakeSync,
    SyncPrevIdle,
    PrevIdle,
    GreedyIdle,
    Pinned,
    DirectDispatch,
    DirectGreedy,
    DirectGreedyFar,
    DsqDispatch,
    GreedyLocal,
    GreedyXnuma,
    KickGreedy,
    Repatriate,
    LoadBalance,
    TaskGetErr,
}

pub const RUSTY_NR_STATS: usize = 15;

impl RustyStat {
    pub const ALL: [RustyStat; RUSTY_NR_STATS] = [
        RustyStat::WakeSync,
        RustyStat::SyncPrevIdle,
        RustyStat::PrevIdle,
        RustyStat::GreedyIdle,
        RustyStat::Pinned,
        RustyStat::DirectDispatch,
        RustyStat::DirectGreedy,
        RustyStat::DirectGreedyFar,
        RustyStat::DsqDispatch,
        RustyStat::GreedyLocal,
        RustyStat::GreedyXnuma,
        RustyStat::KickGreedy,
        RustyStat::Repatriate,
        RustyStat::LoadBalance,
        RustyStat::TaskGetErr,
    ];

    pub fn idx(self) -> usize {
        self as usize
    }
}

/// Placement and dispatch counters, summed over CPUs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RustyStats(Vec<u64>);

impl RustyStats {
    pub fn get(&self, stat: RustyStat) -> u64 {
        self.0.get(stat.idx()).copied().unwrap_or(0)
    }

    /// All placement decisions made in select_cpu() and enqueue().
    pub fn total(&self) -> u64 {
        [
            RustyStat::WakeSync,
            RustyStat::PrevIdle,
            RustyStat::GreedyIdle,
            RustyStat::Pinned,
            RustyStat::DirectDispatch,
            RustyStat::DirectGreedy,
            RustyStat::DirectGreedyFar,
            RustyStat::DsqDispatch,
            RustyStat::GreedyLocal,
            RustyStat::GreedyXnuma,
        ]
        .iter()
        .map(|s| self.get(*s))
        .sum()
    }
}

#[derive(Debug, Clone)]
pub struct RustyConfig {
    pub slice_ns: u64,
    pub load_half_life: TimeNs,
    pub kthreads_local: bool,
    pub fifo_sched: bool,
    pub greedy_threshold: u32,
    pub greedy_threshold_x_numa: u32,
    pub direct_greedy_numa: bool,
}

impl Default for RustyConfig {
    fn default() -> Self {
        Self {
            slice_ns: SCX_SLICE_DFL,
            load_half_life: USAGE_HALF_LIFE,
            kthreads_local: false,
            fifo_sched: false,
            greedy_threshold: 1,
            greedy_threshold_x_numa: 0,
            direct_greedy_numa: false,
        }
    }
}

/// Parameters written by the tuner. Every update bumps `gen`.
#[derive(Debug, Clone)]
pub struct TuneInput {
    pub gen: u64,
    pub slice_ns: u64,
    pub direct_greedy_cpumask: Cpumask,
    pub kick_greedy_cpumask: Cpumask,
}

/// Load figures of one task as seen by the load balancer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLoad {
    pub pid: Pid,
    pub dom_id: usize,
    pub weight: u32,
    pub dcycle: f64,
    pub dom_mask: u64,
    pub is_kworker: bool,
}

#[derive(Debug)]
struct DomLoad {
    load: Ravg,
    dcycle: Ravg,
}

/// Ring of pids that recently ran in a domain. A task is recorded at most
/// once per generation; reading the ring starts a new generation.
#[derive(Debug)]
struct DomActivePids {
    gen: u64,
    read_idx: u64,
    write_idx: u64,
    pids: Vec<Pid>,
}

#[derive(Debug)]
struct DomCtx {
    id: usize,
    node: usize,
    cpumask: Cpumask,
    node_cpumask: Cpumask,
    vtime_now: AtomicU64,
    load: Mutex<DomLoad>,
    active_pids: Mutex<DomActivePids>,
}

impl DomCtx {
    fn dsq(&self) -> DsqId {
        dom_dsq(self.id)
    }

    fn vtime_now(&self) -> u64 {
        self.vtime_now.load(Ordering::Relaxed)
    }

    fn add_load(&self, weight: u32, dcycle: f64, now: TimeNs) {
        let mut load = lock(&self.load);
        load.load.add(weight as f64 * dcycle, now);
        load.dcycle.add(dcycle, now);
    }
}

#[derive(Debug)]
struct TaskCtx {
    dom_id: usize,
    dom_mask: u64,
    // CPUs of the task's domain the task may run on.
    cpumask: Cpumask,
    all_cpus: bool,
    is_kworker: bool,
    weight: u32,
    runnable: bool,
    running_at: TimeNs,
    dcyc: Ravg,
    dom_active_pids_gen: u64,
}

pub fn dom_dsq(dom_id: usize) -> DsqId {
    DsqId(dom_id as u64)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct RustyOps {
    cfg: RustyConfig,
    dom_group: Arc<DomainGroup>,
    doms: Vec<DomCtx>,
    tune_input: RwLock<Arc<TuneInput>>,
    dom_rr_cur: AtomicUsize,
    task_ctxs: TaskCtxStore<Mutex<TaskCtx>>,
    lb_data: Mutex<HashMap<Pid, usize>>,
    stats: PerCpuCounters,
    exit: Mutex<Option<ExitInfo>>,
}

impl RustyOps {
    pub fn new(dom_group: Arc<DomainGroup>, cfg: RustyConfig) -> Result<Self> {
        if cfg.slice_ns == 0 {
            bail!("slice must be positive");
        }

        let nr_cpus = dom_group.nr_cpus();
        let doms = dom_group
            .doms()
            .values()
            .map(|dom| DomCtx {
                id: dom.id(),
                node: dom.node(),
                cpumask: dom.mask().clone(),
                node_cpumask: dom_group.numa_mask(dom.node()),
                vtime_now: AtomicU64::new(0),
                load: Mutex::new(DomLoad {
                    load: Ravg::new(cfg.load_half_life, 0),
                    dcycle: Ravg::new(cfg.load_half_life, 0),
                }),
                active_pids: Mutex::new(DomActivePids {
                    gen: 0,
                    read_idx: 0,
                    write_idx: 0,
                    pids: vec![Pid(0); MAX_DOM_ACTIVE_PIDS],
                }),
            })
            .collect();

        let tune_input = TuneInput {
            gen: 0,
            slice_ns: cfg.slice_ns,
            direct_greedy_cpumask: Cpumask::new(nr_cpus),
            kick_greedy_cpumask: Cpumask::new(nr_cpus),
        };

        Ok(Self {
            doms,
            tune_input: RwLock::new(Arc::new(tune_input)),
            dom_rr_cur: AtomicUsize::new(0),
            task_ctxs: TaskCtxStore::new(MAX_TASKS),
            lb_data: Mutex::new(Default::default()),
            stats: PerCpuCounters::new(nr_cpus, RUSTY_NR_STATS),
            exit: Mutex::new(None),
            dom_group,
            cfg,
        })
    }

    pub fn dom_group(&self) -> &Arc<DomainGroup> {
        &self.dom_group
    }

    pub fn load_half_life(&self) -> TimeNs {
        self.cfg.load_half_life
    }

    /// Cumulative counters.
    pub fn stats(&self) -> RustyStats {
        RustyStats(self.stats.read())
    }

    /// Counters accumulated since the previous call.
    pub fn read_stats(&self) -> RustyStats {
        RustyStats(self.stats.read_and_reset())
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        lock(&self.exit).clone()
    }

    pub fn tune_input(&self) -> Arc<TuneInput> {
        self.tune_input
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn slice_ns(&self) -> u64 {
        self.tune_input().slice_ns
    }

    pub fn set_tune_input(
        &self,
        direct_greedy_cpumask: Cpumask,
        kick_greedy_cpumask: Cpumask,
        slice_ns: u64,
    ) {
        let mut ti = self.tune_input.write().unwrap_or_else(|p| p.into_inner());
        let gen = ti.gen + 1;
        *ti = Arc::new(TuneInput {
            gen,
            slice_ns,
            direct_greedy_cpumask,
            kick_greedy_cpumask,
        });
    }

    /// Weighted load average of `dom_id`.
    pub fn dom_load(&self, dom_id: usize, now: TimeNs) -> f64 {
        self.doms
            .get(dom_id)
            .map_or(0.0, |dom| lock(&dom.load).load.read(now))
    }

    /// Sum of the duty cycles of the tasks in `dom_id`.
    pub fn dom_dcycle(&self, dom_id: usize, now: TimeNs) -> f64 {
        self.doms
            .get(dom_id)
            .map_or(0.0, |dom| lock(&dom.load).dcycle.read(now))
    }

    pub fn dom_vtime_now(&self, dom_id: usize) -> u64 {
        self.doms.get(dom_id).map_or(0, |dom| dom.vtime_now())
    }

    pub fn task_dom(&self, pid: Pid) -> Option<usize> {
        self.task_ctxs.get(pid).map(|taskc| lock(&taskc).dom_id)
    }

    /// Pids that ran in `dom_id` since the previous read, oldest first.
    pub fn read_active_pids(&self, dom_id: usize) -> Vec<Pid> {
        let Some(dom) = self.doms.get(dom_id) else {
            return vec![];
        };
        let mut ap = lock(&dom.active_pids);
        let (mut ridx, widx) = (ap.read_idx, ap.write_idx);
        if widx - ridx > MAX_DOM_ACTIVE_PIDS as u64 {
            ridx = widx - MAX_DOM_ACTIVE_PIDS as u64;
        }

        let pids = (ridx..widx)
            .map(|idx| ap.pids[idx as usize % MAX_DOM_ACTIVE_PIDS])
            .collect();
        ap.read_idx = widx;
        ap.gen += 1;
        pids
    }

    pub fn task_load(&self, pid: Pid, now: TimeNs) -> Option<TaskLoad> {
        let taskc = self.task_ctxs.get(pid)?;
        let tc = lock(&taskc);
        Some(TaskLoad {
            pid,
            dom_id: tc.dom_id,
            weight: tc.weight,
            dcycle: tc.dcyc.read(now),
            dom_mask: tc.dom_mask,
            is_kworker: tc.is_kworker,
        })
    }

    /// Ask the policy to move `pid` to `dom_id` on its next enqueue. Fails
    /// if a migration of `pid` is already pending.
    pub fn lb_migrate(&self, pid: Pid, dom_id: usize) -> Result<()> {
        if dom_id >= self.doms.len() {
            bail!("Invalid domain {} for pid {}", dom_id, pid);
        }
        let mut lb_data = lock(&self.lb_data);
        if lb_data.contains_key(&pid) {
            bail!("Migration of pid {} already pending", pid);
        }
        lb_data.insert(pid, dom_id);
        Ok(())
    }

    pub fn clear_lb_migrations(&self) {
        lock(&self.lb_data).clear();
    }

    pub fn nr_pending_migrations(&self) -> usize {
        lock(&self.lb_data).len()
    }

    fn stat_inc(&self, ctx: &ScxCtx, stat: RustyStat) {
        self.stats.inc(ctx.cpu(), stat.idx());
    }

    /// Round-robin over the domains the task can run in. Returns the picked
    /// domain and the mask of all eligible domains.
    fn task_pick_domain(&self, task: &TaskRef) -> Option<(usize, u64)> {
        let nr_doms = self.doms.len();
        let start = self.dom_rr_cur.fetch_add(1, Ordering::Relaxed);
        let mut first = None;
        let mut dom_mask = 0u64;

        for i in 0..nr_doms {
            let dom = &self.doms[(start + i) % nr_doms];
            if dom.cpumask.intersects(&task.cpus_allowed) {
                dom_mask |= 1u64 << dom.id;
                first.get_or_insert(dom.id);
            }
        }
        first.map(|dom_id| (dom_id, dom_mask))
    }

    fn task_set_domain(&self, ctx: &ScxCtx, task: &TaskRef, tc: &mut TaskCtx, new_dom: usize) -> bool {
        let Some(new) = self.doms.get(new_dom) else {
            return false;
        };
        let cpumask = task.cpus_allowed.and(&new.cpumask);
        if cpumask.is_empty() {
            return false;
        }

        let old = &self.doms[tc.dom_id];
        let now = ctx.now();
        if tc.runnable {
            old.add_load(tc.weight, -1.0, now);
            new.add_load(tc.weight, 1.0, now);
        }

        // Keep the task's lag relative to the domain clock.
        let vtime = task
            .dsq_vtime()
            .wrapping_sub(old.vtime_now())
            .wrapping_add(new.vtime_now());
        task.set_dsq_vtime(vtime);

        tc.dom_id = new_dom;
        tc.cpumask = cpumask;
        tc.dom_active_pids_gen = u64::MAX;
        true
    }

    fn queue_on_dom(&self, ctx: &ScxCtx, task: &TaskRef, dom: &DomCtx, enq_flags: EnqFlags) {
        let slice = self.slice_ns();
        self.stat_inc(ctx, RustyStat::DsqDispatch);

        if self.cfg.fifo_sched {
            ctx.dispatch(task, dom.dsq(), slice, enq_flags);
            return;
        }

        // Limit the budget an idling task can accumulate to one slice.
        let mut vtime = task.dsq_vtime();
        let floor = dom.vtime_now().wrapping_sub(slice);
        if vtime_before(vtime, floor) {
            vtime = floor;
        }
        ctx.dispatch_vtime(task, dom.dsq(), slice, vtime, enq_flags);
    }

    fn try_greedy(&self, ctx: &ScxCtx, dom_id: usize, same_node: bool, threshold: u32) -> bool {
        let nr_doms = self.doms.len();
        let node = self.doms[dom_id].node;

        for i in 1..nr_doms {
            let other = &self.doms[(dom_id + i) % nr_doms];
            if (other.node == node) != same_node {
                continue;
            }
            if ctx.dsq_nr_queued(other.dsq()) >= threshold as usize && ctx.consume(other.dsq()) {
                return true;
            }
        }
        false
    }
}

impl SchedOps for RustyOps {
    fn name(&self) -> &str {
        "rusty"
    }

    fn init(&self, ctx: &ScxCtx) -> Result<()> {
        for dom in self.doms.iter() {
            ctx.create_dsq(dom.dsq(), None)?;
        }
        Ok(())
    }

    fn exit(&self, info: &ExitInfo) {
        *lock(&self.exit) = Some(info.clone());
    }

    fn prep_enable(&self, ctx: &ScxCtx, task: &TaskRef) -> Result<()> {
        let (dom_id, dom_mask) = self
            .task_pick_domain(task)
            .ok_or_else(|| anyhow!("No domain for pid {}", task.pid))?;
        let dom = &self.doms[dom_id];

        let taskc = TaskCtx {
            dom_id,
            dom_mask,
            cpumask: task.cpus_allowed.and(&dom.cpumask),
            all_cpus: task.cpus_allowed.weight() >= self.dom_group.nr_cpus(),
            is_kworker: task.kworker,
            weight: task.weight,
            runnable: false,
            running_at: 0,
            dcyc: Ravg::new(self.cfg.load_half_life, ctx.now()),
            dom_active_pids_gen: u64::MAX,
        };
        self.task_ctxs.on_task_enable(task.pid, || Mutex::new(taskc))?;
        Ok(())
    }

    fn enable(&self, _ctx: &ScxCtx, task: &TaskRef) {
        if let Some(dom_id) = self.task_dom(task.pid) {
            task.set_dsq_vtime(self.doms[dom_id].vtime_now());
        }
    }

    fn disable(&self, ctx: &ScxCtx, task: &TaskRef) {
        if let Some(taskc) = self.task_ctxs.on_task_disable(task.pid) {
            let tc = lock(&taskc);
            if tc.runnable {
                self.doms[tc.dom_id].add_load(tc.weight, -1.0, ctx.now());
            }
        }
        lock(&self.lb_data).remove(&task.pid);
    }

    fn select_cpu(
        &self,
        ctx: &ScxCtx,
        task: &TaskRef,
        prev_cpu: CpuId,
        wake_flags: WakeFlags,
    ) -> CpuId {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            self.stat_inc(ctx, RustyStat::TaskGetErr);
            return prev_cpu;
        };
        let (dom_id, p_cpumask, all_cpus) = {
            let tc = lock(&taskc);
            (tc.dom_id, tc.cpumask.clone(), tc.all_cpus)
        };
        let dom = &self.doms[dom_id];

        let cpu = 'direct: {
            if task.nr_cpus_allowed() == 1 {
                self.stat_inc(ctx, RustyStat::Pinned);
                break 'direct task.cpus_allowed.first().unwrap_or(prev_cpu);
            }

            // The waker is about to sleep. Run the wakee in its place if
            // nothing else is waiting there.
            if wake_flags.contains(WakeFlags::SYNC) {
                let cpu = ctx.cpu();
                if p_cpumask.has(cpu) {
                    self.stat_inc(ctx, RustyStat::WakeSync);
                    if cpu != prev_cpu
                        && p_cpumask.has(prev_cpu)
                        && ctx.test_and_clear_cpu_idle(prev_cpu)
                    {
                        self.stat_inc(ctx, RustyStat::SyncPrevIdle);
                        break 'direct prev_cpu;
                    }
                    if ctx.dsq_nr_queued(DsqId::local_on(cpu)) == 0
                        && ctx.dsq_nr_queued(dom.dsq()) == 0
                    {
                        break 'direct cpu;
                    }
                }
            }

            if p_cpumask.has(prev_cpu) && ctx.test_and_clear_cpu_idle(prev_cpu) {
                self.stat_inc(ctx, RustyStat::PrevIdle);
                break 'direct prev_cpu;
            }

            if let Some(cpu) = ctx.pick_idle_cpu(&p_cpumask) {
                self.stat_inc(ctx, RustyStat::GreedyIdle);
                break 'direct cpu;
            }

            // The home domain is fully booked. Push the task to an idle
            // under-utilized CPU, staying on the node unless allowed not to.
            if all_cpus {
                let ti = self.tune_input();
                if !ti.direct_greedy_cpumask.is_empty() {
                    let near = ti.direct_greedy_cpumask.and(&dom.node_cpumask);
                    if let Some(cpu) = ctx.pick_idle_cpu(&near) {
                        self.stat_inc(ctx, RustyStat::DirectGreedy);
                        break 'direct cpu;
                    }
                    if self.cfg.direct_greedy_numa {
                        if let Some(cpu) = ctx.pick_idle_cpu(&ti.direct_greedy_cpumask) {
                            self.stat_inc(ctx, RustyStat::DirectGreedyFar);
                            break 'direct cpu;
                        }
                    }
                }
            }

            if p_cpumask.has(prev_cpu) {
                return prev_cpu;
            }
            return ctx.pick_any_cpu(&p_cpumask).unwrap_or(prev_cpu);
        };

        self.stat_inc(ctx, RustyStat::DirectDispatch);
        ctx.dispatch(task, DsqId::LOCAL, self.slice_ns(), EnqFlags::NONE);
        cpu
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            self.stat_inc(ctx, RustyStat::TaskGetErr);
            ctx.dispatch(task, DsqId::GLOBAL, self.slice_ns(), enq_flags);
            return;
        };

        if self.cfg.kthreads_local && task.kworker && task.nr_cpus_allowed() == 1 {
            self.stat_inc(ctx, RustyStat::DirectDispatch);
            ctx.dispatch(task, DsqId::LOCAL, self.slice_ns(), enq_flags);
            return;
        }

        let mut tc = lock(&taskc);

        let new_dom = lock(&self.lb_data).remove(&task.pid);
        let migrated = match new_dom {
            Some(new_dom) if new_dom != tc.dom_id => {
                self.task_set_domain(ctx, task, &mut tc, new_dom)
            }
            _ => false,
        };

        if migrated {
            self.stat_inc(ctx, RustyStat::LoadBalance);
            if let Some(cpu) = ctx.pick_any_cpu(&tc.cpumask) {
                ctx.kick_cpu(cpu, KickFlags::NONE);
            }
        } else if !tc.cpumask.has(ctx.task_cpu(task)) {
            // Running outside of its domain after a greedy execution. Kick
            // a CPU of the home domain to pick it up.
            if let Some(cpu) = ctx.pick_any_cpu(&tc.cpumask) {
                ctx.kick_cpu(cpu, KickFlags::NONE);
                self.stat_inc(ctx, RustyStat::Repatriate);
            }
        }

        let dom = &self.doms[tc.dom_id];
        let all_cpus = tc.all_cpus;
        drop(tc);

        self.queue_on_dom(ctx, task, dom, enq_flags);

        // Wake an under-utilized CPU to steal the task if it's allowed to
        // run anywhere.
        if all_cpus {
            let ti = self.tune_input();
            if let Some(cpu) = ctx.pick_idle_cpu(&ti.kick_greedy_cpumask) {
                self.stat_inc(ctx, RustyStat::KickGreedy);
                ctx.kick_cpu(cpu, KickFlags::NONE);
            }
        }
    }

    fn dispatch(&self, ctx: &ScxCtx, cpu: CpuId, _prev: Option<&TaskRef>) {
        // Offline CPUs don't belong to a domain.
        let Some(dom_id) = self.dom_group.cpu_dom_id(cpu) else {
            return;
        };

        if ctx.consume(self.doms[dom_id].dsq()) {
            return;
        }

        if self.cfg.greedy_threshold == 0 {
            return;
        }

        if self.try_greedy(ctx, dom_id, true, self.cfg.greedy_threshold) {
            self.stat_inc(ctx, RustyStat::GreedyLocal);
            return;
        }

        if self.cfg.greedy_threshold_x_numa == 0 || self.dom_group.nr_nodes() == 1 {
            return;
        }

        if self.try_greedy(ctx, dom_id, false, self.cfg.greedy_threshold_x_numa) {
            self.stat_inc(ctx, RustyStat::GreedyXnuma);
        }
    }

    fn runnable(&self, ctx: &ScxCtx, task: &TaskRef, _enq_flags: EnqFlags) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            return;
        };
        let mut tc = lock(&taskc);
        if tc.runnable {
            warn!("pid {} is already runnable", task.pid);
            return;
        }
        let now = ctx.now();
        tc.runnable = true;
        tc.dcyc.accumulate(1.0, now);
        self.doms[tc.dom_id].add_load(tc.weight, 1.0, now);
    }

    fn running(&self, ctx: &ScxCtx, task: &TaskRef) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            return;
        };
        let mut tc = lock(&taskc);
        tc.running_at = ctx.now();
        let dom = &self.doms[tc.dom_id];

        {
            let mut ap = lock(&dom.active_pids);
            if tc.dom_active_pids_gen != ap.gen {
                tc.dom_active_pids_gen = ap.gen;
                let idx = ap.write_idx as usize % MAX_DOM_ACTIVE_PIDS;
                ap.pids[idx] = task.pid;
                ap.write_idx += 1;
            }
        }

        if self.cfg.fifo_sched {
            return;
        }

        // The domain vtime always progresses forward as tasks start
        // executing.
        let vtime = task.dsq_vtime();
        let _ = dom
            .vtime_now
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |now| {
                vtime_before(now, vtime).then_some(vtime)
            });
    }

    fn stopping(&self, ctx: &ScxCtx, task: &TaskRef, _runnable: bool) {
        if self.cfg.fifo_sched {
            return;
        }
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            return;
        };
        let tc = lock(&taskc);

        // Scale the execution time by the inverse of the weight and charge.
        let used = ctx.now().saturating_sub(tc.running_at);
        task.add_dsq_vtime(used * 100 / tc.weight.max(1) as u64);
    }

    fn quiescent(&self, ctx: &ScxCtx, task: &TaskRef, _deq_flags: DeqFlags) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            return;
        };
        let mut tc = lock(&taskc);
        if !tc.runnable {
            return;
        }
        let now = ctx.now();
        tc.runnable = false;
        tc.dcyc.accumulate(0.0, now);
        self.doms[tc.dom_id].add_load(tc.weight, -1.0, now);
    }
}
