// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A multi-layer sched_ext scheduler.
//!
//! Tasks are classified into layers by the match rules of [`LayerSpec`]s.
//! Every layer has its own vtime ordered DSQ and a cpumask of the CPUs it
//! owns, which user space resizes according to the measured utilization of
//! the layer (see [`alloc`]). Confined layers only run on their CPUs,
//! grouped and open layers spill over to idle CPUs elsewhere, and open
//! layers prefer the CPUs nobody owns. Tasks of preempting layers kick
//! CPUs running tasks of non-preempting layers when no idle CPU is around.

pub mod alloc;
pub mod config;
pub mod stats;

pub use config::verify_layer_specs;
pub use config::LayerCommon;
pub use config::LayerConfig;
pub use config::LayerKind;
pub use config::LayerMatch;
pub use config::LayerSpec;
pub use config::MAX_LAYERS;

use std::ops::Sub;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
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
use log::debug;
use log::warn;
use scx_core::vtime_before;
use scx_core::CpuId;
use scx_core::Cpumask;
use scx_core::DeqFlags;
use scx_core::DsqId;
use scx_core::EnqFlags;
use scx_core::ExitInfo;
use scx_core::KickFlags;
use scx_core::PerCpu;
use scx_core::PerCpuCounters;
use scx_core::Pid;
use scx_core::Ravg;
use scx_core::SchedOps;
use scx_core::ScxCtx;
use scx_core::TaskCtxStore;
use scx_core::TaskRef;
use scx_core::TimeNs;
use scx_core::WakeFlags;
use scx_core::USAGE_HALF_LIFE;

pub const MAX_TASKS: usize = 65536;

/// Tasks which can't follow their layer's placement because of their CPU
/// affinity are queued here and served before the non-preempting layers.
pub const HI_FALLBACK_DSQ: DsqId = DsqId(MAX_LAYERS as u64);

pub fn layer_dsq(layer: usize) -> DsqId {
    DsqId(layer as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalStat {
    TaskCtxErr,
    HiFallback,
}

pub const NR_GSTATS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStat {
    SelLocal,
    EnqWakeup,
    EnqExpire,
    EnqReenq,
    MinExec,
    OpenIdle,
    AffnViol,
    Preempt,
    PreemptFail,
}

pub const NR_LSTATS: usize = 9;

/// Counters of one layer in `lstats` order. Together with the task counts
/// these are what the monitor reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayeredStats {
    pub gstats: Vec<u64>,
    pub lstats: Vec<Vec<u64>>,
}

impl LayeredStats {
    pub fn gstat(&self, stat: GlobalStat) -> u64 {
        self.gstats.get(stat as usize).copied().unwrap_or(0)
    }

    pub fn lstat(&self, layer: usize, stat: LayerStat) -> u64 {
        self.lstats
            .get(layer)
            .and_then(|l| l.get(stat as usize))
            .copied()
            .unwrap_or(0)
    }

    pub fn lstat_sum(&self, stat: LayerStat) -> u64 {
        (0..self.lstats.len()).map(|l| self.lstat(l, stat)).sum()
    }

    /// Scheduling events of a layer: every wakeup placement and enqueue.
    pub fn layer_total(&self, layer: usize) -> u64 {
        [
            LayerStat::SelLocal,
            LayerStat::EnqWakeup,
            LayerStat::EnqExpire,
            LayerStat::EnqReenq,
        ]
        .into_iter()
        .map(|stat| self.lstat(layer, stat))
        .sum()
    }

    pub fn total(&self) -> u64 {
        (0..self.lstats.len()).map(|l| self.layer_total(l)).sum()
    }
}

impl<'a, 'b> Sub<&'b LayeredStats> for &'a LayeredStats {
    type Output = LayeredStats;

    fn sub(self, rhs: &'b LayeredStats) -> LayeredStats {
        let vec_sub = |l: &[u64], r: &[u64]| {
            l.iter()
                .zip(r.iter())
                .map(|(l, r)| l.saturating_sub(*r))
                .collect()
        };
        LayeredStats {
            gstats: vec_sub(&self.gstats, &rhs.gstats),
            lstats: self
                .lstats
                .iter()
                .zip(rhs.lstats.iter())
                .map(|(l, r)| vec_sub(l, r))
                .collect(),
        }
    }
}

#[derive(Debug)]
struct LayerCpus {
    seq: u64,
    mask: Arc<Cpumask>,
}

#[derive(Debug)]
struct LayerCtx {
    name: String,
    open: bool,
    preempt: bool,
    slice_ns: u64,
    min_exec_ns: u64,
    cpus: RwLock<LayerCpus>,
    // Mirrors cpus.seq so that tasks can check for updates without locking.
    cpus_seq: AtomicU64,
    nr_cpus: AtomicUsize,
    vtime_now: AtomicU64,
    load: Mutex<Ravg>,
    nr_tasks: AtomicUsize,
}

impl LayerCtx {
    fn cpus(&self) -> (u64, Arc<Cpumask>) {
        let cpus = self.cpus.read().unwrap_or_else(|p| p.into_inner());
        (cpus.seq, cpus.mask.clone())
    }

    fn vtime_now(&self) -> u64 {
        self.vtime_now.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct TaskCtx {
    layer: usize,
    // The layer's cpumask restricted to the task's affinity.
    layered_cpumask: Cpumask,
    layer_cpus_seq: u64,
    all_cpus_allowed: bool,
    weight: u32,
    runnable: bool,
    started_running_at: TimeNs,
}

#[derive(Debug, Default)]
struct CpuCtx {
    current_preempt: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct LayeredOps {
    nr_cpus: usize,
    specs: Vec<LayerSpec>,
    layers: Vec<LayerCtx>,
    task_ctxs: TaskCtxStore<Mutex<TaskCtx>>,
    cpu_ctxs: PerCpu<CpuCtx>,
    layer_cycles: PerCpuCounters,
    gstats: PerCpuCounters,
    lstats: PerCpuCounters,
    fallback_cpu: AtomicU32,
    preempt_cursor: AtomicUsize,
    exit: Mutex<Option<ExitInfo>>,
}

impl LayeredOps {
    /// `slice_ns` applies to layers which don't set their own slice.
    pub fn new(nr_cpus: usize, specs: &[LayerSpec], slice_ns: u64) -> Result<Self> {
        verify_layer_specs(specs)?;
        if slice_ns == 0 {
            bail!("slice must be positive");
        }
        if nr_cpus == 0 {
            bail!("no CPUs");
        }

        // Open layers start out with all CPUs. The others get theirs once
        // user space has seen them run.
        let layers = specs
            .iter()
            .map(|spec| {
                let common = spec.kind.common();
                let mask = match spec.kind {
                    LayerKind::Open { .. } => Cpumask::full(nr_cpus),
                    _ => Cpumask::new(nr_cpus),
                };
                LayerCtx {
                    name: spec.name.clone(),
                    open: spec.kind.is_open(),
                    preempt: common.preempt,
                    slice_ns: match common.slice_us {
                        0 => slice_ns,
                        us => us * 1000,
                    },
                    min_exec_ns: common.min_exec_us * 1000,
                    nr_cpus: AtomicUsize::new(mask.weight()),
                    cpus: RwLock::new(LayerCpus {
                        seq: 0,
                        mask: Arc::new(mask),
                    }),
                    cpus_seq: AtomicU64::new(0),
                    vtime_now: AtomicU64::new(0),
                    load: Mutex::new(Ravg::new(USAGE_HALF_LIFE, 0)),
                    nr_tasks: AtomicUsize::new(0),
                }
            })
            .collect::<Vec<_>>();
        let nr_layers = layers.len();

        Ok(Self {
            nr_cpus,
            specs: specs.to_vec(),
            layers,
            task_ctxs: TaskCtxStore::new(MAX_TASKS),
            cpu_ctxs: PerCpu::new(nr_cpus, |_| CpuCtx::default()),
            layer_cycles: PerCpuCounters::new(nr_cpus, nr_layers),
            gstats: PerCpuCounters::new(nr_cpus, NR_GSTATS),
            lstats: PerCpuCounters::new(nr_cpus, nr_layers * NR_LSTATS),
            fallback_cpu: AtomicU32::new(0),
            preempt_cursor: AtomicUsize::new(0),
            exit: Mutex::new(None),
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn nr_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    pub fn layer_name(&self, layer: usize) -> Option<&str> {
        self.layers.get(layer).map(|l| l.name.as_str())
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        lock(&self.exit).clone()
    }

    pub fn task_layer(&self, pid: Pid) -> Option<usize> {
        self.task_ctxs.get(pid).map(|taskc| lock(&taskc).layer)
    }

    pub fn layer_cpus(&self, layer: usize) -> Option<Cpumask> {
        self.layers.get(layer).map(|l| (*l.cpus().1).clone())
    }

    pub fn layer_cpus_seq(&self, layer: usize) -> Option<u64> {
        self.layers
            .get(layer)
            .map(|l| l.cpus_seq.load(Ordering::Acquire))
    }

    /// Install a new cpumask for `layer`. Tasks pick it up the next time they
    /// are placed.
    pub fn refresh_cpus(&self, layer: usize, mask: Cpumask) -> Result<()> {
        let lyr = self
            .layers
            .get(layer)
            .ok_or_else(|| anyhow!("invalid layer {}", layer))?;
        if mask.len() != self.nr_cpus {
            bail!(
                "cpumask of layer {} covers {} CPUs, expected {}",
                lyr.name,
                mask.len(),
                self.nr_cpus
            );
        }

        let mut cpus = lyr.cpus.write().unwrap_or_else(|p| p.into_inner());
        cpus.seq += 1;
        lyr.nr_cpus.store(mask.weight(), Ordering::Relaxed);
        debug!("layer {} cpus={} seq={}", lyr.name, mask, cpus.seq);
        cpus.mask = Arc::new(mask);
        lyr.cpus_seq.store(cpus.seq, Ordering::Release);
        Ok(())
    }

    pub fn fallback_cpu(&self) -> CpuId {
        CpuId(self.fallback_cpu.load(Ordering::Relaxed))
    }

    /// CPU which serves confined layers that currently own no CPUs.
    pub fn set_fallback_cpu(&self, cpu: CpuId) -> Result<()> {
        if cpu.0 as usize >= self.nr_cpus {
            bail!("invalid fallback CPU {}", cpu);
        }
        self.fallback_cpu.store(cpu.0, Ordering::Relaxed);
        Ok(())
    }

    /// Nanoseconds spent by each layer on all CPUs so far.
    pub fn layer_cycles(&self) -> Vec<u64> {
        self.layer_cycles.read()
    }

    pub fn layer_load(&self, layer: usize, now: TimeNs) -> f64 {
        self.layers
            .get(layer)
            .map(|l| lock(&l.load).read(now))
            .unwrap_or(0.0)
    }

    pub fn layer_nr_tasks(&self, layer: usize) -> usize {
        self.layers
            .get(layer)
            .map(|l| l.nr_tasks.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn layer_vtime_now(&self, layer: usize) -> u64 {
        self.layers.get(layer).map(|l| l.vtime_now()).unwrap_or(0)
    }

    pub fn current_preempt(&self, cpu: CpuId) -> bool {
        self.cpu_ctxs
            .try_get(cpu)
            .map(|c| c.current_preempt.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Cumulative counters.
    pub fn stats(&self) -> LayeredStats {
        let raw = self.lstats.read();
        LayeredStats {
            gstats: self.gstats.read(),
            lstats: raw.chunks(NR_LSTATS).map(|c| c.to_vec()).collect(),
        }
    }

    fn gstat_inc(&self, ctx: &ScxCtx, stat: GlobalStat) {
        self.gstats.inc(ctx.cpu(), stat as usize);
    }

    fn lstat_inc(&self, ctx: &ScxCtx, layer: usize, stat: LayerStat) {
        self.lstats
            .inc(ctx.cpu(), layer * NR_LSTATS + stat as usize);
    }

    fn match_layer(&self, task: &TaskRef) -> Option<usize> {
        self.specs.iter().position(|spec| spec.matches_task(task))
    }

    fn maybe_refresh_layered_cpumask(&self, task: &TaskRef, tc: &mut TaskCtx) {
        let layer = &self.layers[tc.layer];
        if tc.layer_cpus_seq == layer.cpus_seq.load(Ordering::Acquire) {
            return;
        }
        let (seq, mask) = layer.cpus();
        tc.layered_cpumask = mask.and(&task.cpus_allowed);
        tc.layer_cpus_seq = seq;
    }

    fn layer_owns_cpu(&self, layer: usize, cpu: CpuId) -> bool {
        let lyr = &self.layers[layer];
        if lyr.nr_cpus.load(Ordering::Relaxed) == 0 {
            return cpu == self.fallback_cpu();
        }
        lyr.cpus().1.has(cpu)
    }

    fn try_preempt(&self, ctx: &ScxCtx, task: &TaskRef, layer: usize) {
        let nr_cpus = self.nr_cpus;
        let cursor = self.preempt_cursor.load(Ordering::Relaxed);

        for idx in 0..nr_cpus {
            let cpu = (cursor + idx) % nr_cpus;
            if !task.cpus_allowed.test_cpu(cpu) {
                continue;
            }
            let cpu_id = CpuId(cpu as u32);
            if self.current_preempt(cpu_id) {
                continue;
            }

            ctx.kick_cpu(cpu_id, KickFlags::PREEMPT);

            // The cursor is only a hint, racing updates are fine.
            self.preempt_cursor
                .store((cpu + 1) % nr_cpus, Ordering::Relaxed);
            self.lstat_inc(ctx, layer, LayerStat::Preempt);
            return;
        }

        self.lstat_inc(ctx, layer, LayerStat::PreemptFail);
    }
}

/// Prefer `prev_cpu` if it's idle and in `mask`, then any idle CPU in
/// `mask`.
fn pick_idle_cpu_from(ctx: &ScxCtx, mask: &Cpumask, prev_cpu: CpuId) -> Option<CpuId> {
    if mask.has(prev_cpu) && ctx.test_and_clear_cpu_idle(prev_cpu) {
        return Some(prev_cpu);
    }
    ctx.pick_idle_cpu(mask)
}

impl SchedOps for LayeredOps {
    fn name(&self) -> &str {
        "layered"
    }

    fn init(&self, ctx: &ScxCtx) -> Result<()> {
        for layer in 0..self.layers.len() {
            ctx.create_dsq(layer_dsq(layer), None)?;
        }
        ctx.create_dsq(HI_FALLBACK_DSQ, None)?;
        Ok(())
    }

    fn exit(&self, info: &ExitInfo) {
        *lock(&self.exit) = Some(info.clone());
    }

    fn prep_enable(&self, _ctx: &ScxCtx, task: &TaskRef) -> Result<()> {
        let layer = self
            .match_layer(task)
            .ok_or_else(|| anyhow!("{}[{}] doesn't match any layer", task.comm, task.pid))?;

        let taskc = TaskCtx {
            layer,
            layered_cpumask: Cpumask::new(self.nr_cpus),
            // Forces a refresh on the first placement.
            layer_cpus_seq: u64::MAX,
            all_cpus_allowed: task.cpus_allowed.weight() >= self.nr_cpus,
            weight: task.weight,
            runnable: false,
            started_running_at: 0,
        };
        self.task_ctxs.on_task_enable(task.pid, || Mutex::new(taskc))?;
        self.layers[layer].nr_tasks.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{}[{}] joined layer {}",
            task.comm, task.pid, self.layers[layer].name
        );
        Ok(())
    }

    fn enable(&self, _ctx: &ScxCtx, task: &TaskRef) {
        if let Some(layer) = self.task_layer(task.pid) {
            task.set_dsq_vtime(self.layers[layer].vtime_now());
        }
    }

    fn disable(&self, ctx: &ScxCtx, task: &TaskRef) {
        let Some(taskc) = self.task_ctxs.on_task_disable(task.pid) else {
            return;
        };
        let tc = lock(&taskc);
        let layer = &self.layers[tc.layer];
        if tc.runnable {
            lock(&layer.load).add(-(tc.weight as f64), ctx.now());
        }
        if layer
            .nr_tasks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_err()
        {
            warn!("layer {} task count underflow", layer.name);
        }
    }

    fn select_cpu(
        &self,
        ctx: &ScxCtx,
        task: &TaskRef,
        prev_cpu: CpuId,
        _wake_flags: WakeFlags,
    ) -> CpuId {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            self.gstat_inc(ctx, GlobalStat::TaskCtxErr);
            return prev_cpu;
        };
        let mut tc = lock(&taskc);

        // Tasks with restricted affinity take the fallback path in enqueue.
        if !tc.all_cpus_allowed {
            return prev_cpu;
        }

        self.maybe_refresh_layered_cpumask(task, &mut tc);
        let layer_idx = tc.layer;
        let layer = &self.layers[layer_idx];

        let cpu = match pick_idle_cpu_from(ctx, &tc.layered_cpumask, prev_cpu) {
            Some(cpu) => cpu,
            None if layer.open => match pick_idle_cpu_from(ctx, &task.cpus_allowed, prev_cpu) {
                Some(cpu) => {
                    self.lstat_inc(ctx, layer_idx, LayerStat::OpenIdle);
                    cpu
                }
                None => return prev_cpu,
            },
            None => return prev_cpu,
        };
        drop(tc);

        self.lstat_inc(ctx, layer_idx, LayerStat::SelLocal);
        ctx.dispatch(task, DsqId::LOCAL, layer.slice_ns, EnqFlags::NONE);
        cpu
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            self.gstat_inc(ctx, GlobalStat::TaskCtxErr);
            ctx.dispatch(task, DsqId::GLOBAL, 0, enq_flags);
            return;
        };
        let (layer_idx, all_cpus_allowed) = {
            let tc = lock(&taskc);
            (tc.layer, tc.all_cpus_allowed)
        };
        let layer = &self.layers[layer_idx];

        if enq_flags.contains(EnqFlags::REENQ) {
            self.lstat_inc(ctx, layer_idx, LayerStat::EnqReenq);
        } else if enq_flags.contains(EnqFlags::WAKEUP) {
            self.lstat_inc(ctx, layer_idx, LayerStat::EnqWakeup);
        } else {
            self.lstat_inc(ctx, layer_idx, LayerStat::EnqExpire);
        }

        if !all_cpus_allowed {
            self.lstat_inc(ctx, layer_idx, LayerStat::AffnViol);
            self.gstat_inc(ctx, GlobalStat::HiFallback);
            ctx.dispatch(task, HI_FALLBACK_DSQ, layer.slice_ns, enq_flags);
            return;
        }

        // Limit the amount of budget that an idling task can accumulate to
        // one slice.
        let mut vtime = task.dsq_vtime();
        let floor = layer.vtime_now().saturating_sub(layer.slice_ns);
        if vtime_before(vtime, floor) {
            vtime = floor;
        }

        ctx.dispatch_vtime(task, layer_dsq(layer_idx), layer.slice_ns, vtime, enq_flags);

        if layer.preempt {
            self.try_preempt(ctx, task, layer_idx);
        }
    }

    fn dispatch(&self, ctx: &ScxCtx, cpu: CpuId, _prev: Option<&TaskRef>) {
        // Preempting layers first.
        for (idx, layer) in self.layers.iter().enumerate() {
            if layer.preempt
                && (layer.open || self.layer_owns_cpu(idx, cpu))
                && ctx.consume(layer_dsq(idx))
            {
                return;
            }
        }

        if ctx.consume(HI_FALLBACK_DSQ) {
            return;
        }

        // Then the layers owning this CPU.
        for (idx, layer) in self.layers.iter().enumerate() {
            if layer.preempt || !self.layer_owns_cpu(idx, cpu) {
                continue;
            }
            if ctx.consume(layer_dsq(idx)) {
                return;
            }
        }

        // Then whatever may run anywhere.
        for (idx, layer) in self.layers.iter().enumerate() {
            if !layer.preempt && layer.open && ctx.consume(layer_dsq(idx)) {
                return;
            }
        }
    }

    fn runnable(&self, ctx: &ScxCtx, task: &TaskRef, _enq_flags: EnqFlags) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            return;
        };
        let mut tc = lock(&taskc);
        if tc.runnable {
            return;
        }
        tc.runnable = true;
        lock(&self.layers[tc.layer].load).add(tc.weight as f64, ctx.now());
    }

    fn running(&self, ctx: &ScxCtx, task: &TaskRef) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            return;
        };
        let mut tc = lock(&taskc);
        let layer = &self.layers[tc.layer];

        self.cpu_ctxs
            .get(ctx.cpu())
            .current_preempt
            .store(layer.preempt, Ordering::Relaxed);
        tc.started_running_at = ctx.now();

        // The layer vtime only moves forward.
        let vtime = task.dsq_vtime();
        let _ = layer
            .vtime_now
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |now| {
                vtime_before(now, vtime).then_some(vtime)
            });
    }

    fn stopping(&self, ctx: &ScxCtx, task: &TaskRef, _runnable: bool) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            return;
        };
        let tc = lock(&taskc);
        let layer = &self.layers[tc.layer];

        let mut used = ctx.now().saturating_sub(tc.started_running_at);
        if used < layer.min_exec_ns {
            self.lstat_inc(ctx, tc.layer, LayerStat::MinExec);
            used = layer.min_exec_ns;
        }

        self.layer_cycles.add(ctx.cpu(), tc.layer, used);
        task.add_dsq_vtime(used * 100 / tc.weight.max(1) as u64);
        self.cpu_ctxs
            .get(ctx.cpu())
            .current_preempt
            .store(false, Ordering::Relaxed);
    }

    fn quiescent(&self, ctx: &ScxCtx, task: &TaskRef, _deq_flags: DeqFlags) {
        let Some(taskc) = self.task_ctxs.get(task.pid) else {
            return;
        };
        let mut tc = lock(&taskc);
        if !tc.runnable {
            return;
        }
        tc.runnable = false;
        lock(&self.layers[tc.layer].load).add(-(tc.weight as f64), ctx.now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::example_config;

    #[test]
    fn test_new_rejects_invalid_specs() {
        assert!(LayeredOps::new(4, &[], 20_000_000).is_err());
        assert!(LayeredOps::new(4, &example_config().specs, 0).is_err());
    }

    #[test]
    fn test_initial_layer_cpus() {
        let ops = LayeredOps::new(4, &example_config().specs, 20_000_000).unwrap();
        assert_eq!(ops.nr_layers(), 3);
        assert!(ops.layer_cpus(0).unwrap().is_empty());
        assert!(ops.layer_cpus(1).unwrap().is_full());
        assert!(ops.layer_cpus(2).unwrap().is_empty());
        assert_eq!(ops.layer_cpus_seq(0), Some(0));
    }

    #[test]
    fn test_refresh_cpus_bumps_seq() {
        let ops = LayeredOps::new(4, &example_config().specs, 20_000_000).unwrap();
        ops.refresh_cpus(0, Cpumask::from_cpus(&[2, 3], 4).unwrap())
            .unwrap();
        assert_eq!(ops.layer_cpus_seq(0), Some(1));
        assert_eq!(ops.layer_cpus(0).unwrap().weight(), 2);

        assert!(ops.refresh_cpus(0, Cpumask::new(8)).is_err());
        assert!(ops.refresh_cpus(3, Cpumask::new(4)).is_err());
        assert_eq!(ops.layer_cpus_seq(0), Some(1));
    }

    #[test]
    fn test_stats_sub() {
        let prev = LayeredStats {
            gstats: vec![1, 0],
            lstats: vec![vec![1; NR_LSTATS], vec![0; NR_LSTATS]],
        };
        let mut cur = prev.clone();
        cur.lstats[0][LayerStat::SelLocal as usize] = 5;
        cur.lstats[1][LayerStat::EnqWakeup as usize] = 3;
        cur.gstats[GlobalStat::HiFallback as usize] = 2;

        let delta = &cur - &prev;
        assert_eq!(delta.lstat(0, LayerStat::SelLocal), 4);
        assert_eq!(delta.lstat(1, LayerStat::EnqWakeup), 3);
        assert_eq!(delta.gstat(GlobalStat::HiFallback), 2);
        assert_eq!(delta.total(), 7);
        assert_eq!(delta.lstat_sum(LayerStat::SelLocal), 4);
    }
}
