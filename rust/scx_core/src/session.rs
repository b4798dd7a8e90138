// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The class switch shim.
//!
//! A session brackets one policy from load to unload. It owns the per-CPU
//! run queues, the DSQs, the task registry and the exit record, and exposes
//! the entry points the rest of the scheduler (here: the engine) calls:
//! wakeups, picks, ticks and exits. While the policy is enabled the Ext
//! class is consulted before the default class on every pick; once it is
//! disabled every task falls back to the default class and the policy is
//! never called again.

use crate::clock::Clock;
use crate::dsq::DsqError;
use crate::dsq::DsqTable;
use crate::exit::ExitCell;
use crate::exit::ExitInfo;
use crate::exit::ScxExitKind;
use crate::ops::SchedOps;
use crate::ops::ScxCtx;
use crate::ops::ScxOp;
use crate::percpu::PerCpu;
use crate::stats::ScxStatIdx;
use crate::stats::ScxStats;
use crate::stats::ScxStatsSnapshot;
use crate::task::DirectDispatch;
use crate::task::OpsState;
use crate::task::SchedPolicy;
use crate::task::Task;
use crate::task::TaskAttrs;
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
use crate::types::SCX_DSP_MAX_BATCH;
use crate::types::SCX_DSP_MAX_LOOPS;
use crate::types::SCX_SLICE_DFL;
use crate::types::SCX_SLICE_INF;
use crate::util::lock;
use crate::util::read;
use crate::util::write;
use crate::watchdog::Watchdog;
use anyhow::bail;
use anyhow::Result;
use crossbeam::channel::bounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use log::debug;
use log::error;
use log::info;
use log::warn;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

/// Slice given to default-class tasks.
pub const FAIR_SLICE_NS: u64 = 4_000_000;

const KICK_PENDING: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ScxOpsState {
    Prepping = 0,
    Enabling = 1,
    Enabled = 2,
    Disabling = 3,
    Disabled = 4,
}

impl ScxOpsState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ScxOpsState::Prepping,
            1 => ScxOpsState::Enabling,
            2 => ScxOpsState::Enabled,
            3 => ScxOpsState::Disabling,
            _ => ScxOpsState::Disabled,
        }
    }
}

/// Scheduling classes in pick order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedClass {
    Ext,
    Fair,
    Idle,
}

impl SchedClass {
    pub const ALL: [SchedClass; 3] = [SchedClass::Ext, SchedClass::Fair, SchedClass::Idle];
}

/// What happens to the task that was running when a CPU reschedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrevState {
    /// Still runnable: preempted or out of slice.
    Runnable,
    /// Went to sleep.
    Blocked,
    /// Exiting.
    Dead,
}

/// Session-wide load parameters, validated by the loader.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub nr_cpus: u32,
    pub timeout_ms: u32,
    pub switch_partial: bool,
    pub exit_dump_len: usize,
}

#[derive(Debug, Default)]
struct ScxRq {
    local: Mutex<VecDeque<TaskRef>>,
    fair: Mutex<VecDeque<TaskRef>>,
    curr: Mutex<Option<TaskRef>>,
    idle: AtomicBool,
    kick: AtomicU64,
    nr_dsp: AtomicU32,
    busy_ns: AtomicU64,
}

pub struct ScxSession {
    ops: Arc<dyn SchedOps>,
    name: String,
    flags: OpsFlags,
    nr_cpus: u32,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    rqs: PerCpu<ScxRq>,
    dsqs: DsqTable,
    tasks: RwLock<BTreeMap<Pid, TaskRef>>,
    stats: ScxStats,
    watchdog: Watchdog,
    exit: ExitCell,
    exit_tx: Sender<ExitInfo>,
    exit_rx: Receiver<ExitInfo>,
    exit_dump_len: usize,
    disable_pending: AtomicBool,
    // Callbacks run under the read side, teardown takes the write side.
    ops_rwsem: RwLock<()>,
    timer: Mutex<Option<(TimeNs, CpuId)>>,
}

impl fmt::Debug for ScxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScxSession")
            .field("name", &self.name)
            .field("nr_cpus", &self.nr_cpus)
            .field("state", &self.state())
            .finish()
    }
}

impl ScxSession {
    pub fn new(
        ops: Arc<dyn SchedOps>,
        params: &SessionParams,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        if params.nr_cpus == 0 {
            bail!("nr_cpus must be positive");
        }
        let mut flags = ops.flags();
        if params.switch_partial {
            flags.insert(OpsFlags::SWITCH_PARTIAL);
        }
        let now = clock.now();
        let (exit_tx, exit_rx) = bounded(1);
        let nr_cpus = params.nr_cpus as usize;

        Ok(Arc::new(Self {
            name: ops.name().to_string(),
            ops,
            flags,
            nr_cpus: params.nr_cpus,
            clock,
            state: AtomicU8::new(ScxOpsState::Prepping as u8),
            // Nothing runs anywhere yet.
            rqs: PerCpu::new(nr_cpus, |_| ScxRq {
                idle: AtomicBool::new(true),
                ..Default::default()
            }),
            dsqs: DsqTable::new(),
            tasks: RwLock::new(BTreeMap::new()),
            stats: ScxStats::new(nr_cpus),
            watchdog: Watchdog::new(params.timeout_ms, now),
            exit: ExitCell::new(),
            exit_tx,
            exit_rx,
            exit_dump_len: params.exit_dump_len,
            disable_pending: AtomicBool::new(false),
            ops_rwsem: RwLock::new(()),
            timer: Mutex::new(None),
        }))
    }

    fn ctx(&self, cpu: CpuId, op: ScxOp) -> ScxCtx<'_> {
        ScxCtx::new(self, cpu, op)
    }

    fn rq(&self, cpu: CpuId) -> &ScxRq {
        self.rqs.get(cpu)
    }

    fn valid_cpu(&self, cpu: CpuId) -> bool {
        cpu.0 < self.nr_cpus
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> OpsFlags {
        self.flags
    }

    pub fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    pub fn now(&self) -> TimeNs {
        self.clock.now()
    }

    pub fn state(&self) -> ScxOpsState {
        ScxOpsState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ScxOpsState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn cmpxchg_state(&self, old: ScxOpsState, new: ScxOpsState) -> bool {
        self.state
            .compare_exchange(old as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True only while the policy is fully enabled.
    pub fn scx_enabled(&self) -> bool {
        self.state() == ScxOpsState::Enabled
    }

    /// Callbacks may dispatch while the policy is coming up or running.
    fn accepting(&self) -> bool {
        matches!(self.state(), ScxOpsState::Enabling | ScxOpsState::Enabled)
    }

    fn partial(&self) -> bool {
        self.flags.contains(OpsFlags::SWITCH_PARTIAL)
    }

    /// Classes consulted by a pick, Ext only while enabled.
    pub fn for_each_active_class(&self) -> impl Iterator<Item = SchedClass> {
        let enabled = self.scx_enabled();
        SchedClass::ALL
            .into_iter()
            .filter(move |class| *class != SchedClass::Ext || enabled)
    }

    /// Classes to balance when `prev` is going off the CPU. Ext is always
    /// balanced before the default class even if `prev` was below it.
    pub fn for_balance_class_range(&self, prev: SchedClass) -> impl Iterator<Item = SchedClass> {
        self.for_each_active_class()
            .filter(move |class| *class >= prev || *class == SchedClass::Ext)
    }

    pub fn task_on_scx(&self, task: &Task) -> bool {
        self.scx_enabled()
            && task.on_scx()
            && !task.disallowed()
            && (!self.partial() || task.policy == SchedPolicy::Ext)
    }

    pub fn stats(&self) -> ScxStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn exit_info(&self) -> Option<&ExitInfo> {
        self.exit.get()
    }

    pub fn exit_kind(&self) -> ScxExitKind {
        self.exit.kind()
    }

    pub fn exit_receiver(&self) -> Receiver<ExitInfo> {
        self.exit_rx.clone()
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn task(&self, pid: Pid) -> Option<TaskRef> {
        read(&self.tasks).get(&pid).cloned()
    }

    /// All live tasks in pid order.
    pub fn tasks(&self) -> Vec<TaskRef> {
        read(&self.tasks).values().cloned().collect()
    }

    pub fn curr(&self, cpu: CpuId) -> Option<TaskRef> {
        self.rqs.try_get(cpu).and_then(|rq| lock(&rq.curr).clone())
    }

    pub fn cpu_is_idle(&self, cpu: CpuId) -> bool {
        self.rqs
            .try_get(cpu)
            .is_some_and(|rq| rq.idle.load(Ordering::Acquire))
    }

    /// Nanoseconds `cpu` spent running tasks.
    pub fn cpu_busy_ns(&self, cpu: CpuId) -> u64 {
        self.rqs
            .try_get(cpu)
            .map_or(0, |rq| rq.busy_ns.load(Ordering::Relaxed))
    }

    pub fn local_pids(&self, cpu: CpuId) -> Vec<Pid> {
        self.rqs
            .try_get(cpu)
            .map_or(vec![], |rq| lock(&rq.local).iter().map(|t| t.pid).collect())
    }

    pub fn fair_pids(&self, cpu: CpuId) -> Vec<Pid> {
        self.rqs
            .try_get(cpu)
            .map_or(vec![], |rq| lock(&rq.fair).iter().map(|t| t.pid).collect())
    }

    pub fn dsq_pids(&self, dsq_id: DsqId) -> Vec<Pid> {
        if dsq_id.is_local_on() {
            return self.local_pids(dsq_id.local_on_cpu());
        }
        self.dsqs.pids(dsq_id).unwrap_or_default()
    }

    pub fn task_running(&self, task: &Task) -> bool {
        matches!(task.ops_state(), OpsState::Running(_))
            || self
                .rqs
                .iter()
                .any(|(_, rq)| lock(&rq.curr).as_ref().is_some_and(|t| t.pid == task.pid))
    }

    //
    // Exit path.
    //

    fn build_dump(&self) -> Option<String> {
        if self.exit_dump_len == 0 {
            return None;
        }
        let mut dump = String::new();
        let _ = writeln!(dump, "{} at {}ns", self.name, self.now());
        for (cpu, rq) in self.rqs.iter() {
            let curr = lock(&rq.curr)
                .as_ref()
                .map_or("-".to_string(), |t| format!("{}[{}]", t.comm, t.pid));
            let _ = writeln!(
                dump,
                "CPU {:3}: curr={} idle={} nr_local={} nr_fair={}",
                cpu.0,
                curr,
                rq.idle.load(Ordering::Relaxed),
                lock(&rq.local).len(),
                lock(&rq.fair).len()
            );
        }
        for id in self.dsqs.ids() {
            let _ = writeln!(
                dump,
                "DSQ {}: nr_queued={}",
                id,
                self.dsqs.nr_queued(id).unwrap_or(0)
            );
        }
        if dump.len() > self.exit_dump_len {
            let mut end = self.exit_dump_len;
            while !dump.is_char_boundary(end) {
                end -= 1;
            }
            dump.truncate(end);
        }
        Some(dump)
    }

    /// Record an error exit and schedule the teardown. Only the first exit
    /// record sticks; returns whether this call wrote it.
    pub fn ops_error(&self, kind: ScxExitKind, msg: impl Into<String>) -> bool {
        let mut info = ExitInfo::new(kind, msg, self.now());
        if kind.is_error() {
            info.dump = self.build_dump();
        }
        let msg = info.msg.clone();
        if !self.exit.set(info) {
            return false;
        }
        error!("sched_ext: {} error: {} ({})", self.name, kind.reason(), msg);
        self.disable_pending.store(true, Ordering::Release);
        true
    }

    pub(crate) fn policy_error(&self, msg: String) {
        self.ops_error(ScxExitKind::ErrorBpf, msg);
    }

    pub(crate) fn policy_exit(&self, code: u64, msg: String) {
        let mut info = ExitInfo::new(ScxExitKind::Done, msg, self.now());
        info.exit_code = code;
        if self.exit.set(info) {
            self.disable_pending.store(true, Ordering::Release);
        }
    }

    /// Tear down if a callback asked for it. Must not be called with the
    /// ops lock held.
    fn maybe_disable(&self) {
        if self.disable_pending.load(Ordering::Acquire) && self.accepting() {
            self.disable(ScxExitKind::Error, "");
        }
    }

    /// Disable the policy: every sched_ext task goes back to the default
    /// class, ops.disable() runs for each task and ops.exit() runs once.
    /// Later calls are no-ops. `kind` and `msg` only matter if nothing was
    /// recorded before.
    pub fn disable(&self, kind: ScxExitKind, msg: &str) {
        let from = loop {
            let state = self.state();
            match state {
                ScxOpsState::Disabling | ScxOpsState::Disabled => return,
                _ => {
                    if self.cmpxchg_state(state, ScxOpsState::Disabling) {
                        break state;
                    }
                }
            }
        };
        let mut info = ExitInfo::new(kind, msg, self.now());
        if kind.is_error() {
            info.dump = self.build_dump();
        }
        self.exit.set(info);

        {
            let _guard = write(&self.ops_rwsem);
            self.dsqs.drain_all();
            for (_, rq) in self.rqs.iter() {
                lock(&rq.local).clear();
            }
            *lock(&self.timer) = None;

            if from != ScxOpsState::Prepping {
                for task in self.tasks() {
                    self.disable_task(&task);
                }
            }
            if let Some(info) = self.exit.get() {
                self.ops.exit(info);
            }
        }

        self.set_state(ScxOpsState::Disabled);
        if let Some(info) = self.exit.get() {
            info!(
                "sched_ext: \"{}\" disabled ({}{}{})",
                self.name,
                info.reason,
                if info.msg.is_empty() { "" } else { ": " },
                info.msg
            );
            let _ = self.exit_tx.try_send(info.clone());
        }
        for cpu in 0..self.nr_cpus {
            self.resched_cpu(CpuId(cpu));
        }
    }

    fn disable_task(&self, task: &TaskRef) {
        let cpu = task.cpu();
        if task.on_scx() {
            let state = {
                let mut st = task.ops_state_lock();
                let prev = *st;
                *st = OpsState::None;
                prev
            };
            if task.slice() == SCX_SLICE_INF {
                task.set_slice(FAIR_SLICE_NS);
            }
            if let OpsState::Queued | OpsState::Dispatched(_) = state {
                task.set_slice(FAIR_SLICE_NS);
                lock(&self.rq(cpu).fair).push_back(task.clone());
            }
            task.set_on_scx(false);
        }
        if task.prepped() {
            self.ops.disable(&self.ctx(cpu, ScxOp::Disable), task);
            task.set_prepped(false);
        }
    }

    //
    // Load and attach.
    //

    /// Run ops.init(). The session stays in the prepping state.
    pub fn init(&self) -> Result<()> {
        if self.state() != ScxOpsState::Prepping {
            bail!("{} is not being loaded", self.name);
        }
        let res = {
            let _guard = read(&self.ops_rwsem);
            self.ops.init(&self.ctx(CpuId(0), ScxOp::Init))
        };
        if let Err(e) = res {
            self.disable(ScxExitKind::Error, &format!("ops.init() failed: {:#}", e));
            return Err(e.context(format!("ops.init() failed for {}", self.name)));
        }
        if let Some(info) = self.exit.get() {
            let msg = info.msg.clone();
            self.disable(ScxExitKind::Error, "");
            bail!("{} raised an error during init: {}", self.name, msg);
        }
        Ok(())
    }

    /// Switch eligible tasks over and start scheduling with the policy.
    pub fn enable(&self) -> Result<()> {
        if !self.cmpxchg_state(ScxOpsState::Prepping, ScxOpsState::Enabling) {
            bail!("{} is in state {:?}, can't enable", self.name, self.state());
        }
        {
            let _guard = write(&self.ops_rwsem);
            for task in self.tasks() {
                self.enable_task(&task);
                if task.on_scx() {
                    self.switch_to_scx(&task);
                }
            }
        }
        self.watchdog.checkin(self.now());

        if let Some(info) = self.exit.get() {
            let msg = info.msg.clone();
            self.disable(ScxExitKind::Error, "");
            bail!("{} failed to enable: {}", self.name, msg);
        }
        if !self.cmpxchg_state(ScxOpsState::Enabling, ScxOpsState::Enabled) {
            bail!("{} was disabled while enabling", self.name);
        }
        info!("sched_ext: \"{}\" enabled", self.name);
        for cpu in 0..self.nr_cpus {
            self.resched_cpu(CpuId(cpu));
        }
        Ok(())
    }

    fn enable_task(&self, task: &TaskRef) {
        if self.partial() && task.policy != SchedPolicy::Ext {
            return;
        }
        let ctx = self.ctx(task.cpu(), ScxOp::PrepEnable);
        if let Err(e) = self.ops.prep_enable(&ctx, task) {
            warn!(
                "{}: prep_enable failed for {}[{}]: {:#}",
                self.name, task.comm, task.pid, e
            );
            self.stats.inc(task.cpu(), ScxStatIdx::EnableErr);
            return;
        }
        task.set_prepped(true);
        if task.disallowed() {
            debug!("{}[{}] disallowed, staying on fair", task.comm, task.pid);
            return;
        }
        self.ops.enable(&self.ctx(task.cpu(), ScxOp::Enable), task);
        task.set_on_scx(true);
    }

    /// Move a task that was on the default class over to the policy.
    fn switch_to_scx(&self, task: &TaskRef) {
        let cpu = task.cpu();
        let queued = {
            let mut fair = lock(&self.rq(cpu).fair);
            let before = fair.len();
            fair.retain(|t| t.pid != task.pid);
            before != fair.len()
        };
        let running_on = self
            .rqs
            .iter()
            .find(|(_, rq)| lock(&rq.curr).as_ref().is_some_and(|t| t.pid == task.pid))
            .map(|(cpu, _)| cpu);

        if let Some(rcpu) = running_on {
            *task.ops_state_lock() = OpsState::Running(rcpu);
            task.set_slice(SCX_SLICE_DFL);
            self.ops
                .runnable(&self.ctx(rcpu, ScxOp::Runnable), task, EnqFlags::NONE);
            self.ops.running(&self.ctx(rcpu, ScxOp::Running), task);
        } else if queued {
            *task.ops_state_lock() = OpsState::Queued;
            task.set_runnable_at(self.now());
            self.stats.inc(cpu, ScxStatIdx::Enqueue);
            self.ops
                .runnable(&self.ctx(cpu, ScxOp::Runnable), task, EnqFlags::NONE);
            self.enqueue_task(cpu, task, EnqFlags::NONE);
        }
    }

    //
    // Task lifecycle entry points.
    //

    /// Create a task. It comes up sleeping, under the policy if one is
    /// active and the task is eligible.
    pub fn register_task(&self, attrs: &TaskAttrs) -> Result<TaskRef> {
        let task = Arc::new(Task::new(attrs, self.nr_cpus as usize)?);
        {
            let _guard = read(&self.ops_rwsem);
            {
                let mut tasks = write(&self.tasks);
                if tasks.contains_key(&task.pid) {
                    bail!("pid {} already exists", task.pid);
                }
                tasks.insert(task.pid, task.clone());
            }
            if self.accepting() {
                self.enable_task(&task);
            }
        }
        self.maybe_disable();
        Ok(task)
    }

    /// Make a sleeping task runnable. Returns the CPU it was queued for.
    pub fn wakeup(&self, task: &TaskRef, wake_flags: WakeFlags, waker_cpu: Option<CpuId>) -> CpuId {
        let cpu = {
            let _guard = read(&self.ops_rwsem);
            self.wakeup_locked(task, wake_flags, waker_cpu)
        };
        self.maybe_disable();
        cpu
    }

    fn wakeup_locked(
        &self,
        task: &TaskRef,
        wake_flags: WakeFlags,
        waker_cpu: Option<CpuId>,
    ) -> CpuId {
        let prev_cpu = task.cpu();
        if !self.task_on_scx(task) {
            return self.fair_enqueue(task, prev_cpu);
        }

        *task.ops_state_lock() = OpsState::Queued;
        task.set_runnable_at(self.now());
        self.stats.inc(prev_cpu, ScxStatIdx::Enqueue);
        self.ops
            .runnable(&self.ctx(prev_cpu, ScxOp::Runnable), task, EnqFlags::WAKEUP);

        let this_cpu = waker_cpu.filter(|c| self.valid_cpu(*c)).unwrap_or(prev_cpu);
        let ctx = self.ctx(this_cpu, ScxOp::SelectCpu);
        let mut cpu = self.ops.select_cpu(&ctx, task, prev_cpu, wake_flags);
        if !self.valid_cpu(cpu) {
            self.ops_error(
                ScxExitKind::Error,
                format!("select_cpu returned invalid cpu {}", cpu.0),
            );
            cpu = prev_cpu;
        } else if !task.cpus_allowed.has(cpu) {
            cpu = prev_cpu;
        }
        task.set_cpu(cpu);
        self.enqueue_task(cpu, task, EnqFlags::WAKEUP);
        if self.cpu_is_idle(cpu) {
            self.resched_cpu(cpu);
        }
        cpu
    }

    fn fair_enqueue(&self, task: &TaskRef, prev_cpu: CpuId) -> CpuId {
        let cpu = if task.cpus_allowed.has(prev_cpu) && self.cpu_is_idle(prev_cpu) {
            prev_cpu
        } else {
            task.cpus_allowed
                .iter()
                .find(|c| self.cpu_is_idle(*c))
                .unwrap_or(if task.cpus_allowed.has(prev_cpu) {
                    prev_cpu
                } else {
                    task.cpus_allowed.first().unwrap_or(prev_cpu)
                })
        };
        task.set_cpu(cpu);
        if task.slice() == 0 {
            task.set_slice(FAIR_SLICE_NS);
        }
        lock(&self.rq(cpu).fair).push_back(task.clone());
        self.resched_cpu(cpu);
        cpu
    }

    fn enqueue_task(&self, cpu: CpuId, task: &TaskRef, enq_flags: EnqFlags) {
        if let Some(ddsp) = task.take_ddsp() {
            self.stats.inc(cpu, ScxStatIdx::DirectDispatch);
            self.dispatch(
                cpu,
                ScxOp::Enqueue,
                task,
                ddsp.dsq_id,
                ddsp.slice,
                ddsp.vtime,
                ddsp.enq_flags | enq_flags,
            );
            return;
        }
        if enq_flags.contains(EnqFlags::LAST) && !self.flags.contains(OpsFlags::ENQ_LAST) {
            self.dispatch(
                cpu,
                ScxOp::Enqueue,
                task,
                DsqId::LOCAL,
                SCX_SLICE_DFL,
                None,
                EnqFlags::NONE,
            );
            return;
        }
        self.ops
            .enqueue(&self.ctx(cpu, ScxOp::Enqueue), task, enq_flags);
    }

    /// Take `cpu`'s current task off the CPU.
    pub fn put_prev_task(&self, cpu: CpuId, how: PrevState) {
        {
            let _guard = read(&self.ops_rwsem);
            if let Some(prev) = lock(&self.rq(cpu).curr).take() {
                self.put_prev_locked(cpu, &prev, how);
            }
        }
        self.maybe_disable();
    }

    /// The current task of `cpu` goes to sleep.
    pub fn task_sleep(&self, cpu: CpuId) {
        self.put_prev_task(cpu, PrevState::Blocked);
    }

    fn put_prev_locked(&self, cpu: CpuId, prev: &TaskRef, how: PrevState) {
        if !self.task_on_scx(prev) {
            *prev.ops_state_lock() = OpsState::None;
            if how == PrevState::Runnable {
                if prev.slice() == 0 {
                    prev.set_slice(FAIR_SLICE_NS);
                }
                lock(&self.rq(cpu).fair).push_back(prev.clone());
            }
            return;
        }

        let runnable = how == PrevState::Runnable;
        self.ops
            .stopping(&self.ctx(cpu, ScxOp::Stopping), prev, runnable);

        match how {
            PrevState::Runnable => {
                *prev.ops_state_lock() = OpsState::Queued;
                prev.set_runnable_at(self.now());
                self.stats.inc(cpu, ScxStatIdx::Enqueue);
                if prev.slice() > 0 {
                    // Preempted with slice left, back to the head of the line.
                    self.dispatch(
                        cpu,
                        ScxOp::Enqueue,
                        prev,
                        DsqId::LOCAL,
                        0,
                        None,
                        EnqFlags::HEAD,
                    );
                } else {
                    let mut flags = EnqFlags::NONE;
                    if lock(&self.rq(cpu).local).is_empty() {
                        flags.insert(EnqFlags::LAST);
                    }
                    self.enqueue_task(cpu, prev, flags);
                }
            }
            PrevState::Blocked | PrevState::Dead => {
                *prev.ops_state_lock() = OpsState::None;
                let deq_flags = if how == PrevState::Blocked {
                    DeqFlags::SLEEP
                } else {
                    DeqFlags::NONE
                };
                self.ops
                    .quiescent(&self.ctx(cpu, ScxOp::Quiescent), prev, deq_flags);
            }
        }
    }

    /// Pick the next task for `cpu`, which must have nothing running.
    pub fn pick_next_task(&self, cpu: CpuId) -> Option<TaskRef> {
        let next = {
            let _guard = read(&self.ops_rwsem);
            self.pick_next_locked(cpu, None)
        };
        self.maybe_disable();
        next
    }

    /// Reschedule `cpu`. A runnable current task with slice left keeps the
    /// CPU. Returns what runs next.
    pub fn schedule(&self, cpu: CpuId, how: PrevState) -> Option<TaskRef> {
        if !self.valid_cpu(cpu) {
            return None;
        }
        let next = {
            let _guard = read(&self.ops_rwsem);
            self.schedule_locked(cpu, how)
        };
        self.maybe_disable();
        next
    }

    fn schedule_locked(&self, cpu: CpuId, how: PrevState) -> Option<TaskRef> {
        let rq = self.rq(cpu);
        let prev = lock(&rq.curr).clone();
        let Some(prev) = prev else {
            return self.pick_next_locked(cpu, None);
        };

        if how == PrevState::Runnable {
            if self.task_on_scx(&prev) {
                if prev.slice() > 0 {
                    return Some(prev);
                }
                // Nothing else to do and the policy didn't ask to see the
                // last task: keep running it.
                if !self.balance_scx(cpu, Some(&prev))
                    && !self.flags.contains(OpsFlags::ENQ_LAST)
                    && lock(&rq.fair).is_empty()
                {
                    prev.set_slice(SCX_SLICE_DFL);
                    self.stats.inc(cpu, ScxStatIdx::EnqLast);
                    return Some(prev);
                }
            } else if prev.slice() > 0 {
                return Some(prev);
            }
        }

        lock(&rq.curr).take();
        self.put_prev_locked(cpu, &prev, how);
        self.pick_next_locked(cpu, None)
    }

    /// Refill `cpu`'s local DSQ from GLOBAL and the policy. Returns whether
    /// the local DSQ has something to run.
    fn balance_scx(&self, cpu: CpuId, prev: Option<&TaskRef>) -> bool {
        if !self.scx_enabled() {
            return false;
        }
        let rq = self.rq(cpu);
        if !lock(&rq.local).is_empty() || self.consume_global(cpu) {
            return true;
        }
        for _ in 0..SCX_DSP_MAX_LOOPS {
            rq.nr_dsp.store(0, Ordering::Relaxed);
            self.ops
                .dispatch(&self.ctx(cpu, ScxOp::Dispatch), cpu, prev);
            if !lock(&rq.local).is_empty() || self.consume_global(cpu) {
                return true;
            }
            if rq.nr_dsp.load(Ordering::Relaxed) == 0 || !self.scx_enabled() {
                break;
            }
        }
        false
    }

    fn consume_global(&self, cpu: CpuId) -> bool {
        self.consume_dsq(cpu, DsqId::GLOBAL)
    }

    fn consume_dsq(&self, cpu: CpuId, dsq_id: DsqId) -> bool {
        match self.dsqs.pop_for_cpu(dsq_id, cpu) {
            Ok(Some(task)) => {
                let mut st = task.ops_state_lock();
                *st = OpsState::Dispatched(DsqId::local_on(cpu));
                task.set_cpu(cpu);
                lock(&self.rq(cpu).local).push_back(task.clone());
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.ops_error(ScxExitKind::Error, format!("consume: {e}"));
                false
            }
        }
    }

    fn pick_next_locked(&self, cpu: CpuId, prev: Option<&TaskRef>) -> Option<TaskRef> {
        let rq = self.rq(cpu);
        for class in self.for_balance_class_range(SchedClass::Ext) {
            let next = match class {
                SchedClass::Ext => {
                    if self.balance_scx(cpu, prev) {
                        let next = lock(&rq.local).pop_front();
                        if let Some(task) = &next {
                            self.set_next_task_scx(cpu, task);
                        }
                        next
                    } else {
                        None
                    }
                }
                SchedClass::Fair => self.pick_fair(cpu),
                SchedClass::Idle => None,
            };
            if let Some(task) = next {
                *lock(&rq.curr) = Some(task.clone());
                if rq.idle.swap(false, Ordering::AcqRel) && self.scx_enabled() {
                    self.ops
                        .update_idle(&self.ctx(cpu, ScxOp::UpdateIdle), cpu, false);
                }
                return Some(task);
            }
        }

        if !rq.idle.swap(true, Ordering::AcqRel) && self.scx_enabled() {
            self.ops
                .update_idle(&self.ctx(cpu, ScxOp::UpdateIdle), cpu, true);
        }
        None
    }

    fn set_next_task_scx(&self, cpu: CpuId, task: &TaskRef) {
        *task.ops_state_lock() = OpsState::Running(cpu);
        task.set_cpu(cpu);
        if task.slice() == 0 {
            task.set_slice(SCX_SLICE_DFL);
        }
        self.stats.inc(cpu, ScxStatIdx::ExtPick);
        self.ops.running(&self.ctx(cpu, ScxOp::Running), task);
    }

    fn pick_fair(&self, cpu: CpuId) -> Option<TaskRef> {
        let own = lock(&self.rq(cpu).fair).pop_front();
        let next = own.or_else(|| {
            (1..self.nr_cpus).find_map(|off| {
                let other = CpuId((cpu.0 + off) % self.nr_cpus);
                let mut fair = lock(&self.rq(other).fair);
                let pos = fair.iter().position(|t| t.cpus_allowed.has(cpu))?;
                fair.remove(pos)
            })
        })?;
        next.set_cpu(cpu);
        if next.slice() == 0 {
            next.set_slice(FAIR_SLICE_NS);
        }
        self.stats.inc(cpu, ScxStatIdx::FairPick);
        Some(next)
    }

    /// A task leaves the system. Its CPU must have put it already.
    pub fn task_exit(&self, task: &TaskRef) {
        {
            let _guard = read(&self.ops_rwsem);
            let cpu = task.cpu();
            let state = task.ops_state();
            match state {
                OpsState::Queued if task.on_scx() => {
                    self.stats.inc(cpu, ScxStatIdx::Dequeue);
                    self.ops
                        .dequeue(&self.ctx(cpu, ScxOp::Dequeue), task, DeqFlags::NONE);
                }
                OpsState::Dispatched(dsq_id) => {
                    self.stats.inc(cpu, ScxStatIdx::Dequeue);
                    if dsq_id.is_local_on() {
                        let mut local = lock(&self.rq(dsq_id.local_on_cpu()).local);
                        local.retain(|t| t.pid != task.pid);
                    } else {
                        self.dsqs.remove(dsq_id, task.pid);
                    }
                }
                _ => {}
            }
            if matches!(state, OpsState::Queued | OpsState::Dispatched(_)) && task.on_scx() {
                self.ops
                    .quiescent(&self.ctx(cpu, ScxOp::Quiescent), task, DeqFlags::NONE);
            }
            *task.ops_state_lock() = OpsState::None;
            for (_, rq) in self.rqs.iter() {
                lock(&rq.fair).retain(|t| t.pid != task.pid);
                let mut curr = lock(&rq.curr);
                if curr.as_ref().is_some_and(|t| t.pid == task.pid) {
                    *curr = None;
                }
            }
            task.set_on_scx(false);
            if task.prepped() {
                self.ops.disable(&self.ctx(cpu, ScxOp::Disable), task);
                task.set_prepped(false);
            }
            write(&self.tasks).remove(&task.pid);
        }
        self.maybe_disable();
    }

    //
    // Ticks, kicks, timers and the watchdog.
    //

    /// Periodic tick on `cpu` after `elapsed` ns. Charges the running task,
    /// runs ops.tick() and the stall checks. Returns whether `cpu` needs to
    /// reschedule.
    pub fn notify_sched_tick(&self, cpu: CpuId, elapsed: u64) -> bool {
        if !self.valid_cpu(cpu) {
            return false;
        }
        let resched = {
            let _guard = read(&self.ops_rwsem);
            self.tick_locked(cpu, elapsed)
        };
        self.maybe_disable();
        resched
    }

    fn tick_locked(&self, cpu: CpuId, elapsed: u64) -> bool {
        let rq = self.rq(cpu);
        let curr = lock(&rq.curr).clone();
        let mut resched = false;

        if let Some(curr) = &curr {
            rq.busy_ns.fetch_add(elapsed, Ordering::Relaxed);
            if curr.slice() != SCX_SLICE_INF && curr.consume_slice(elapsed) == 0 {
                resched = true;
            }
            if self.task_on_scx(curr) {
                self.ops.tick(&self.ctx(cpu, ScxOp::Tick), curr);
                resched |= curr.slice() == 0;
            }
        }

        if self.scx_enabled() {
            self.stats.inc(cpu, ScxStatIdx::WatchdogCheck);
            let now = self.now();
            let tasks = read(&self.tasks);
            let stall = self
                .watchdog
                .check(now, tasks.values().filter(|t| t.cpu() == cpu));
            drop(tasks);
            if let Some(msg) = stall {
                self.ops_error(ScxExitKind::ErrorStall, msg);
            }
        }
        resched
    }

    /// The watchdog work: proves the system still makes progress.
    pub fn watchdog_checkin(&self) {
        self.watchdog.checkin(self.now());
    }

    pub(crate) fn resched_cpu(&self, cpu: CpuId) {
        if let Some(rq) = self.rqs.try_get(cpu) {
            rq.kick.fetch_or(KICK_PENDING, Ordering::AcqRel);
        }
    }

    pub(crate) fn kick_cpu(&self, this_cpu: CpuId, cpu: CpuId, flags: KickFlags) {
        if !self.valid_cpu(cpu) {
            self.ops_error(
                ScxExitKind::Error,
                format!("kick_cpu: invalid cpu {}", cpu.0),
            );
            return;
        }
        if !self.accepting() {
            return;
        }
        if flags.contains(KickFlags::IDLE) && !self.cpu_is_idle(cpu) {
            return;
        }
        self.stats.inc(this_cpu, ScxStatIdx::Kick);
        if flags.contains(KickFlags::PREEMPT) {
            self.stats.inc(this_cpu, ScxStatIdx::Preempt);
        }
        self.rq(cpu)
            .kick
            .fetch_or(KICK_PENDING | flags.raw(), Ordering::AcqRel);
    }

    /// Collect a pending kick of `cpu`. A preempting kick zeroes the slice of
    /// the running task so that the following reschedule switches it out.
    pub fn take_kick(&self, cpu: CpuId) -> Option<KickFlags> {
        let rq = self.rqs.try_get(cpu)?;
        let raw = rq.kick.swap(0, Ordering::AcqRel);
        if raw & KICK_PENDING == 0 {
            return None;
        }
        let flags = KickFlags::from_raw(raw & !KICK_PENDING);
        if flags.contains(KickFlags::PREEMPT) {
            if let Some(curr) = lock(&rq.curr).as_ref() {
                if curr.on_scx() {
                    curr.set_slice(0);
                }
            }
        }
        Some(flags)
    }

    pub(crate) fn timer_start(&self, cpu: CpuId, delay: u64) {
        *lock(&self.timer) = Some((self.now().saturating_add(delay), cpu));
    }

    /// Fire the policy timer if it expired.
    pub fn run_timers(&self) {
        {
            let _guard = read(&self.ops_rwsem);
            if !self.accepting() {
                return;
            }
            let now = self.now();
            let fired = {
                let mut timer = lock(&self.timer);
                match *timer {
                    Some((at, cpu)) if at <= now => {
                        *timer = None;
                        Some(cpu)
                    }
                    _ => None,
                }
            };
            if let Some(cpu) = fired {
                self.ops.timer(&self.ctx(cpu, ScxOp::Timer));
            }
        }
        self.maybe_disable();
    }

    pub(crate) fn test_and_clear_cpu_idle(&self, cpu: CpuId) -> bool {
        self.rqs.try_get(cpu).is_some_and(|rq| {
            rq.idle
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    //
    // Dispatch kfuncs.
    //

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dispatch(
        &self,
        cpu: CpuId,
        op: ScxOp,
        task: &TaskRef,
        dsq_id: DsqId,
        slice: u64,
        vtime: Option<u64>,
        enq_flags: EnqFlags,
    ) {
        if !self.accepting() {
            return;
        }
        match op {
            ScxOp::SelectCpu => {
                let ddsp = DirectDispatch {
                    dsq_id,
                    slice,
                    vtime,
                    enq_flags,
                };
                if !task.set_ddsp(ddsp) {
                    self.ops_error(
                        ScxExitKind::Error,
                        format!("{}[{}] dispatched twice from select_cpu", task.comm, task.pid),
                    );
                }
                return;
            }
            ScxOp::Enqueue => {}
            ScxOp::Dispatch => {
                let rq = self.rq(cpu);
                if rq.nr_dsp.load(Ordering::Relaxed) >= SCX_DSP_MAX_BATCH {
                    self.ops_error(ScxExitKind::Error, "dispatch buffer overflow");
                    return;
                }
                rq.nr_dsp.fetch_add(1, Ordering::Relaxed);
            }
            op => {
                self.ops_error(
                    ScxExitKind::Error,
                    format!("dispatch called from an invalid callback ({op:?})"),
                );
                return;
            }
        }

        let mut st = task.ops_state_lock();
        match *st {
            OpsState::Queued => {}
            OpsState::None => {
                self.stats.inc(cpu, ScxStatIdx::Spurious);
                debug!("spurious dispatch of {}[{}]", task.comm, task.pid);
                return;
            }
            OpsState::Dispatched(_) | OpsState::Running(_) => {
                self.stats.inc(cpu, ScxStatIdx::DoubleDispatch);
                warn!(
                    "{}: rejected double dispatch of {}[{}] ({:?})",
                    self.name, task.comm, task.pid, *st
                );
                return;
            }
        }
        if slice != 0 {
            task.set_slice(slice);
        }
        if let Some(vtime) = vtime {
            task.set_dsq_vtime(vtime);
        }
        let target = self.dispatch_enqueue(cpu, task, dsq_id, vtime, enq_flags);
        *st = OpsState::Dispatched(target);
        drop(st);

        if target.is_local_on() {
            let tcpu = target.local_on_cpu();
            if enq_flags.contains(EnqFlags::PREEMPT) {
                self.rq(tcpu)
                    .kick
                    .fetch_or(KICK_PENDING | KickFlags::PREEMPT.raw(), Ordering::AcqRel);
                self.stats.inc(cpu, ScxStatIdx::Preempt);
            } else if tcpu != cpu && self.cpu_is_idle(tcpu) {
                self.resched_cpu(tcpu);
            }
        }
    }

    /// Put `task` on the DSQ it ends up on and return that DSQ's id, with
    /// LOCAL resolved to `LOCAL_ON | cpu`.
    fn dispatch_enqueue(
        &self,
        cpu: CpuId,
        task: &TaskRef,
        dsq_id: DsqId,
        vtime: Option<u64>,
        enq_flags: EnqFlags,
    ) -> DsqId {
        let head = enq_flags.contains(EnqFlags::HEAD);

        if dsq_id.is_local() || dsq_id.is_local_on() {
            let tcpu = if dsq_id.is_local() {
                cpu
            } else {
                dsq_id.local_on_cpu()
            };
            if !self.valid_cpu(tcpu) {
                self.ops_error(
                    ScxExitKind::Error,
                    format!("invalid cpu {} in {}", tcpu.0, dsq_id),
                );
            } else if !task.cpus_allowed.has(tcpu) {
                self.stats.inc(cpu, ScxStatIdx::AffnViol);
            } else {
                if vtime.is_some() {
                    self.ops_error(
                        ScxExitKind::Error,
                        format!("cannot use vtime ordering for built-in DSQ {}", dsq_id),
                    );
                }
                task.set_cpu(tcpu);
                let mut local = lock(&self.rq(tcpu).local);
                if head {
                    local.push_front(task.clone());
                } else {
                    local.push_back(task.clone());
                }
                self.stats.inc(cpu, ScxStatIdx::LocalDispatch);
                return DsqId::local_on(tcpu);
            }
            return self.dispatch_global(cpu, task, head);
        }

        if dsq_id == DsqId::GLOBAL {
            if vtime.is_some() {
                self.ops_error(
                    ScxExitKind::Error,
                    "cannot use vtime ordering for built-in DSQ GLOBAL",
                );
            }
            return self.dispatch_global(cpu, task, head);
        }

        let res = match vtime {
            Some(vtime) => self.dsqs.insert_vtime(dsq_id, task.clone(), vtime),
            None => self.dsqs.insert(dsq_id, task.clone(), head),
        };
        match res {
            Ok(()) => {
                self.stats.inc(cpu, ScxStatIdx::DsqDispatch);
                dsq_id
            }
            Err(DsqError::Full(_)) => {
                self.stats.inc(cpu, ScxStatIdx::Overflow);
                self.dispatch_global(cpu, task, head)
            }
            Err(DsqError::NotFound(_)) => {
                self.ops_error(
                    ScxExitKind::Error,
                    format!(
                        "non-existent DSQ {} for {}[{}]",
                        dsq_id, task.comm, task.pid
                    ),
                );
                self.dispatch_global(cpu, task, head)
            }
            Err(e) => {
                self.ops_error(ScxExitKind::Error, e.to_string());
                self.dispatch_global(cpu, task, head)
            }
        }
    }

    fn dispatch_global(&self, cpu: CpuId, task: &TaskRef, head: bool) -> DsqId {
        if let Err(e) = self.dsqs.insert(DsqId::GLOBAL, task.clone(), head) {
            error!("failed to queue {}[{}] on GLOBAL: {}", task.comm, task.pid, e);
        }
        self.stats.inc(cpu, ScxStatIdx::GlobalDispatch);
        DsqId::GLOBAL
    }

    pub(crate) fn consume(&self, cpu: CpuId, op: ScxOp, dsq_id: DsqId) -> bool {
        if op != ScxOp::Dispatch {
            self.ops_error(
                ScxExitKind::Error,
                format!("consume called from an invalid callback ({op:?})"),
            );
            return false;
        }
        if dsq_id.is_builtin() && dsq_id != DsqId::GLOBAL {
            self.ops_error(ScxExitKind::Error, format!("can't consume from {dsq_id}"));
            return false;
        }
        self.consume_dsq(cpu, dsq_id)
    }

    pub(crate) fn dispatch_nr_slots(&self, cpu: CpuId, op: ScxOp) -> u32 {
        if op != ScxOp::Dispatch {
            return 0;
        }
        SCX_DSP_MAX_BATCH.saturating_sub(self.rq(cpu).nr_dsp.load(Ordering::Relaxed))
    }

    pub(crate) fn create_dsq(&self, dsq_id: DsqId, capacity: Option<usize>) -> Result<()> {
        self.dsqs.create(dsq_id, capacity)?;
        debug!("{}: created DSQ {}", self.name, dsq_id);
        Ok(())
    }

    pub(crate) fn destroy_dsq(&self, cpu: CpuId, dsq_id: DsqId) {
        match self.dsqs.destroy(dsq_id) {
            Ok(tasks) => {
                for task in tasks {
                    // Whatever was left is still owed a CPU.
                    *task.ops_state_lock() = OpsState::Dispatched(DsqId::GLOBAL);
                    self.dispatch_global(cpu, &task, false);
                }
            }
            Err(e) => {
                self.ops_error(ScxExitKind::Error, format!("destroy_dsq: {e}"));
            }
        }
    }

    pub(crate) fn dsq_nr_queued(&self, cpu: CpuId, dsq_id: DsqId) -> usize {
        if dsq_id.is_local() {
            return lock(&self.rq(cpu).local).len();
        }
        if dsq_id.is_local_on() {
            return self
                .rqs
                .try_get(dsq_id.local_on_cpu())
                .map_or(0, |rq| lock(&rq.local).len());
        }
        self.dsqs.nr_queued(dsq_id).unwrap_or(0)
    }
}
