// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Tasks as seen by the scheduling core.
//!
//! Identity and placement constraints are fixed at creation. Everything the
//! core and the policy change while the task moves through the system (slice,
//! vtime, ops state, ...) uses interior mutability so that a `TaskRef` can be
//! shared between run queues, dispatch queues and policy-side lookups.

use crate::cpumask::Cpumask;
use crate::types::CpuId;
use crate::types::DsqId;
use crate::types::EnqFlags;
use crate::types::Pid;
use crate::types::TimeNs;
use crate::types::Weight;
use crate::util::lock;
use anyhow::bail;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// Kernel sched_prio_to_weight table, nice -20..19.
const SCHED_PRIO_TO_WEIGHT: [u32; 40] = [
    /* -20 */ 88761, 71755, 56483, 46273, 36291, /* -15 */ 29154, 23254, 18705, 14949,
    11916, /* -10 */ 9548, 7620, 6100, 4904, 3906, /*  -5 */ 3121, 2501, 1991, 1586,
    1277, /*   0 */ 1024, 820, 655, 526, 423, /*   5 */ 335, 272, 215, 172, 137,
    /*  10 */ 110, 87, 70, 56, 45, /*  15 */ 36, 29, 23, 18, 15,
];

const CGROUP_WEIGHT_MIN: u32 = 1;
const CGROUP_WEIGHT_DFL: u32 = 100;
const CGROUP_WEIGHT_MAX: u32 = 10000;

/// Compound weight of a nice level, rounded to the closest cgroup weight.
/// Nice values outside -20..19 are clamped.
pub fn nice_to_weight(nice: i32) -> Weight {
    let raw = SCHED_PRIO_TO_WEIGHT[(nice.clamp(-20, 19) + 20) as usize] as u64;
    let cg = (raw * CGROUP_WEIGHT_DFL as u64 + 512) / 1024;
    (cg as u32).clamp(CGROUP_WEIGHT_MIN, CGROUP_WEIGHT_MAX)
}

/// Scheduling policy requested by the task itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// SCHED_NORMAL: handled by sched_ext only when the policy switches all
    /// tasks.
    Normal,
    /// SCHED_EXT: always handled by sched_ext while a policy is enabled.
    #[default]
    Ext,
}

/// Ownership of a task while it is on sched_ext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpsState {
    /// Not runnable, or not on sched_ext.
    #[default]
    None,
    /// Handed to ops.enqueue(); owned by the policy until dispatched.
    Queued,
    /// Sitting on a DSQ.
    Dispatched(DsqId),
    /// Executing on a CPU.
    Running(CpuId),
}

/// A dispatch issued from ops.select_cpu(), executed by the core in place of
/// ops.enqueue().
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectDispatch {
    pub dsq_id: DsqId,
    pub slice: u64,
    pub vtime: Option<u64>,
    pub enq_flags: EnqFlags,
}

/// Creation-time attributes of a task.
#[derive(Debug, Clone)]
pub struct TaskAttrs {
    pub pid: Pid,
    pub tgid: Pid,
    pub comm: String,
    pub cgroup: String,
    pub nice: i32,
    pub weight: Weight,
    pub allowed_cpus: Option<Vec<u32>>,
    pub kworker: bool,
    pub policy: SchedPolicy,
}

impl TaskAttrs {
    pub fn new(pid: Pid, comm: &str) -> Self {
        Self {
            pid,
            tgid: pid,
            comm: comm.to_string(),
            cgroup: "/".to_string(),
            nice: 0,
            weight: nice_to_weight(0),
            allowed_cpus: None,
            kworker: false,
            policy: SchedPolicy::Ext,
        }
    }
}

pub type TaskRef = Arc<Task>;

#[derive(Debug)]
pub struct Task {
    pub pid: Pid,
    pub tgid: Pid,
    pub comm: String,
    pub cgroup: String,
    pub nice: i32,
    pub weight: Weight,
    pub cpus_allowed: Cpumask,
    pub kworker: bool,
    pub policy: SchedPolicy,

    slice: AtomicU64,
    dsq_vtime: AtomicU64,
    cpu: AtomicU32,
    runnable_at: AtomicU64,
    disallow: AtomicBool,
    on_scx: AtomicBool,
    prepped: AtomicBool,
    ops_state: Mutex<OpsState>,
    ddsp: Mutex<Option<DirectDispatch>>,
}

impl Task {
    pub fn new(attrs: &TaskAttrs, nr_cpus: usize) -> Result<Task> {
        let cpus_allowed = match &attrs.allowed_cpus {
            Some(cpus) => Cpumask::from_cpus(cpus, nr_cpus)?,
            None => Cpumask::full(nr_cpus),
        };
        if cpus_allowed.is_empty() {
            bail!("{}[{}] has an empty cpumask", attrs.comm, attrs.pid);
        }
        let first = cpus_allowed.first().unwrap_or_default();

        Ok(Task {
            pid: attrs.pid,
            tgid: attrs.tgid,
            comm: attrs.comm.clone(),
            cgroup: attrs.cgroup.clone(),
            nice: attrs.nice,
            weight: attrs.weight.clamp(CGROUP_WEIGHT_MIN, CGROUP_WEIGHT_MAX),
            cpus_allowed,
            kworker: attrs.kworker,
            policy: attrs.policy,
            slice: AtomicU64::new(0),
            dsq_vtime: AtomicU64::new(0),
            cpu: AtomicU32::new(first.0),
            runnable_at: AtomicU64::new(0),
            disallow: AtomicBool::new(false),
            on_scx: AtomicBool::new(false),
            prepped: AtomicBool::new(false),
            ops_state: Mutex::new(OpsState::None),
            ddsp: Mutex::new(None),
        })
    }

    pub fn nr_cpus_allowed(&self) -> usize {
        self.cpus_allowed.weight()
    }

    pub fn slice(&self) -> u64 {
        self.slice.load(Ordering::Relaxed)
    }

    pub fn set_slice(&self, slice: u64) {
        self.slice.store(slice, Ordering::Relaxed);
    }

    /// Charge `ns` of execution against the slice and return what is left.
    pub fn consume_slice(&self, ns: u64) -> u64 {
        let left = self.slice().saturating_sub(ns);
        self.set_slice(left);
        left
    }

    pub fn dsq_vtime(&self) -> u64 {
        self.dsq_vtime.load(Ordering::Relaxed)
    }

    pub fn set_dsq_vtime(&self, vtime: u64) {
        self.dsq_vtime.store(vtime, Ordering::Relaxed);
    }

    pub fn add_dsq_vtime(&self, delta: u64) {
        self.dsq_vtime.fetch_add(delta, Ordering::Relaxed);
    }

    /// CPU the task last ran on or was placed on.
    pub fn cpu(&self) -> CpuId {
        CpuId(self.cpu.load(Ordering::Relaxed))
    }

    pub(crate) fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu.0, Ordering::Relaxed);
    }

    pub fn runnable_at(&self) -> TimeNs {
        self.runnable_at.load(Ordering::Relaxed)
    }

    pub(crate) fn set_runnable_at(&self, now: TimeNs) {
        self.runnable_at.store(now, Ordering::Relaxed);
    }

    /// Set from ops.prep_enable() to keep the task on the default class.
    pub fn set_disallow(&self, disallow: bool) {
        self.disallow.store(disallow, Ordering::Relaxed);
    }

    pub fn disallowed(&self) -> bool {
        self.disallow.load(Ordering::Relaxed)
    }

    /// The task is currently scheduled by sched_ext.
    pub fn on_scx(&self) -> bool {
        self.on_scx.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_scx(&self, on: bool) {
        self.on_scx.store(on, Ordering::Release);
    }

    /// ops.prep_enable() succeeded and ops.disable() is still owed.
    pub(crate) fn prepped(&self) -> bool {
        self.prepped.load(Ordering::Acquire)
    }

    pub(crate) fn set_prepped(&self, prepped: bool) {
        self.prepped.store(prepped, Ordering::Release);
    }

    pub fn ops_state(&self) -> OpsState {
        *lock(&self.ops_state)
    }

    pub(crate) fn ops_state_lock(&self) -> std::sync::MutexGuard<'_, OpsState> {
        lock(&self.ops_state)
    }

    pub(crate) fn set_ddsp(&self, ddsp: DirectDispatch) -> bool {
        let mut slot = lock(&self.ddsp);
        if slot.is_some() {
            return false;
        }
        *slot = Some(ddsp);
        true
    }

    pub(crate) fn take_ddsp(&self) -> Option<DirectDispatch> {
        lock(&self.ddsp).take()
    }
}

/// Per-task policy context with a fixed number of slots, the model of BPF
/// task local storage.
pub struct TaskCtxStore<T> {
    max_entries: usize,
    map: Mutex<HashMap<Pid, Arc<T>>>,
}

impl<T> TaskCtxStore<T> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the context of `pid`. An existing context is returned as is.
    pub fn on_task_enable(&self, pid: Pid, init: impl FnOnce() -> T) -> Result<Arc<T>> {
        let mut map = lock(&self.map);
        if let Some(ctx) = map.get(&pid) {
            return Ok(ctx.clone());
        }
        if map.len() >= self.max_entries {
            bail!(
                "task_ctx storage full ({} entries), can't allocate for pid {}",
                self.max_entries,
                pid
            );
        }
        let ctx = Arc::new(init());
        map.insert(pid, ctx.clone());
        Ok(ctx)
    }

    /// Free the context of `pid`. Freeing twice is harmless.
    pub fn on_task_disable(&self, pid: Pid) -> Option<Arc<T>> {
        lock(&self.map).remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<T>> {
        lock(&self.map).get(&pid).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> Vec<Pid> {
        lock(&self.map).keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_weights() {
        assert_eq!(nice_to_weight(0), 100);
        assert_eq!(nice_to_weight(-20), 8668);
        assert_eq!(nice_to_weight(19), 1);
        assert_eq!(nice_to_weight(-100), nice_to_weight(-20));
        assert!(nice_to_weight(-5) > nice_to_weight(5));
    }

    #[test]
    fn task_from_attrs() {
        let mut attrs = TaskAttrs::new(Pid(3), "worker");
        attrs.allowed_cpus = Some(vec![2, 3]);
        attrs.weight = 0;
        let task = Task::new(&attrs, 4).unwrap();
        assert_eq!(task.nr_cpus_allowed(), 2);
        assert_eq!(task.cpu(), CpuId(2));
        assert_eq!(task.weight, 1);
        assert_eq!(task.ops_state(), OpsState::None);

        attrs.allowed_cpus = Some(vec![]);
        assert!(Task::new(&attrs, 4).is_err());
        attrs.allowed_cpus = Some(vec![9]);
        assert!(Task::new(&attrs, 4).is_err());
    }

    #[test]
    fn slice_accounting_saturates() {
        let task = Task::new(&TaskAttrs::new(Pid(1), "t"), 1).unwrap();
        task.set_slice(5);
        assert_eq!(task.consume_slice(3), 2);
        assert_eq!(task.consume_slice(3), 0);
    }

    #[test]
    fn task_ctx_store_is_bounded_and_idempotent() {
        let store: TaskCtxStore<u32> = TaskCtxStore::new(2);
        assert_eq!(*store.on_task_enable(Pid(1), || 10).unwrap(), 10);
        assert_eq!(*store.on_task_enable(Pid(1), || 11).unwrap(), 10);
        store.on_task_enable(Pid(2), || 20).unwrap();
        assert!(store.on_task_enable(Pid(3), || 30).is_err());

        assert!(store.on_task_disable(Pid(1)).is_some());
        assert!(store.on_task_disable(Pid(1)).is_none());
        assert!(store.get(Pid(1)).is_none());
        store.on_task_enable(Pid(3), || 30).unwrap();
        assert_eq!(store.len(), 2);
    }
}
