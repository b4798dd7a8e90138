// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A demo sched_ext core-scheduler which always makes every sibling CPU pair
//! execute from the same CPU cgroup.
//!
//! Each CPU in the system is paired with exactly one other CPU, according
//! to a "stride" value that can be specified when the scheduler is loaded.
//! Each CPU pair only executes tasks from a single cgroup at a time.
//!
//! Every cgroup has its own FIFO of pids. A cgroup with queued tasks sits on
//! the top-level queue. When a pair needs a new cgroup it pops the next one
//! from the top-level queue and both CPUs execute from it for one batch.
//! Once the batch expires, the pair drains: neither CPU picks up new work
//! until both stopped executing the expiring cgroup, and only then does the
//! pair move on to the next one.

use anyhow::bail;
use anyhow::Result;
use scx_core::scx_bpf_error;
use scx_core::vtime_before;
use scx_core::BoundedQueue;
use scx_core::CpuId;
use scx_core::DsqId;
use scx_core::EnqFlags;
use scx_core::ExitInfo;
use scx_core::KickFlags;
use scx_core::OpsFlags;
use scx_core::PerCpuCounters;
use scx_core::Pid;
use scx_core::SchedOps;
use scx_core::ScxCtx;
use scx_core::TaskRef;
use scx_core::TimeNs;
use scx_core::WakeFlags;
use scx_core::SCX_SLICE_DFL;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

pub const MAX_CGRPS: usize = 4096;
pub const MAX_QUEUED_PER_CGRP: usize = 4096;
pub const PAIR_BATCH_DUR_NS: u64 = SCX_SLICE_DFL;

const MAX_DISPATCH_LOOPS: usize = 8;

const STAT_TOTAL: usize = 0;
const STAT_DISPATCHED: usize = 1;
const STAT_MISSING: usize = 2;
const STAT_KICKS: usize = 3;
const STAT_PREEMPTIONS: usize = 4;
const STAT_EXP: usize = 5;
const STAT_EXP_EMPTY: usize = 6;
const STAT_EXP_DRAIN: usize = 7;
const NR_STATS: usize = 8;

/// Which CPU is paired with which.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairTable {
    pair_cpu: Vec<CpuId>,
    pair_id: Vec<usize>,
    in_pair_idx: Vec<u8>,
}

impl PairTable {
    /// Pair CPU `i` with CPU `(i + stride) % nr_cpus`. Every CPU must end
    /// up in exactly one pair of two distinct CPUs.
    pub fn new(nr_cpus: u32, stride: u32) -> Result<Self> {
        let n = nr_cpus as usize;
        let mut pair_cpu: Vec<Option<usize>> = vec![None; n];
        let mut pair_id = vec![0; n];
        let mut in_pair_idx = vec![0; n];

        for i in 0..n {
            let j = (i + stride as usize) % n;
            if pair_cpu[i].is_some() {
                continue;
            }
            if i == j {
                bail!("Invalid stride {} - CPU{} wants to be its own pair", stride, i);
            }
            if let Some(k) = pair_cpu[j] {
                bail!(
                    "Invalid stride {} - three CPUs ({}, {}, {}) want to be a pair",
                    stride,
                    i,
                    j,
                    k
                );
            }
            pair_cpu[i] = Some(j);
            pair_cpu[j] = Some(i);
            pair_id[i] = i;
            pair_id[j] = i;
            in_pair_idx[i] = 0;
            in_pair_idx[j] = 1;
        }

        Ok(Self {
            pair_cpu: pair_cpu
                .into_iter()
                .map(|cpu| CpuId(cpu.unwrap_or_default() as u32))
                .collect(),
            pair_id,
            in_pair_idx,
        })
    }

    pub fn pair_of(&self, cpu: CpuId) -> CpuId {
        self.pair_cpu[cpu.idx()]
    }

    pub fn pair_id(&self, cpu: CpuId) -> usize {
        self.pair_id[cpu.idx()]
    }

    /// All pairs, lower CPU first.
    pub fn pairs(&self) -> Vec<(CpuId, CpuId)> {
        self.pair_cpu
            .iter()
            .enumerate()
            .filter(|(i, j)| *i < j.idx())
            .map(|(i, j)| (CpuId(i as u32), *j))
            .collect()
    }

    fn in_pair_mask(&self, cpu: CpuId) -> u8 {
        1 << self.in_pair_idx[cpu.idx()]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairStats {
    pub total: u64,
    pub dispatched: u64,
    pub missing: u64,
    pub kicks: u64,
    pub preemptions: u64,
    pub exp: u64,
    pub exp_empty: u64,
    pub exp_drain: u64,
}

#[derive(Debug, Default)]
struct PairCtx {
    started_at: TimeNs,
    cgrp: Option<usize>,
    active_mask: u8,
    draining: bool,
}

#[derive(Debug)]
struct CgrpQueue {
    pids: BoundedQueue<Pid>,
    len: AtomicU64,
    on_top_q: AtomicBool,
}

enum TryDispatch {
    Dispatched,
    Again,
    Stop,
}

pub struct PairOps {
    pairs: PairTable,
    cgrp_idx: Mutex<HashMap<String, usize>>,
    cgrp_names: Mutex<Vec<String>>,
    cgrp_qs: Vec<CgrpQueue>,
    top_q: BoundedQueue<usize>,
    pair_ctxs: Vec<Mutex<PairCtx>>,
    stats: PerCpuCounters,
    exit: Mutex<Option<ExitInfo>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PairOps {
    pub fn new(nr_cpus: u32, stride: u32) -> Result<Self> {
        let pairs = PairTable::new(nr_cpus, stride)?;
        Ok(Self {
            pairs,
            cgrp_idx: Mutex::new(HashMap::new()),
            cgrp_names: Mutex::new(vec![]),
            cgrp_qs: (0..MAX_CGRPS)
                .map(|_| CgrpQueue {
                    pids: BoundedQueue::new(MAX_QUEUED_PER_CGRP),
                    len: AtomicU64::new(0),
                    on_top_q: AtomicBool::new(false),
                })
                .collect(),
            top_q: BoundedQueue::new(MAX_CGRPS),
            pair_ctxs: (0..nr_cpus).map(|_| Mutex::new(PairCtx::default())).collect(),
            stats: PerCpuCounters::new(nr_cpus as usize, NR_STATS),
            exit: Mutex::new(None),
        })
    }

    pub fn pairs(&self) -> &PairTable {
        &self.pairs
    }

    pub fn stats(&self) -> PairStats {
        let raw = self.stats.read();
        PairStats {
            total: raw[STAT_TOTAL],
            dispatched: raw[STAT_DISPATCHED],
            missing: raw[STAT_MISSING],
            kicks: raw[STAT_KICKS],
            preemptions: raw[STAT_PREEMPTIONS],
            exp: raw[STAT_EXP],
            exp_empty: raw[STAT_EXP_EMPTY],
            exp_drain: raw[STAT_EXP_DRAIN],
        }
    }

    /// Cgroup the pair of `cpu` is currently executing, if any.
    pub fn pair_cgroup(&self, cpu: CpuId) -> Option<String> {
        let cgrp = lock(&self.pair_ctxs[self.pairs.pair_id(cpu)]).cgrp?;
        lock(&self.cgrp_names).get(cgrp).cloned()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        lock(&self.exit).clone()
    }

    fn cgrp_of(&self, cgroup: &str) -> Option<usize> {
        lock(&self.cgrp_idx).get(cgroup).copied()
    }

    fn alloc_cgrp(&self, cgroup: &str) -> Result<usize> {
        let mut idx = lock(&self.cgrp_idx);
        if let Some(&q) = idx.get(cgroup) {
            return Ok(q);
        }
        let q = idx.len();
        if q >= MAX_CGRPS {
            bail!("out of cgroup queues for {}", cgroup);
        }
        idx.insert(cgroup.to_string(), q);
        lock(&self.cgrp_names).push(cgroup.to_string());
        Ok(q)
    }

    /// Put `cgrp` on the top-level queue unless it is already there.
    fn push_top(&self, ctx: &ScxCtx, cgrp: usize) {
        let cgq = &self.cgrp_qs[cgrp];
        if cgq.on_top_q.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.top_q.push(cgrp).is_err() {
            scx_bpf_error!(ctx, "top_q overflow");
        }
    }

    fn pop_top(&self) -> Option<usize> {
        while let Some(cgrp) = self.top_q.pop() {
            let cgq = &self.cgrp_qs[cgrp];
            cgq.on_top_q.store(false, Ordering::Release);
            if cgq.len.load(Ordering::Acquire) > 0 {
                return Some(cgrp);
            }
        }
        None
    }

    /// Take one queued task off `cgrp`, `None` if it ran empty.
    fn claim(&self, cgrp: usize) -> Option<Pid> {
        let cgq = &self.cgrp_qs[cgrp];
        cgq.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| len.checked_sub(1))
            .ok()?;
        cgq.pids.pop()
    }

    fn try_dispatch(&self, ctx: &ScxCtx, cpu: CpuId) -> TryDispatch {
        let pairc_lock = &self.pair_ctxs[self.pairs.pair_id(cpu)];
        let in_pair_mask = self.pairs.in_pair_mask(cpu);
        let now = ctx.now();
        let mut kick_pair = false;

        let cgrp = {
            let mut pairc = lock(pairc_lock);
            pairc.active_mask &= !in_pair_mask;

            let expired = pairc.cgrp.is_none()
                || vtime_before(pairc.started_at.wrapping_add(PAIR_BATCH_DUR_NS), now);
            if expired || pairc.draining {
                self.stats.inc(cpu, STAT_EXP);
                pairc.draining = true;

                // The pair CPU still executes the expiring cgroup.
                if pairc.active_mask != 0 {
                    self.stats.inc(cpu, STAT_EXP_DRAIN);
                    return TryDispatch::Stop;
                }

                if let Some(old) = pairc.cgrp.take() {
                    if self.cgrp_qs[old].len.load(Ordering::Acquire) > 0 {
                        self.push_top(ctx, old);
                    }
                }
                let Some(next) = self.pop_top() else {
                    self.stats.inc(cpu, STAT_EXP_EMPTY);
                    return TryDispatch::Stop;
                };
                pairc.cgrp = Some(next);
                pairc.started_at = now;
                pairc.draining = false;
                kick_pair = true;
            }

            pairc.active_mask |= in_pair_mask;
            match pairc.cgrp {
                Some(cgrp) => cgrp,
                None => return TryDispatch::Stop,
            }
        };

        let Some(pid) = self.claim(cgrp) else {
            // The cgroup ran out of tasks, move on.
            let mut pairc = lock(pairc_lock);
            pairc.draining = true;
            pairc.active_mask &= !in_pair_mask;
            return TryDispatch::Again;
        };

        let res = match ctx.task_from_pid(pid) {
            Some(task) => {
                self.stats.inc(cpu, STAT_DISPATCHED);
                ctx.dispatch(&task, DsqId::LOCAL, SCX_SLICE_DFL, EnqFlags::NONE);
                TryDispatch::Dispatched
            }
            None => {
                // Dequeues aren't tracked, retry on lost tasks.
                self.stats.inc(cpu, STAT_MISSING);
                TryDispatch::Again
            }
        };

        if kick_pair {
            let pair = self.pairs.pair_of(cpu);
            self.stats.inc(cpu, STAT_KICKS);
            if ctx.cpu_curr(pair).is_some() {
                self.stats.inc(cpu, STAT_PREEMPTIONS);
            }
            ctx.kick_cpu(pair, KickFlags::PREEMPT);
        }
        res
    }
}

impl SchedOps for PairOps {
    fn name(&self) -> &str {
        "pair"
    }

    // The last task must go through ops.enqueue() so that it can't keep
    // running past its cgroup's batch.
    fn flags(&self) -> OpsFlags {
        OpsFlags::ENQ_LAST
    }

    fn exit(&self, info: &ExitInfo) {
        *lock(&self.exit) = Some(info.clone());
    }

    fn prep_enable(&self, _ctx: &ScxCtx, task: &TaskRef) -> Result<()> {
        self.alloc_cgrp(&task.cgroup)?;
        Ok(())
    }

    // No direct dispatch. Every task has to wait for its cgroup's turn.
    fn select_cpu(
        &self,
        _ctx: &ScxCtx,
        _task: &TaskRef,
        prev_cpu: CpuId,
        _wake_flags: WakeFlags,
    ) -> CpuId {
        prev_cpu
    }

    fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, _enq_flags: EnqFlags) {
        let Some(cgrp) = self.cgrp_of(&task.cgroup) else {
            scx_bpf_error!(ctx, "failed to lookup q_idx for cgroup {}", task.cgroup);
            return;
        };

        let cgq = &self.cgrp_qs[cgrp];
        if cgq.pids.push(task.pid).is_err() {
            scx_bpf_error!(ctx, "cgroup queue of {} overflowed", task.cgroup);
            return;
        }
        cgq.len.fetch_add(1, Ordering::AcqRel);
        self.push_top(ctx, cgrp);
        self.stats.inc(ctx.cpu(), STAT_TOTAL);
    }

    fn dispatch(&self, ctx: &ScxCtx, cpu: CpuId, _prev: Option<&TaskRef>) {
        for _ in 0..MAX_DISPATCH_LOOPS {
            match self.try_dispatch(ctx, cpu) {
                TryDispatch::Again => continue,
                TryDispatch::Dispatched | TryDispatch::Stop => break,
            }
        }
    }
}
