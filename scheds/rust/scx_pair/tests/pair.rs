// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use scx_core::*;
use scx_pair::PairOps;
use std::collections::HashMap;
use std::sync::Arc;

const MS: u64 = 1_000_000;

fn setup(nr_cpus: u32, stride: u32) -> (Arc<PairOps>, SchedHandle, ScxLink, Engine) {
    let ops = Arc::new(PairOps::new(nr_cpus, stride).unwrap());
    let clock = Arc::new(SimClock::new(0));
    let cfg = ScxConfig {
        nr_cpus,
        tick_ns: MS,
        ..Default::default()
    };
    let handle = SchedHandle::open_and_load(ops.clone(), &cfg, clock.clone()).unwrap();
    let link = handle.attach().unwrap();
    let engine = Engine::new(handle.session().clone(), clock, cfg.tick_ns).unwrap();
    (ops, handle, link, engine)
}

/// Per-CPU `(pid, start, end)` execution intervals under the policy.
fn intervals(trace: &Trace, nr_cpus: u32, end_ns: u64) -> Vec<Vec<(Pid, u64, u64)>> {
    let mut out = vec![vec![]; nr_cpus as usize];
    let mut curr: Vec<Option<(Pid, u64)>> = vec![None; nr_cpus as usize];

    for e in trace.events() {
        let cpu = e.cpu.idx();
        match e.kind {
            TraceKind::TaskScheduled { pid, class } => {
                if let Some((p, start)) = curr[cpu].take() {
                    out[cpu].push((p, start, e.time_ns));
                }
                if class == SchedClass::Ext {
                    curr[cpu] = Some((pid, e.time_ns));
                }
            }
            TraceKind::TaskPreempted { pid }
            | TraceKind::TaskSlept { pid }
            | TraceKind::TaskCompleted { pid } => {
                for (c, slot) in curr.iter_mut().enumerate() {
                    if matches!(slot, Some((p, _)) if *p == pid) {
                        if let Some((p, start)) = slot.take() {
                            out[c].push((p, start, e.time_ns));
                        }
                    }
                }
            }
            TraceKind::CpuIdle => {
                if let Some((p, start)) = curr[cpu].take() {
                    out[cpu].push((p, start, e.time_ns));
                }
            }
            _ => {}
        }
    }
    for (cpu, slot) in curr.into_iter().enumerate() {
        if let Some((p, start)) = slot {
            out[cpu].push((p, start, end_ns));
        }
    }
    out
}

#[test]
fn test_pair_runs_one_cgroup_at_a_time() {
    let (ops, handle, _link, mut engine) = setup(4, 2);
    let mut cgroup_of = HashMap::new();
    for pid in 1..=8 {
        let cgroup = if pid % 2 == 0 { "/a" } else { "/b" };
        cgroup_of.insert(Pid(pid), cgroup);
        engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::cpu_bound()).cgroup(cgroup))
            .unwrap();
    }
    engine.run_for(1000 * MS);
    assert!(handle.session().scx_enabled());

    let trace = engine.trace();
    let ivs = intervals(trace, 4, engine.now());
    for (a, b) in ops.pairs().pairs() {
        for &(pa, sa, ea) in &ivs[a.idx()] {
            for &(pb, sb, eb) in &ivs[b.idx()] {
                if cgroup_of[&pa] == cgroup_of[&pb] {
                    continue;
                }
                let overlap = ea.min(eb).saturating_sub(sa.max(sb));
                assert_eq!(
                    overlap, 0,
                    "CPU{} ran {} ({}) while CPU{} ran {} ({}) at {}",
                    a, pa, cgroup_of[&pa], b, pb, cgroup_of[&pb], sa.max(sb)
                );
            }
        }
    }

    for pid in 1..=8 {
        assert!(trace.total_runtime(Pid(pid)) > 0, "pid {} never ran", pid);
    }
    let stats = ops.stats();
    assert!(stats.dispatched > 0, "{:?}", stats);
    assert!(stats.exp > 0, "{:?}", stats);
    assert!(stats.kicks > 0, "{:?}", stats);
    assert_eq!(stats.missing, 0);
}

#[test]
fn test_idle_pair_reports_empty_top_queue() {
    let (ops, _handle, _link, mut engine) = setup(2, 1);
    engine
        .add_task(&TaskDef::new(Pid(1), "short", TaskBehavior::oneshot(5 * MS)).cgroup("/a"))
        .unwrap();
    engine.run_for(100 * MS);

    assert!(engine.trace().completed(Pid(1)));
    let stats = ops.stats();
    assert!(stats.exp_empty > 0, "{:?}", stats);
    assert_eq!(stats.total, 1);
}

#[test]
fn test_batch_expiry_rotates_cgroups() {
    let (ops, _handle, _link, mut engine) = setup(2, 1);
    for (pid, cgroup) in [(1, "/a"), (2, "/a"), (3, "/b"), (4, "/b")] {
        engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::cpu_bound()).cgroup(cgroup))
            .unwrap();
    }

    let mut seen = vec![];
    for _ in 0..40 {
        engine.run_for(10 * MS);
        if let Some(cgroup) = ops.pair_cgroup(CpuId(0)) {
            if seen.last() != Some(&cgroup) {
                seen.push(cgroup);
            }
        }
    }
    assert!(seen.len() >= 4, "cgroups didn't rotate: {:?}", seen);
    assert!(ops.stats().exp_drain > 0 || ops.stats().exp > 0);
}

#[test]
fn test_invalid_stride() {
    let err = PairOps::new(4, 0).err().unwrap();
    assert!(err.to_string().contains("wants to be its own pair"));
    let err = PairOps::new(3, 1).err().unwrap();
    assert!(err.to_string().contains("three CPUs"));
}
