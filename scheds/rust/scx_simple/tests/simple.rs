// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use scx_core::*;
use scx_simple::SimpleOps;
use scx_simple::SHARED_DSQ;
use std::sync::Arc;

const MS: u64 = 1_000_000;

fn setup(nr_cpus: u32, fifo: bool) -> (Arc<SimpleOps>, SchedHandle, ScxLink, Engine) {
    let ops = Arc::new(SimpleOps::new(nr_cpus, fifo));
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

fn scheduled_between(trace: &Trace, pid: Pid, from: u64, to: u64) -> bool {
    trace.events().iter().any(|e| {
        e.time_ns >= from
            && e.time_ns < to
            && matches!(e.kind, TraceKind::TaskScheduled { pid: p, .. } if p == pid)
    })
}

#[test]
fn test_vtime_follows_weight() {
    let (_ops, _handle, _link, mut engine) = setup(1, false);
    engine
        .add_task(&TaskDef::new(Pid(1), "heavy", TaskBehavior::cpu_bound()).weight(200))
        .unwrap();
    for pid in 2..=3 {
        engine
            .add_task(&TaskDef::new(Pid(pid), "light", TaskBehavior::cpu_bound()).weight(100))
            .unwrap();
    }
    engine.run_for(2000 * MS);

    let heavy = engine.trace().total_runtime(Pid(1));
    let light = engine.trace().total_runtime(Pid(2));
    assert!(light > 0);
    assert!(engine.trace().total_runtime(Pid(3)) > 0);
    assert!(
        heavy as f64 > light as f64 * 1.5,
        "heavy={} light={}",
        heavy,
        light
    );
    assert!(engine.session().scx_enabled());
}

#[test]
fn test_sleeper_budget_is_capped() {
    let (_ops, _handle, _link, mut engine) = setup(1, false);
    engine
        .add_task(&TaskDef::new(Pid(1), "a", TaskBehavior::cpu_bound()))
        .unwrap();
    engine
        .add_task(&TaskDef::new(Pid(2), "b", TaskBehavior::cpu_bound()))
        .unwrap();
    // Enabled at vtime 0 and woken a second later.
    engine
        .add_task(&TaskDef::new(Pid(3), "late", TaskBehavior::cpu_bound()).start_at(1000 * MS))
        .unwrap();
    engine.run_for(1200 * MS);

    let trace = engine.trace();
    assert!(scheduled_between(trace, Pid(3), 1000 * MS, 1200 * MS));
    assert!(scheduled_between(trace, Pid(1), 1001 * MS, 1200 * MS));
    assert!(scheduled_between(trace, Pid(2), 1001 * MS, 1200 * MS));
}

#[test]
fn test_fifo_runs_everything() {
    let (ops, handle, _link, mut engine) = setup(2, true);
    for pid in 1..=10 {
        engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::oneshot(5 * MS)))
            .unwrap();
    }
    engine.run_for(100 * MS);

    for pid in 1..=10 {
        assert!(engine.trace().completed(Pid(pid)));
    }
    let stats = ops.stats();
    assert!(stats.local >= 1, "{:?}", stats);
    assert!(stats.global >= 8, "{:?}", stats);
    assert!(stats.local + stats.global <= handle.poll_stats().nr_enqueued);
    assert!(handle.session().dsq_pids(SHARED_DSQ).is_empty());
}

#[test]
fn test_unregister_reaches_exit() {
    let (ops, handle, link, mut engine) = setup(2, false);
    for def in mixed_workload(16, 2, 100, 3) {
        engine.add_task(&def).unwrap();
    }
    engine.run_for(300 * MS);
    drop(link);
    engine.run_for(50 * MS);

    let info = ops.exit_info().unwrap();
    assert_eq!(info.kind, ScxExitKind::Unreg);
    assert!(handle.exit_info().report().is_ok());
    assert!(engine.trace().schedule_count_in(SchedClass::Fair) > 0);
}
