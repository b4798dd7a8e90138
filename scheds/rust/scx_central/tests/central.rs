// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use scx_central::CentralConfig;
use scx_central::CentralOps;
use scx_core::*;
use std::sync::Arc;

const MS: u64 = 1_000_000;

fn setup(nr_cpus: u32, ccfg: CentralConfig) -> (Arc<CentralOps>, SchedHandle, ScxLink, Engine) {
    let ops = Arc::new(CentralOps::new(nr_cpus, ccfg).unwrap());
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

#[test]
fn test_central_cpu_feeds_the_others() {
    let (ops, handle, _link, mut engine) = setup(4, CentralConfig::default());
    for pid in 1..=8 {
        engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::periodic(3 * MS, 4 * MS)))
            .unwrap();
    }
    engine.run_for(500 * MS);

    assert!(handle.session().scx_enabled());
    let trace = engine.trace();
    for pid in 1..=8 {
        assert!(trace.total_runtime(Pid(pid)) > 0, "pid {} never ran", pid);
    }
    let remote = (1..=8)
        .flat_map(|pid| trace.cpus_of(Pid(pid)))
        .any(|cpu| cpu != CpuId(0));
    assert!(remote, "nothing ran outside of the central CPU");

    let stats = ops.stats();
    assert!(stats.queued > 0, "{:?}", stats);
    assert!(stats.started > 0, "{:?}", stats);
    assert_eq!(stats.lost, 0);
    assert_eq!(stats.overflow, 0);
}

#[test]
fn test_timer_enforces_slices() {
    let (ops, handle, _link, mut engine) = setup(
        2,
        CentralConfig {
            slice_ns: 10 * MS,
            ..Default::default()
        },
    );
    for pid in 1..=3 {
        engine
            .add_task(&TaskDef::new(Pid(pid), "hog", TaskBehavior::cpu_bound()))
            .unwrap();
    }
    engine.run_for(1000 * MS);

    assert!(handle.session().scx_enabled());
    for pid in 1..=3 {
        assert!(engine.trace().total_runtime(Pid(pid)) > 0, "pid {} starved", pid);
    }
    assert!(ops.stats().kicked > 0);
}

#[test]
fn test_pinned_kthread_runs_locally() {
    let (ops, _handle, _link, mut engine) = setup(4, CentralConfig::default());
    for pid in 1..=4 {
        engine
            .add_task(&TaskDef::new(Pid(pid), "hog", TaskBehavior::cpu_bound()))
            .unwrap();
    }
    engine
        .add_task(
            &TaskDef::new(Pid(50), "kworker/2:0", TaskBehavior::periodic(MS, 10 * MS))
                .kworker()
                .cpus(&[2]),
        )
        .unwrap();
    engine.run_for(300 * MS);

    assert!(ops.stats().local > 0);
    assert!(engine.trace().cpus_of(Pid(50)).iter().all(|&cpu| cpu == CpuId(2)));
    assert!(engine.trace().schedule_count(Pid(50)) > 5);
}

#[test]
fn test_queue_overflow_goes_to_fallback() {
    let (ops, handle, _link, mut engine) = setup(
        2,
        CentralConfig {
            queue_capacity: 1,
            ..Default::default()
        },
    );
    for pid in 1..=8 {
        engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::periodic(2 * MS, 3 * MS)))
            .unwrap();
    }
    engine.run_for(500 * MS);

    // The queue keeps draining while FALLBACK is busy and nothing stalls.
    assert!(handle.session().scx_enabled());
    assert!(ops.exit_info().is_none());
    let stats = ops.stats();
    assert!(stats.overflow > 0);
    assert!(stats.started > 0);
    for pid in 1..=8 {
        assert!(engine.trace().total_runtime(Pid(pid)) > 0, "pid {} never ran", pid);
        assert!(engine.trace().schedule_count(Pid(pid)) > 1, "pid {} stuck", pid);
    }
}

#[test]
fn test_central_cpu_option() {
    let (ops, _handle, _link, mut engine) = setup(
        3,
        CentralConfig {
            central_cpu: CpuId(2),
            ..Default::default()
        },
    );
    assert_eq!(ops.central_cpu(), CpuId(2));
    for pid in 1..=4 {
        engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::oneshot(5 * MS)))
            .unwrap();
    }
    engine.run_for(100 * MS);
    for pid in 1..=4 {
        assert!(engine.trace().completed(Pid(pid)));
    }
}
