// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use scx_core::*;
use scx_qmap::QmapConfig;
use scx_qmap::QmapOps;
use std::sync::Arc;

const MS: u64 = 1_000_000;

struct Setup {
    ops: Arc<QmapOps>,
    handle: SchedHandle,
    _link: ScxLink,
    engine: Engine,
}

fn setup(nr_cpus: u32, qcfg: QmapConfig, timeout_ms: Option<u32>) -> Setup {
    let ops = Arc::new(QmapOps::new(nr_cpus, qcfg));
    let clock = Arc::new(SimClock::new(0));
    let cfg = ScxConfig {
        nr_cpus,
        timeout_ms,
        tick_ns: MS,
        ..Default::default()
    };
    let handle = SchedHandle::open_and_load(ops.clone(), &cfg, clock.clone()).unwrap();
    let link = handle.attach().unwrap();
    let engine = Engine::new(handle.session().clone(), clock, cfg.tick_ns).unwrap();
    Setup {
        ops,
        handle,
        _link: link,
        engine,
    }
}

#[test]
fn test_heavy_ring_drawn_more_often() {
    let mut s = setup(1, QmapConfig::default(), None);
    for pid in 1..=8 {
        s.engine
            .add_task(&TaskDef::new(Pid(pid), "heavy", TaskBehavior::cpu_bound()).weight(500))
            .unwrap();
    }
    for pid in 11..=18 {
        s.engine
            .add_task(&TaskDef::new(Pid(pid), "light", TaskBehavior::cpu_bound()).weight(10))
            .unwrap();
    }
    s.engine.run_for(3000 * MS);

    let trace = s.engine.trace();
    let heavy: u64 = (1..=8).map(|pid| trace.total_runtime(Pid(pid))).sum();
    let light: u64 = (11..=18).map(|pid| trace.total_runtime(Pid(pid))).sum();
    assert!(light > 0, "light tasks starved");
    assert!(heavy > light * 4, "heavy={} light={}", heavy, light);

    let lens = s.ops.queue_lens();
    assert_eq!(lens[1] + lens[2] + lens[3], 0);
    assert!(s.handle.session().scx_enabled());
}

/// Tasks of weight 10, 40, 100, 300 and 500 land on rings 0-4. With every
/// ring backed up, each run of 31 dispatches on a CPU draws 1, 2, 4, 8 and 16
/// tasks from them.
#[test]
fn test_dispatch_draws_rings_1_2_4_8_16() {
    const PER_RING: i32 = 64;
    let nr_cpus = 2;
    let ops = Arc::new(QmapOps::new(nr_cpus, QmapConfig::default()));
    let clock = Arc::new(SimClock::new(0));
    let cfg = ScxConfig {
        nr_cpus,
        tick_ns: MS,
        ..Default::default()
    };
    let handle = SchedHandle::open_and_load(ops.clone(), &cfg, clock).unwrap();
    let _link = handle.attach().unwrap();
    let sess = handle.session();

    let mut tasks = vec![];
    for (ring, weight) in [10, 40, 100, 300, 500].into_iter().enumerate() {
        for i in 0..PER_RING {
            let pid = Pid(ring as i32 * PER_RING + i + 1);
            let mut attrs = TaskAttrs::new(pid, "t");
            attrs.weight = weight;
            tasks.push(sess.register_task(&attrs).unwrap());
        }
    }
    for task in &tasks {
        sess.wakeup(task, WakeFlags::TTWU, None);
    }

    // An early wakeup may go straight to an idle CPU. Run that one first so
    // every later pick comes from a ring.
    assert!(sess.schedule(CpuId(0), PrevState::Blocked).is_some());
    assert!(sess.local_pids(CpuId(0)).is_empty());

    let start = ops.queue_lens();
    let drawn = |lens: [usize; 5]| -> Vec<usize> {
        start.iter().zip(lens.iter()).map(|(a, b)| a - b).collect()
    };

    for _ in 0..31 {
        assert!(sess.schedule(CpuId(0), PrevState::Blocked).is_some());
    }
    assert_eq!(drawn(ops.queue_lens()), vec![1, 2, 4, 8, 16]);

    for _ in 0..62 {
        assert!(sess.schedule(CpuId(0), PrevState::Blocked).is_some());
    }
    assert_eq!(drawn(ops.queue_lens()), vec![3, 6, 12, 24, 48]);
    assert_eq!(ops.stats().overflow, 0);
    assert!(sess.scx_enabled());
}

#[test]
fn test_full_ring_overflows_to_global() {
    let mut s = setup(
        2,
        QmapConfig {
            ring_capacity: 2,
            ..Default::default()
        },
        None,
    );
    for pid in 1..=10 {
        s.engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::periodic(3 * MS, MS)))
            .unwrap();
    }
    s.engine.run_for(500 * MS);

    let stats = s.ops.stats();
    assert!(stats.overflow > 0, "{:?}", stats);
    assert!(stats.dsp > 0, "{:?}", stats);
    for pid in 1..=10 {
        assert!(s.engine.trace().total_runtime(Pid(pid)) > 0, "pid {}", pid);
    }
    assert!(s.handle.session().scx_enabled());
}

#[test]
fn test_error_after_count() {
    let mut s = setup(
        2,
        QmapConfig {
            error_after: 20,
            ..Default::default()
        },
        None,
    );
    for pid in 1..=4 {
        s.engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::periodic(2 * MS, 2 * MS)))
            .unwrap();
    }
    s.engine.run_for(500 * MS);

    let sess = s.handle.session();
    assert!(!sess.scx_enabled());
    assert_eq!(sess.exit_kind(), ScxExitKind::ErrorBpf);
    assert_eq!(s.ops.exit_info().unwrap().msg, "test triggering error");
    assert!(s.handle.exit_info().report().is_err());
    assert!(s.engine.trace().schedule_count_in(SchedClass::Fair) > 0);
}

#[test]
fn test_stalled_user_task_trips_watchdog() {
    let mut s = setup(
        2,
        QmapConfig {
            stall_user_nth: 3,
            ..Default::default()
        },
        Some(500),
    );
    for pid in 1..=4 {
        s.engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::periodic(2 * MS, 5 * MS)))
            .unwrap();
    }
    s.engine.run_for(2000 * MS);

    let (at, kind) = s.engine.trace().disabled_at().unwrap();
    assert_eq!(kind, ScxExitKind::ErrorStall);
    assert!(at > 500 * MS, "stalled early at {}", at);
    assert!(s.ops.exit_info().unwrap().msg.contains("failed to run for"));
}

#[test]
fn test_kernel_stall_spares_user_tasks() {
    let mut s = setup(
        2,
        QmapConfig {
            stall_kernel_nth: 2,
            ..Default::default()
        },
        Some(500),
    );
    for pid in 1..=4 {
        s.engine
            .add_task(&TaskDef::new(Pid(pid), "t", TaskBehavior::periodic(2 * MS, 5 * MS)))
            .unwrap();
    }
    s.engine.run_for(1500 * MS);
    assert!(s.handle.session().scx_enabled());

    s.engine
        .add_task(
            &TaskDef::new(Pid(50), "kworker/0:1", TaskBehavior::periodic(MS, 5 * MS))
                .kworker()
                .cpus(&[0]),
        )
        .unwrap();
    s.engine.run_for(1500 * MS);
    assert_eq!(
        s.engine.trace().disabled_at().map(|(_, kind)| kind),
        Some(ScxExitKind::ErrorStall)
    );
}

#[test]
fn test_disallowed_tgid_stays_on_fair() {
    let mut s = setup(
        2,
        QmapConfig {
            disallow_tgid: Some(Pid(300)),
            ..Default::default()
        },
        None,
    );
    let outsider = s
        .engine
        .add_task(
            &TaskDef::new(Pid(301), "outsider", TaskBehavior::periodic(2 * MS, 2 * MS))
                .tgid(Pid(300)),
        )
        .unwrap();
    let insider = s
        .engine
        .add_task(&TaskDef::new(Pid(1), "insider", TaskBehavior::periodic(2 * MS, 2 * MS)))
        .unwrap();
    s.engine.run_for(100 * MS);

    let sess = s.handle.session();
    assert!(!sess.task_on_scx(&outsider));
    assert!(sess.task_on_scx(&insider));
    assert!(s.engine.trace().total_runtime(Pid(301)) > 0);
    assert!(s.engine.trace().total_runtime(Pid(1)) > 0);
}
