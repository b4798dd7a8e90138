// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use scx_core::*;
use scx_layered::alloc::LayerCpuAllocator;
use scx_layered::config::example_config;
use scx_layered::stats::Stats;
use scx_layered::GlobalStat;
use scx_layered::LayerCommon;
use scx_layered::LayerKind;
use scx_layered::LayerMatch;
use scx_layered::LayerSpec;
use scx_layered::LayerStat;
use scx_layered::LayeredOps;
use std::io::Write;
use std::sync::Arc;

const MS: u64 = 1_000_000;

struct Setup {
    ops: Arc<LayeredOps>,
    _handle: SchedHandle,
    _link: ScxLink,
    engine: Engine,
}

fn setup(nr_cpus: u32, specs: &[LayerSpec]) -> Setup {
    let ops = Arc::new(LayeredOps::new(nr_cpus as usize, specs, 20 * MS).unwrap());
    let clock = Arc::new(SimClock::new(0));
    let cfg = ScxConfig {
        nr_cpus,
        tick_ns: MS,
        ..Default::default()
    };
    let handle = SchedHandle::open_and_load(ops.clone(), &cfg, clock.clone()).unwrap();
    let link = handle.attach().unwrap();
    let engine = Engine::new(handle.session().clone(), clock, cfg.tick_ns).unwrap();
    Setup {
        ops,
        _handle: handle,
        _link: link,
        engine,
    }
}

fn spec(name: &str, matches: Vec<Vec<LayerMatch>>, kind: LayerKind) -> LayerSpec {
    LayerSpec {
        name: name.into(),
        comment: None,
        matches,
        kind,
    }
}

fn confined(name: &str, comm: &str) -> LayerSpec {
    spec(
        name,
        vec![vec![LayerMatch::CommPrefix(comm.into())]],
        LayerKind::Confined {
            util_range: (0.5, 0.6),
            cpus_range: None,
            common: LayerCommon::default(),
        },
    )
}

fn open_rest() -> LayerSpec {
    spec(
        "rest",
        vec![vec![]],
        LayerKind::Open {
            common: LayerCommon::default(),
        },
    )
}

fn add(s: &mut Setup, def: TaskDef) {
    s.engine.add_task(&def).unwrap();
}

/// CPUs `pid` was scheduled on at or after `since`.
fn cpus_since(engine: &Engine, pid: Pid, since: TimeNs) -> Vec<CpuId> {
    engine
        .trace()
        .events()
        .iter()
        .filter(|e| e.time_ns >= since)
        .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { pid: p, .. } if p == pid))
        .map(|e| e.cpu)
        .collect()
}

#[test]
fn test_tasks_are_classified_into_first_matching_layer() {
    let mut s = setup(4, &example_config().specs);
    let periodic = TaskBehavior::periodic(MS, MS);

    add(
        &mut s,
        TaskDef::new(Pid(1), "sys-1", periodic.clone()).cgroup("/system.slice"),
    );
    add(
        &mut s,
        TaskDef::new(Pid(2), "web-2", periodic.clone())
            .cgroup("/workload.slice/web")
            .nice(-3),
    );
    add(
        &mut s,
        TaskDef::new(Pid(3), "web-3", periodic.clone()).cgroup("/workload.slice/web"),
    );
    // Matches both batch and immediate, batch comes first.
    add(
        &mut s,
        TaskDef::new(Pid(4), "batch-4", periodic)
            .cgroup("/workload.slice/batch")
            .nice(5),
    );

    assert_eq!(s.ops.task_layer(Pid(1)), Some(0));
    assert_eq!(s.ops.task_layer(Pid(2)), Some(1));
    assert_eq!(s.ops.task_layer(Pid(3)), Some(2));
    assert_eq!(s.ops.task_layer(Pid(4)), Some(0));
    assert_eq!(s.ops.task_layer(Pid(5)), None);
    assert_eq!(s.ops.layer_nr_tasks(0), 2);
    assert_eq!(s.ops.layer_nr_tasks(1), 1);
    assert_eq!(s.ops.layer_nr_tasks(2), 1);
}

#[test]
fn test_confined_layer_follows_its_cpumask() {
    let mut s = setup(4, &[confined("conf", "conf"), open_rest()]);
    s.ops
        .refresh_cpus(0, Cpumask::from_cpus(&[2, 3], 4).unwrap())
        .unwrap();
    s.ops
        .refresh_cpus(1, Cpumask::from_cpus(&[0, 1], 4).unwrap())
        .unwrap();

    for pid in 1..=3 {
        add(
            &mut s,
            TaskDef::new(Pid(pid), "conf", TaskBehavior::periodic(2 * MS, 2 * MS)),
        );
    }
    s.engine.run_for(200 * MS);

    let mask = s.ops.layer_cpus(0).unwrap();
    for pid in 1..=3 {
        let cpus = s.engine.trace().cpus_of(Pid(pid));
        assert!(!cpus.is_empty(), "pid {} never ran", pid);
        assert!(cpus.iter().all(|cpu| mask.has(*cpu)), "pid {} ran on {:?}", pid, cpus);
    }

    // Move the layer. Tasks pick the new mask up the next time they wake.
    s.ops
        .refresh_cpus(0, Cpumask::from_cpus(&[0], 4).unwrap())
        .unwrap();
    assert_eq!(s.ops.layer_cpus_seq(0), Some(2));
    let moved_at = s.engine.now();
    s.engine.run_for(200 * MS);

    for pid in 1..=3 {
        let cpus = cpus_since(&s.engine, Pid(pid), moved_at + 50 * MS);
        assert!(!cpus.is_empty(), "pid {} never ran after the move", pid);
        assert!(cpus.iter().all(|cpu| *cpu == CpuId(0)), "pid {} ran on {:?}", pid, cpus);
    }
    assert_eq!(s.ops.stats().gstat(GlobalStat::TaskCtxErr), 0);
}

#[test]
fn test_empty_confined_layer_runs_on_fallback_cpu() {
    let mut s = setup(4, &[confined("conf", "conf"), open_rest()]);
    s.ops.set_fallback_cpu(CpuId(2)).unwrap();
    assert!(s.ops.set_fallback_cpu(CpuId(4)).is_err());

    for pid in 1..=2 {
        add(
            &mut s,
            TaskDef::new(Pid(pid), "conf", TaskBehavior::periodic(2 * MS, MS)),
        );
    }
    add(
        &mut s,
        TaskDef::new(Pid(3), "other", TaskBehavior::periodic(2 * MS, MS)),
    );
    s.engine.run_for(200 * MS);

    let trace = s.engine.trace();
    for pid in 1..=2 {
        let cpus = trace.cpus_of(Pid(pid));
        assert!(!cpus.is_empty(), "pid {} never ran", pid);
        assert!(cpus.iter().all(|cpu| *cpu == CpuId(2)), "pid {} ran on {:?}", pid, cpus);
    }
    assert!(trace.total_runtime(Pid(3)) > 0);
}

#[test]
fn test_preempting_layer_kicks_busy_cpus() {
    let hot = spec(
        "hot",
        vec![vec![LayerMatch::CommPrefix("hot".into())]],
        LayerKind::Open {
            common: LayerCommon {
                preempt: true,
                ..Default::default()
            },
        },
    );
    let mut s = setup(2, &[hot, open_rest()]);
    for pid in 1..=2 {
        add(&mut s, TaskDef::new(Pid(pid), "hog", TaskBehavior::cpu_bound()));
    }
    add(
        &mut s,
        TaskDef::new(Pid(10), "hot", TaskBehavior::periodic(MS, 5 * MS)).start_at(10 * MS),
    );
    s.engine.run_for(300 * MS);

    let stats = s.ops.stats();
    assert!(stats.lstat(0, LayerStat::Preempt) > 0);
    assert_eq!(stats.lstat(1, LayerStat::Preempt), 0);

    let trace = s.engine.trace();
    assert!(trace.schedule_count(Pid(10)) >= 10);
    for pid in 1..=2 {
        assert!(trace.total_runtime(Pid(pid)) > 0);
    }
}

#[test]
fn test_pinned_tasks_use_hi_fallback() {
    let mut s = setup(2, &[open_rest()]);
    add(
        &mut s,
        TaskDef::new(Pid(1), "kworker/1:0", TaskBehavior::periodic(MS, MS))
            .cpus(&[1])
            .kworker(),
    );
    add(
        &mut s,
        TaskDef::new(Pid(2), "free", TaskBehavior::periodic(MS, MS)),
    );
    s.engine.run_for(100 * MS);

    let trace = s.engine.trace();
    let cpus = trace.cpus_of(Pid(1));
    assert!(!cpus.is_empty());
    assert!(cpus.iter().all(|cpu| *cpu == CpuId(1)));

    let stats = s.ops.stats();
    assert!(stats.lstat(0, LayerStat::AffnViol) > 0);
    assert!(stats.gstat(GlobalStat::HiFallback) > 0);
    assert!(stats.lstat(0, LayerStat::SelLocal) > 0);
}

#[test]
fn test_layer_spec_from_file() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(
        serde_json::to_string_pretty(&example_config())
            .unwrap()
            .as_bytes(),
    )
    .unwrap();

    let path = f.path().to_str().unwrap();
    for prefix in ["f:", "file:"] {
        let specs = LayerSpec::parse(&format!("{}{}", prefix, path)).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[1].name, "immediate");
        assert!(specs[1].kind.common().preempt);
    }

    assert!(LayerSpec::parse("f:/nonexistent/layers.json").is_err());
    assert!(LayerSpec::parse("not json").is_err());
}

#[test]
fn test_confined_layer_grows_with_utilization() {
    let specs = [confined("conf", "conf"), open_rest()];
    let mut s = setup(4, &specs);
    let mut cpu_alloc = LayerCpuAllocator::new(&specs, 4, false).unwrap();
    let mut stats = Stats::new(s.engine.session(), &s.ops);

    for pid in 1..=3 {
        add(
            &mut s,
            TaskDef::new(Pid(pid), "conf", TaskBehavior::cpu_bound()),
        );
    }

    let mut updated = false;
    for _ in 0..30 {
        s.engine.run_for(100 * MS);
        stats
            .refresh(s.engine.session(), &s.ops, Default::default())
            .unwrap();
        updated |= cpu_alloc.refresh_cpumasks(&stats, &s.ops).unwrap();
    }
    assert!(updated);
    assert!(stats.layer_utils[0] > 0.0);
    assert_eq!(stats.nr_layer_tasks, vec![3, 0]);

    let conf = s.ops.layer_cpus(0).unwrap();
    let rest = s.ops.layer_cpus(1).unwrap();
    assert!(conf.weight() >= 1);
    assert_eq!(conf.weight(), cpu_alloc.layers()[0].nr_cpus);
    assert!(conf.and(&rest).is_empty());
    assert!(conf.or(&rest).is_full());
    assert!(!conf.has(s.ops.fallback_cpu()) || conf.is_full());

    let ranges = cpu_alloc.take_cpus_ranges();
    assert_eq!(ranges[0].0, 0);
    assert!(ranges[0].1 >= 1);
}
