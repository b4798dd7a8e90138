// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use scx_core::*;
use scx_rusty::load_balance::LoadBalancer;
use scx_rusty::DomainGroup;
use scx_rusty::RustyConfig;
use scx_rusty::RustyOps;
use scx_rusty::RustyStat;
use scx_rusty::RustyStats;
use scx_rusty::Tuner;
use std::sync::Arc;

const MS: u64 = 1_000_000;

struct Setup {
    ops: Arc<RustyOps>,
    handle: SchedHandle,
    _link: ScxLink,
    engine: Engine,
}

fn setup(nr_cpus: u32, nr_doms: usize, rcfg: RustyConfig) -> Setup {
    let dg = Arc::new(DomainGroup::split(nr_cpus as usize, nr_doms, 1).unwrap());
    let ops = Arc::new(RustyOps::new(dg, rcfg).unwrap());
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
        handle,
        _link: link,
        engine,
    }
}

fn no_greedy() -> RustyConfig {
    RustyConfig {
        greedy_threshold: 0,
        ..Default::default()
    }
}

fn add(s: &mut Setup, pid: i32, behavior: TaskBehavior) {
    s.engine
        .add_task(&TaskDef::new(Pid(pid), "t", behavior))
        .unwrap();
}

#[test]
fn test_tasks_are_spread_round_robin_over_domains() {
    let mut s = setup(4, 2, RustyConfig::default());
    for pid in 1..=4 {
        add(&mut s, pid, TaskBehavior::periodic(2 * MS, 2 * MS));
    }
    assert_eq!(s.ops.task_dom(Pid(1)), Some(0));
    assert_eq!(s.ops.task_dom(Pid(2)), Some(1));
    assert_eq!(s.ops.task_dom(Pid(3)), Some(0));
    assert_eq!(s.ops.task_dom(Pid(4)), Some(1));
    assert_eq!(s.ops.task_dom(Pid(5)), None);
}

#[test]
fn test_tasks_stay_in_their_domain_without_greedy() {
    let mut s = setup(4, 2, no_greedy());
    for pid in 1..=8 {
        add(&mut s, pid, TaskBehavior::periodic(3 * MS, MS));
    }
    s.engine.run_for(500 * MS);

    let dg = s.ops.dom_group().clone();
    let trace = s.engine.trace();
    for pid in 1..=8 {
        let dom = s.ops.task_dom(Pid(pid)).unwrap();
        let mask = dg.doms()[&dom].mask();
        let cpus = trace.cpus_of(Pid(pid));
        assert!(!cpus.is_empty(), "pid {} never ran", pid);
        assert!(cpus.iter().all(|cpu| mask.has(*cpu)), "pid {} ran on {:?}", pid, cpus);
    }

    let stats = s.ops.stats();
    assert!(stats.get(RustyStat::DsqDispatch) > 0);
    assert!(stats.get(RustyStat::PrevIdle) + stats.get(RustyStat::GreedyIdle) > 0);
    assert_eq!(stats.get(RustyStat::GreedyLocal), 0);
    assert_eq!(stats.get(RustyStat::TaskGetErr), 0);
    assert!(s.handle.session().scx_enabled());
}

#[test]
fn test_idle_domain_steals_queued_tasks() {
    // Domain 0 ends up with the CPU hogs, domain 1 with short-lived tasks.
    let mut s = setup(2, 2, RustyConfig::default());
    for pid in 1..=6 {
        let behavior = if pid % 2 == 1 {
            TaskBehavior::cpu_bound()
        } else {
            TaskBehavior::oneshot(MS)
        };
        add(&mut s, pid, behavior);
    }
    s.engine.run_for(500 * MS);

    let trace = s.engine.trace();
    for pid in [2, 4, 6] {
        assert!(trace.completed(Pid(pid)));
    }
    let stolen = [1, 3, 5]
        .iter()
        .any(|pid| trace.cpus_of(Pid(*pid)).contains(&CpuId(1)));
    assert!(stolen);

    let stats = s.ops.stats();
    assert!(stats.get(RustyStat::GreedyLocal) > 0);
    assert_eq!(stats.get(RustyStat::GreedyXnuma), 0);
}

#[test]
fn test_idle_domain_stays_idle_without_greedy() {
    let mut s = setup(2, 2, no_greedy());
    for pid in 1..=6 {
        let behavior = if pid % 2 == 1 {
            TaskBehavior::cpu_bound()
        } else {
            TaskBehavior::oneshot(MS)
        };
        add(&mut s, pid, behavior);
    }
    s.engine.run_for(500 * MS);

    let trace = s.engine.trace();
    for pid in [1, 3, 5] {
        assert!(trace.cpus_of(Pid(pid)).iter().all(|cpu| *cpu == CpuId(0)));
        assert!(trace.total_runtime(Pid(pid)) > 0);
    }
}

#[test]
fn test_load_balancer_migrates_from_busy_domain() {
    let mut s = setup(2, 2, no_greedy());
    for pid in 1..=6 {
        let behavior = if pid % 2 == 1 {
            TaskBehavior::cpu_bound()
        } else {
            TaskBehavior::oneshot(MS)
        };
        add(&mut s, pid, behavior);
    }
    s.engine.run_for(1000 * MS);

    let now = s.handle.session().now();
    assert!(s.ops.dom_load(0, now) > s.ops.dom_load(1, now) * 10.0);

    let mut lb = LoadBalancer::new(&s.ops, now, false, true, true);
    lb.load_balance().unwrap();
    assert_eq!(lb.nr_lb_data_errors(), 0);

    let lb_stats = lb.get_stats();
    assert_eq!(lb_stats.len(), 1);
    assert_eq!(lb_stats[0].domains.len(), 2);
    assert!(lb_stats[0].domains[0].load.delta() < 0.0);
    assert!(lb_stats[0].domains[1].load.delta() > 0.0);
    assert!(s.ops.nr_pending_migrations() >= 1);

    s.engine.run_for(200 * MS);
    assert_eq!(s.ops.nr_pending_migrations(), 0);
    assert!(s.ops.stats().get(RustyStat::LoadBalance) >= 1);

    let moved: Vec<i32> = [1, 3, 5]
        .into_iter()
        .filter(|pid| s.ops.task_dom(Pid(*pid)) == Some(1))
        .collect();
    assert!(!moved.is_empty());
    assert!(s.engine.trace().cpus_of(Pid(moved[0])).contains(&CpuId(1)));
}

#[test]
fn test_load_balancer_only_reports_when_disabled() {
    let mut s = setup(2, 2, no_greedy());
    for pid in 1..=6 {
        let behavior = if pid % 2 == 1 {
            TaskBehavior::cpu_bound()
        } else {
            TaskBehavior::oneshot(MS)
        };
        add(&mut s, pid, behavior);
    }
    s.engine.run_for(500 * MS);

    let now = s.handle.session().now();
    let mut lb = LoadBalancer::new(&s.ops, now, false, false, false);
    lb.load_balance().unwrap();
    assert_eq!(lb.get_stats().len(), 1);
    assert_eq!(s.ops.nr_pending_migrations(), 0);
}

#[test]
fn test_tuner_marks_underutilized_domains() {
    let mut s = setup(4, 2, no_greedy());
    for pid in 1..=4 {
        let behavior = if pid % 2 == 1 {
            TaskBehavior::cpu_bound()
        } else {
            TaskBehavior::oneshot(MS)
        };
        add(&mut s, pid, behavior);
    }
    s.engine.run_for(200 * MS);

    let dg = s.ops.dom_group().clone();
    let mut tuner = Tuner::new(dg, 90.0, 100.0, 20 * MS, MS).unwrap();
    tuner.step(s.handle.session(), &s.ops).unwrap();

    assert!(!tuner.fully_utilized);
    assert!(tuner.dom_util(0) > 0.9);
    assert!(tuner.dom_util(1) < 0.1);

    let ti = s.ops.tune_input();
    assert_eq!(ti.gen, 1);
    assert_eq!(ti.slice_ns, 20 * MS);
    assert_eq!(ti.direct_greedy_cpumask.iter().collect::<Vec<_>>(), vec![CpuId(2), CpuId(3)]);
    assert_eq!(ti.kick_greedy_cpumask.weight(), 4);
}

#[test]
fn test_tuner_shortens_slice_when_saturated() {
    let mut s = setup(2, 1, RustyConfig::default());
    for pid in 1..=4 {
        add(&mut s, pid, TaskBehavior::cpu_bound());
    }
    s.engine.run_for(200 * MS);

    let dg = s.ops.dom_group().clone();
    let mut tuner = Tuner::new(dg, 90.0, 0.0, 20 * MS, MS).unwrap();
    tuner.step(s.handle.session(), &s.ops).unwrap();
    s.engine.run_for(200 * MS);
    tuner.step(s.handle.session(), &s.ops).unwrap();

    assert!(tuner.fully_utilized);
    assert_eq!(tuner.slice_ns, MS);
    assert_eq!(s.ops.slice_ns(), MS);
    assert!(s.ops.tune_input().direct_greedy_cpumask.is_empty());
    assert!(s.ops.tune_input().kick_greedy_cpumask.is_empty());
}

#[test]
fn test_direct_greedy_pushes_to_remote_idle_cpu() {
    let mut s = setup(4, 2, no_greedy());
    // Only CPU 3 may take remote tasks directly.
    s.ops
        .set_tune_input(Cpumask::from_cpus(&[3], 4).unwrap(), Cpumask::new(4), 20 * MS);
    for pid in 1..=8 {
        let behavior = if pid % 2 == 1 {
            TaskBehavior::periodic(3 * MS, MS)
        } else {
            TaskBehavior::oneshot(MS)
        };
        add(&mut s, pid, behavior);
    }
    s.engine.run_for(300 * MS);

    let stats = s.ops.stats();
    assert!(stats.get(RustyStat::DirectGreedy) > 0);
    assert_eq!(stats.get(RustyStat::DirectGreedyFar), 0);
}

#[test]
fn test_fifo_leaves_domain_vtime_alone() {
    let mut s = setup(
        2,
        1,
        RustyConfig {
            fifo_sched: true,
            ..Default::default()
        },
    );
    for pid in 1..=4 {
        add(&mut s, pid, TaskBehavior::cpu_bound());
    }
    s.engine.run_for(400 * MS);

    let trace = s.engine.trace();
    for pid in 1..=4 {
        assert!(trace.total_runtime(Pid(pid)) > 0);
    }
    assert_eq!(s.ops.dom_vtime_now(0), 0);
}

#[test]
fn test_vtime_advances_domain_clock() {
    let mut s = setup(2, 1, RustyConfig::default());
    for pid in 1..=4 {
        add(&mut s, pid, TaskBehavior::cpu_bound());
    }
    s.engine.run_for(400 * MS);
    assert!(s.ops.dom_vtime_now(0) > 0);
}

#[test]
fn test_pinned_task_runs_on_its_cpu() {
    let mut s = setup(4, 2, RustyConfig::default());
    s.engine
        .add_task(&TaskDef::new(Pid(1), "pinned", TaskBehavior::periodic(MS, MS)).cpus(&[3]))
        .unwrap();
    s.engine.run_for(100 * MS);

    assert_eq!(s.ops.task_dom(Pid(1)), Some(1));
    let cpus = s.engine.trace().cpus_of(Pid(1));
    assert!(!cpus.is_empty());
    assert!(cpus.iter().all(|cpu| *cpu == CpuId(3)));
    assert!(s.ops.stats().get(RustyStat::Pinned) > 0);
}

fn kworker_contention(kthreads_local: bool) -> RustyStats {
    let mut s = setup(
        2,
        1,
        RustyConfig {
            kthreads_local,
            ..Default::default()
        },
    );
    s.engine
        .add_task(&TaskDef::new(Pid(1), "kworker/0:1", TaskBehavior::cpu_bound()).cpus(&[0]).kworker())
        .unwrap();
    s.engine
        .add_task(&TaskDef::new(Pid(2), "hog", TaskBehavior::cpu_bound()).cpus(&[0]))
        .unwrap();
    s.engine.run_for(200 * MS);
    s.ops.stats()
}

#[test]
fn test_kthreads_local_bypasses_domain_dsq() {
    let stats = kworker_contention(false);
    assert_eq!(stats.get(RustyStat::DirectDispatch), stats.get(RustyStat::Pinned));

    let stats = kworker_contention(true);
    assert!(stats.get(RustyStat::DirectDispatch) > stats.get(RustyStat::Pinned));
}
