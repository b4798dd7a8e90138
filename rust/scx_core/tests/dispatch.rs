// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use scx_core::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

mod common;
use common::*;

/// Every task queued on GLOBAL eventually runs to completion.
#[test]
fn test_global_no_starvation() {
    let mut h = Harness::with_cpus(Arc::new(GlobalFifo::default()), 4);
    for pid in 1..=32 {
        h.add(TaskDef::new(Pid(pid), "short", TaskBehavior::oneshot(2 * MS)));
    }
    h.engine.run_for(100 * MS);

    let trace = h.engine.trace();
    for pid in 1..=32 {
        assert!(trace.completed(Pid(pid)), "task {} never completed", pid);
        assert!(trace.total_runtime(Pid(pid)) > 0);
    }
    assert_eq!(h.engine.nr_live_tasks(), 0);
    assert!(h.sess().scx_enabled());
}

/// Tasks dispatched to CPU 1's local DSQ never run anywhere else.
#[test]
fn test_local_exclusivity() {
    let mut h = Harness::with_cpus(Arc::new(PinnedLocal { cpu: CpuId(1) }), 4);
    for pid in 1..=6 {
        h.add(TaskDef::new(
            Pid(pid),
            "pinned",
            TaskBehavior::periodic(3 * MS, 2 * MS),
        ));
    }
    h.engine.run_for(200 * MS);

    let trace = h.engine.trace();
    for pid in 1..=6 {
        let cpus = trace.cpus_of(Pid(pid));
        assert!(!cpus.is_empty(), "task {} never ran", pid);
        assert!(
            cpus.iter().all(|cpu| *cpu == CpuId(1)),
            "task {} ran on {:?}",
            pid,
            cpus
        );
    }
    assert_eq!(h.sess().stats().nr_affn_viol, 0);
}

/// A LOCAL_ON dispatch to a CPU outside the task's mask goes to GLOBAL.
#[test]
fn test_local_affinity_violation_falls_back_to_global() {
    let mut h = Harness::with_cpus(Arc::new(PinnedLocal { cpu: CpuId(1) }), 2);
    h.add(TaskDef::new(Pid(1), "elsewhere", TaskBehavior::oneshot(2 * MS)).cpus(&[0]));
    h.engine.run_for(20 * MS);

    let trace = h.engine.trace();
    assert!(trace.completed(Pid(1)));
    assert!(trace.cpus_of(Pid(1)).iter().all(|cpu| *cpu == CpuId(0)));
    assert!(h.sess().stats().nr_affn_viol >= 1);
}

/// CPUs start out idle, so the first wakeup after attach is dispatched
/// straight to the local DSQ by the default select_cpu.
#[test]
fn test_first_wakeup_finds_idle_cpu() {
    let ops = Arc::new(GlobalFifo::default());
    let (_clock, handle, _link) = load_bare(ops.clone(), 2);
    let sess = handle.session();
    assert!(sess.cpu_is_idle(CpuId(0)));
    assert!(sess.cpu_is_idle(CpuId(1)));

    let task = sess.register_task(&attrs(1, "first")).unwrap();
    let cpu = sess.wakeup(&task, WakeFlags::TTWU, None);

    assert_eq!(sess.local_pids(cpu), vec![Pid(1)]);
    assert!(sess.dsq_pids(DsqId::GLOBAL).is_empty());
    assert_eq!(ops.nr_enqueued.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(sess.stats().nr_direct, 1);
    assert!(!sess.cpu_is_idle(cpu));
}

/// The (K+1)-th task queued on a full bounded DSQ lands on GLOBAL.
#[test]
fn test_overflow_goes_to_global() {
    let (_clock, handle, _link) = load_bare(
        Arc::new(Bounded {
            capacity: 2,
            drain: false,
        }),
        1,
    );
    let sess = handle.session();

    let mut tasks = vec![];
    for pid in 1..=3 {
        tasks.push(sess.register_task(&attrs(pid, "t")).unwrap());
    }
    for task in &tasks {
        sess.wakeup(task, WakeFlags::TTWU, None);
    }

    assert_eq!(sess.dsq_pids(common::BOUNDED_DSQ), vec![Pid(1), Pid(2)]);
    assert_eq!(sess.dsq_pids(DsqId::GLOBAL), vec![Pid(3)]);
    let stats = sess.stats();
    assert_eq!(stats.nr_overflow, 1);
    assert_eq!(stats.nr_dsq, 2);
    assert_eq!(stats.nr_global, 1);

    // Nothing was lost: GLOBAL feeds the CPU even though the policy never
    // drains its own queue.
    let next = sess.pick_next_task(CpuId(0)).unwrap();
    assert_eq!(next.pid, Pid(3));
}

/// Draining policy: everything queued on the bounded DSQ or GLOBAL runs.
#[test]
fn test_bounded_dsq_drains() {
    let mut h = Harness::with_cpus(
        Arc::new(Bounded {
            capacity: 4,
            drain: true,
        }),
        2,
    );
    for pid in 1..=12 {
        h.add(TaskDef::new(Pid(pid), "t", TaskBehavior::oneshot(MS)));
    }
    h.engine.run_for(50 * MS);
    for pid in 1..=12 {
        assert!(h.engine.trace().completed(Pid(pid)), "task {} lost", pid);
    }
}

/// CPUs picking from GLOBAL in rounds get tasks in FIFO order: the task at
/// position k runs in round k / nr_cpus.
#[test]
fn test_global_fairness_bound() {
    let nr_cpus = 3;
    let (_clock, handle, _link) = load_bare(Arc::new(GlobalFifo::default()), nr_cpus);
    let sess = handle.session();

    let tasks: Vec<_> = (1..=10)
        .map(|pid| sess.register_task(&attrs(pid, "t")).unwrap())
        .collect();
    for task in &tasks {
        sess.wakeup(task, WakeFlags::TTWU, Some(CpuId(0)));
    }

    let mut order = vec![];
    for round in 0.. {
        let mut picked = false;
        for cpu in 0..nr_cpus {
            if let Some(task) = sess.pick_next_task(CpuId(cpu)) {
                let k = (task.pid.0 - 1) as usize;
                assert!(
                    k / nr_cpus as usize <= round,
                    "task at {} ran in round {}",
                    k,
                    round
                );
                order.push(task.pid);
                sess.task_sleep(CpuId(cpu));
                picked = true;
            }
        }
        if !picked {
            break;
        }
    }
    let expected: Vec<_> = (1..=10).map(Pid).collect();
    assert_eq!(order, expected);
}

/// Concurrent consumption of GLOBAL never hands a task to two CPUs and
/// never loses one.
#[test]
fn test_concurrent_global_consume() {
    let nr_cpus = 4;
    let nr_tasks = 400;
    let (_clock, handle, _link) = load_bare(Arc::new(GlobalFifo::default()), nr_cpus);
    let sess = handle.session().clone();

    let tasks: Vec<_> = (1..=nr_tasks)
        .map(|pid| sess.register_task(&attrs(pid, "t")).unwrap())
        .collect();
    for task in &tasks {
        sess.wakeup(task, WakeFlags::TTWU, Some(CpuId(0)));
    }

    let workers: Vec<_> = (0..nr_cpus)
        .map(|cpu| {
            let sess = sess.clone();
            thread::spawn(move || {
                let mut got = vec![];
                while let Some(task) = sess.pick_next_task(CpuId(cpu)) {
                    got.push(task.pid);
                    sess.task_sleep(CpuId(cpu));
                }
                got
            })
        })
        .collect();

    let mut all = vec![];
    for worker in workers {
        all.extend(worker.join().unwrap());
    }
    let unique: BTreeSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), nr_tasks as usize, "duplicate or missing picks");
    assert_eq!(unique.len(), nr_tasks as usize);
    assert_eq!(sess.stats().nr_double_dispatch, 0);
}

/// A stale reference dispatched after the task left is counted and skipped.
#[test]
fn test_spurious_dispatch_is_tolerated() {
    let ops = Arc::new(StaleQueue::default());
    let (_clock, handle, _link) = load_bare(ops.clone(), 1);
    let sess = handle.session();

    let t1 = sess.register_task(&attrs(1, "gone")).unwrap();
    let t2 = sess.register_task(&attrs(2, "stays")).unwrap();
    sess.wakeup(&t1, WakeFlags::TTWU, None);
    sess.wakeup(&t2, WakeFlags::TTWU, None);
    sess.task_exit(&t1);
    assert_eq!(ops.queue.lock().unwrap().len(), 2);

    let next = sess.pick_next_task(CpuId(0)).unwrap();
    assert_eq!(next.pid, Pid(2));
    let stats = sess.stats();
    assert_eq!(stats.nr_spurious, 1);
    assert_eq!(stats.nr_dequeued, 1);
    assert!(sess.scx_enabled());
}

/// Dispatching a task that already sits on a DSQ is rejected.
#[test]
fn test_double_dispatch_rejected() {
    let (_clock, handle, _link) = load_bare(Arc::new(DoubleDispatch), 1);
    let sess = handle.session();

    let task = sess.register_task(&attrs(1, "twice")).unwrap();
    sess.wakeup(&task, WakeFlags::TTWU, None);

    assert_eq!(sess.dsq_pids(DsqId::GLOBAL), vec![Pid(1)]);
    assert_eq!(sess.stats().nr_double_dispatch, 1);
    assert!(sess.scx_enabled());
}

/// Dispatch into a DSQ that was never created is a policy error; the task
/// still runs.
#[test]
fn test_missing_dsq_is_an_error() {
    struct Missing;

    impl SchedOps for Missing {
        fn name(&self) -> &str {
            "missing"
        }

        fn select_cpu(
            &self,
            ctx: &ScxCtx,
            task: &TaskRef,
            prev_cpu: CpuId,
            _: WakeFlags,
        ) -> CpuId {
            keep_prev(ctx, task, prev_cpu)
        }

        fn enqueue(&self, ctx: &ScxCtx, task: &TaskRef, enq_flags: EnqFlags) {
            ctx.dispatch(task, DsqId(4242), SCX_SLICE_DFL, enq_flags);
        }
    }

    let mut h = Harness::with_cpus(Arc::new(Missing), 1);
    h.add(TaskDef::new(Pid(1), "t", TaskBehavior::oneshot(2 * MS)));
    h.engine.run_for(20 * MS);

    assert_eq!(h.sess().state(), ScxOpsState::Disabled);
    assert_eq!(h.sess().exit_kind(), ScxExitKind::Error);
    let info = h.sess().exit_info().unwrap();
    assert!(info.msg.contains("non-existent DSQ"), "{}", info.msg);
    assert!(h.engine.trace().completed(Pid(1)));
}
