// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Synthetic workloads for the scheduler binaries.

use crate::clock::SimClock;
use crate::engine::Engine;
use crate::loader::SchedHandle;
use crate::scenario::TaskBehavior;
use crate::scenario::TaskDef;
use crate::types::Pid;
use anyhow::anyhow;
use anyhow::Result;
use log::debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MS: u64 = 1_000_000;

/// Cgroups the generated tasks are spread over.
pub const WORKLOAD_CGROUPS: [&str; 3] = [
    "/workload.slice/web",
    "/workload.slice/batch",
    "/system.slice",
];

/// Deterministic xorshift32.
#[derive(Debug, Clone)]
pub struct XorShift32(u32);

impl XorShift32 {
    pub fn new(seed: u32) -> Self {
        Self(if seed == 0 { 0xDEAD_BEEF } else { seed })
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    /// Uniform in `[lo, hi]`.
    pub fn range(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        lo + self.next_u32() as u64 % (hi - lo + 1)
    }
}

/// A mix of interactive, batch and per-CPU kernel worker tasks. Pids start at
/// `first_pid`; the same seed always yields the same tasks.
pub fn mixed_workload(nr_tasks: usize, nr_cpus: u32, first_pid: i32, seed: u32) -> Vec<TaskDef> {
    let mut rng = XorShift32::new(seed);
    let mut defs = Vec::with_capacity(nr_tasks);

    for i in 0..nr_tasks {
        let pid = Pid(first_pid + i as i32);
        let def = match rng.range(0, 9) {
            0 => {
                let cpu = (i as u32) % nr_cpus.max(1);
                TaskDef::new(
                    pid,
                    &format!("kworker/{}:0", cpu),
                    TaskBehavior::periodic(rng.range(1, 2) * MS, rng.range(5, 20) * MS),
                )
                .kworker()
                .cpus(&[cpu])
                .cgroup("/")
            }
            1..=4 => TaskDef::new(
                pid,
                &format!("web-{}", i),
                TaskBehavior::periodic(rng.range(1, 5) * MS, rng.range(1, 15) * MS),
            )
            .cgroup(WORKLOAD_CGROUPS[0])
            .nice(rng.range(0, 10) as i32 - 5),
            5..=7 => TaskDef::new(
                pid,
                &format!("batch-{}", i),
                TaskBehavior::periodic(rng.range(20, 80) * MS, rng.range(0, 2) * MS + 1),
            )
            .cgroup(WORKLOAD_CGROUPS[1])
            .nice(rng.range(5, 19) as i32),
            _ => TaskDef::new(
                pid,
                &format!("sys-{}", i),
                TaskBehavior::periodic(rng.range(1, 3) * MS, rng.range(10, 50) * MS),
            )
            .cgroup(WORKLOAD_CGROUPS[2]),
        };
        defs.push(def.tgid(Pid(first_pid + (i as i32 / 4) * 4)));
    }
    defs
}

/// First pid handed out by [`WorkloadRunner`].
pub const WORKLOAD_FIRST_PID: i32 = 1000;

/// A mixed workload played against a loaded policy by a paced engine on a
/// background thread. Simulated time follows the wall clock.
#[derive(Debug)]
pub struct WorkloadRunner {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Engine>>,
}

impl WorkloadRunner {
    pub fn start(
        handle: &SchedHandle,
        clock: Arc<SimClock>,
        nr_tasks: usize,
        seed: u32,
    ) -> Result<Self> {
        let cfg = handle.config();
        let mut engine = Engine::new(handle.session().clone(), clock, cfg.tick_ns)?;
        for def in mixed_workload(nr_tasks, cfg.nr_cpus, WORKLOAD_FIRST_PID, seed) {
            engine.add_task(&def)?;
        }
        debug!(
            "starting {} tasks on {} CPUs, tick={}us",
            nr_tasks,
            cfg.nr_cpus,
            cfg.tick_ns / 1000
        );

        let stop = Arc::new(AtomicBool::new(false));
        let thread = engine.spawn_paced(Duration::from_nanos(cfg.tick_ns), stop.clone());
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the engine and hand it back.
    pub fn stop(mut self) -> Result<Engine> {
        self.stop.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow!("workload thread panicked")),
            None => Err(anyhow!("workload already stopped")),
        }
    }
}

impl Drop for WorkloadRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
