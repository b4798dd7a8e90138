// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scripted workloads for the engine.

use crate::task::nice_to_weight;
use crate::task::SchedPolicy;
use crate::task::TaskAttrs;
use crate::types::Pid;
use crate::types::TimeNs;
use crate::types::Weight;
use anyhow::bail;
use anyhow::Result;

/// One step of a task's script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Consume CPU for the given time.
    Run(TimeNs),
    /// Block for the given time.
    Sleep(TimeNs),
    /// Wake another task if it is sleeping. Takes no time.
    Wake(Pid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBehavior {
    pub phases: Vec<Phase>,
    pub repeat: bool,
}

impl TaskBehavior {
    /// Runs forever.
    pub fn cpu_bound() -> Self {
        Self {
            phases: vec![Phase::Run(TimeNs::MAX)],
            repeat: false,
        }
    }

    /// Alternates between running for `run_ns` and sleeping for `sleep_ns`.
    pub fn periodic(run_ns: TimeNs, sleep_ns: TimeNs) -> Self {
        Self {
            phases: vec![Phase::Run(run_ns), Phase::Sleep(sleep_ns)],
            repeat: true,
        }
    }

    /// Runs for `run_ns` once and exits.
    pub fn oneshot(run_ns: TimeNs) -> Self {
        Self {
            phases: vec![Phase::Run(run_ns)],
            repeat: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            bail!("task behavior has no phases");
        }
        let takes_time = self.phases.iter().any(|phase| match phase {
            Phase::Run(ns) | Phase::Sleep(ns) => *ns > 0,
            Phase::Wake(_) => false,
        });
        if self.repeat && !takes_time {
            bail!("repeating task behavior must contain a non-empty run or sleep");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TaskDef {
    pub attrs: TaskAttrs,
    pub behavior: TaskBehavior,
    /// When the task first becomes runnable.
    pub start_time_ns: TimeNs,
}

impl TaskDef {
    pub fn new(pid: Pid, comm: &str, behavior: TaskBehavior) -> Self {
        Self {
            attrs: TaskAttrs::new(pid, comm),
            behavior,
            start_time_ns: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.attrs.pid
    }

    /// Sets the nice value and the weight derived from it.
    pub fn nice(mut self, nice: i32) -> Self {
        self.attrs.nice = nice;
        self.attrs.weight = nice_to_weight(nice);
        self
    }

    pub fn weight(mut self, weight: Weight) -> Self {
        self.attrs.weight = weight;
        self
    }

    pub fn cpus(mut self, cpus: &[u32]) -> Self {
        self.attrs.allowed_cpus = Some(cpus.to_vec());
        self
    }

    pub fn tgid(mut self, tgid: Pid) -> Self {
        self.attrs.tgid = tgid;
        self
    }

    pub fn cgroup(mut self, cgroup: &str) -> Self {
        self.attrs.cgroup = cgroup.to_string();
        self
    }

    pub fn kworker(mut self) -> Self {
        self.attrs.kworker = true;
        self
    }

    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.attrs.policy = policy;
        self
    }

    pub fn start_at(mut self, ns: TimeNs) -> Self {
        self.start_time_ns = ns;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub nr_cpus: u32,
    pub tasks: Vec<TaskDef>,
    pub duration_ns: TimeNs,
}

pub struct ScenarioBuilder {
    nr_cpus: u32,
    tasks: Vec<TaskDef>,
    duration_ns: TimeNs,
    next_pid: i32,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            nr_cpus: 1,
            tasks: vec![],
            duration_ns: 100_000_000,
            next_pid: 1,
        }
    }
}

impl ScenarioBuilder {
    pub fn cpus(mut self, n: u32) -> Self {
        self.nr_cpus = n;
        self
    }

    pub fn task(mut self, def: TaskDef) -> Self {
        self.next_pid = self.next_pid.max(def.pid().0 + 1);
        self.tasks.push(def);
        self
    }

    /// Add a task with the next free pid.
    pub fn add_task(self, comm: &str, behavior: TaskBehavior) -> Self {
        let pid = Pid(self.next_pid);
        self.task(TaskDef::new(pid, comm, behavior))
    }

    /// Add a task with the next free pid, adjusted by `f`.
    pub fn add_task_with(
        self,
        comm: &str,
        behavior: TaskBehavior,
        f: impl FnOnce(TaskDef) -> TaskDef,
    ) -> Self {
        let pid = Pid(self.next_pid);
        self.task(f(TaskDef::new(pid, comm, behavior)))
    }

    pub fn duration_ns(mut self, ns: TimeNs) -> Self {
        self.duration_ns = ns;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ns = ms * 1_000_000;
        self
    }

    pub fn build(self) -> Result<Scenario> {
        if self.nr_cpus == 0 {
            bail!("scenario must have at least one CPU");
        }
        let mut pids = std::collections::BTreeSet::new();
        for def in &self.tasks {
            if !pids.insert(def.pid()) {
                bail!("duplicate pid {} in scenario", def.pid());
            }
            def.behavior.validate()?;
        }
        Ok(Scenario {
            nr_cpus: self.nr_cpus,
            tasks: self.tasks,
            duration_ns: self.duration_ns,
        })
    }
}
