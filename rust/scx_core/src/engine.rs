// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Tick-driven engine.
//!
//! The engine plays the part of the rest of the kernel: it owns the simulated
//! clock, runs every task's script, and turns the script into calls on the
//! class switch shim (wakeups, ticks, sleeps, exits, reschedules). Every
//! step advances the clock by one tick, delivers due wakeups, then ticks
//! each CPU in order. Runs are deterministic.

use crate::clock::Clock;
use crate::clock::SimClock;
use crate::scenario::Phase;
use crate::scenario::Scenario;
use crate::scenario::TaskBehavior;
use crate::scenario::TaskDef;
use crate::session::PrevState;
use crate::session::SchedClass;
use crate::session::ScxOpsState;
use crate::session::ScxSession;
use crate::task::TaskRef;
use crate::trace::Trace;
use crate::trace::TraceKind;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::TimeNs;
use crate::types::WakeFlags;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::trace;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Event {
    time_ns: TimeNs,
    seq: u64,
    kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ns
            .cmp(&other.time_ns)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    /// First wakeup of a new task.
    TaskStart { pid: Pid },
    /// End of a sleep phase. Stale if the task's generation moved on.
    SleepDone { pid: Pid, gen: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimState {
    NotStarted,
    Sleeping,
    Runnable,
    Running(CpuId),
    Exited,
}

/// What a task does next once its Wake phases are out of the way.
enum Next {
    Run,
    Sleep(TimeNs),
    Exit,
}

#[derive(Debug)]
struct SimTask {
    task: TaskRef,
    behavior: TaskBehavior,
    phase_idx: usize,
    run_remaining: TimeNs,
    state: SimState,
    gen: u64,
}

impl SimTask {
    fn new(task: TaskRef, behavior: TaskBehavior) -> Self {
        let run_remaining = match behavior.phases.first() {
            Some(Phase::Run(ns)) => *ns,
            _ => 0,
        };
        Self {
            task,
            behavior,
            phase_idx: 0,
            run_remaining,
            state: SimState::NotStarted,
            gen: 0,
        }
    }

    fn current_phase(&self) -> Option<&Phase> {
        self.behavior.phases.get(self.phase_idx)
    }

    fn advance_phase(&mut self) -> bool {
        self.phase_idx += 1;
        if self.phase_idx >= self.behavior.phases.len() {
            if !self.behavior.repeat {
                return false;
            }
            self.phase_idx = 0;
        }
        if let Some(Phase::Run(ns)) = self.current_phase() {
            self.run_remaining = *ns;
        }
        true
    }

    /// Skip over Wake phases and empty runs, collecting wake targets.
    fn settle(&mut self, wakes: &mut Vec<Pid>) -> Next {
        for _ in 0..=2 * self.behavior.phases.len() {
            match self.current_phase() {
                None => return Next::Exit,
                Some(Phase::Run(ns)) if *ns > 0 => return Next::Run,
                Some(Phase::Sleep(ns)) if *ns > 0 => return Next::Sleep(*ns),
                Some(Phase::Wake(target)) => wakes.push(*target),
                Some(_) => {}
            }
            if !self.advance_phase() {
                return Next::Exit;
            }
        }
        Next::Exit
    }
}

pub struct Engine {
    sess: Arc<ScxSession>,
    clock: Arc<SimClock>,
    tick_ns: u64,
    tasks: BTreeMap<Pid, SimTask>,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
    trace: Trace,
    idle: Vec<bool>,
    watchdog_work: bool,
    next_checkin: TimeNs,
    disable_recorded: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sess", &self.sess)
            .field("now", &self.clock_now())
            .field("nr_tasks", &self.tasks.len())
            .finish()
    }
}

impl Engine {
    pub fn new(sess: Arc<ScxSession>, clock: Arc<SimClock>, tick_ns: u64) -> Result<Self> {
        if tick_ns == 0 {
            bail!("tick interval must be positive");
        }
        let now = clock.now();
        let nr_cpus = sess.nr_cpus() as usize;
        Ok(Self {
            next_checkin: now + sess.watchdog().period_ns(),
            sess,
            clock,
            tick_ns,
            tasks: BTreeMap::new(),
            events: BinaryHeap::new(),
            seq: 0,
            trace: Trace::new(),
            idle: vec![false; nr_cpus],
            watchdog_work: true,
            disable_recorded: false,
        })
    }

    fn clock_now(&self) -> TimeNs {
        self.clock.now()
    }

    pub fn now(&self) -> TimeNs {
        self.clock_now()
    }

    pub fn session(&self) -> &Arc<ScxSession> {
        &self.sess
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    /// Stop recording trace events. Used for long paced runs.
    pub fn disable_trace(&mut self) {
        self.trace.set_enabled(false);
    }

    /// Starve the watchdog work: the session stops checking in.
    pub fn set_watchdog_work(&mut self, enabled: bool) {
        self.watchdog_work = enabled;
    }

    pub fn task(&self, pid: Pid) -> Option<&TaskRef> {
        self.tasks.get(&pid).map(|t| &t.task)
    }

    /// Number of tasks that have not exited.
    pub fn nr_live_tasks(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state != SimState::Exited)
            .count()
    }

    fn push_event(&mut self, time_ns: TimeNs, kind: EventKind) {
        self.seq += 1;
        self.events.push(Reverse(Event {
            time_ns,
            seq: self.seq,
            kind,
        }));
    }

    /// Create the task in the session and schedule its first wakeup.
    pub fn add_task(&mut self, def: &TaskDef) -> Result<TaskRef> {
        let task = self.sess.register_task(&def.attrs)?;
        self.tasks
            .insert(task.pid, SimTask::new(task.clone(), def.behavior.clone()));
        let start = def.start_time_ns.max(self.clock_now());
        self.push_event(start, EventKind::TaskStart { pid: task.pid });
        Ok(task)
    }

    pub fn load(&mut self, scenario: &Scenario) -> Result<()> {
        if scenario.nr_cpus != self.sess.nr_cpus() {
            bail!(
                "scenario wants {} CPUs, session has {}",
                scenario.nr_cpus,
                self.sess.nr_cpus()
            );
        }
        for def in &scenario.tasks {
            self.add_task(def)?;
        }
        Ok(())
    }

    /// Run until `duration_ns` of simulated time has passed.
    pub fn run_for(&mut self, duration_ns: TimeNs) {
        let end = self.clock_now().saturating_add(duration_ns);
        while self.clock_now() < end {
            self.step();
        }
    }

    /// Run until `cond` holds or `max_ns` passed. Returns whether `cond` held.
    pub fn run_until(&mut self, max_ns: TimeNs, mut cond: impl FnMut(&Self) -> bool) -> bool {
        let end = self.clock_now().saturating_add(max_ns);
        while self.clock_now() < end {
            if cond(self) {
                return true;
            }
            self.step();
        }
        cond(self)
    }

    /// Advance one tick.
    pub fn step(&mut self) {
        let now = self.clock.advance(self.tick_ns);

        while let Some(Reverse(ev)) = self.events.peek() {
            if ev.time_ns > now {
                break;
            }
            let Some(Reverse(ev)) = self.events.pop() else {
                break;
            };
            match ev.kind {
                EventKind::TaskStart { pid } => {
                    self.wake_task(pid, now, WakeFlags::FORK, None, false)
                }
                EventKind::SleepDone { pid, gen } => {
                    let current = self.tasks.get(&pid).is_some_and(|t| t.gen == gen);
                    if current {
                        self.wake_task(pid, now, WakeFlags::TTWU, None, true);
                    }
                }
            }
        }

        for cpu in 0..self.sess.nr_cpus() {
            self.tick_cpu(CpuId(cpu), now);
        }

        self.sess.run_timers();

        if self.watchdog_work && now >= self.next_checkin {
            self.sess.watchdog_checkin();
            self.next_checkin = now + self.sess.watchdog().period_ns();
        }

        if !self.disable_recorded && self.sess.state() == ScxOpsState::Disabled {
            self.disable_recorded = true;
            let kind = self.sess.exit_kind();
            debug!("sched_ext disabled at {}ns ({})", now, kind.reason());
            self.trace
                .record(now, CpuId(0), TraceKind::ScxDisabled { kind });
        }
    }

    fn wake_task(
        &mut self,
        pid: Pid,
        now: TimeNs,
        wake_flags: WakeFlags,
        waker_cpu: Option<CpuId>,
        sleep_done: bool,
    ) {
        let mut wakes = vec![];
        let (task, next) = {
            let Some(st) = self.tasks.get_mut(&pid) else {
                return;
            };
            match st.state {
                SimState::NotStarted if !sleep_done => {}
                SimState::Sleeping => {}
                _ => return,
            }
            st.gen += 1;
            let next = if sleep_done && !st.advance_phase() {
                Next::Exit
            } else {
                st.settle(&mut wakes)
            };
            (st.task.clone(), next)
        };

        match next {
            Next::Run => {
                self.set_state(pid, SimState::Runnable);
                let cpu = self.sess.wakeup(&task, wake_flags, waker_cpu);
                trace!("woke {}[{}] for CPU {}", task.comm, pid, cpu);
                self.trace.record(now, cpu, TraceKind::TaskWoke { pid });
            }
            Next::Sleep(ns) => self.sleep_task(pid, now, ns),
            Next::Exit => self.exit_task(&task, now),
        }
        self.deliver_wakes(wakes, now, waker_cpu.unwrap_or(task.cpu()));
    }

    fn deliver_wakes(&mut self, wakes: Vec<Pid>, now: TimeNs, waker_cpu: CpuId) {
        for target in wakes {
            let sleeping = self
                .tasks
                .get(&target)
                .is_some_and(|t| t.state == SimState::Sleeping);
            if sleeping {
                self.wake_task(target, now, WakeFlags::TTWU, Some(waker_cpu), true);
            }
        }
    }

    fn set_state(&mut self, pid: Pid, state: SimState) {
        if let Some(st) = self.tasks.get_mut(&pid) {
            st.state = state;
        }
    }

    fn sleep_task(&mut self, pid: Pid, now: TimeNs, ns: TimeNs) {
        let gen = match self.tasks.get_mut(&pid) {
            Some(st) => {
                st.state = SimState::Sleeping;
                st.gen
            }
            None => return,
        };
        self.push_event(now.saturating_add(ns), EventKind::SleepDone { pid, gen });
    }

    fn exit_task(&mut self, task: &TaskRef, now: TimeNs) {
        self.set_state(task.pid, SimState::Exited);
        self.trace
            .record(now, task.cpu(), TraceKind::TaskCompleted { pid: task.pid });
        self.sess.task_exit(task);
    }

    fn tick_cpu(&mut self, cpu: CpuId, now: TimeNs) {
        let Some(curr) = self.sess.curr(cpu) else {
            // Idle CPUs still run the stall checks.
            self.sess.notify_sched_tick(cpu, self.tick_ns);
            self.sess.take_kick(cpu);
            self.reschedule(cpu, PrevState::Runnable, now);
            return;
        };

        let pid = curr.pid;
        let run_done = match self.tasks.get_mut(&pid) {
            Some(st) => {
                st.run_remaining = st.run_remaining.saturating_sub(self.tick_ns);
                st.run_remaining == 0
            }
            None => false,
        };
        let mut resched = self.sess.notify_sched_tick(cpu, self.tick_ns);
        resched |= self.sess.take_kick(cpu).is_some();

        if !run_done {
            if resched {
                self.reschedule(cpu, PrevState::Runnable, now);
            }
            return;
        }

        let mut wakes = vec![];
        let next = match self.tasks.get_mut(&pid) {
            Some(st) => {
                if st.advance_phase() {
                    st.settle(&mut wakes)
                } else {
                    Next::Exit
                }
            }
            None => return,
        };
        self.deliver_wakes(wakes, now, cpu);

        match next {
            Next::Run => {
                if resched {
                    self.reschedule(cpu, PrevState::Runnable, now);
                }
            }
            Next::Sleep(ns) => {
                self.trace.record(now, cpu, TraceKind::TaskSlept { pid });
                self.sleep_task(pid, now, ns);
                self.reschedule(cpu, PrevState::Blocked, now);
            }
            Next::Exit => {
                self.set_state(pid, SimState::Exited);
                self.trace
                    .record(now, cpu, TraceKind::TaskCompleted { pid });
                self.reschedule(cpu, PrevState::Dead, now);
                self.sess.task_exit(&curr);
            }
        }
    }

    fn reschedule(&mut self, cpu: CpuId, how: PrevState, now: TimeNs) {
        let prev = self.sess.curr(cpu);
        let next = self.sess.schedule(cpu, how);

        if let (Some(prev), Some(next)) = (&prev, &next) {
            if prev.pid == next.pid {
                return;
            }
        }
        if let Some(prev) = &prev {
            if how == PrevState::Runnable {
                self.set_state(prev.pid, SimState::Runnable);
                self.trace
                    .record(now, cpu, TraceKind::TaskPreempted { pid: prev.pid });
            }
        }

        let idx = cpu.idx();
        match next {
            Some(next) => {
                self.idle[idx] = false;
                let class = if self.sess.task_on_scx(&next) {
                    SchedClass::Ext
                } else {
                    SchedClass::Fair
                };
                self.set_state(next.pid, SimState::Running(cpu));
                self.trace.record(
                    now,
                    cpu,
                    TraceKind::TaskScheduled {
                        pid: next.pid,
                        class,
                    },
                );
            }
            None => {
                if !self.idle[idx] {
                    self.idle[idx] = true;
                    self.trace.record(now, cpu, TraceKind::CpuIdle);
                }
            }
        }
    }

    /// Run on a background thread, one tick per `tick_wall` of wall time,
    /// until `shutdown` is set. Trace recording is turned off.
    pub fn spawn_paced(mut self, tick_wall: Duration, shutdown: Arc<AtomicBool>) -> JoinHandle<Self> {
        self.disable_trace();
        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                self.step();
                thread::sleep(tick_wall);
            }
            self
        })
    }
}
