// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduling events recorded by the engine.

use crate::exit::ScxExitKind;
use crate::session::SchedClass;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::TimeNs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub time_ns: TimeNs,
    pub cpu: CpuId,
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    /// A task started running, under `class`.
    TaskScheduled { pid: Pid, class: SchedClass },
    /// A runnable task was switched out.
    TaskPreempted { pid: Pid },
    TaskSlept { pid: Pid },
    TaskWoke { pid: Pid },
    /// Last phase done, the task exited.
    TaskCompleted { pid: Pid },
    CpuIdle,
    /// The policy was torn down. Recorded once.
    ScxDisabled { kind: ScxExitKind },
}

#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
    enabled: bool,
}

impl Trace {
    pub(crate) fn new() -> Self {
        Self {
            events: vec![],
            enabled: true,
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn record(&mut self, time_ns: TimeNs, cpu: CpuId, kind: TraceKind) {
        if self.enabled {
            self.events.push(TraceEvent { time_ns, cpu, kind });
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Time `pid` spent on a CPU, summed over the intervals between being
    /// scheduled and being switched out.
    pub fn total_runtime(&self, pid: Pid) -> TimeNs {
        let mut total = 0;
        let mut running_since = None;

        for event in &self.events {
            match event.kind {
                TraceKind::TaskScheduled { pid: p, .. } if p == pid => {
                    running_since = Some(event.time_ns);
                }
                TraceKind::TaskPreempted { pid: p }
                | TraceKind::TaskSlept { pid: p }
                | TraceKind::TaskCompleted { pid: p }
                    if p == pid =>
                {
                    if let Some(start) = running_since.take() {
                        total += event.time_ns - start;
                    }
                }
                _ => {}
            }
        }
        total
    }

    pub fn schedule_count(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { pid: p, .. } if p == pid))
            .count()
    }

    /// Number of times any task was scheduled under `class`.
    pub fn schedule_count_in(&self, class: SchedClass) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { class: c, .. } if c == class))
            .count()
    }

    /// CPUs `pid` was scheduled on, in order, duplicates kept.
    pub fn cpus_of(&self, pid: Pid) -> Vec<CpuId> {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { pid: p, .. } if p == pid))
            .map(|e| e.cpu)
            .collect()
    }

    pub fn idle_count(&self, cpu: CpuId) -> usize {
        self.events
            .iter()
            .filter(|e| e.cpu == cpu && e.kind == TraceKind::CpuIdle)
            .count()
    }

    pub fn completed(&self, pid: Pid) -> bool {
        self.events
            .iter()
            .any(|e| e.kind == TraceKind::TaskCompleted { pid })
    }

    /// When and why the policy was torn down.
    pub fn disabled_at(&self) -> Option<(TimeNs, ScxExitKind)> {
        self.events.iter().find_map(|e| match e.kind {
            TraceKind::ScxDisabled { kind } => Some((e.time_ns, kind)),
            _ => None,
        })
    }

    pub fn dump(&self) {
        for event in &self.events {
            let desc = match &event.kind {
                TraceKind::TaskScheduled { pid, class } => {
                    format!("SCHED    pid={} class={:?}", pid, class)
                }
                TraceKind::TaskPreempted { pid } => format!("PREEMPT  pid={}", pid),
                TraceKind::TaskSlept { pid } => format!("SLEEP    pid={}", pid),
                TraceKind::TaskWoke { pid } => format!("WAKE     pid={}", pid),
                TraceKind::TaskCompleted { pid } => format!("COMPLETE pid={}", pid),
                TraceKind::CpuIdle => "IDLE".to_string(),
                TraceKind::ScxDisabled { kind } => format!("DISABLED {}", kind.reason()),
            };
            eprintln!("[{:>12} ns] cpu={:<3} {}", event.time_ns, event.cpu.0, desc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_sums_closed_intervals() {
        let mut trace = Trace::new();
        let pid = Pid(7);
        trace.record(
            10,
            CpuId(0),
            TraceKind::TaskScheduled {
                pid,
                class: SchedClass::Ext,
            },
        );
        trace.record(30, CpuId(0), TraceKind::TaskPreempted { pid });
        trace.record(
            50,
            CpuId(1),
            TraceKind::TaskScheduled {
                pid,
                class: SchedClass::Fair,
            },
        );
        trace.record(55, CpuId(1), TraceKind::TaskSlept { pid });
        trace.record(
            60,
            CpuId(1),
            TraceKind::TaskScheduled {
                pid,
                class: SchedClass::Fair,
            },
        );

        assert_eq!(trace.total_runtime(pid), 25);
        assert_eq!(trace.schedule_count(pid), 3);
        assert_eq!(trace.schedule_count_in(SchedClass::Fair), 2);
        assert_eq!(trace.cpus_of(pid), vec![CpuId(0), CpuId(1), CpuId(1)]);
        assert!(!trace.completed(pid));
        assert_eq!(trace.disabled_at(), None);
    }

    #[test]
    fn disabled_trace_records_nothing() {
        let mut trace = Trace::new();
        trace.set_enabled(false);
        trace.record(1, CpuId(0), TraceKind::CpuIdle);
        assert!(trace.events().is_empty());
    }
}
