// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Core counters, kept per CPU and summed on read.

use crate::percpu::PerCpuCounters;
use crate::types::CpuId;
use anyhow::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ScxStatIdx {
    Enqueue,
    Dequeue,
    DirectDispatch,
    LocalDispatch,
    GlobalDispatch,
    DsqDispatch,
    Overflow,
    Spurious,
    DoubleDispatch,
    AffnViol,
    Kick,
    Preempt,
    ExtPick,
    FairPick,
    EnqLast,
    EnableErr,
    WatchdogCheck,
}

pub const NR_SCX_STATS: usize = ScxStatIdx::WatchdogCheck as usize + 1;

#[derive(Debug)]
pub struct ScxStats {
    counters: PerCpuCounters,
}

impl ScxStats {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            counters: PerCpuCounters::new(nr_cpus, NR_SCX_STATS),
        }
    }

    pub fn inc(&self, cpu: CpuId, idx: ScxStatIdx) {
        self.counters.inc(cpu, idx as usize);
    }

    pub fn snapshot(&self) -> ScxStatsSnapshot {
        ScxStatsSnapshot::from_raw(&self.counters.read())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScxStatsSnapshot {
    pub nr_enqueued: u64,
    pub nr_dequeued: u64,
    pub nr_direct: u64,
    pub nr_local: u64,
    pub nr_global: u64,
    pub nr_dsq: u64,
    pub nr_overflow: u64,
    pub nr_spurious: u64,
    pub nr_double_dispatch: u64,
    pub nr_affn_viol: u64,
    pub nr_kicks: u64,
    pub nr_preempt: u64,
    pub nr_ext_picks: u64,
    pub nr_fair_picks: u64,
    pub nr_enq_last: u64,
    pub nr_enable_err: u64,
    pub nr_watchdog_checks: u64,
}

impl ScxStatsSnapshot {
    fn from_raw(raw: &[u64]) -> Self {
        let stat = |idx: ScxStatIdx| raw.get(idx as usize).copied().unwrap_or(0);
        Self {
            nr_enqueued: stat(ScxStatIdx::Enqueue),
            nr_dequeued: stat(ScxStatIdx::Dequeue),
            nr_direct: stat(ScxStatIdx::DirectDispatch),
            nr_local: stat(ScxStatIdx::LocalDispatch),
            nr_global: stat(ScxStatIdx::GlobalDispatch),
            nr_dsq: stat(ScxStatIdx::DsqDispatch),
            nr_overflow: stat(ScxStatIdx::Overflow),
            nr_spurious: stat(ScxStatIdx::Spurious),
            nr_double_dispatch: stat(ScxStatIdx::DoubleDispatch),
            nr_affn_viol: stat(ScxStatIdx::AffnViol),
            nr_kicks: stat(ScxStatIdx::Kick),
            nr_preempt: stat(ScxStatIdx::Preempt),
            nr_ext_picks: stat(ScxStatIdx::ExtPick),
            nr_fair_picks: stat(ScxStatIdx::FairPick),
            nr_enq_last: stat(ScxStatIdx::EnqLast),
            nr_enable_err: stat(ScxStatIdx::EnableErr),
            nr_watchdog_checks: stat(ScxStatIdx::WatchdogCheck),
        }
    }

    /// Counter increase since `prev`.
    pub fn delta(&self, prev: &Self) -> Self {
        Self {
            nr_enqueued: self.nr_enqueued.saturating_sub(prev.nr_enqueued),
            nr_dequeued: self.nr_dequeued.saturating_sub(prev.nr_dequeued),
            nr_direct: self.nr_direct.saturating_sub(prev.nr_direct),
            nr_local: self.nr_local.saturating_sub(prev.nr_local),
            nr_global: self.nr_global.saturating_sub(prev.nr_global),
            nr_dsq: self.nr_dsq.saturating_sub(prev.nr_dsq),
            nr_overflow: self.nr_overflow.saturating_sub(prev.nr_overflow),
            nr_spurious: self.nr_spurious.saturating_sub(prev.nr_spurious),
            nr_double_dispatch: self
                .nr_double_dispatch
                .saturating_sub(prev.nr_double_dispatch),
            nr_affn_viol: self.nr_affn_viol.saturating_sub(prev.nr_affn_viol),
            nr_kicks: self.nr_kicks.saturating_sub(prev.nr_kicks),
            nr_preempt: self.nr_preempt.saturating_sub(prev.nr_preempt),
            nr_ext_picks: self.nr_ext_picks.saturating_sub(prev.nr_ext_picks),
            nr_fair_picks: self.nr_fair_picks.saturating_sub(prev.nr_fair_picks),
            nr_enq_last: self.nr_enq_last.saturating_sub(prev.nr_enq_last),
            nr_enable_err: self.nr_enable_err.saturating_sub(prev.nr_enable_err),
            nr_watchdog_checks: self
                .nr_watchdog_checks
                .saturating_sub(prev.nr_watchdog_checks),
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "enq={:7} deq={:6} direct={:6} local={:7} global={:7} dsq={:7} ovf={:4} \
             spurious={:4} dbl={:3} affn={:4} kick={:6} preempt={:5} ext={:7} fair={:6}",
            self.nr_enqueued,
            self.nr_dequeued,
            self.nr_direct,
            self.nr_local,
            self.nr_global,
            self.nr_dsq,
            self.nr_overflow,
            self.nr_spurious,
            self.nr_double_dispatch,
            self.nr_affn_viol,
            self.nr_kicks,
            self.nr_preempt,
            self.nr_ext_picks,
            self.nr_fair_picks,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_delta() {
        let stats = ScxStats::new(2);
        stats.inc(CpuId(0), ScxStatIdx::Overflow);
        stats.inc(CpuId(1), ScxStatIdx::Overflow);
        stats.inc(CpuId(1), ScxStatIdx::WatchdogCheck);
        let first = stats.snapshot();
        assert_eq!(first.nr_overflow, 2);
        assert_eq!(first.nr_watchdog_checks, 1);

        stats.inc(CpuId(0), ScxStatIdx::Overflow);
        let delta = stats.snapshot().delta(&first);
        assert_eq!(delta.nr_overflow, 1);
        assert_eq!(delta.nr_watchdog_checks, 0);

        let mut line = vec![];
        delta.format(&mut line).unwrap();
        let line = String::from_utf8(line).unwrap();
        assert!(line.starts_with("enq="), "{line}");
        assert!(line.contains("ovf=   1"), "{line}");
        assert_eq!(line.lines().count(), 1);
    }
}
