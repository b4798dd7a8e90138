// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use scx_core::Cpumask;

use crate::load_balance::NumaStat;
use crate::RustyStat;
use crate::RustyStats;

fn signed(x: f64) -> String {
    if x >= 0.0f64 {
        format!("{:+7.2}", x)
    } else {
        format!("{:7.2}", x)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DomainStats {
    pub load: f64,
    pub imbal: f64,
    pub delta: f64,
}

impl DomainStats {
    pub fn format<W: Write>(&self, w: &mut W, id: usize) -> Result<()> {
        writeln!(
            w,
            "   DOM[{:02}] load={:6.2} imbal={} delta={}",
            id,
            self.load,
            signed(self.imbal),
            signed(self.delta)
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    pub load: f64,
    pub imbal: f64,
    pub delta: f64,
    pub doms: BTreeMap<usize, DomainStats>,
}

impl NodeStats {
    pub fn format<W: Write>(&self, w: &mut W, id: usize) -> Result<()> {
        writeln!(
            w,
            "  NODE[{:02}] load={:6.2} imbal={} delta={}",
            id,
            self.load,
            signed(self.imbal),
            signed(self.delta)
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClusterStats {
    pub cpu_busy: f64,
    pub load: f64,
    pub nr_load_balances: u64,

    pub task_get_err: u64,
    pub lb_data_err: u64,
    pub cpu_used: f64,

    pub total: u64,

    pub sync_prev_idle: f64,
    pub wake_sync: f64,
    pub prev_idle: f64,
    pub greedy_idle: f64,
    pub pinned: f64,
    pub dispatch: f64,
    pub greedy: f64,
    pub greedy_far: f64,
    pub dsq_dispatch: f64,
    pub greedy_local: f64,
    pub greedy_xnuma: f64,
    pub kick_greedy: f64,
    pub repatriate: f64,

    pub slice_us: u64,
    pub direct_greedy_cpus: Option<Cpumask>,
    pub kick_greedy_cpus: Option<Cpumask>,

    pub nodes: BTreeMap<usize, NodeStats>,
}

impl ClusterStats {
    /// Placement counters are reported as percentages of all placement
    /// decisions in the interval.
    pub fn new(
        cpu_busy: f64,
        stats: &RustyStats,
        lb_stats: &[NumaStat],
        lb_data_err: u64,
        cpu_used: f64,
    ) -> Self {
        let total = stats.total();
        let pct = |stat: RustyStat| {
            if total == 0 {
                0.0
            } else {
                stats.get(stat) as f64 / total as f64 * 100.0
            }
        };

        let mut nodes = BTreeMap::new();
        let mut load = 0.0;
        for node in lb_stats.iter() {
            load += node.load.load_sum();
            let doms = node
                .domains
                .iter()
                .map(|dom| {
                    (
                        dom.id,
                        DomainStats {
                            load: dom.load.load_sum(),
                            imbal: dom.load.imbal(),
                            delta: dom.load.delta(),
                        },
                    )
                })
                .collect();
            nodes.insert(
                node.id,
                NodeStats {
                    load: node.load.load_sum(),
                    imbal: node.load.imbal(),
                    delta: node.load.delta(),
                    doms,
                },
            );
        }

        Self {
            cpu_busy: cpu_busy * 100.0,
            load,
            nr_load_balances: stats.get(RustyStat::LoadBalance),
            task_get_err: stats.get(RustyStat::TaskGetErr),
            lb_data_err,
            cpu_used,
            total,
            sync_prev_idle: pct(RustyStat::SyncPrevIdle),
            wake_sync: pct(RustyStat::WakeSync),
            prev_idle: pct(RustyStat::PrevIdle),
            greedy_idle: pct(RustyStat::GreedyIdle),
            pinned: pct(RustyStat::Pinned),
            dispatch: pct(RustyStat::DirectDispatch),
            greedy: pct(RustyStat::DirectGreedy),
            greedy_far: pct(RustyStat::DirectGreedyFar),
            dsq_dispatch: pct(RustyStat::DsqDispatch),
            greedy_local: pct(RustyStat::GreedyLocal),
            greedy_xnuma: pct(RustyStat::GreedyXnuma),
            kick_greedy: pct(RustyStat::KickGreedy),
            repatriate: pct(RustyStat::Repatriate),
            nodes,
            ..Default::default()
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "cpu={:7.2} load={:8.2} bal={} task_err={} lb_data_err={} cpu_used={:4.1}ms",
            self.cpu_busy,
            self.load,
            self.nr_load_balances,
            self.task_get_err,
            self.lb_data_err,
            self.cpu_used * 1000.0,
        )?;
        writeln!(
            w,
            "tot={:7} sync_prev_idle={:5.2} wsync={:5.2}",
            self.total, self.sync_prev_idle, self.wake_sync,
        )?;
        writeln!(
            w,
            "prev_idle={:5.2} greedy_idle={:5.2} pin={:5.2}",
            self.prev_idle, self.greedy_idle, self.pinned
        )?;

        writeln!(
            w,
            "dir={:5.2} dir_greedy={:5.2} dir_greedy_far={:5.2}",
            self.dispatch, self.greedy, self.greedy_far,
        )?;

        writeln!(
            w,
            "dsq={:5.2} greedy_local={:5.2} greedy_xnuma={:5.2}",
            self.dsq_dispatch, self.greedy_local, self.greedy_xnuma,
        )?;

        writeln!(
            w,
            "kick_greedy={:5.2} rep={:5.2}",
            self.kick_greedy, self.repatriate
        )?;

        writeln!(w, "slice={}us", self.slice_us)?;
        if let Some(mask) = &self.direct_greedy_cpus {
            writeln!(w, "direct_greedy_cpus={:x}", mask)?;
        }
        if let Some(mask) = &self.kick_greedy_cpus {
            writeln!(w, "  kick_greedy_cpus={:x}", mask)?;
        }

        for (nid, node) in self.nodes.iter() {
            node.format(w, *nid)?;
            for (did, dom) in node.doms.iter() {
                dom.format(w, *did)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cluster_stats() {
        let mut stats = ClusterStats {
            cpu_busy: 42.5,
            total: 10,
            prev_idle: 50.0,
            slice_us: 20000,
            ..Default::default()
        };
        stats.nodes.insert(
            0,
            NodeStats {
                load: 3.0,
                imbal: -1.0,
                delta: 0.0,
                doms: BTreeMap::from([(1, DomainStats { load: 1.5, imbal: 0.5, delta: 0.0 })]),
            },
        );

        let mut buf = Vec::new();
        stats.format(&mut buf).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.starts_with("cpu=  42.50"));
        assert!(out.contains("prev_idle=50.00"));
        assert!(out.contains("slice=20000us"));
        assert!(out.contains("  NODE[00] load=  3.00 imbal=  -1.00"));
        assert!(out.contains("   DOM[01] load=  1.50 imbal=  +0.50"));
        assert!(!out.contains("direct_greedy_cpus"));
    }
}
