// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use bitvec::prelude::*;
use scx_core::CpuId;
use scx_core::ScxSession;
use scx_core::TimeNs;
use scx_core::USAGE_HALF_LIFE;
use serde::Deserialize;
use serde::Serialize;

use crate::alloc::Layer;
use crate::GlobalStat;
use crate::LayerStat;
use crate::LayeredOps;
use crate::LayeredStats;

const USAGE_HALF_LIFE_F64: f64 = USAGE_HALF_LIFE as f64 / 1_000_000_000.0;

fn usage_decay() -> f64 {
    0.5f64.powf(1.0 / USAGE_HALF_LIFE_F64)
}

fn fmt_pct(v: f64) -> String {
    if v >= 99.995 {
        format!("{:5.1}", v)
    } else {
        format!("{:5.2}", v)
    }
}

/// Measurements user space sizes the layers by. Utilizations are in CPUs,
/// i.e. 1.0 is one fully busy CPU.
#[derive(Clone, Debug)]
pub struct Stats {
    nr_layers: usize,
    at: TimeNs,

    pub nr_layer_tasks: Vec<usize>,

    pub total_load: f64,
    pub layer_loads: Vec<f64>,

    pub total_util: f64, // Running AVG of sum of layer_utils
    pub layer_utils: Vec<f64>,
    prev_layer_cycles: Vec<u64>,

    pub cpu_busy: f64, // Read from the session, maybe higher than total_util
    prev_cpu_busy: Vec<u64>,

    pub layered_stats: LayeredStats,
    prev_layered_stats: LayeredStats,

    pub processing_dur: Duration,
    prev_processing_dur: Duration,
}

impl Stats {
    fn read_cpu_busy(sess: &ScxSession) -> Vec<u64> {
        (0..sess.nr_cpus())
            .map(|cpu| sess.cpu_busy_ns(CpuId(cpu)))
            .collect()
    }

    pub fn new(sess: &ScxSession, ops: &LayeredOps) -> Self {
        let nr_layers = ops.nr_layers();
        let layered_stats = ops.stats();

        Self {
            nr_layers,
            at: sess.now(),

            nr_layer_tasks: vec![0; nr_layers],

            total_load: 0.0,
            layer_loads: vec![0.0; nr_layers],

            total_util: 0.0,
            layer_utils: vec![0.0; nr_layers],
            prev_layer_cycles: ops.layer_cycles(),

            cpu_busy: 0.0,
            prev_cpu_busy: Self::read_cpu_busy(sess),

            layered_stats: layered_stats.clone(),
            prev_layered_stats: layered_stats,

            processing_dur: Default::default(),
            prev_processing_dur: Default::default(),
        }
    }

    pub fn refresh(
        &mut self,
        sess: &ScxSession,
        ops: &LayeredOps,
        cur_processing_dur: Duration,
    ) -> Result<()> {
        let now = sess.now();
        let elapsed_ns = now.saturating_sub(self.at);
        if elapsed_ns == 0 {
            return Ok(());
        }
        let elapsed = elapsed_ns as f64 / 1_000_000_000.0;

        let nr_layer_tasks: Vec<usize> = (0..self.nr_layers)
            .map(|layer| ops.layer_nr_tasks(layer))
            .collect();

        let layer_loads: Vec<f64> = (0..self.nr_layers)
            .map(|layer| ops.layer_load(layer, now))
            .collect();

        let cur_layer_cycles = ops.layer_cycles();
        let cur_layer_utils: Vec<f64> = cur_layer_cycles
            .iter()
            .zip(self.prev_layer_cycles.iter())
            .map(|(cur, prev)| cur.saturating_sub(*prev) as f64 / elapsed_ns as f64)
            .collect();
        let decay = usage_decay().powf(elapsed);
        let layer_utils: Vec<f64> = cur_layer_utils
            .iter()
            .zip(self.layer_utils.iter())
            .map(|(cur, prev)| prev * decay + cur * (1.0 - decay))
            .collect();

        let cur_cpu_busy = Self::read_cpu_busy(sess);
        let busy_ns: u64 = cur_cpu_busy
            .iter()
            .zip(self.prev_cpu_busy.iter())
            .map(|(cur, prev)| cur.saturating_sub(*prev))
            .sum();
        let cpu_busy = (busy_ns as f64 / (elapsed_ns as f64 * cur_cpu_busy.len().max(1) as f64))
            .clamp(0.0, 1.0);

        let cur_layered_stats = ops.stats();
        let layered_stats = &cur_layered_stats - &self.prev_layered_stats;

        let processing_dur = cur_processing_dur.saturating_sub(self.prev_processing_dur);

        *self = Self {
            at: now,
            nr_layers: self.nr_layers,

            nr_layer_tasks,

            total_load: layer_loads.iter().sum(),
            layer_loads,

            total_util: layer_utils.iter().sum(),
            layer_utils,
            prev_layer_cycles: cur_layer_cycles,

            cpu_busy,
            prev_cpu_busy: cur_cpu_busy,

            layered_stats,
            prev_layered_stats: cur_layered_stats,

            processing_dur,
            prev_processing_dur: cur_processing_dur,
        };
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LayerStats {
    pub util: f64,
    pub util_frac: f64,
    pub load: f64,
    pub load_frac: f64,
    pub tasks: u32,
    pub total: u64,
    pub sel_local: f64,
    pub enq_wakeup: f64,
    pub enq_expire: f64,
    pub enq_reenq: f64,
    pub min_exec: f64,
    pub open_idle: f64,
    pub preempt: f64,
    pub preempt_fail: f64,
    pub affn_viol: f64,
    pub is_excl: u32,
    pub cpus: Vec<u32>,
    pub cur_nr_cpus: u32,
    pub min_nr_cpus: u32,
    pub max_nr_cpus: u32,
}

impl LayerStats {
    fn bitvec_to_u32s(bitvec: &BitVec) -> Vec<u32> {
        let mut vals = Vec::<u32>::new();
        let mut val: u32 = 0;
        for (idx, bit) in bitvec.iter().enumerate() {
            if idx > 0 && idx % 32 == 0 {
                vals.push(val);
                val = 0;
            }
            if *bit {
                val |= 1 << (idx % 32);
            }
        }
        vals.push(val);
        vals
    }

    pub fn new(lidx: usize, layer: &Layer, stats: &Stats, nr_cpus_range: (usize, usize)) -> Self {
        let lstats = &stats.layered_stats;
        let ltotal = lstats.layer_total(lidx);
        let lstat_pct = |stat| {
            if ltotal != 0 {
                lstats.lstat(lidx, stat) as f64 / ltotal as f64 * 100.0
            } else {
                0.0
            }
        };
        let calc_frac = |a, b| {
            if b != 0.0 {
                a / b * 100.0
            } else {
                0.0
            }
        };

        Self {
            util: stats.layer_utils[lidx] * 100.0,
            util_frac: calc_frac(stats.layer_utils[lidx], stats.total_util),
            load: stats.layer_loads[lidx],
            load_frac: calc_frac(stats.layer_loads[lidx], stats.total_load),
            tasks: stats.nr_layer_tasks[lidx] as u32,
            total: ltotal,
            sel_local: lstat_pct(LayerStat::SelLocal),
            enq_wakeup: lstat_pct(LayerStat::EnqWakeup),
            enq_expire: lstat_pct(LayerStat::EnqExpire),
            enq_reenq: lstat_pct(LayerStat::EnqReenq),
            min_exec: lstat_pct(LayerStat::MinExec),
            open_idle: lstat_pct(LayerStat::OpenIdle),
            preempt: lstat_pct(LayerStat::Preempt),
            preempt_fail: lstat_pct(LayerStat::PreemptFail),
            affn_viol: lstat_pct(LayerStat::AffnViol),
            is_excl: layer.kind.common().exclusive as u32,
            cpus: Self::bitvec_to_u32s(&layer.cpus),
            cur_nr_cpus: layer.cpus.count_ones() as u32,
            min_nr_cpus: nr_cpus_range.0 as u32,
            max_nr_cpus: nr_cpus_range.1 as u32,
        }
    }

    pub fn format<W: Write>(&self, w: &mut W, name: &str, header_width: usize) -> Result<()> {
        writeln!(
            w,
            "  {:<width$}: util/frac={:7.1}/{:5.1} load/frac={:9.1}:{:5.1} tasks={:6}",
            name,
            self.util,
            self.util_frac,
            self.load,
            self.load_frac,
            self.tasks,
            width = header_width,
        )?;

        writeln!(
            w,
            "  {:<width$}  tot={:7} local={} wake/exp/reenq={}/{}/{}",
            "",
            self.total,
            fmt_pct(self.sel_local),
            fmt_pct(self.enq_wakeup),
            fmt_pct(self.enq_expire),
            fmt_pct(self.enq_reenq),
            width = header_width,
        )?;

        writeln!(
            w,
            "  {:<width$}  open_idle={} affn_viol={} preempt/fail={}/{} min_exec={}",
            "",
            fmt_pct(self.open_idle),
            fmt_pct(self.affn_viol),
            fmt_pct(self.preempt),
            fmt_pct(self.preempt_fail),
            fmt_pct(self.min_exec),
            width = header_width,
        )?;

        let mut cpus = self
            .cpus
            .iter()
            .fold(String::new(), |string, v| format!("{}{:08x} ", string, v));
        cpus.pop();

        writeln!(
            w,
            "  {:<width$}  cpus={:3} [{:3},{:3}] {}{}",
            "",
            self.cur_nr_cpus,
            self.min_nr_cpus,
            self.max_nr_cpus,
            &cpus,
            if self.is_excl != 0 { " excl" } else { "" },
            width = header_width
        )?;

        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SysStats {
    pub at: f64,
    pub total: u64,
    pub local: f64,
    pub open_idle: f64,
    pub affn_viol: f64,
    pub hi_fallback: u64,
    pub task_ctx_err: u64,
    pub proc_ms: u64,
    pub busy: f64,
    pub util: f64,
    pub load: f64,
    pub fallback_cpu: u32,
    pub layers: BTreeMap<String, LayerStats>,
}

impl SysStats {
    pub fn new(stats: &Stats, at: TimeNs, fallback_cpu: usize) -> Self {
        let lstats = &stats.layered_stats;
        let total = lstats.total();
        let lsum_pct = |stat| {
            if total != 0 {
                lstats.lstat_sum(stat) as f64 / total as f64 * 100.0
            } else {
                0.0
            }
        };

        Self {
            at: at as f64 / 1_000_000_000.0,
            total,
            local: lsum_pct(LayerStat::SelLocal),
            open_idle: lsum_pct(LayerStat::OpenIdle),
            affn_viol: lsum_pct(LayerStat::AffnViol),
            hi_fallback: lstats.gstat(GlobalStat::HiFallback),
            task_ctx_err: lstats.gstat(GlobalStat::TaskCtxErr),
            proc_ms: stats.processing_dur.as_millis() as u64,
            busy: stats.cpu_busy * 100.0,
            util: stats.total_util * 100.0,
            load: stats.total_load,
            fallback_cpu: fallback_cpu as u32,
            layers: BTreeMap::new(),
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "tot={:7} local={} open_idle={} affn_viol={} proc={}ms",
            self.total,
            fmt_pct(self.local),
            fmt_pct(self.open_idle),
            fmt_pct(self.affn_viol),
            self.proc_ms,
        )?;

        writeln!(
            w,
            "busy={:5.1} util={:7.1} load={:9.1} fallback_cpu={:3} task_err={}",
            self.busy, self.util, self.load, self.fallback_cpu, self.task_ctx_err,
        )?;

        Ok(())
    }

    pub fn format_all<W: Write>(&self, w: &mut W) -> Result<()> {
        self.format(w)?;
        let header_width = self
            .layers
            .keys()
            .map(|name| name.len())
            .max()
            .unwrap_or(0)
            .max(4);
        for (name, layer) in self.layers.iter() {
            layer.format(w, name, header_width)?;
        }
        Ok(())
    }
}
