// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! User space side of the layer cpumasks.
//!
//! Confined and grouped layers own CPUs handed out by a [`CpuPool`]. Every
//! refresh grows a layer while its per-CPU utilization is above the top of
//! its `util_range` and shrinks it while below the bottom, within
//! `cpus_range` and, unless disabled, the layer's share of the total load.
//! Open layers get whatever is left.

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use log::debug;
use log::trace;
use scx_core::CpuId;
use scx_core::Cpumask;

use crate::stats::Stats;
use crate::LayerKind;
use crate::LayerSpec;
use crate::LayeredOps;

#[derive(Debug)]
pub struct CpuPool {
    nr_cpus: usize,
    available_cpus: BitVec,
    first_cpu: usize,
    fallback_cpu: usize, // next free or the first CPU if none is free
}

impl CpuPool {
    pub fn new(nr_cpus: usize) -> Result<Self> {
        if nr_cpus == 0 {
            bail!("no CPUs to allocate");
        }
        let mut cpu_pool = Self {
            nr_cpus,
            available_cpus: bitvec![1; nr_cpus],
            first_cpu: 0,
            fallback_cpu: 0,
        };
        cpu_pool.update_fallback_cpu();
        Ok(cpu_pool)
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn fallback_cpu(&self) -> usize {
        self.fallback_cpu
    }

    pub fn nr_available(&self) -> usize {
        self.available_cpus.count_ones()
    }

    fn update_fallback_cpu(&mut self) {
        self.fallback_cpu = self.available_cpus.first_one().unwrap_or(self.first_cpu);
    }

    /// Take the lowest free CPU the layer may use.
    pub fn alloc_cpus(&mut self, layer: &Layer) -> Option<BitVec> {
        let cpu = self.available_cpus_in_mask(&layer.allowed_cpus).first_one()?;
        self.available_cpus.set(cpu, false);
        self.update_fallback_cpu();

        let mut cpus = bitvec![0; self.nr_cpus];
        cpus.set(cpu, true);
        Some(cpus)
    }

    pub fn free(&mut self, cpus_to_free: &BitVec) -> Result<()> {
        if (self.available_cpus.clone() & cpus_to_free).any() {
            bail!("Some of CPUs {} are already free", cpus_to_free);
        }
        self.available_cpus |= cpus_to_free;
        self.update_fallback_cpu();
        Ok(())
    }

    /// The highest CPU of `cands`. CPUs are given back in the reverse order
    /// of allocation.
    pub fn next_to_free(&self, cands: &BitVec) -> Option<BitVec> {
        let last = cands.last_one()?;
        let mut cpus = bitvec![0; self.nr_cpus];
        cpus.set(last, true);
        Some(cpus)
    }

    pub fn available_cpus_in_mask(&self, allowed_cpus: &BitVec) -> BitVec {
        self.available_cpus.clone() & allowed_cpus
    }
}

#[derive(Debug)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,

    pub nr_cpus: usize,
    pub cpus: BitVec,
    pub allowed_cpus: BitVec,
}

impl Layer {
    pub fn new(spec: &LayerSpec, cpu_pool: &CpuPool) -> Self {
        let (cpus, nr_cpus) = match &spec.kind {
            LayerKind::Open { .. } => (cpu_pool.available_cpus.clone(), cpu_pool.nr_available()),
            _ => (bitvec![0; cpu_pool.nr_cpus], 0),
        };
        Self {
            name: spec.name.clone(),
            kind: spec.kind.clone(),
            nr_cpus,
            cpus,
            allowed_cpus: bitvec![1; cpu_pool.nr_cpus],
        }
    }

    pub fn cpumask(&self) -> Result<Cpumask> {
        let cpus: Vec<u32> = self.cpus.iter_ones().map(|cpu| cpu as u32).collect();
        Cpumask::from_cpus(&cpus, self.cpus.len())
    }

    fn grow_confined_or_grouped(
        &mut self,
        cpu_pool: &mut CpuPool,
        (cpus_min, cpus_max): (usize, usize),
        (_util_low, util_high): (f64, f64),
        (layer_load, total_load): (f64, f64),
        layer_util: f64,
        no_load_frac_limit: bool,
    ) -> bool {
        let nr_cpus = self.cpus.count_ones();
        if nr_cpus >= cpus_max {
            trace!("layer has {} max: {}", nr_cpus, cpus_max);
            return false;
        }

        // Do we already have enough?
        if nr_cpus >= cpus_min
            && (layer_util == 0.0 || (nr_cpus > 0 && layer_util / nr_cpus as f64 <= util_high))
        {
            return false;
        }

        // Can't have more CPUs than our load fraction.
        if !no_load_frac_limit
            && nr_cpus >= cpus_min
            && total_load > 0.0
            && nr_cpus as f64 / cpu_pool.nr_cpus as f64 >= layer_load / total_load
        {
            trace!(
                "layer-{} needs more CPUs (util={:.3}) but is over the load fraction",
                &self.name,
                layer_util
            );
            return false;
        }

        let new_cpus = match cpu_pool.alloc_cpus(self) {
            Some(ret) => ret,
            None => {
                trace!("layer-{} can't grow, no CPUs", &self.name);
                return false;
            }
        };

        trace!(
            "layer-{} adding {} CPUs to {} CPUs",
            &self.name,
            new_cpus.count_ones(),
            nr_cpus,
        );
        self.cpus |= &new_cpus;
        self.nr_cpus = self.cpus.count_ones();
        true
    }

    fn cpus_to_free(
        &self,
        cpu_pool: &CpuPool,
        (cpus_min, _cpus_max): (usize, usize),
        (util_low, util_high): (f64, f64),
        (layer_load, total_load): (f64, f64),
        layer_util: f64,
        no_load_frac_limit: bool,
    ) -> Option<BitVec> {
        let nr_cpus = self.cpus.count_ones();
        if nr_cpus <= cpus_min {
            return None;
        }
        let cpus_to_free = cpu_pool.next_to_free(&self.cpus)?;
        let nr_to_free = cpus_to_free.count_ones();

        // If we'd be over the load fraction even after freeing
        // $cpus_to_free, we have to free.
        if !no_load_frac_limit
            && total_load > 0.0
            && (nr_cpus - nr_to_free) as f64 / cpu_pool.nr_cpus as f64 >= layer_load / total_load
        {
            return Some(cpus_to_free);
        }

        if layer_util / nr_cpus as f64 >= util_low {
            return None;
        }

        // Can't shrink if losing the CPUs pushes us over @util_high.
        match nr_cpus - nr_to_free {
            0 => {
                if layer_util > 0.0 {
                    return None;
                }
            }
            nr_left => {
                if layer_util / nr_left as f64 >= util_high {
                    return None;
                }
            }
        }

        Some(cpus_to_free)
    }

    fn shrink_confined_or_grouped(
        &mut self,
        cpu_pool: &mut CpuPool,
        cpus_range: (usize, usize),
        util_range: (f64, f64),
        load: (f64, f64),
        layer_util: f64,
        no_load_frac_limit: bool,
    ) -> Result<bool> {
        match self.cpus_to_free(
            cpu_pool,
            cpus_range,
            util_range,
            load,
            layer_util,
            no_load_frac_limit,
        ) {
            Some(cpus_to_free) => {
                trace!("{} freeing CPUs {}", self.name, &cpus_to_free);
                self.cpus &= !cpus_to_free.clone();
                cpu_pool.free(&cpus_to_free)?;
                self.nr_cpus = self.cpus.count_ones();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of CPUs added, negative if the layer shrank.
    pub fn resize_confined_or_grouped(
        &mut self,
        cpu_pool: &mut CpuPool,
        cpus_range: Option<(usize, usize)>,
        util_range: (f64, f64),
        load: (f64, f64),
        layer_util: f64,
        no_load_frac_limit: bool,
    ) -> Result<i64> {
        let cpus_range = cpus_range.unwrap_or((0, usize::MAX));
        let mut adjusted = 0;

        while self.grow_confined_or_grouped(
            cpu_pool,
            cpus_range,
            util_range,
            load,
            layer_util,
            no_load_frac_limit,
        ) {
            adjusted += 1;
            trace!("{} grew, adjusted={}", &self.name, adjusted);
        }

        if adjusted == 0 {
            while self.shrink_confined_or_grouped(
                cpu_pool,
                cpus_range,
                util_range,
                load,
                layer_util,
                no_load_frac_limit,
            )? {
                adjusted -= 1;
                trace!("{} shrunk, adjusted={}", &self.name, adjusted);
            }
        }

        if adjusted != 0 {
            trace!("{} done resizing, adjusted={}", &self.name, adjusted);
        }
        Ok(adjusted)
    }
}

/// Owns the CPU pool and the user space view of every layer's CPUs.
#[derive(Debug)]
pub struct LayerCpuAllocator {
    cpu_pool: CpuPool,
    layers: Vec<Layer>,
    no_load_frac_limit: bool,
    nr_layer_cpus_ranges: Vec<(usize, usize)>,
}

impl LayerCpuAllocator {
    pub fn new(specs: &[LayerSpec], nr_cpus: usize, no_load_frac_limit: bool) -> Result<Self> {
        let cpu_pool = CpuPool::new(nr_cpus)?;
        let layers: Vec<Layer> = specs.iter().map(|spec| Layer::new(spec, &cpu_pool)).collect();
        let nr_layer_cpus_ranges = layers.iter().map(|l| (l.nr_cpus, l.nr_cpus)).collect();
        Ok(Self {
            cpu_pool,
            layers,
            no_load_frac_limit,
            nr_layer_cpus_ranges,
        })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn fallback_cpu(&self) -> usize {
        self.cpu_pool.fallback_cpu()
    }

    /// Smallest and largest CPU count of every layer since the last call.
    pub fn take_cpus_ranges(&mut self) -> Vec<(usize, usize)> {
        let ranges = self.nr_layer_cpus_ranges.clone();
        for (range, layer) in self.nr_layer_cpus_ranges.iter_mut().zip(self.layers.iter()) {
            *range = (layer.nr_cpus, layer.nr_cpus);
        }
        ranges
    }

    /// Resize the layers according to `stats` and install the new cpumasks.
    /// Returns whether anything changed.
    pub fn refresh_cpumasks(&mut self, stats: &Stats, ops: &LayeredOps) -> Result<bool> {
        let mut updated = false;

        for (idx, layer) in self.layers.iter_mut().enumerate() {
            let Some((cpus_range, util_range)) = layer.kind.sizing() else {
                continue;
            };
            let load = (stats.layer_loads[idx], stats.total_load);
            if layer.resize_confined_or_grouped(
                &mut self.cpu_pool,
                cpus_range,
                util_range,
                load,
                stats.layer_utils[idx],
                self.no_load_frac_limit,
            )? != 0
            {
                ops.refresh_cpus(idx, layer.cpumask()?)?;
                updated = true;
            }
        }

        if !updated {
            return Ok(false);
        }

        for (idx, layer) in self.layers.iter_mut().enumerate() {
            if let LayerKind::Open { .. } = layer.kind {
                // Open layers need the intersection of allowed cpus and
                // available cpus.
                layer.cpus = self.cpu_pool.available_cpus_in_mask(&layer.allowed_cpus);
                layer.nr_cpus = layer.cpus.count_ones();
                ops.refresh_cpus(idx, layer.cpumask()?)?;
            }
        }

        ops.set_fallback_cpu(CpuId(self.cpu_pool.fallback_cpu() as u32))?;

        for (range, layer) in self.nr_layer_cpus_ranges.iter_mut().zip(self.layers.iter()) {
            *range = (range.0.min(layer.nr_cpus), range.1.max(layer.nr_cpus));
        }

        debug!(
            "layer cpus: {}",
            self.layers
                .iter()
                .map(|l| format!("{}={}", l.name, l.nr_cpus))
                .collect::<Vec<_>>()
                .join(" ")
        );
        Ok(true)
    }
}
