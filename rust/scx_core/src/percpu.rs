// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU storage.
//!
//! `PerCpu<T>` is allocated once for the CPU count of the session and never
//! grows. Each slot sits on its own cache line so that CPUs updating their
//! own slot don't bounce lines between each other.

use crate::types::CpuId;
use crossbeam::utils::CachePadded;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Debug)]
pub struct PerCpu<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T> PerCpu<T> {
    pub fn new(nr_cpus: usize, mut init: impl FnMut(CpuId) -> T) -> Self {
        let slots = (0..nr_cpus)
            .map(|cpu| CachePadded::new(init(CpuId(cpu as u32))))
            .collect();
        Self { slots }
    }

    /// Slot of `cpu`. CPU ids are validated at the session boundary, an out
    /// of range id here is a bug.
    pub fn get(&self, cpu: CpuId) -> &T {
        &self.slots[cpu.idx()]
    }

    pub fn try_get(&self, cpu: CpuId) -> Option<&T> {
        self.slots.get(cpu.idx()).map(|slot| &**slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(cpu, slot)| (CpuId(cpu as u32), &**slot))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Per-CPU arrays of counters. Each CPU bumps its own copy, readers sum
/// them up. Individual counters are atomic so a read never observes a torn
/// value, although the sum across CPUs is not a point-in-time snapshot.
#[derive(Debug)]
pub struct PerCpuCounters {
    nr_stats: usize,
    counters: PerCpu<Box<[AtomicU64]>>,
}

impl PerCpuCounters {
    pub fn new(nr_cpus: usize, nr_stats: usize) -> Self {
        Self {
            nr_stats,
            counters: PerCpu::new(nr_cpus, |_| (0..nr_stats).map(|_| AtomicU64::new(0)).collect()),
        }
    }

    pub fn nr_stats(&self) -> usize {
        self.nr_stats
    }

    pub fn add(&self, cpu: CpuId, idx: usize, val: u64) {
        if let Some(slot) = self.counters.try_get(cpu) {
            slot[idx].fetch_add(val, Ordering::Relaxed);
        }
    }

    pub fn inc(&self, cpu: CpuId, idx: usize) {
        self.add(cpu, idx, 1);
    }

    pub fn read(&self) -> Vec<u64> {
        let mut sums = vec![0u64; self.nr_stats];
        for (_, slot) in self.counters.iter() {
            for (sum, counter) in sums.iter_mut().zip(slot.iter()) {
                *sum += counter.load(Ordering::Relaxed);
            }
        }
        sums
    }

    pub fn read_cpu(&self, cpu: CpuId) -> Vec<u64> {
        self.counters
            .get(cpu)
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Sum and clear. Increments racing with the reset land in the next read.
    pub fn read_and_reset(&self) -> Vec<u64> {
        let mut sums = vec![0u64; self.nr_stats];
        for (_, slot) in self.counters.iter() {
            for (sum, counter) in sums.iter_mut().zip(slot.iter()) {
                *sum += counter.swap(0, Ordering::Relaxed);
            }
        }
        sums
    }
}
