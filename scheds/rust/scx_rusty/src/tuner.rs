// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use scx_core::CpuId;
use scx_core::Cpumask;
use scx_core::ScxSession;
use scx_core::TimeNs;

use crate::DomainGroup;
use crate::RustyOps;

pub fn sub_or_zero(curr: &u64, prev: &u64) -> u64 {
    curr.saturating_sub(*prev)
}

fn calc_util(curr_busy: u64, prev_busy: u64, elapsed: u64) -> f64 {
    if elapsed == 0 {
        return 1.0;
    }
    (sub_or_zero(&curr_busy, &prev_busy) as f64 / elapsed as f64).clamp(0.0, 1.0)
}

pub struct Tuner {
    dom_group: Arc<DomainGroup>,
    direct_greedy_under: f64,
    kick_greedy_under: f64,
    slice_under_ns: u64,
    slice_over_ns: u64,
    prev_busy: Vec<u64>,
    prev_at: TimeNs,
    pub fully_utilized: bool,
    pub slice_ns: u64,
    pub cpu_busy: f64,
    dom_utils: Vec<f64>,
}

impl Tuner {
    /// `direct_greedy_under` and `kick_greedy_under` are utilization
    /// percentages.
    pub fn new(
        dom_group: Arc<DomainGroup>,
        direct_greedy_under: f64,
        kick_greedy_under: f64,
        slice_under_ns: u64,
        slice_over_ns: u64,
    ) -> Result<Self> {
        for (name, val) in [
            ("direct_greedy_under", direct_greedy_under),
            ("kick_greedy_under", kick_greedy_under),
        ] {
            if !(0.0..=100.0).contains(&val) {
                bail!("{} ({}) must be between 0 and 100", name, val);
            }
        }
        if slice_under_ns == 0 || slice_over_ns == 0 {
            bail!("slice lengths must be positive");
        }

        Ok(Self {
            direct_greedy_under: direct_greedy_under / 100.0,
            kick_greedy_under: kick_greedy_under / 100.0,
            slice_under_ns,
            slice_over_ns,
            prev_busy: vec![0; dom_group.nr_cpus()],
            prev_at: 0,
            fully_utilized: false,
            slice_ns: slice_under_ns,
            cpu_busy: 0.0,
            dom_utils: vec![0.0; dom_group.nr_doms()],
            dom_group,
        })
    }

    pub fn dom_util(&self, dom: usize) -> f64 {
        self.dom_utils[dom]
    }

    /// Apply a step in the Tuner by:
    ///
    /// 1. Reading the busy time of every CPU from the session
    /// 2. Calculating current per-domain and host-wide utilization
    /// 3. Updating the direct and kick greedy cpumasks and the slice length
    ///    according to the observed utilization
    pub fn step(&mut self, sess: &ScxSession, ops: &RustyOps) -> Result<()> {
        let now = sess.now();
        let elapsed = now.saturating_sub(self.prev_at);
        let nr_cpus = self.dom_group.nr_cpus();
        let mut dom_nr_cpus = vec![0; self.dom_group.nr_doms()];
        let mut dom_util_sum = vec![0.0; self.dom_group.nr_doms()];

        let mut avg_util = 0.0f64;
        let mut curr_busy = vec![0; nr_cpus];
        for cpu in 0..nr_cpus {
            let cpu_id = CpuId(cpu as u32);
            curr_busy[cpu] = sess.cpu_busy_ns(cpu_id);
            // CPUs outside of all domains are offline.
            if let Some(dom) = self.dom_group.cpu_dom_id(cpu_id) {
                let util = calc_util(curr_busy[cpu], self.prev_busy[cpu], elapsed);
                dom_nr_cpus[dom] += 1;
                dom_util_sum[dom] += util;
                avg_util += util;
            }
        }
        let nr_online: usize = dom_nr_cpus.iter().sum();
        avg_util /= nr_online.max(1) as f64;
        self.cpu_busy = avg_util;
        self.fully_utilized = avg_util >= 0.99999;

        let mut direct_greedy = Cpumask::new(nr_cpus);
        let mut kick_greedy = Cpumask::new(nr_cpus);
        for (dom_id, dom) in self.dom_group.doms().iter() {
            // Go with 0.0 for domains without online CPUs.
            let util = match dom_nr_cpus[*dom_id] {
                0 => 0.0,
                nr => dom_util_sum[*dom_id] / nr as f64,
            };
            self.dom_utils[*dom_id] = util;

            if self.direct_greedy_under > 0.99999 || util < self.direct_greedy_under {
                direct_greedy = direct_greedy.or(dom.mask());
            }
            if self.kick_greedy_under > 0.99999 || util < self.kick_greedy_under {
                kick_greedy = kick_greedy.or(dom.mask());
            }
        }

        self.slice_ns = if self.fully_utilized {
            self.slice_over_ns
        } else {
            self.slice_under_ns
        };

        debug!(
            "tune: util={:.3} slice={}us direct_greedy={:x} kick_greedy={:x}",
            avg_util,
            self.slice_ns / 1000,
            direct_greedy,
            kick_greedy
        );
        ops.set_tune_input(direct_greedy, kick_greedy, self.slice_ns);

        self.prev_busy = curr_busy;
        self.prev_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_util() {
        assert_eq!(calc_util(150, 100, 100), 0.5);
        assert_eq!(calc_util(500, 100, 100), 1.0);
        assert_eq!(calc_util(50, 100, 100), 0.0);
        assert_eq!(calc_util(0, 0, 0), 1.0);
    }

    #[test]
    fn test_percentages_are_validated() {
        let dg = Arc::new(DomainGroup::split(4, 2, 1).unwrap());
        assert!(Tuner::new(dg.clone(), 101.0, 100.0, 20_000_000, 1_000_000).is_err());
        assert!(Tuner::new(dg.clone(), 90.0, -1.0, 20_000_000, 1_000_000).is_err());
        assert!(Tuner::new(dg, 90.0, 100.0, 20_000_000, 1_000_000).is_ok());
    }
}
