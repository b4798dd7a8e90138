// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeMap;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use scx_core::CpuId;
use scx_core::Cpumask;

use crate::MAX_DOMS;
use crate::MAX_NUMA_NODES;

#[derive(Debug)]
pub struct Domain {
    id: usize,
    node: usize,
    mask: Cpumask,
}

impl Domain {
    /// Get the Domain's ID.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The NUMA node the domain belongs to.
    pub fn node(&self) -> usize {
        self.node
    }

    pub fn mask(&self) -> &Cpumask {
        &self.mask
    }

    /// The number of CPUs in the domain.
    pub fn weight(&self) -> usize {
        self.mask.weight()
    }
}

#[derive(Debug)]
pub struct DomainGroup {
    doms: BTreeMap<usize, Domain>,
    cpu_dom_map: BTreeMap<usize, usize>,
    nr_nodes: usize,
    nr_cpus: usize,
}

impl DomainGroup {
    /// One domain per cpumask string. Every CPU may belong to at most one
    /// domain, CPUs left out of all masks are considered offline. All
    /// domains live on NUMA node 0.
    pub fn from_cpumasks(nr_cpus: usize, cpumasks: &[String]) -> Result<Self> {
        let mut doms = BTreeMap::new();
        for (id, mask_str) in cpumasks.iter().enumerate() {
            let mask = Cpumask::from_str(mask_str, nr_cpus)
                .with_context(|| format!("Failed to parse cpumask {:?}", mask_str))?;
            doms.insert(id, Domain { id, node: 0, mask });
        }
        Self::build(nr_cpus, doms, 1)
    }

    /// Split `nr_cpus` into `nr_doms` contiguous domains spread evenly over
    /// `nr_nodes` NUMA nodes.
    pub fn split(nr_cpus: usize, nr_doms: usize, nr_nodes: usize) -> Result<Self> {
        if nr_doms == 0 || nr_doms > nr_cpus {
            bail!("nr_doms ({}) must be between 1 and nr_cpus ({})", nr_doms, nr_cpus);
        }
        if nr_nodes == 0 || nr_nodes > nr_doms {
            bail!("nr_nodes ({}) must be between 1 and nr_doms ({})", nr_nodes, nr_doms);
        }

        let mut doms = BTreeMap::new();
        for id in 0..nr_doms {
            let mut mask = Cpumask::new(nr_cpus);
            for cpu in (id * nr_cpus / nr_doms)..((id + 1) * nr_cpus / nr_doms) {
                mask.set_cpu(cpu)?;
            }
            let node = id * nr_nodes / nr_doms;
            doms.insert(id, Domain { id, node, mask });
        }
        Self::build(nr_cpus, doms, nr_nodes)
    }

    fn build(nr_cpus: usize, doms: BTreeMap<usize, Domain>, nr_nodes: usize) -> Result<Self> {
        if doms.is_empty() {
            bail!("No domains specified");
        }
        if doms.len() > MAX_DOMS {
            bail!("nr_doms ({}) is greater than MAX_DOMS ({})", doms.len(), MAX_DOMS);
        }
        if nr_nodes > MAX_NUMA_NODES {
            bail!("nr_nodes ({}) is greater than MAX_NUMA_NODES ({})", nr_nodes, MAX_NUMA_NODES);
        }

        let mut cpu_dom_map = BTreeMap::new();
        for (id, dom) in doms.iter() {
            if dom.mask.is_empty() {
                bail!("Domain {} has no CPUs", id);
            }
            for cpu in dom.mask.iter() {
                if let Some(other) = cpu_dom_map.insert(cpu.idx(), *id) {
                    bail!("CPU {} belongs to both domain {} and {}", cpu, other, id);
                }
            }
        }

        Ok(Self {
            doms,
            cpu_dom_map,
            nr_nodes,
            nr_cpus,
        })
    }

    pub fn doms(&self) -> &BTreeMap<usize, Domain> {
        &self.doms
    }

    pub fn nr_doms(&self) -> usize {
        self.doms.len()
    }

    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn cpu_dom_id(&self, cpu: CpuId) -> Option<usize> {
        self.cpu_dom_map.get(&cpu.idx()).copied()
    }

    pub fn dom_numa_id(&self, dom_id: usize) -> Option<usize> {
        self.doms.get(&dom_id).map(|dom| dom.node)
    }

    pub fn numa_doms(&self, node: usize) -> Vec<&Domain> {
        self.doms.values().filter(|dom| dom.node == node).collect()
    }

    /// Union of the cpumasks of all domains on `node`.
    pub fn numa_mask(&self, node: usize) -> Cpumask {
        self.numa_doms(node)
            .iter()
            .fold(Cpumask::new(self.nr_cpus), |acc, dom| acc.or(&dom.mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_spreads_doms_over_nodes() {
        let dg = DomainGroup::split(8, 4, 2).unwrap();
        assert_eq!(dg.nr_doms(), 4);
        assert_eq!(dg.cpu_dom_id(CpuId(0)), Some(0));
        assert_eq!(dg.cpu_dom_id(CpuId(3)), Some(1));
        assert_eq!(dg.cpu_dom_id(CpuId(7)), Some(3));
        assert_eq!(dg.dom_numa_id(1), Some(0));
        assert_eq!(dg.dom_numa_id(2), Some(1));
        assert_eq!(dg.numa_mask(1).weight(), 4);
        assert!(DomainGroup::split(4, 5, 1).is_err());
        assert!(DomainGroup::split(4, 2, 3).is_err());
    }

    #[test]
    fn test_cpumasks_must_not_overlap() {
        let dg = DomainGroup::from_cpumasks(8, &["0x0f".into(), "0x30".into()]).unwrap();
        assert_eq!(dg.nr_doms(), 2);
        assert_eq!(dg.cpu_dom_id(CpuId(5)), Some(1));
        assert_eq!(dg.cpu_dom_id(CpuId(7)), None);

        let err = DomainGroup::from_cpumasks(8, &["0x0f".into(), "0x18".into()]).unwrap_err();
        assert!(err.to_string().contains("belongs to both"));
        assert!(DomainGroup::from_cpumasks(8, &["none".into()]).is_err());
    }
}
