// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A fixed-width set of CPUs backed by a `BitVec` of u64's. The width is the
//! CPU count of the session the mask belongs to, so masks from different
//! sessions never silently mix sizes.
//!
//! Masks are built empty or full, from a hexadecimal string, or from a
//! cpulist:
//!
//!```
//!     use scx_core::Cpumask;
//!     let mask = Cpumask::from_str("0xf0", 8).unwrap();
//!     assert!(mask.test_cpu(4));
//!     assert!(!mask.test_cpu(0));
//!
//!     let mask = Cpumask::from_cpulist("0-1,6", 8).unwrap();
//!     assert_eq!(mask.weight(), 3);
//!```
//!
//! The hexadecimal string also accepts "none" and "all".

use crate::types::CpuId;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask object.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every CPU set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask object from a hexadecimal string.
    pub fn from_str(cpumask: &str, nr_cpus: usize) -> Result<Cpumask> {
        match cpumask {
            "none" => return Ok(Self::new(nr_cpus)),
            "all" => return Ok(Self::full(nr_cpus)),
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace('_', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Self::new(nr_cpus);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= nr_cpus {
                    bail!(
                        concat!(
                            "Found cpu ({}) in cpumask ({}) which is larger",
                            " than the number of cpus ({})"
                        ),
                        cpu,
                        cpumask,
                        nr_cpus
                    );
                }
                mask.mask.set(cpu, true);
            }
        }

        Ok(mask)
    }

    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)
                .with_context(|| format!("Invalid cpulist {cpulist}"))?;
        }

        Ok(mask)
    }

    pub fn from_cpus(cpus: &[u32], nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for &cpu in cpus {
            mask.set_cpu(cpu as usize)?;
        }
        Ok(mask)
    }

    /// Return a slice of u64's whose bits reflect the Cpumask.
    pub fn as_raw_slice(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }

    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Out-of-range CPUs test false.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    pub fn has(&self, cpu: CpuId) -> bool {
        self.test_cpu(cpu.idx())
    }

    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    pub fn is_full(&self) -> bool {
        self.mask.all()
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn first(&self) -> Option<CpuId> {
        self.mask.first_one().map(|cpu| CpuId(cpu as u32))
    }

    pub fn not(&self) -> Cpumask {
        let mut new = self.clone();
        new.mask = !new.mask;
        new
    }

    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= other.mask.clone();
        new
    }

    pub fn intersects(&self, other: &Cpumask) -> bool {
        !self.and(other).is_empty()
    }

    pub fn is_subset_of(&self, other: &Cpumask) -> bool {
        self.and(&other.not()).is_empty()
    }

    /// Iterate over the indices of the set bits.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.mask.iter_ones().map(|cpu| CpuId(cpu as u32))
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let nr_cpus = self.len();
        if nr_cpus == 0 {
            return f.write_str("0");
        }
        let mut masks: Vec<u32> = self
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(nr_cpus.div_ceil(32));

        // Print the highest 32bit. Trim digits beyond nr_cpus.
        let width = match nr_cpus.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        match case {
            'X' => write!(f, "{:0width$X}", top, width = width)?,
            _ => write!(f, "{:0width$x}", top, width = width)?,
        }

        // The rest in descending order.
        for submask in masks.iter().rev() {
            match case {
                'X' => write!(f, ",{submask:08X}")?,
                _ => write!(f, ",{submask:08x}")?,
            }
        }
        Ok(())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0');
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        if min > max {
            bail!("Invalid cpu range {}-{}", min, max);
        }
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parsing() {
        let mask = Cpumask::from_str("0x0f_f0", 16).unwrap();
        assert_eq!(mask.weight(), 8);
        assert!(mask.test_cpu(4));
        assert!(mask.test_cpu(11));
        assert!(!mask.test_cpu(12));
        assert_eq!(format!("{mask}"), "0ff0");

        assert!(Cpumask::from_str("none", 4).unwrap().is_empty());
        assert!(Cpumask::from_str("all", 4).unwrap().is_full());
        assert!(Cpumask::from_str("0x100", 8).is_err());
        assert!(Cpumask::from_str("zz", 8).is_err());
    }

    #[test]
    fn cpulist_parsing() {
        let mask = Cpumask::from_cpulist("0-2,5", 8).unwrap();
        let cpus: Vec<u32> = mask.iter().map(|c| c.0).collect();
        assert_eq!(cpus, vec![0, 1, 2, 5]);
        assert_eq!(mask.first(), Some(CpuId(0)));
        assert!(Cpumask::from_cpulist("7-9", 8).is_err());
        assert!(Cpumask::from_cpulist("x", 8).is_err());
    }

    #[test]
    fn set_operations() {
        let a = Cpumask::from_cpulist("0-3", 8).unwrap();
        let b = Cpumask::from_cpulist("2-5", 8).unwrap();
        assert_eq!(a.and(&b).weight(), 2);
        assert_eq!(a.or(&b).weight(), 6);
        assert_eq!(a.not().weight(), 4);
        assert!(a.intersects(&b));
        assert!(a.and(&b).is_subset_of(&a));
        assert!(!b.is_subset_of(&a));
        assert!(Cpumask::new(8).first().is_none());
    }

    #[test]
    fn out_of_range_cpu_rejected() {
        let mut mask = Cpumask::new(4);
        assert!(mask.set_cpu(4).is_err());
        assert!(!mask.test_cpu(100));
        mask.set_cpu(3).unwrap();
        assert!(mask.has(CpuId(3)));
        mask.clear_cpu(3).unwrap();
        assert!(mask.is_empty());
    }
}
