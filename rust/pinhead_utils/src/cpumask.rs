// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Pinhead Cpumask
//!
//! A fixed-length affinity mask with one bit per host logical processor.
//!
//! Cpumask
//! -------
//!
//! A Cpumask is a BitVec of u64's sized to the number of logical processors
//! it describes. Unlike the kernel's cpumask it carries its own length: two
//! masks are equal only when both their length and their set bits match, which
//! is what the hypervisor compares when deciding whether a vCPU needs to be
//! repinned.
//!
//!```
//!     use pinhead_utils::Cpumask;
//!     let mask = Cpumask::single(8, 3).unwrap();
//!     assert_eq!(mask.weight(), 1);
//!     assert_eq!(mask.to_cpulist(), "3");
//!     assert_eq!(format!("{}", mask), "08");
//!```
//!
//! Masks are read from libvirt's notation (one 'y' or '-' per processor,
//! e.g. "y-y-") and written as kernel cpulists (e.g. "0-3,8").

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask covering `len` logical processors.
    pub fn new(len: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; len],
        }
    }

    /// Build a Cpumask of `len` processors with only `cpu` set.
    pub fn single(len: usize, cpu: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(len);
        mask.set_cpu(cpu)?;
        Ok(mask)
    }

    /// Build a Cpumask from libvirt's affinity notation, one character per
    /// host processor: 'y' when the processor is allowed, '-' otherwise.
    ///
    /// The result is resized to `len` processors. Bits set beyond `len` are
    /// preserved by growing the mask instead, so that such a mask never
    /// compares equal to one built for a `len`-processor topology.
    pub fn from_affinity_str(affinity: &str, len: usize) -> Result<Cpumask> {
        let mut mask: BitVec<u64, Lsb0> = BitVec::with_capacity(affinity.len());
        for (idx, c) in affinity.trim().chars().enumerate() {
            match c {
                'y' | 'Y' => mask.push(true),
                '-' | 'n' | 'N' => mask.push(false),
                _ => bail!("Invalid character {:?} at {} in affinity {:?}", c, idx, affinity),
            }
        }

        let needed = match mask.last_one() {
            Some(last) => len.max(last + 1),
            None => len,
        };
        mask.resize(needed, false);

        Ok(Self { mask })
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Iterate over the indices of the bits set in the Cpumask.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }

    /// Format the set bits as a cpulist, e.g. "0-3,8".
    pub fn to_cpulist(&self) -> String {
        write_cpulist(self.iter())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    if cpulist.is_empty() {
        return Ok(vec![]);
    }

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
            bail!("Invalid range {} in cpulist", group.trim());
        }
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

/// Collapse ascending CPU ids into cpulist notation.
pub fn write_cpulist<I>(cpus: I) -> String
where
    I: IntoIterator<Item = usize>,
{
    let mut groups: Vec<(usize, usize)> = vec![];
    for cpu in cpus {
        match groups.last_mut() {
            Some((_, end)) if *end + 1 == cpu => *end = cpu,
            _ => groups.push((cpu, cpu)),
        }
    }

    groups
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Cpumask {
    /// Hex, most significant word first, 32 bits per comma separated group,
    /// the way the kernel prints cpumasks.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(self.len().div_ceil(32));

        let top = match masks.pop() {
            Some(top) => top,
            None => return write!(f, "0"),
        };

        // Trim digits of the highest group beyond the mask length.
        let width = match self.len().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        write!(f, "{:0width$x}", top, width = width)?;
        for submask in masks.iter().rev() {
            write!(f, ",{submask:08x}")?;
        }
        Ok(())
    }
}
