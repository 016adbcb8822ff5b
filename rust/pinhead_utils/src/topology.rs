// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Host Topology Discovery
//!
//! Reports where each logical processor of the host lives, as a
//! (socket id, core id) pair, along with a hint for the number of SMT
//! siblings per core. This is the raw material pinhead builds its
//! socket -> core -> thread model from; nothing here knows about
//! reservations or virtual machines.
//!
//! The information is exposed through the [`HostTopology`] trait so that the
//! allocation logic can be driven by synthetic topologies. The production
//! implementation, [`SysfsTopology`], reads the per-processor topology files
//! the kernel exports:
//!
//!```text
//!     /sys/devices/system/cpu/online
//!     /sys/devices/system/cpu/cpuN/topology/physical_package_id
//!     /sys/devices/system/cpu/cpuN/topology/core_id
//!     /sys/devices/system/cpu/cpuN/topology/thread_siblings_list
//!```
//!
//! Logical processor numbering is not assumed to be contiguous per core:
//! e.g. a 12 core Xeon E5-2670 v3 enumerates its core ids as 0-5, 8-13, and
//! SMT siblings are usually numbered N and N + nr_cores.

use crate::misc::read_from_file;
use crate::read_cpulist;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use sscanf::sscanf;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Physical position of a logical processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorLocation {
    pub socket: usize,
    pub core: usize,
}

impl ProcessorLocation {
    pub fn new(socket: usize, core: usize) -> Self {
        Self { socket, core }
    }
}

pub trait HostTopology {
    /// Ids of the logical processors usable on the host, ascending.
    fn logical_processors(&self) -> Result<Vec<usize>>;

    /// Socket and core id of the given logical processor.
    fn processor_location(&self, cpu: usize) -> Result<ProcessorLocation>;

    /// Number of hardware threads per core. Only a hint: cores with fewer
    /// threads may exist.
    fn threads_per_core(&self) -> Result<usize>;

    /// (processor id, location) for every logical processor, in the order of
    /// logical_processors().
    fn processor_locations(&self) -> Result<Vec<(usize, ProcessorLocation)>> {
        self.logical_processors()?
            .into_iter()
            .map(|cpu| Ok((cpu, self.processor_location(cpu)?)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsTopology {
    pub fn new() -> Self {
        Self::with_root(SYSFS_CPU_ROOT)
    }

    /// Read the topology from a sysfs-like tree rooted at `root` instead of
    /// /sys/devices/system/cpu.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn topology_path(&self, cpu: usize) -> PathBuf {
        self.root.join(format!("cpu{}", cpu)).join("topology")
    }

    /// Online processors, or None if the kernel doesn't export the list.
    fn cpus_online(&self) -> Result<Option<BTreeSet<usize>>> {
        let path = self.root.join("online");
        if !path.exists() {
            return Ok(None);
        }
        let online = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(read_cpulist(&online)?.into_iter().collect()))
    }
}

impl HostTopology for SysfsTopology {
    fn logical_processors(&self) -> Result<Vec<usize>> {
        let online = self.cpus_online()?;

        let pattern = self.root.join("cpu[0-9]*");
        let cpu_paths = glob(pattern.to_string_lossy().as_ref())?;
        let mut cpus = vec![];
        for cpu_path in cpu_paths.filter_map(Result::ok) {
            let name = match cpu_path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            let cpu_id = match sscanf!(name.as_str(), "cpu{usize}") {
                Ok(val) => val,
                Err(_) => {
                    bail!("Failed to parse cpu ID {}", name);
                }
            };

            if let Some(online) = &online {
                if !online.contains(&cpu_id) {
                    debug!("Skipping offline cpu{}", cpu_id);
                    continue;
                }
            }
            cpus.push(cpu_id);
        }

        cpus.sort_unstable();
        Ok(cpus)
    }

    fn processor_location(&self, cpu: usize) -> Result<ProcessorLocation> {
        let top_path = self.topology_path(cpu);
        let socket = read_from_file(&top_path.join("physical_package_id"))?;
        let core = read_from_file(&top_path.join("core_id"))?;
        Ok(ProcessorLocation { socket, core })
    }

    fn threads_per_core(&self) -> Result<usize> {
        let mut max_siblings = 0;
        for cpu in self.logical_processors()? {
            let path = self.topology_path(cpu).join("thread_siblings_list");
            let siblings = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            max_siblings = max_siblings.max(read_cpulist(&siblings)?.len());
        }

        Ok(max_siblings)
    }
}
