// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Pinhead Topology
//!
//! The host modelled as the socket -> core -> thread hierarchy that the
//! allocator walks. Each Thread carries the list of domains that reserved it
//! during the current run, which is what socket and core load is computed
//! from.
//!
//!```text
//!     Topology
//!       Socket 0
//!         Core 0:  s0c0t0 (cpu0)  s0c0t1 (cpu4)
//!         Core 1:  s0c1t0 (cpu1)  s0c1t1 (cpu5)
//!       Socket 1
//!         Core 0:  s1c0t0 (cpu2)  s1c0t1 (cpu6)
//!         Core 1:  s1c1t0 (cpu3)  s1c1t1 (cpu7)
//!```
//!
//! A Topology is rebuilt from the host on every run, starting with no
//! reservations. The order of sockets, of cores within a socket and of
//! threads within a core is fixed at construction and is what load ties are
//! broken by.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::Result;
use log::debug;
use log::trace;
use pinhead_utils::ProcessorLocation;

use crate::error::PinError;
use crate::hypervisor::DomainId;

/// Position of a thread in the Topology: socket, core and thread indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    pub socket: usize,
    pub core: usize,
    pub thread: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    label: String,
    cpu: usize,
    reservations: Vec<DomainId>,
}

impl Thread {
    /// Label derived from the position, e.g. "s0c1t0".
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Logical processor id as known to the OS and the hypervisor.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Domains that reserved this thread during the current run.
    pub fn reservations(&self) -> &[DomainId] {
        &self.reservations
    }

    pub fn load(&self) -> usize {
        self.reservations.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Core {
    id: usize,
    threads: Vec<Thread>,
}

impl Core {
    pub fn id(&self) -> usize {
        self.id
    }

    /// SMT siblings of this core, in fill order.
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn load(&self) -> usize {
        self.threads.iter().map(Thread::load).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    id: usize,
    cores: Vec<Core>,
}

impl Socket {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn load(&self) -> usize {
        self.cores.iter().map(Core::load).sum()
    }

    /// Core indices, least loaded first. Ties keep construction order.
    pub fn cores_by_load(&self) -> Vec<usize> {
        rank_by_load(self.cores.iter().map(Core::load))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    sockets: Vec<Socket>,
    nr_cpus: usize,
}

fn topology_err(msg: String) -> anyhow::Error {
    PinError::TopologyDetection(msg).into()
}

/// Map each distinct id to its position in ascending id order.
fn index_ids<I>(ids: I) -> BTreeMap<usize, usize>
where
    I: IntoIterator<Item = usize>,
{
    ids.into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(idx, id)| (id, idx))
        .collect()
}

/// Indices of `loads` sorted ascending by load, with the index itself as the
/// secondary key so equal loads keep their original order.
fn rank_by_load<I>(loads: I) -> Vec<usize>
where
    I: IntoIterator<Item = usize>,
{
    let mut ranked: Vec<(usize, usize)> = loads
        .into_iter()
        .enumerate()
        .map(|(idx, load)| (load, idx))
        .collect();
    ranked.sort_unstable();
    ranked.into_iter().map(|(_, idx)| idx).collect()
}

impl Topology {
    /// Build the hierarchy from the (processor id, location) pairs of every
    /// usable logical processor.
    ///
    /// Sockets and cores are laid out by ascending id, with every socket
    /// getting a slot set of `threads_per_core` for every distinct core id.
    /// Processors are then placed, in the order given, into the first free
    /// slot of their (socket, core). Slots no processor claimed are dropped,
    /// as are cores left without threads.
    ///
    /// Processor ids need not be contiguous: offline processors leave holes,
    /// and affinity masks span up to the highest id.
    pub fn build(
        processors: &[(usize, ProcessorLocation)],
        threads_per_core: usize,
    ) -> Result<Topology> {
        let nr_processors = processors.len();
        if nr_processors == 0 {
            return Err(topology_err("no logical processors found".into()));
        }
        if threads_per_core == 0 {
            return Err(topology_err("zero threads per core".into()));
        }
        let nr_cpus = processors
            .iter()
            .map(|&(cpu, _)| cpu + 1)
            .max()
            .unwrap_or(0);

        let socket_idx = index_ids(processors.iter().map(|(_, loc)| loc.socket));
        let core_idx = index_ids(processors.iter().map(|(_, loc)| loc.core));
        debug!(
            "{} cpus (mask width {}), {} threads per core, {} cores per socket, {} sockets",
            nr_processors,
            nr_cpus,
            threads_per_core,
            core_idx.len(),
            socket_idx.len()
        );

        // slots[socket][core][thread], None until a processor claims it.
        let mut slots: Vec<Vec<Vec<Option<usize>>>> =
            vec![vec![vec![None; threads_per_core]; core_idx.len()]; socket_idx.len()];
        let mut seen = BTreeSet::new();

        for &(cpu, loc) in processors.iter() {
            if !seen.insert(cpu) {
                return Err(topology_err(format!("cpu{} reported twice", cpu)));
            }

            let (sidx, cidx) = match (socket_idx.get(&loc.socket), core_idx.get(&loc.core)) {
                (Some(&sidx), Some(&cidx)) => (sidx, cidx),
                _ => {
                    return Err(topology_err(format!(
                        "cpu{} is on unindexed socket {} core {}",
                        cpu, loc.socket, loc.core
                    )));
                }
            };
            match slots[sidx][cidx].iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(cpu),
                None => {
                    return Err(topology_err(format!(
                        "no free thread slot for cpu{} on socket {} core {} ({} threads per core)",
                        cpu, loc.socket, loc.core, threads_per_core
                    )));
                }
            }
        }

        let mut sockets = Vec::with_capacity(socket_idx.len());
        for (socket_slots, &socket_id) in slots.into_iter().zip(socket_idx.keys()) {
            let mut cores = vec![];
            for (core_slots, &core_id) in socket_slots.into_iter().zip(core_idx.keys()) {
                let threads: Vec<Thread> = core_slots
                    .into_iter()
                    .enumerate()
                    .filter_map(|(tidx, cpu)| {
                        cpu.map(|cpu| Thread {
                            label: format!("s{}c{}t{}", socket_id, core_id, tidx),
                            cpu,
                            reservations: vec![],
                        })
                    })
                    .collect();
                if threads.is_empty() {
                    trace!("socket {} has no core {}", socket_id, core_id);
                    continue;
                }
                cores.push(Core {
                    id: core_id,
                    threads,
                });
            }
            sockets.push(Socket {
                id: socket_id,
                cores,
            });
        }

        let top = Topology { sockets, nr_cpus };
        let nr_threads = top.threads().count();
        if nr_threads != nr_processors {
            return Err(topology_err(format!(
                "mapped {} threads for {} processors",
                nr_threads, nr_processors
            )));
        }

        Ok(top)
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    /// Length of every affinity mask computed for this host: one past the
    /// highest processor id.
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.sockets
            .get(id.socket)?
            .cores
            .get(id.core)?
            .threads
            .get(id.thread)
    }

    /// Every thread with its position, in construction order.
    pub fn threads(&self) -> impl Iterator<Item = (ThreadId, &Thread)> + '_ {
        self.sockets.iter().enumerate().flat_map(|(sidx, socket)| {
            socket.cores.iter().enumerate().flat_map(move |(cidx, core)| {
                core.threads.iter().enumerate().map(move |(tidx, thread)| {
                    (
                        ThreadId {
                            socket: sidx,
                            core: cidx,
                            thread: tidx,
                        },
                        thread,
                    )
                })
            })
        })
    }

    /// Socket indices, least loaded first. Ties keep construction order.
    pub fn sockets_by_load(&self) -> Vec<usize> {
        rank_by_load(self.sockets.iter().map(Socket::load))
    }

    /// Record that `domain` holds the thread for the rest of the run.
    pub fn reserve(&mut self, id: ThreadId, domain: DomainId) -> Result<()> {
        let thread = self
            .sockets
            .get_mut(id.socket)
            .and_then(|socket| socket.cores.get_mut(id.core))
            .and_then(|core| core.threads.get_mut(id.thread))
            .ok_or_else(|| anyhow::anyhow!("No thread at {:?}", id))?;
        thread.reservations.push(domain);
        Ok(())
    }
}
