// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Pinhead allocator
//!
//! Maps vCPU demand onto hardware threads in a single greedy pass.
//!
//! Domains are handled in demand order, largest first. For each domain:
//!
//! 1. Sockets are ranked by load, the number of reservations across all of
//!    their threads, least loaded first.
//!
//! 2. Walking the sockets in that order, the cores of the current socket are
//!    ranked the same way, once, when the walk enters the socket.
//!
//! 3. Cores are consumed whole in ranked order: each of a core's threads is
//!    taken before moving on to the next core, so that a two vCPU domain
//!    lands on a core and its SMT sibling, a four vCPU domain on two such
//!    pairs, and so on, on the same socket when possible.
//!
//! 4. The walk stops as soon as the domain has one thread per vCPU. If every
//!    socket is exhausted first, the domain keeps the partial allocation and
//!    a warning is logged.
//!
//! 5. The domain's reservations are committed to the Topology before the
//!    next domain is ranked, so later domains see the load of earlier ones.
//!
//! Per-thread occupancy is not looked at by step 3 under the default
//! FillPolicy::Sequential: a core is entered based on its aggregate load and
//! its threads are taken in construction order, reserved or not.
//! FillPolicy::PreferIdle takes a core's least reserved threads first.

use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::demand::Demand;
use crate::error::PinError;
use crate::hypervisor::DomainId;
use crate::topology::Core;
use crate::topology::ThreadId;
use crate::topology::Topology;

/// Order in which the threads of a chosen core are taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FillPolicy {
    /// Construction order, regardless of existing reservations.
    #[default]
    Sequential,
    /// Least reserved threads first, construction order on ties.
    PreferIdle,
}

/// Threads reserved for one domain, in the order they were taken. The Nth
/// thread is meant for the domain's Nth vCPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub domain: DomainId,
    pub demand: usize,
    pub threads: Vec<ThreadId>,
}

impl Allocation {
    pub fn is_partial(&self) -> bool {
        self.threads.len() < self.demand
    }
}

fn core_fill_order(core: &Core, policy: FillPolicy) -> Vec<usize> {
    let mut order: Vec<usize> = (0..core.threads().len()).collect();
    if policy == FillPolicy::PreferIdle {
        order.sort_by_key(|&tidx| (core.threads()[tidx].load(), tidx));
    }
    order
}

/// Pick up to `nr_vcpus` threads for a domain without reserving them.
pub fn select_threads(top: &Topology, nr_vcpus: usize, policy: FillPolicy) -> Vec<ThreadId> {
    let mut picked = Vec::with_capacity(nr_vcpus);
    if nr_vcpus == 0 {
        return picked;
    }

    for sidx in top.sockets_by_load() {
        let socket = &top.sockets()[sidx];
        for cidx in socket.cores_by_load() {
            let core = &socket.cores()[cidx];
            for tidx in core_fill_order(core, policy) {
                picked.push(ThreadId {
                    socket: sidx,
                    core: cidx,
                    thread: tidx,
                });
                if picked.len() == nr_vcpus {
                    return picked;
                }
            }
        }
    }

    picked
}

/// Allocate threads for every domain in `demand`, in order, reserving them
/// in `top` as it goes.
pub fn allocate(
    top: &mut Topology,
    demand: &[Demand],
    policy: FillPolicy,
) -> Result<Vec<Allocation>> {
    let mut allocations = Vec::with_capacity(demand.len());

    for d in demand.iter() {
        let threads = select_threads(top, d.vcpus, policy);
        for &id in threads.iter() {
            top.reserve(id, d.domain)?;
        }

        let alloc = Allocation {
            domain: d.domain,
            demand: d.vcpus,
            threads,
        };
        if alloc.is_partial() {
            warn!(
                "{}",
                PinError::InsufficientCapacity {
                    domain: d.domain,
                    wanted: d.vcpus,
                    assigned: alloc.threads.len(),
                }
            );
        }

        let labels: Vec<&str> = alloc
            .threads
            .iter()
            .filter_map(|&id| top.thread(id).map(|t| t.label()))
            .collect();
        info!(
            "Domain {} ({} vCPUs) -> [{}]",
            d.domain,
            d.vcpus,
            labels.join(" ")
        );
        allocations.push(alloc);
    }

    for socket in top.sockets() {
        debug!("Socket {} load {}", socket.id(), socket.load());
    }

    Ok(allocations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinhead_utils::ProcessorLocation;

    /// `sockets` x `cores` x `threads`, processor ids following thread order.
    fn grid(sockets: usize, cores: usize, threads: usize) -> Topology {
        let mut procs = vec![];
        for s in 0..sockets {
            for c in 0..cores {
                for _ in 0..threads {
                    procs.push((procs.len(), ProcessorLocation::new(s, c)));
                }
            }
        }
        Topology::build(&procs, threads).unwrap()
    }

    fn cpus(top: &Topology, alloc: &Allocation) -> Vec<usize> {
        alloc
            .threads
            .iter()
            .map(|&id| top.thread(id).unwrap().cpu())
            .collect()
    }

    fn demand(list: &[(DomainId, usize)]) -> Vec<Demand> {
        list.iter()
            .map(|&(domain, vcpus)| Demand { domain, vcpus })
            .collect()
    }

    #[test]
    fn test_whole_core_then_next() {
        let mut top = grid(1, 2, 2);
        let list = demand(&[(1, 2), (2, 2)]);
        let allocs = allocate(&mut top, &list, FillPolicy::Sequential).unwrap();
        assert_eq!(cpus(&top, &allocs[0]), vec![0, 1]);
        assert_eq!(cpus(&top, &allocs[1]), vec![2, 3]);
        assert!(top.threads().all(|(_, t)| t.load() == 1));
    }

    #[test]
    fn test_spreads_across_sockets() {
        // 2 sockets x 2 cores x 2 threads: cpus 0-3 on socket 0, 4-7 on 1.
        let mut top = grid(2, 2, 2);
        let allocs = allocate(
            &mut top,
            &demand(&[(1, 4), (2, 2), (3, 1), (4, 1)]),
            FillPolicy::Sequential,
        )
        .unwrap();
        assert_eq!(cpus(&top, &allocs[0]), vec![0, 1, 2, 3]);
        assert_eq!(cpus(&top, &allocs[1]), vec![4, 5]);
        assert_eq!(cpus(&top, &allocs[2]), vec![6]);
        // Socket 1 now has load 3 vs 4 on socket 0, core 1 of socket 1 has 1.
        assert_eq!(cpus(&top, &allocs[3]), vec![6]);
    }

    #[test]
    fn test_crosses_socket_when_exhausted() {
        let mut top = grid(2, 1, 2);
        let allocs = allocate(&mut top, &demand(&[(1, 3)]), FillPolicy::Sequential).unwrap();
        assert_eq!(cpus(&top, &allocs[0]), vec![0, 1, 2]);
        assert!(!allocs[0].is_partial());
    }

    #[test]
    fn test_partial_allocation() {
        let mut top = grid(1, 1, 1);
        let list = demand(&[(1, 2), (2, 1)]);
        let allocs = allocate(&mut top, &list, FillPolicy::Sequential).unwrap();
        assert_eq!(cpus(&top, &allocs[0]), vec![0]);
        assert!(allocs[0].is_partial());
        // The run goes on for the next domain.
        assert_eq!(cpus(&top, &allocs[1]), vec![0]);
        assert_eq!(top.thread(allocs[0].threads[0]).unwrap().reservations(), &[1, 2]);
    }

    #[test]
    fn test_zero_demand_takes_nothing() {
        let top = grid(1, 2, 2);
        assert!(select_threads(&top, 0, FillPolicy::Sequential).is_empty());
    }

    /// After two single vCPU domains both cores have load 1. The third
    /// domain lands on core 0 again: Sequential reuses its reserved first
    /// thread, PreferIdle takes the free sibling.
    #[test]
    fn test_within_core_occupancy() {
        let list = demand(&[(1, 1), (2, 1), (3, 1)]);

        let mut top = grid(1, 2, 2);
        let allocs = allocate(&mut top, &list, FillPolicy::Sequential).unwrap();
        assert_eq!(cpus(&top, &allocs[0]), vec![0]);
        assert_eq!(cpus(&top, &allocs[1]), vec![2]);
        assert_eq!(cpus(&top, &allocs[2]), vec![0]);

        let mut top = grid(1, 2, 2);
        let allocs = allocate(&mut top, &list, FillPolicy::PreferIdle).unwrap();
        assert_eq!(cpus(&top, &allocs[0]), vec![0]);
        assert_eq!(cpus(&top, &allocs[1]), vec![2]);
        assert_eq!(cpus(&top, &allocs[2]), vec![1]);
    }

    #[test]
    fn test_no_duplicate_threads_per_domain() {
        let mut top = grid(2, 3, 2);
        let list = demand(&[(1, 5), (2, 5), (3, 3), (4, 20)]);
        for alloc in allocate(&mut top, &list, FillPolicy::Sequential).unwrap() {
            let mut seen = alloc.threads.clone();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), alloc.threads.len());
            assert!(alloc.threads.len() <= alloc.demand);
        }
    }
}
