// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Turns an Allocation into per-vCPU affinity and pushes it to the
//! hypervisor, leaving alone every vCPU whose live mask already matches.
//!
//! The Nth thread of the allocation goes to the Nth active vCPU in the
//! hypervisor's reporting order. A partial allocation leaves the remaining
//! vCPUs untouched. Each pin is independent: a failed one is logged and the
//! rest are still attempted, nothing is rolled back.

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use pinhead_utils::Cpumask;

use crate::alloc::Allocation;
use crate::hypervisor::Hypervisor;
use crate::topology::Topology;

/// A computed pin for one vCPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinTarget {
    /// Position of the vCPU in the hypervisor's report.
    pub pos: usize,
    pub vcpu: u32,
    pub label: String,
    pub cpu: usize,
    pub mask: Cpumask,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinStats {
    /// Masks changed on the hypervisor.
    pub applied: usize,
    /// Live mask already matched, no call made.
    pub unchanged: usize,
    /// set_affinity calls that failed.
    pub failed: usize,
    /// Active vCPUs left without a target by a partial allocation.
    pub untouched: usize,
}

impl PinStats {
    pub fn merge(&mut self, other: &PinStats) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.untouched += other.untouched;
    }
}

/// Pair the allocation's threads with `vcpus`, the (report position, vCPU
/// index) of the domain's active vCPUs, and build a single-processor mask
/// for each pair.
pub fn pin_targets(
    alloc: &Allocation,
    top: &Topology,
    vcpus: &[(usize, u32)],
) -> Result<Vec<PinTarget>> {
    let mut targets = vec![];
    for (&id, &(pos, vcpu)) in alloc.threads.iter().zip(vcpus.iter()) {
        let thread = match top.thread(id) {
            Some(thread) => thread,
            None => bail!("Domain {} allocated unknown thread {:?}", alloc.domain, id),
        };
        targets.push(PinTarget {
            pos,
            vcpu,
            label: thread.label().to_string(),
            cpu: thread.cpu(),
            mask: Cpumask::single(top.nr_cpus(), thread.cpu())?,
        });
    }

    Ok(targets)
}

/// Apply `alloc` to its domain. Errors are returned only when the domain's
/// current state can't be read; individual pin failures are counted.
pub fn apply<H>(hv: &mut H, alloc: &Allocation, top: &Topology) -> Result<PinStats>
where
    H: Hypervisor + ?Sized,
{
    let domain = alloc.domain;
    let uuid = hv
        .domain_uuid(domain)
        .unwrap_or_else(|_| "unknown".to_string());
    let infos = hv.vcpu_info(domain, top.nr_cpus())?;

    let active: Vec<(usize, u32)> = infos
        .iter()
        .enumerate()
        .filter(|(_, info)| info.state.active)
        .map(|(pos, info)| (pos, info.state.vcpu))
        .collect();

    let targets = pin_targets(alloc, top, &active)?;
    let mut stats = PinStats {
        untouched: active.len() - targets.len(),
        ..Default::default()
    };

    for target in targets.iter() {
        let live = &infos[target.pos].affinity;
        debug!(
            "Domain {} vCPU {}: live {} ({} cpus), computed {}",
            domain,
            target.vcpu,
            live,
            live.weight(),
            target.mask
        );
        if *live == target.mask {
            info!(
                "Live pin mask for domain {} vCPU {} matches {} (cpu{}); skipping repinning",
                domain, target.vcpu, target.label, target.cpu
            );
            stats.unchanged += 1;
            continue;
        }

        info!(
            "Pinning domain {} (UUID {}) vCPU {} to thread {} (cpu{})",
            domain, uuid, target.vcpu, target.label, target.cpu
        );
        match hv.set_affinity(domain, target.vcpu, &target.mask) {
            Ok(()) => stats.applied += 1,
            Err(e) => {
                warn!(
                    "Failed to pin domain {} vCPU {} to cpu{}: {:#}",
                    domain, target.vcpu, target.cpu, e
                );
                stats.failed += 1;
            }
        }
    }

    if stats.untouched > 0 {
        warn!(
            "Domain {}: {} vCPUs left unpinned by a partial allocation",
            domain, stats.untouched
        );
    }

    Ok(stats)
}
