// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # pinhead
//!
//! Pins the vCPUs of running virtual machines to hardware threads of the
//! host in one batch pass:
//!
//! 1. Collect the active vCPU count of every running domain ([`demand`]).
//! 2. Model the host as sockets, cores and threads ([`topology`]).
//! 3. Greedily reserve threads for each domain, largest first, spreading load
//!    across sockets and filling whole cores ([`alloc`]).
//! 4. Push the resulting single-thread affinity to each vCPU whose live mask
//!    differs ([`pinning`]).
//!
//! Nothing is kept between runs; the live affinity held by the hypervisor is
//! the only record of earlier decisions. The pass is meant to be re-run
//! externally, e.g. from a timer, whenever domains come and go.
//!
//! Two instances running at the same time against one host are not guarded
//! against and race on the live affinity.

pub mod alloc;
pub mod demand;
pub mod error;
pub mod hypervisor;
pub mod pinning;
pub mod topology;
pub mod virsh;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use pinhead_utils::HostTopology;

pub use alloc::Allocation;
pub use alloc::FillPolicy;
pub use error::exit_code;
pub use error::PinError;
pub use hypervisor::DomainId;
pub use hypervisor::Hypervisor;
pub use pinning::PinStats;
pub use topology::Topology;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOpts {
    pub fill_policy: FillPolicy,
    /// Overrides the host's threads per core hint.
    pub threads_per_core: Option<usize>,
    /// Allocate and log, but don't touch the hypervisor's affinity.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub allocations: Vec<Allocation>,
    /// Domains whose allocation has fewer threads than vCPUs.
    pub partial: usize,
    /// Domains that couldn't be inspected at apply time.
    pub skipped: usize,
    pub pins: PinStats,
}

/// Build the Topology of `host`.
pub fn build_topology<T>(host: &T, threads_per_core: Option<usize>) -> Result<Topology>
where
    T: HostTopology + ?Sized,
{
    let processors = host
        .processor_locations()
        .context("Failed to read host processor topology")?;
    let threads_per_core = match threads_per_core {
        Some(nr) => nr,
        None => host
            .threads_per_core()
            .context("Failed to read host threads per core")?,
    };
    Topology::build(&processors, threads_per_core)
}

/// Run one collect, allocate and apply pass.
pub fn run<H, T>(hv: &mut H, host: &T, opts: &RunOpts) -> Result<RunSummary>
where
    H: Hypervisor + ?Sized,
    T: HostTopology + ?Sized,
{
    let demand = demand::collect(&*hv)?;
    let mut top = build_topology(host, opts.threads_per_core)?;
    info!(
        "{} domains to place on {} cpus in {} sockets",
        demand.len(),
        top.threads().count(),
        top.sockets().len()
    );

    let allocations = alloc::allocate(&mut top, &demand, opts.fill_policy)?;
    let mut summary = RunSummary {
        partial: allocations.iter().filter(|a| a.is_partial()).count(),
        ..Default::default()
    };

    if opts.dry_run {
        info!("Dry run, leaving vCPU affinity untouched");
    } else {
        for alloc in allocations.iter() {
            match pinning::apply(&mut *hv, alloc, &top) {
                Ok(stats) => summary.pins.merge(&stats),
                Err(e) => {
                    warn!("Failed to pin domain {}: {:#}", alloc.domain, e);
                    summary.skipped += 1;
                }
            }
        }
    }

    summary.allocations = allocations;
    info!(
        "{} domains, {} partial, {} skipped; pins: {} applied, {} unchanged, {} failed, {} vCPUs untouched",
        summary.allocations.len(),
        summary.partial,
        summary.skipped,
        summary.pins.applied,
        summary.pins.unchanged,
        summary.pins.failed,
        summary.pins.untouched
    );

    Ok(summary)
}
