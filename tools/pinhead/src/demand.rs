// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use anyhow::Result;
use log::debug;
use log::warn;

use crate::error::PinError;
use crate::hypervisor::DomainId;
use crate::hypervisor::Hypervisor;

/// Number of active vCPUs a running domain wants pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    pub domain: DomainId,
    pub vcpus: usize,
}

/// Gather the vCPU demand of every running domain, largest first.
///
/// Only vCPUs reported as running count. Domains without any are left out.
/// Domains with equal demand keep the order the hypervisor listed them in,
/// which makes the resulting allocation reproducible.
pub fn collect<H>(hv: &H) -> Result<Vec<Demand>>
where
    H: Hypervisor + ?Sized,
{
    let mut demand = vec![];
    for domain in hv.list_active_domains()? {
        // The domain may have stopped since it was listed.
        let states = match hv.vcpu_state(domain) {
            Ok(states) => states,
            Err(e) => {
                warn!("Skipping domain {}: {:#}", domain, e);
                continue;
            }
        };

        let mut vcpus = 0;
        for state in states.iter().filter(|s| s.active) {
            vcpus += 1;
            let cpu = match state.cpu {
                Some(cpu) => format!("cpu{}", cpu),
                None => "unknown cpu".to_string(),
            };
            let time = match state.cpu_time {
                Some(time) => format!("{:.1}s", time.as_secs_f64()),
                None => "n/a".to_string(),
            };
            debug!(
                "Domain {} vCPU {} last ran on {}, cpu time {}",
                domain, state.vcpu, cpu, time
            );
        }

        debug!("Domain {} has {} active vCPUs", domain, vcpus);
        if vcpus > 0 {
            demand.push(Demand { domain, vcpus });
        }
    }

    // sort_by is stable.
    demand.sort_by(|a, b| b.vcpus.cmp(&a.vcpus));

    if demand.is_empty() {
        return Err(PinError::NoActiveWorkload.into());
    }

    Ok(demand)
}
