// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-memory hypervisor and host used to drive pinhead without libvirt.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::BTreeSet;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use pinhead::hypervisor::VcpuInfo;
use pinhead::hypervisor::VcpuState;
use pinhead::DomainId;
use pinhead::Hypervisor;
use pinhead_utils::Cpumask;
use pinhead_utils::HostTopology;
use pinhead_utils::ProcessorLocation;

pub struct FakeDomain {
    pub id: DomainId,
    pub vcpus: Vec<VcpuState>,
    pub live: Vec<Cpumask>,
}

impl FakeDomain {
    /// A domain whose vCPUs 0..n are all running and may run anywhere.
    pub fn running(id: DomainId, nr_vcpus: u32, nr_cpus: usize) -> Self {
        Self::with_states(id, &vec![true; nr_vcpus as usize], nr_cpus)
    }

    /// vCPU i is active iff `active[i]`.
    pub fn with_states(id: DomainId, active: &[bool], nr_cpus: usize) -> Self {
        let all = Cpumask::from_affinity_str(&"y".repeat(nr_cpus), nr_cpus).unwrap();
        Self {
            id,
            vcpus: active
                .iter()
                .enumerate()
                .map(|(vcpu, &active)| VcpuState {
                    vcpu: vcpu as u32,
                    active,
                    cpu: None,
                    cpu_time: None,
                })
                .collect(),
            live: vec![all; active.len()],
        }
    }
}

#[derive(Default)]
pub struct FakeHypervisor {
    pub domains: Vec<FakeDomain>,
    /// Every set_affinity call, in order.
    pub calls: Vec<(DomainId, u32, Cpumask)>,
    /// (domain, vcpu) pairs whose set_affinity fails.
    pub failing: BTreeSet<(DomainId, u32)>,
    /// Domains that vanish after being listed.
    pub vanished: BTreeSet<DomainId>,
    /// Number of vCPU reads of any domain.
    pub reads: Cell<usize>,
}

impl FakeHypervisor {
    pub fn new(domains: Vec<FakeDomain>) -> Self {
        Self {
            domains,
            ..Default::default()
        }
    }

    fn domain(&self, id: DomainId) -> Result<&FakeDomain> {
        if self.vanished.contains(&id) {
            bail!("Domain not found: no domain with matching id {}", id);
        }
        self.domains
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| anyhow!("Domain not found: no domain with matching id {}", id))
    }

    pub fn live(&self, id: DomainId, vcpu: u32) -> &Cpumask {
        let dom = self.domains.iter().find(|d| d.id == id).unwrap();
        let pos = dom.vcpus.iter().position(|s| s.vcpu == vcpu).unwrap();
        &dom.live[pos]
    }

    pub fn set_live(&mut self, id: DomainId, vcpu: u32, mask: Cpumask) {
        let dom = self.domains.iter_mut().find(|d| d.id == id).unwrap();
        let pos = dom.vcpus.iter().position(|s| s.vcpu == vcpu).unwrap();
        dom.live[pos] = mask;
    }
}

impl Hypervisor for FakeHypervisor {
    fn list_active_domains(&self) -> Result<Vec<DomainId>> {
        Ok(self.domains.iter().map(|d| d.id).collect())
    }

    fn domain_uuid(&self, domain: DomainId) -> Result<String> {
        self.domain(domain)?;
        Ok(format!("00000000-0000-0000-0000-{:012}", domain))
    }

    fn vcpu_state(&self, domain: DomainId) -> Result<Vec<VcpuState>> {
        self.reads.set(self.reads.get() + 1);
        Ok(self.domain(domain)?.vcpus.clone())
    }

    fn vcpu_info(&self, domain: DomainId, _nr_cpus: usize) -> Result<Vec<VcpuInfo>> {
        self.reads.set(self.reads.get() + 1);
        let dom = self.domain(domain)?;
        Ok(dom
            .vcpus
            .iter()
            .zip(dom.live.iter())
            .map(|(state, affinity)| VcpuInfo {
                state: state.clone(),
                affinity: affinity.clone(),
            })
            .collect())
    }

    fn set_affinity(&mut self, domain: DomainId, vcpu: u32, mask: &Cpumask) -> Result<()> {
        self.calls.push((domain, vcpu, mask.clone()));
        if self.failing.contains(&(domain, vcpu)) {
            bail!("Requested operation is not valid: cpu affinity is not supported");
        }
        self.domain(domain)?;
        self.set_live(domain, vcpu, mask.clone());
        Ok(())
    }
}

/// Host whose processors are given up front.
pub struct StaticHost {
    pub processors: Vec<(usize, ProcessorLocation)>,
    pub threads_per_core: usize,
}

impl StaticHost {
    /// `sockets` x `cores` x `threads`, processor ids following thread order.
    pub fn grid(sockets: usize, cores: usize, threads: usize) -> Self {
        let mut processors = vec![];
        for s in 0..sockets {
            for c in 0..cores {
                for _ in 0..threads {
                    processors.push((processors.len(), ProcessorLocation::new(s, c)));
                }
            }
        }
        Self {
            processors,
            threads_per_core: threads,
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.processors.len()
    }
}

impl HostTopology for StaticHost {
    fn logical_processors(&self) -> Result<Vec<usize>> {
        Ok(self.processors.iter().map(|(cpu, _)| *cpu).collect())
    }

    fn processor_location(&self, cpu: usize) -> Result<ProcessorLocation> {
        self.processors
            .iter()
            .find(|(id, _)| *id == cpu)
            .map(|(_, loc)| *loc)
            .ok_or_else(|| anyhow!("cpu{} not found", cpu))
    }

    fn threads_per_core(&self) -> Result<usize> {
        Ok(self.threads_per_core)
    }
}

/// Mask given as T/F per processor.
pub fn mask(bits: &str) -> Cpumask {
    let affinity: String = bits
        .chars()
        .map(|c| if c == 'T' { 'y' } else { '-' })
        .collect();
    Cpumask::from_affinity_str(&affinity, bits.len()).unwrap()
}
