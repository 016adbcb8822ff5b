// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! What pinhead needs from the hypervisor. One session is opened per run and
//! every query and mutation goes through it; implementations are expected to
//! block until the hypervisor answers.

use std::time::Duration;

use anyhow::Result;
use pinhead_utils::Cpumask;

/// Hypervisor-assigned id of a running domain.
pub type DomainId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct VcpuState {
    /// vCPU index inside the domain.
    pub vcpu: u32,
    /// Whether the vCPU is actually running, as opposed to merely configured.
    pub active: bool,
    /// Host processor the vCPU last ran on, if known.
    pub cpu: Option<usize>,
    /// Accumulated run time, if reported.
    pub cpu_time: Option<Duration>,
}

/// A vCPU and its live affinity, taken from the same read of the domain.
#[derive(Debug, Clone, PartialEq)]
pub struct VcpuInfo {
    pub state: VcpuState,
    pub affinity: Cpumask,
}

pub trait Hypervisor {
    /// Ids of the currently running domains, in discovery order.
    fn list_active_domains(&self) -> Result<Vec<DomainId>>;

    /// Stable identity of the domain, for log lines.
    fn domain_uuid(&self, domain: DomainId) -> Result<String>;

    /// vCPUs of the domain, in the hypervisor's reporting order.
    fn vcpu_state(&self, domain: DomainId) -> Result<Vec<VcpuState>>;

    /// vCPUs of the domain with their live affinity, in reporting order.
    /// Masks are `nr_cpus` wide unless the hypervisor reports processors
    /// beyond that.
    fn vcpu_info(&self, domain: DomainId, nr_cpus: usize) -> Result<Vec<VcpuInfo>>;

    /// Restrict one vCPU of a running domain to `mask`.
    fn set_affinity(&mut self, domain: DomainId, vcpu: u32, mask: &Cpumask) -> Result<()>;
}
