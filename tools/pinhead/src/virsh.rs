// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Hypervisor backend driving libvirt through the virsh client.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::trace;
use pinhead_utils::Cpumask;
use sscanf::sscanf;

use crate::error::PinError;
use crate::hypervisor::DomainId;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::VcpuInfo;
use crate::hypervisor::VcpuState;

pub const DEFAULT_URI: &str = "qemu:///system";

#[derive(Debug, Clone)]
pub struct Virsh {
    binary: PathBuf,
    uri: String,
}

/// One record of `virsh vcpuinfo`.
#[derive(Debug, Clone, PartialEq)]
pub struct VcpuRecord {
    pub state: VcpuState,
    pub affinity: String,
}

impl Virsh {
    /// Check that the hypervisor at `uri` answers and return a handle on it.
    pub fn connect<P: AsRef<Path>>(binary: P, uri: &str) -> Result<Self> {
        let virsh = Self {
            binary: binary.as_ref().to_path_buf(),
            uri: uri.to_string(),
        };

        match virsh.command(&["uri"]) {
            Ok(canonical) => debug!("Connected to {}", canonical.trim()),
            Err(e) => return Err(PinError::Connection(format!("{}: {:#}", uri, e)).into()),
        }

        Ok(virsh)
    }

    fn command(&self, args: &[&str]) -> Result<String> {
        trace!("{:?} -c {} {}", self.binary, self.uri, args.join(" "));
        let output = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {:?}", self.binary))?;

        if !output.status.success() {
            bail!(
                "virsh {} failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn vcpuinfo(&self, domain: DomainId) -> Result<Vec<VcpuRecord>> {
        let out = self.command(&["vcpuinfo", &domain.to_string()])?;
        parse_vcpuinfo(&out)
            .with_context(|| format!("Failed to parse vcpuinfo of domain {}", domain))
    }
}

impl Hypervisor for Virsh {
    fn list_active_domains(&self) -> Result<Vec<DomainId>> {
        parse_domain_ids(&self.command(&["list", "--id"])?)
    }

    fn domain_uuid(&self, domain: DomainId) -> Result<String> {
        Ok(self.command(&["domuuid", &domain.to_string()])?.trim().to_string())
    }

    fn vcpu_state(&self, domain: DomainId) -> Result<Vec<VcpuState>> {
        Ok(self
            .vcpuinfo(domain)?
            .into_iter()
            .map(|rec| rec.state)
            .collect())
    }

    fn vcpu_info(&self, domain: DomainId, nr_cpus: usize) -> Result<Vec<VcpuInfo>> {
        self.vcpuinfo(domain)?
            .into_iter()
            .map(|rec| {
                Ok(VcpuInfo {
                    affinity: Cpumask::from_affinity_str(&rec.affinity, nr_cpus)?,
                    state: rec.state,
                })
            })
            .collect()
    }

    fn set_affinity(&mut self, domain: DomainId, vcpu: u32, mask: &Cpumask) -> Result<()> {
        if mask.is_empty() {
            bail!("Refusing to pin domain {} vCPU {} to no CPU", domain, vcpu);
        }
        self.command(&[
            "vcpupin",
            &domain.to_string(),
            &vcpu.to_string(),
            &mask.to_cpulist(),
            "--live",
        ])?;
        Ok(())
    }
}

/// Parse the output of `virsh list --id`, one domain id per line.
pub fn parse_domain_ids(out: &str) -> Result<Vec<DomainId>> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<DomainId>()
                .with_context(|| format!("Invalid domain id {:?}", line))
        })
        .collect()
}

/// Parse the output of `virsh vcpuinfo`:
///
///```text
///     VCPU:           0
///     CPU:            5
///     State:          running
///     CPU time:       405.4s
///     CPU Affinity:   yyyyyyyy
///```
///
/// Records are separated by blank lines and start with the VCPU key.
pub fn parse_vcpuinfo(out: &str) -> Result<Vec<VcpuRecord>> {
    let mut infos = vec![];
    let mut cur: Option<VcpuRecord> = None;

    for line in out.lines() {
        let (key, val) = match line.split_once(':') {
            Some((key, val)) => (key.trim(), val.trim()),
            None => continue,
        };

        if key == "VCPU" {
            if let Some(info) = cur.take() {
                infos.push(info);
            }
            let vcpu = val
                .parse::<u32>()
                .with_context(|| format!("Invalid vCPU index {:?}", val))?;
            cur = Some(VcpuRecord {
                state: VcpuState {
                    vcpu,
                    active: false,
                    cpu: None,
                    cpu_time: None,
                },
                affinity: String::new(),
            });
            continue;
        }

        let info = match cur.as_mut() {
            Some(info) => info,
            None => bail!("Found {:?} outside of a vCPU record", key),
        };
        match key {
            "CPU" => info.state.cpu = val.parse::<usize>().ok(),
            "State" => info.state.active = val == "running",
            "CPU time" => {
                info.state.cpu_time = sscanf!(val, "{f64}s")
                    .ok()
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(Duration::from_secs_f64)
            }
            "CPU Affinity" => info.affinity = val.to_string(),
            _ => trace!("Ignoring vcpuinfo key {:?}", key),
        }
    }
    if let Some(info) = cur.take() {
        infos.push(info);
    }

    for info in infos.iter() {
        if info.affinity.is_empty() {
            bail!("No affinity reported for vCPU {}", info.state.vcpu);
        }
    }

    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VCPUINFO: &str = "\
VCPU:           0
CPU:            5
State:          running
CPU time:       405.4s
CPU Affinity:   yyyyyyyy

VCPU:           1
CPU:            N/A
State:          offline
CPU Affinity:   --y-----

VCPU:           2
CPU:            3
State:          running
CPU time:       142.0s
CPU Affinity:   ---y----

";

    #[test]
    fn test_parse_domain_ids() {
        assert_eq!(parse_domain_ids(" 1\n 7\n\n 12\n").unwrap(), vec![1, 7, 12]);
        assert_eq!(parse_domain_ids("\n").unwrap(), Vec::<DomainId>::new());
        assert!(parse_domain_ids(" 1\n web01\n").is_err());
    }

    #[test]
    fn test_parse_vcpuinfo() {
        let infos = parse_vcpuinfo(VCPUINFO).unwrap();
        assert_eq!(infos.len(), 3);

        let first = &infos[0].state;
        assert_eq!((first.vcpu, first.active, first.cpu), (0, true, Some(5)));
        assert_eq!(first.cpu_time, Some(Duration::from_secs_f64(405.4)));

        let second = &infos[1].state;
        assert_eq!((second.vcpu, second.active, second.cpu), (1, false, None));
        assert_eq!(second.cpu_time, None);

        assert!(infos[2].state.active);
        assert_eq!(
            Cpumask::from_affinity_str(&infos[2].affinity, 8).unwrap(),
            Cpumask::single(8, 3).unwrap()
        );
    }

    #[test]
    fn test_parse_vcpuinfo_errors() {
        assert!(parse_vcpuinfo("CPU: 1\n").is_err());
        assert!(parse_vcpuinfo("VCPU: x\n").is_err());
        assert!(parse_vcpuinfo("VCPU: 0\nState: running\n").is_err());
        assert_eq!(parse_vcpuinfo("").unwrap(), vec![]);
    }
}
