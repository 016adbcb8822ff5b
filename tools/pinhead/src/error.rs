// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fmt;

use crate::hypervisor::DomainId;

/// Conditions with a defined meaning for the run. Everything else bubbling
/// up through anyhow is treated as an unclassified fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    /// The hypervisor session could not be established.
    Connection(String),
    /// Host topology inputs are empty or contradict each other.
    TopologyDetection(String),
    /// No running domain has an active vCPU.
    NoActiveWorkload,
    /// A domain asked for more threads than the walk could provide. Only
    /// ever logged; the domain keeps its partial allocation.
    InsufficientCapacity {
        domain: DomainId,
        wanted: usize,
        assigned: usize,
    },
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinError::Connection(msg) => {
                write!(f, "Failed to open connection to the hypervisor: {}", msg)
            }
            PinError::TopologyDetection(msg) => write!(
                f,
                "Failed to collect meaningful information about physical CPUs: {}",
                msg
            ),
            PinError::NoActiveWorkload => write!(f, "No running domains with active vCPUs"),
            PinError::InsufficientCapacity {
                domain,
                wanted,
                assigned,
            } => write!(
                f,
                "Insufficient threads for domain {} (need {}, got {}); allocation incomplete",
                domain, wanted, assigned
            ),
        }
    }
}

impl std::error::Error for PinError {}

/// Process exit status for a run that ended with `err`.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PinError>() {
        Some(PinError::Connection(_)) => 2,
        Some(PinError::TopologyDetection(_)) => 3,
        Some(PinError::NoActiveWorkload) => 4,
        _ => 1,
    }
}
