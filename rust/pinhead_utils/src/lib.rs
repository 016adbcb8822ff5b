// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Host utilities for pinhead
//!
//! pinhead assigns the vCPUs of running virtual machines to hardware threads
//! of the host. This crate holds the pieces that talk about the host rather
//! than about allocation policy:
//!
//! - [`Cpumask`], the fixed-length affinity mask handed to the hypervisor, and
//!   the cpulist helpers used to read and print it.
//! - [`HostTopology`], the capability of reporting the (socket, core) position
//!   of each logical processor, and [`SysfsTopology`], its implementation on
//!   top of the kernel's sysfs topology files.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::write_cpulist;
pub use cpumask::Cpumask;

mod topology;
pub use topology::HostTopology;
pub use topology::ProcessorLocation;
pub use topology::SysfsTopology;
pub use topology::SYSFS_CPU_ROOT;

mod misc;
pub use misc::read_from_file;
