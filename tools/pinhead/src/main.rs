// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::error;
use log::warn;
use pinhead::exit_code;
use pinhead::virsh::Virsh;
use pinhead::virsh::DEFAULT_URI;
use pinhead::FillPolicy;
use pinhead::PinError;
use pinhead::RunOpts;
use pinhead_utils::SysfsTopology;
use pinhead_utils::SYSFS_CPU_ROOT;

/// pinhead: pin the vCPUs of running virtual machines to host threads
///
/// Every running domain gets one hardware thread per active vCPU. Domains
/// are placed largest first on the least loaded socket, taking whole cores
/// (a thread and its SMT siblings) before moving on to the next least loaded
/// core, and only spilling to another socket when the current one runs out.
///
/// Each run starts from scratch and only issues a pin for vCPUs whose live
/// affinity differs from the computed one, so it is cheap to run
/// periodically, e.g. from a systemd timer.
///
/// Exit status is 0 when the run completed, even if some domains got fewer
/// threads than vCPUs or some pins failed; 2 if the hypervisor can't be
/// reached, 3 if the host topology can't be made sense of, 4 if there is no
/// running domain to pin, and 1 on any other error.
#[derive(Debug, Parser)]
struct Opts {
    /// Hypervisor connection URI.
    #[clap(short = 'c', long, env = "LIBVIRT_DEFAULT_URI", default_value = DEFAULT_URI)]
    connect: String,

    /// virsh executable used to talk to the hypervisor.
    #[clap(long, default_value = "virsh")]
    virsh: PathBuf,

    /// Root of the CPU sysfs hierarchy the host topology is read from.
    #[clap(long, default_value = SYSFS_CPU_ROOT)]
    sysfs_cpu: PathBuf,

    /// Number of hardware threads per core. Detected from the SMT sibling
    /// lists when not given.
    #[clap(short = 't', long)]
    threads_per_core: Option<usize>,

    /// Order in which the threads of a chosen core are taken. "sequential"
    /// always takes them in hardware order; "prefer-idle" takes threads not
    /// yet reserved in this run first.
    #[clap(short = 'f', long, value_enum, default_value_t = FillPolicy::Sequential)]
    fill_policy: FillPolicy,

    /// Compute and log the allocation without changing any vCPU affinity.
    #[clap(short = 'n', long, action = clap::ArgAction::SetTrue)]
    dry_run: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_log(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn run(opts: &Opts) -> Result<()> {
    let mut hv = Virsh::connect(&opts.virsh, &opts.connect)?;
    let host = SysfsTopology::with_root(&opts.sysfs_cpu);
    let run_opts = RunOpts {
        fill_policy: opts.fill_policy,
        threads_per_core: opts.threads_per_core,
        dry_run: opts.dry_run,
    };

    pinhead::run(&mut hv, &host, &run_opts)?;
    Ok(())
}

fn main() -> ExitCode {
    let opts = Opts::parse();

    if let Err(e) = init_log(opts.verbose) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<PinError>() {
                Some(PinError::NoActiveWorkload) => warn!("{:#}. Exiting", e),
                _ => error!("{:#}. Exiting", e),
            }
            ExitCode::from(exit_code(&e))
        }
    }
}
