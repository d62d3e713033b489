use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use libcpuctl::common::ControllerTarget;
use libcpuctl::stats::{FlatKeyedParser, Stats};
use libcpuctl::v1::controller::{CgroupProcsAttacher, Controller};
use libcpuctl::v1::cpu::{Cpu, CpuResources};
use libcpuctl::v1::manager::CpuController;
use libcpuctl::v1::util::{FixedRootResolver, MountInfoResolver, PathResolver};
use nix::unistd::Pid;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Drives the cgroup v1 cpu controller of a single cgroup
#[derive(Parser, Debug)]
#[clap(version)]
struct Opts {
    /// Directory that contains one mount per subsystem. The mount table of
    /// the current process is used if omitted.
    #[clap(long)]
    cgroup_root: Option<PathBuf>,
    #[clap(long, default_value = "info")]
    log_level: String,
    /// Cgroup path relative to the cpu mount
    #[clap(long)]
    cgroup_path: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the cgroup, move a process into it and apply the limits
    Apply {
        #[clap(long)]
        pid: i32,
        #[clap(flatten)]
        limits: Limits,
    },
    /// Update the limits of an existing cgroup
    Set(Limits),
    /// Print the throttling statistics as json
    Stats,
    /// Delete the cgroup
    Remove,
}

#[derive(Args, Debug)]
struct Limits {
    /// Json file with the limits, e.g. {"shares": 512, "quota": 50000}
    #[clap(long)]
    config: Option<PathBuf>,
    #[clap(long)]
    shares: Option<u64>,
    #[clap(long)]
    period: Option<u64>,
    #[clap(long, allow_hyphen_values = true)]
    quota: Option<i64>,
    #[clap(long)]
    realtime_period: Option<u64>,
    #[clap(long, allow_hyphen_values = true)]
    realtime_runtime: Option<i64>,
}

impl Limits {
    fn resources(&self) -> Result<CpuResources> {
        let mut resources = match &self.config {
            Some(config) => {
                let content = std::fs::read_to_string(config)
                    .with_context(|| format!("failed to read {config:?}"))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse {config:?}"))?
            }
            None => CpuResources::default(),
        };

        if let Some(shares) = self.shares {
            resources.shares = shares;
        }
        if let Some(period) = self.period {
            resources.period = period;
        }
        if let Some(quota) = self.quota {
            resources.quota = quota;
        }
        if let Some(realtime_period) = self.realtime_period {
            resources.realtime_period = realtime_period;
        }
        if let Some(realtime_runtime) = self.realtime_runtime {
            resources.realtime_runtime = realtime_runtime;
        }

        Ok(resources)
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let level = Level::from_str(level).with_context(|| "failed to parse log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(LevelFilter::from_level(level).into()),
        )
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_tracing(&opts.log_level)?;

    let resolver: Box<dyn PathResolver> = match &opts.cgroup_root {
        Some(root) => Box::new(FixedRootResolver::new(root)),
        None => Box::new(MountInfoResolver),
    };
    let target = ControllerTarget::new(&opts.cgroup_path, Pid::this());

    match &opts.command {
        Command::Apply { pid, limits } => {
            let resources = limits.resources()?;
            let target = ControllerTarget::new(&opts.cgroup_path, Pid::from_raw(*pid));
            let mut controller = CpuController::new();
            controller.apply(resolver.as_ref(), &CgroupProcsAttacher, &target, &resources)?;
            controller.set(&resources)?;
            match controller.path() {
                Some(path) => println!("attached {pid} to {}", path.display()),
                None => println!("cpu subsystem is not mounted"),
            }
        }
        Command::Set(limits) => {
            let path = resolver.resolve("cpu", &target)?;
            if path.as_os_str().is_empty() {
                println!("nothing to update in the cpu hierarchy root");
                return Ok(());
            }
            Cpu::new().set(&path, &limits.resources()?)?;
        }
        Command::Stats => {
            let path = resolver.resolve("cpu", &target)?;
            let mut stats = Stats::default();
            if !path.as_os_str().is_empty() {
                Cpu::new().stats(&path, &FlatKeyedParser, &mut stats.cpu.throttling)?;
            }
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Remove => {
            CpuController::new().remove(resolver.as_ref(), &target)?;
        }
    }

    Ok(())
}
