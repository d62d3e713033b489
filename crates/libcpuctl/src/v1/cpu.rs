use std::fs::{DirBuilder, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use oci_spec::runtime::LinuxCpu;
use serde::{Deserialize, Serialize};

use super::controller::{AttachError, ProcessAttacher};
use crate::common::{CgroupFileWriter, ParameterWriter, WrapIoResult, WrappedIoError};
use crate::stats::{CpuThrottling, KeyValueParser, ParseError};

pub const CGROUP_CPU_SHARES: &str = "cpu.shares";
pub const CGROUP_CPU_QUOTA: &str = "cpu.cfs_quota_us";
pub const CGROUP_CPU_PERIOD: &str = "cpu.cfs_period_us";
pub const CGROUP_CPU_RT_RUNTIME: &str = "cpu.rt_runtime_us";
pub const CGROUP_CPU_RT_PERIOD: &str = "cpu.rt_period_us";
pub const CGROUP_CPU_STAT: &str = "cpu.stat";

/// Desired configuration of the cpu controller. A field that is zero is
/// never written, the kernel keeps its current value for it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CpuResources {
    /// Relative share of cpu time
    pub shares: u64,
    /// Length of a CFS accounting period in microseconds
    pub period: u64,
    /// Cpu time in microseconds the group may use per period, negative for unlimited
    pub quota: i64,
    /// Length of a real-time accounting period in microseconds
    pub realtime_period: u64,
    /// Cpu time in microseconds real-time tasks may use per real-time period
    pub realtime_runtime: i64,
}

impl From<&LinuxCpu> for CpuResources {
    fn from(cpu: &LinuxCpu) -> Self {
        Self {
            shares: cpu.shares().unwrap_or_default(),
            period: cpu.period().unwrap_or_default(),
            quota: cpu.quota().unwrap_or_default(),
            realtime_period: cpu.realtime_period().unwrap_or_default(),
            realtime_runtime: cpu.realtime_runtime().unwrap_or_default(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApplyDirError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("failed to attach process: {0}")]
    Attach(#[from] AttachError),
}

#[derive(thiserror::Error, Debug)]
pub enum CpuStatsError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("failed to parse {path}: {err}")]
    Parse { path: PathBuf, err: ParseError },
}

/// Writes the cpu controller files of a cgroup directory and reads its
/// throttling statistics.
#[derive(Debug, Default)]
pub struct Cpu<W: ParameterWriter = CgroupFileWriter> {
    writer: W,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            writer: CgroupFileWriter,
        }
    }
}

impl<W: ParameterWriter> Cpu<W> {
    pub fn with_writer(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Creates the cgroup directory and attaches `pid` to it. Real-time
    /// bandwidth is configured first. A process that already runs with a
    /// real-time policy cannot join a group without real-time runtime.
    /// An empty path means the subsystem is not mounted and nothing is done.
    pub fn apply_dir(
        &self,
        path: &Path,
        cpu: &CpuResources,
        pid: Pid,
        attacher: &dyn ProcessAttacher,
    ) -> Result<(), ApplyDirError> {
        if path.as_os_str().is_empty() {
            return Ok(());
        }

        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(path)
            .wrap_create_dir(path)?;

        self.set_rt_sched(path, cpu)?;
        attacher.attach(path, pid)?;

        Ok(())
    }

    /// Writes the real-time bandwidth settings.
    pub fn set_rt_sched(&self, path: &Path, cpu: &CpuResources) -> Result<(), WrappedIoError> {
        if cpu.realtime_period != 0 {
            self.write(path, CGROUP_CPU_RT_PERIOD, cpu.realtime_period)?;
        }

        if cpu.realtime_runtime != 0 {
            self.write(path, CGROUP_CPU_RT_RUNTIME, cpu.realtime_runtime)?;
        }

        Ok(())
    }

    /// Writes shares, CFS bandwidth and real-time bandwidth.
    pub fn set(&self, path: &Path, cpu: &CpuResources) -> Result<(), WrappedIoError> {
        tracing::debug!("Apply Cpu cgroup config");

        if cpu.shares != 0 {
            self.write(path, CGROUP_CPU_SHARES, cpu.shares)?;
        }

        // A child cgroup must not have a higher quota/period ratio than its
        // parent, and the kernel checks every write against the values
        // currently in effect. Writing period, then quota, then period again
        // succeeds for a valid pair whichever of the two shrinks.
        let mut reorder = false;
        if cpu.period != 0 && self.write(path, CGROUP_CPU_PERIOD, cpu.period).is_err() {
            tracing::debug!(
                "{} rejected, retrying after {}",
                CGROUP_CPU_PERIOD,
                CGROUP_CPU_QUOTA
            );
            reorder = true;
        }

        if cpu.quota != 0 {
            self.write(path, CGROUP_CPU_QUOTA, cpu.quota)?;
        }

        if reorder {
            self.write(path, CGROUP_CPU_PERIOD, cpu.period)?;
        }

        self.set_rt_sched(path, cpu)
    }

    /// Reads `cpu.stat` into `throttling`. A missing file leaves `throttling`
    /// untouched. On error nothing is written to `throttling`.
    pub fn stats(
        &self,
        path: &Path,
        parser: &dyn KeyValueParser,
        throttling: &mut CpuThrottling,
    ) -> Result<(), CpuStatsError> {
        let stat_path = path.join(CGROUP_CPU_STAT);
        let file = match File::open(&stat_path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).wrap_open(&stat_path).map_err(CpuStatsError::from),
        };

        let mut stats = *throttling;
        for line in BufReader::new(file).lines() {
            let line = line.wrap_read(&stat_path)?;
            let (key, value) = parser
                .parse(&line)
                .map_err(|err| CpuStatsError::Parse {
                    path: stat_path.clone(),
                    err,
                })?;

            match key.as_str() {
                "nr_periods" => stats.periods = value,
                "nr_throttled" => stats.throttled_periods = value,
                "throttled_time" => stats.throttled_time = value,
                _ => continue,
            }
        }

        *throttling = stats;
        Ok(())
    }

    fn write<T: ToString>(&self, path: &Path, param: &str, value: T) -> Result<(), WrappedIoError> {
        self.writer.write(path, param, &value.to_string())
    }
}
