use std::path::Path;

use nix::unistd::Pid;

use super::util::PathResolver;
use crate::common::{self, ControllerTarget, WrappedIoError, CGROUP_PROCS};
use crate::stats::{KeyValueParser, Stats};

/// Capabilities shared by all cgroup v1 subsystem controllers. Collaborators
/// are handed to each operation, so a controller holds no global state and can
/// be reused for several cgroups.
pub trait Controller {
    type Error;
    type Resource;

    /// Name of the subsystem as it appears in the cgroup hierarchy
    fn name(&self) -> &'static str;

    /// Creates the cgroup, applies the settings that are needed before the
    /// process can join and attaches the process
    fn apply(
        &mut self,
        resolver: &dyn PathResolver,
        attacher: &dyn ProcessAttacher,
        target: &ControllerTarget,
        resource: &Self::Resource,
    ) -> Result<(), Self::Error>;

    /// Applies resource restrictions to the cgroup
    fn set(&self, resource: &Self::Resource) -> Result<(), Self::Error>;

    /// Removes the cgroup
    fn remove(
        &mut self,
        resolver: &dyn PathResolver,
        target: &ControllerTarget,
    ) -> Result<(), Self::Error>;

    /// Adds the statistics of this subsystem to `stats`
    fn stats(&self, parser: &dyn KeyValueParser, stats: &mut Stats) -> Result<(), Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum AttachError {
    #[error("failed to add task {pid} to cgroup: {err}")]
    AddTask { pid: Pid, err: WrappedIoError },
}

/// Places a process into a cgroup.
#[cfg_attr(test, automock)]
pub trait ProcessAttacher {
    fn attach(&self, cgroup_path: &Path, pid: Pid) -> Result<(), AttachError>;
}

/// Attaches processes by writing their pid into `cgroup.procs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CgroupProcsAttacher;

impl ProcessAttacher for CgroupProcsAttacher {
    fn attach(&self, cgroup_path: &Path, pid: Pid) -> Result<(), AttachError> {
        common::write_cgroup_file(cgroup_path.join(CGROUP_PROCS), pid)
            .map_err(|err| AttachError::AddTask { pid, err })
    }
}
