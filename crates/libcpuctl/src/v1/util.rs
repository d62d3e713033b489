use std::path::{Component, Path, PathBuf};

use procfs::process::{MountInfo, Process};
use procfs::ProcError;

use crate::common::{ControllerTarget, JoinSafelyError, PathBufExt, DEFAULT_CGROUP_ROOT};

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("could not find mountpoint for {subsystem}")]
    NotMounted { subsystem: String },
    #[error("failed to read process info from /proc/self: {0}")]
    ReadSelf(ProcError),
    #[error("failed to get mountinfo: {0}")]
    MountInfo(ProcError),
    #[error("cgroup path {path:?} leaves the {subsystem} hierarchy")]
    InvalidCgroupPath { subsystem: String, path: PathBuf },
    #[error("failed to join cgroup path: {0}")]
    JoinSafely(#[from] JoinSafelyError),
}

impl ResolveError {
    pub fn is_not_mounted(&self) -> bool {
        matches!(self, ResolveError::NotMounted { .. })
    }
}

/// Determines the directory of a cgroup within the hierarchy of a subsystem.
#[cfg_attr(test, automock)]
pub trait PathResolver {
    /// Returns the cgroup directory of `target` for `subsystem`. An empty path
    /// signals that there is nothing to do.
    fn resolve(&self, subsystem: &str, target: &ControllerTarget)
        -> Result<PathBuf, ResolveError>;
}

/// Resolves cgroup directories below the mount point found in the mount
/// table of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct MountInfoResolver;

impl PathResolver for MountInfoResolver {
    fn resolve(
        &self,
        subsystem: &str,
        target: &ControllerTarget,
    ) -> Result<PathBuf, ResolveError> {
        if is_hierarchy_root(&target.cgroup_path) {
            return Ok(PathBuf::new());
        }

        tracing::debug!("Get path for subsystem: {}", subsystem);
        let mount_point = get_subsystem_mount_point(subsystem)?;
        cgroup_dir(mount_point, subsystem, &target.cgroup_path)
    }
}

/// Resolves cgroup directories below a fixed root that contains one directory
/// per subsystem, e.g. `/sys/fs/cgroup/cpu`.
#[derive(Debug, Clone)]
pub struct FixedRootResolver {
    root: PathBuf,
}

impl FixedRootResolver {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl Default for FixedRootResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CGROUP_ROOT)
    }
}

impl PathResolver for FixedRootResolver {
    fn resolve(
        &self,
        subsystem: &str,
        target: &ControllerTarget,
    ) -> Result<PathBuf, ResolveError> {
        if is_hierarchy_root(&target.cgroup_path) {
            return Ok(PathBuf::new());
        }

        let mount_point = self.root.join(subsystem);
        if !mount_point.is_dir() {
            return Err(ResolveError::NotMounted {
                subsystem: subsystem.into(),
            });
        }

        cgroup_dir(mount_point, subsystem, &target.cgroup_path)
    }
}

// "", "/" and "." all name the mount point itself, which is always
// left untouched.
fn is_hierarchy_root(cgroup_path: &Path) -> bool {
    !cgroup_path
        .components()
        .any(|c| matches!(c, Component::Normal(_) | Component::ParentDir))
}

fn cgroup_dir(
    mount_point: PathBuf,
    subsystem: &str,
    cgroup_path: &Path,
) -> Result<PathBuf, ResolveError> {
    if cgroup_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ResolveError::InvalidCgroupPath {
            subsystem: subsystem.into(),
            path: cgroup_path.to_path_buf(),
        });
    }

    Ok(mount_point.join_safely(cgroup_path)?)
}

/// List all cgroup v1 subsystem mount points on the system. This can include unsupported
/// subsystems, comounted controllers and named hierarchies.
pub fn list_subsystem_mount_points() -> Result<Vec<PathBuf>, ResolveError> {
    Ok(Process::myself()
        .map_err(ResolveError::ReadSelf)?
        .mountinfo()
        .map_err(ResolveError::MountInfo)?
        .into_iter()
        .filter(|m| m.fs_type == "cgroup")
        .map(|m| m.mount_point)
        .collect())
}

pub fn get_subsystem_mount_point(subsystem: &str) -> Result<PathBuf, ResolveError> {
    let mounts: Vec<MountInfo> = Process::myself()
        .map_err(ResolveError::ReadSelf)?
        .mountinfo()
        .map_err(ResolveError::MountInfo)?
        .into_iter()
        .collect();

    find_subsystem_mount_point(
        mounts
            .iter()
            .map(|m| (m.fs_type.as_str(), m.mount_point.as_path())),
        subsystem,
    )
    .ok_or_else(|| ResolveError::NotMounted {
        subsystem: subsystem.into(),
    })
}

/// Picks the cgroup v1 mount of `subsystem` from `(fs_type, mount_point)` pairs.
fn find_subsystem_mount_point<'a, I>(mounts: I, subsystem: &str) -> Option<PathBuf>
where
    I: IntoIterator<Item = (&'a str, &'a Path)>,
{
    mounts
        .into_iter()
        .filter(|(fs_type, _)| *fs_type == "cgroup")
        .map(|(_, mount_point)| mount_point)
        .find(|mount_point| mounts_subsystem(mount_point, subsystem))
        .map(Path::to_path_buf)
}

// Comounted controllers share one directory, named after all of them
// (e.g. cpu,cpuacct). Distributions mount them in either order.
fn mounts_subsystem(mount_point: &Path, subsystem: &str) -> bool {
    mount_point
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.split(',').any(|s| s == subsystem))
        .unwrap_or(false)
}
