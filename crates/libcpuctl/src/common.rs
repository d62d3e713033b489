use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf, StripPrefixError},
};

use nix::unistd::Pid;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// ControllerTarget identifies the cgroup a controller acts on and the process
/// that has to be placed into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerTarget {
    /// Cgroup path relative to the subsystem mount point. Absolute paths are
    /// interpreted relative to the mount point as well. A path that names the
    /// mount point itself, e.g. an empty one, leaves the subsystem untouched.
    pub cgroup_path: PathBuf,
    /// Process that is attached to the cgroup.
    pub pid: Pid,
}

impl ControllerTarget {
    pub fn new<P: Into<PathBuf>>(cgroup_path: P, pid: Pid) -> Self {
        Self {
            cgroup_path: cgroup_path.into(),
            pid,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WrappedIoError {
    #[error("failed to open {path}: {err}")]
    Open { err: std::io::Error, path: PathBuf },
    #[error("failed to write {data} to {path}: {err}")]
    Write {
        err: std::io::Error,
        path: PathBuf,
        data: String,
    },
    #[error("failed to read {path}: {err}")]
    Read { err: std::io::Error, path: PathBuf },
    #[error("failed to create dir {path}: {err}")]
    CreateDir { err: std::io::Error, path: PathBuf },
    #[error("failed to remove dir {path}: {err}")]
    Remove { err: std::io::Error, path: PathBuf },
    #[error("at {path}: {err}")]
    Other { err: std::io::Error, path: PathBuf },
}

impl WrappedIoError {
    pub fn inner(&self) -> &std::io::Error {
        match self {
            WrappedIoError::Open { err, .. } => err,
            WrappedIoError::Write { err, .. } => err,
            WrappedIoError::Read { err, .. } => err,
            WrappedIoError::CreateDir { err, .. } => err,
            WrappedIoError::Remove { err, .. } => err,
            WrappedIoError::Other { err, .. } => err,
        }
    }
}

/// Writes a single control parameter of a cgroup. Every control file write of
/// this crate goes through an implementation of this trait.
#[cfg_attr(test, automock)]
pub trait ParameterWriter {
    /// Replaces the content of `param` inside the cgroup directory `dir` with `value`.
    /// The parameter file is never created, a missing file means the running
    /// kernel does not support the parameter.
    fn write(&self, dir: &Path, param: &str, value: &str) -> Result<(), WrappedIoError>;
}

/// Writes parameters straight into the cgroup filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct CgroupFileWriter;

impl ParameterWriter for CgroupFileWriter {
    fn write(&self, dir: &Path, param: &str, value: &str) -> Result<(), WrappedIoError> {
        write_cgroup_file_str(dir.join(param), value)
    }
}

#[inline]
pub fn write_cgroup_file_str<P: AsRef<Path>>(path: P, data: &str) -> Result<(), WrappedIoError> {
    let path = path.as_ref();

    fs::OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|err| WrappedIoError::Open {
            err,
            path: path.to_path_buf(),
        })?
        .write_all(data.as_bytes())
        .map_err(|err| WrappedIoError::Write {
            err,
            path: path.to_path_buf(),
            data: data.into(),
        })?;

    Ok(())
}

#[inline]
pub fn write_cgroup_file<P: AsRef<Path>, T: ToString>(
    path: P,
    data: T,
) -> Result<(), WrappedIoError> {
    write_cgroup_file_str(path, &data.to_string())
}

/// Removes a cgroup directory together with all of its child cgroups.
/// Cgroup directories can only be removed with rmdir, so control files are
/// never unlinked. A directory that does not exist is not an error.
pub fn remove_cgroup_dir<P: AsRef<Path>>(path: P) -> Result<(), WrappedIoError> {
    let path = path.as_ref();
    match fs::remove_dir(path) {
        Ok(()) => return Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).wrap_read(path),
    };

    for entry in entries {
        let entry = entry.wrap_read(path)?;
        if entry.file_type().wrap_other(entry.path())?.is_dir() {
            remove_cgroup_dir(entry.path())?;
        }
    }

    match fs::remove_dir(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err).wrap_remove(path),
        _ => Ok(()),
    }
}

pub(crate) trait PathBufExt {
    fn join_safely<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, JoinSafelyError>;
}

#[derive(thiserror::Error, Debug)]
pub enum JoinSafelyError {
    #[error("failed to strip prefix from {path}: {err}")]
    StripPrefix {
        err: StripPrefixError,
        path: PathBuf,
    },
}

impl PathBufExt for PathBuf {
    fn join_safely<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, JoinSafelyError> {
        let path = path.as_ref();
        if path.is_relative() {
            return Ok(self.join(path));
        }

        let stripped = path
            .strip_prefix("/")
            .map_err(|err| JoinSafelyError::StripPrefix {
                err,
                path: path.to_path_buf(),
            })?;
        Ok(self.join(stripped))
    }
}

pub(crate) trait WrapIoResult {
    type Target;

    fn wrap_create_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_read<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_remove<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
}

impl<T> WrapIoResult for Result<T, std::io::Error> {
    type Target = T;

    fn wrap_create_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::CreateDir {
            err,
            path: path.into(),
        })
    }

    fn wrap_read<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Read {
            err,
            path: path.into(),
        })
    }

    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Open {
            err,
            path: path.into(),
        })
    }

    fn wrap_remove<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Remove {
            err,
            path: path.into(),
        })
    }

    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Other {
            err,
            path: path.into(),
        })
    }
}
