use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::common::{ControllerTarget, ParameterWriter, WrappedIoError};
use crate::v1::controller::{AttachError, ProcessAttacher};
use crate::v1::util::{PathResolver, ResolveError};

/// Records every parameter write and rejects the first writes of selected
/// parameters, the way the kernel rejects an invalid quota/period ratio.
#[derive(Debug, Default)]
pub struct TestWriter {
    writes: RefCell<Vec<(String, String)>>,
    rejections: RefCell<HashMap<String, usize>>,
}

impl TestWriter {
    /// Rejects the next `times` writes of `param`.
    pub fn reject(self, param: &str, times: usize) -> Self {
        self.rejections.borrow_mut().insert(param.to_owned(), times);
        self
    }

    /// All attempted writes as `(parameter, value)`, including rejected ones.
    pub fn get_writes(&self) -> Vec<(String, String)> {
        self.writes.borrow().clone()
    }

    pub fn get_params(&self) -> Vec<String> {
        self.writes.borrow().iter().map(|(p, _)| p.clone()).collect()
    }
}

impl ParameterWriter for TestWriter {
    fn write(&self, dir: &Path, param: &str, value: &str) -> Result<(), WrappedIoError> {
        self.writes
            .borrow_mut()
            .push((param.to_owned(), value.to_owned()));

        if let Some(remaining) = self.rejections.borrow_mut().get_mut(param) {
            if *remaining > 0 {
                *remaining -= 1;
                let attempt = self.get_params().iter().filter(|p| *p == param).count();
                return Err(WrappedIoError::Write {
                    err: Error::new(
                        ErrorKind::InvalidInput,
                        format!("write {attempt} of {param} rejected"),
                    ),
                    path: dir.join(param),
                    data: value.to_owned(),
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Resolution {
    Path(PathBuf),
    NotMounted,
    Broken,
}

/// Resolves every target to a preconfigured outcome.
#[derive(Debug)]
pub struct TestResolver {
    resolution: Resolution,
    resolve_calls: RefCell<usize>,
}

impl TestResolver {
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(Resolution::Path(path.into()))
    }

    pub fn not_mounted() -> Self {
        Self::new(Resolution::NotMounted)
    }

    /// Fails every resolution with an error other than `NotMounted`.
    pub fn broken() -> Self {
        Self::new(Resolution::Broken)
    }

    fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            resolve_calls: RefCell::new(0),
        }
    }

    pub fn resolve_calls(&self) -> usize {
        *self.resolve_calls.borrow()
    }
}

impl PathResolver for TestResolver {
    fn resolve(
        &self,
        subsystem: &str,
        target: &ControllerTarget,
    ) -> Result<PathBuf, ResolveError> {
        *self.resolve_calls.borrow_mut() += 1;
        match &self.resolution {
            Resolution::Path(path) => Ok(path.clone()),
            Resolution::NotMounted => Err(ResolveError::NotMounted {
                subsystem: subsystem.into(),
            }),
            Resolution::Broken => Err(ResolveError::InvalidCgroupPath {
                subsystem: subsystem.into(),
                path: target.cgroup_path.clone(),
            }),
        }
    }
}

/// Records attached processes instead of moving them.
#[derive(Debug, Default)]
pub struct TestAttacher {
    attach_args: RefCell<Vec<(PathBuf, Pid)>>,
    fail: bool,
}

impl TestAttacher {
    pub fn failing() -> Self {
        Self {
            attach_args: RefCell::new(vec![]),
            fail: true,
        }
    }

    pub fn get_attach_args(&self) -> Vec<(PathBuf, Pid)> {
        self.attach_args.borrow().clone()
    }
}

impl ProcessAttacher for TestAttacher {
    fn attach(&self, cgroup_path: &Path, pid: Pid) -> Result<(), AttachError> {
        self.attach_args
            .borrow_mut()
            .push((cgroup_path.to_path_buf(), pid));

        if self.fail {
            return Err(AttachError::AddTask {
                pid,
                err: WrappedIoError::Write {
                    err: Error::from(ErrorKind::InvalidInput),
                    path: cgroup_path.to_path_buf(),
                    data: pid.to_string(),
                },
            });
        }

        Ok(())
    }
}
