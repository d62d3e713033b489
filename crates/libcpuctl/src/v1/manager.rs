use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use super::controller::{Controller, ProcessAttacher};
use super::cpu::{ApplyDirError, Cpu, CpuResources, CpuStatsError};
use super::util::{PathResolver, ResolveError};
use crate::common::{self, CgroupFileWriter, ControllerTarget, ParameterWriter, WrappedIoError};
use crate::stats::{KeyValueParser, Stats};

pub const CPU_SUBSYSTEM: &str = "cpu";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    /// Nothing has been applied yet, or the last apply failed
    Unattached,
    /// The process has been attached. Without a path the subsystem is not
    /// available and the controller does nothing.
    Attached { path: Option<PathBuf> },
    /// The cgroup has been deleted. No further operation is possible.
    Removed,
}

impl Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ControllerState::Unattached => "unattached",
            ControllerState::Attached { path: Some(_) } => "attached",
            ControllerState::Attached { path: None } => "inactive",
            ControllerState::Removed => "removed",
        };

        write!(f, "{state}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CpuControllerError {
    #[error("failed to resolve cpu cgroup: {0}")]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    WrappedIo(#[from] WrappedIoError),
    #[error("failed to apply cpu cgroup: {0}")]
    ApplyDir(#[from] ApplyDirError),
    #[error("failed to read cpu stats: {0}")]
    Stats(#[from] CpuStatsError),
    #[error("cannot {operation} a controller that is {state}")]
    InvalidState {
        operation: &'static str,
        state: ControllerState,
    },
}

/// Lifecycle of the cpu controller for a single cgroup.
#[derive(Debug)]
pub struct CpuController<W: ParameterWriter = CgroupFileWriter> {
    cpu: Cpu<W>,
    state: ControllerState,
}

impl CpuController {
    pub fn new() -> Self {
        Self::with_writer(CgroupFileWriter)
    }
}

impl Default for CpuController {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: ParameterWriter> CpuController<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            cpu: Cpu::with_writer(writer),
            state: ControllerState::Unattached,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Cgroup directory the process was attached to, if any
    pub fn path(&self) -> Option<&Path> {
        match &self.state {
            ControllerState::Attached { path } => path.as_deref(),
            _ => None,
        }
    }

    fn invalid_state(&self, operation: &'static str) -> CpuControllerError {
        CpuControllerError::InvalidState {
            operation,
            state: self.state.clone(),
        }
    }

    // Ok(None) means the subsystem is not available and there is nothing to do.
    fn resolve(
        resolver: &dyn PathResolver,
        target: &ControllerTarget,
    ) -> Result<Option<PathBuf>, ResolveError> {
        match resolver.resolve(CPU_SUBSYSTEM, target) {
            Ok(path) if path.as_os_str().is_empty() => Ok(None),
            Ok(path) => Ok(Some(path)),
            Err(err) if err.is_not_mounted() => {
                tracing::debug!("{} subsystem is not mounted", CPU_SUBSYSTEM);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl<W: ParameterWriter> Controller for CpuController<W> {
    type Error = CpuControllerError;
    type Resource = CpuResources;

    fn name(&self) -> &'static str {
        CPU_SUBSYSTEM
    }

    fn apply(
        &mut self,
        resolver: &dyn PathResolver,
        attacher: &dyn ProcessAttacher,
        target: &ControllerTarget,
        resource: &Self::Resource,
    ) -> Result<(), Self::Error> {
        if self.state != ControllerState::Unattached {
            return Err(self.invalid_state("apply"));
        }

        let path = Self::resolve(resolver, target)?;
        if let Some(path) = &path {
            tracing::debug!("attaching {} to {:?}", target.pid, path);
            self.cpu.apply_dir(path, resource, target.pid, attacher)?;
        }

        self.state = ControllerState::Attached { path };
        Ok(())
    }

    fn set(&self, resource: &Self::Resource) -> Result<(), Self::Error> {
        match &self.state {
            ControllerState::Attached { path: Some(path) } => Ok(self.cpu.set(path, resource)?),
            ControllerState::Attached { path: None } => Ok(()),
            _ => Err(self.invalid_state("set")),
        }
    }

    fn remove(
        &mut self,
        resolver: &dyn PathResolver,
        target: &ControllerTarget,
    ) -> Result<(), Self::Error> {
        if self.state == ControllerState::Removed {
            return Err(self.invalid_state("remove"));
        }

        if let Some(path) = Self::resolve(resolver, target)? {
            tracing::debug!("remove cgroup {:?}", path);
            common::remove_cgroup_dir(&path)?;
        }

        self.state = ControllerState::Removed;
        Ok(())
    }

    fn stats(&self, parser: &dyn KeyValueParser, stats: &mut Stats) -> Result<(), Self::Error> {
        match &self.state {
            ControllerState::Removed => Err(self.invalid_state("read stats of")),
            ControllerState::Attached { path: Some(path) } => {
                Ok(self.cpu.stats(path, parser, &mut stats.cpu.throttling)?)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use nix::unistd::Pid;

    use super::*;
    use crate::common::CGROUP_PROCS;
    use crate::stats::{CpuThrottling, FlatKeyedParser, MockKeyValueParser};
    use crate::test::{set_cpu_fixtures, set_fixture};
    use crate::test_collaborators::{TestAttacher, TestResolver, TestWriter};
    use crate::v1::controller::CgroupProcsAttacher;
    use crate::v1::cpu::{
        CGROUP_CPU_PERIOD, CGROUP_CPU_QUOTA, CGROUP_CPU_RT_RUNTIME, CGROUP_CPU_STAT,
    };
    use crate::v1::util::{FixedRootResolver, MockPathResolver};

    fn target() -> ControllerTarget {
        ControllerTarget::new("youki/container", Pid::from_raw(1000))
    }

    fn attached(path: &Path) -> CpuController<TestWriter> {
        let mut controller = CpuController::with_writer(TestWriter::default());
        controller
            .apply(
                &TestResolver::with_path(path),
                &TestAttacher::default(),
                &target(),
                &CpuResources::default(),
            )
            .expect("apply cpu controller");
        controller
    }

    #[test]
    fn test_apply_attaches_process() {
        // arrange
        let tmp = tempfile::tempdir().unwrap();
        let cgroup = tmp.path().join("youki");
        let resolver = TestResolver::with_path(&cgroup);
        let attacher = TestAttacher::default();
        let mut controller = CpuController::with_writer(TestWriter::default());

        // act
        controller
            .apply(&resolver, &attacher, &target(), &CpuResources::default())
            .expect("apply cpu controller");

        // assert
        assert_eq!(resolver.resolve_calls(), 1);
        assert!(cgroup.is_dir());
        assert_eq!(
            attacher.get_attach_args(),
            vec![(cgroup.clone(), Pid::from_raw(1000))]
        );
        assert_eq!(controller.path(), Some(cgroup.as_path()));
    }

    #[test]
    fn test_apply_resolves_cpu_subsystem() {
        let tmp = tempfile::tempdir().unwrap();
        let cgroup = tmp.path().to_path_buf();
        let mut resolver = MockPathResolver::new();
        resolver
            .expect_resolve()
            .withf(|subsystem, target| {
                subsystem == "cpu" && target.cgroup_path == Path::new("youki/container")
            })
            .times(1)
            .returning(move |_, _| Ok(cgroup.clone()));
        let mut controller = CpuController::with_writer(TestWriter::default());

        let result = controller.apply(
            &resolver,
            &TestAttacher::default(),
            &target(),
            &CpuResources::default(),
        );

        assert!(result.is_ok());
    }

    #[test]
    fn test_apply_without_cpu_subsystem() {
        // arrange
        let attacher = TestAttacher::default();
        let mut controller = CpuController::with_writer(TestWriter::default());

        // act
        controller
            .apply(
                &TestResolver::not_mounted(),
                &attacher,
                &target(),
                &CpuResources {
                    shares: 1024,
                    ..Default::default()
                },
            )
            .expect("apply cpu controller");
        controller
            .set(&CpuResources {
                shares: 2048,
                ..Default::default()
            })
            .expect("set on inactive controller");

        // assert
        assert_eq!(
            controller.state(),
            &ControllerState::Attached { path: None }
        );
        assert!(attacher.get_attach_args().is_empty());
        assert!(controller.cpu.writer().get_params().is_empty());
    }

    #[test]
    fn test_apply_with_empty_path() {
        let attacher = TestAttacher::default();
        let mut controller = CpuController::with_writer(TestWriter::default());

        controller
            .apply(
                &TestResolver::with_path(""),
                &attacher,
                &target(),
                &CpuResources {
                    realtime_runtime: 950000,
                    ..Default::default()
                },
            )
            .expect("apply cpu controller");

        assert_eq!(controller.path(), None);
        assert!(attacher.get_attach_args().is_empty());
        assert!(controller.cpu.writer().get_params().is_empty());
    }

    #[test]
    fn test_apply_with_broken_resolver() {
        let mut controller = CpuController::with_writer(TestWriter::default());

        let result = controller.apply(
            &TestResolver::broken(),
            &TestAttacher::default(),
            &target(),
            &CpuResources::default(),
        );

        assert!(matches!(result, Err(CpuControllerError::Resolve(_))));
        assert_eq!(controller.state(), &ControllerState::Unattached);
    }

    #[test]
    fn test_failed_apply_can_be_retried() {
        // arrange
        let tmp = tempfile::tempdir().unwrap();
        let resolver = TestResolver::with_path(tmp.path());
        let mut controller = CpuController::with_writer(TestWriter::default());

        // act
        let first = controller.apply(
            &resolver,
            &TestAttacher::failing(),
            &target(),
            &CpuResources::default(),
        );
        let second = controller.apply(
            &resolver,
            &TestAttacher::default(),
            &target(),
            &CpuResources::default(),
        );

        // assert
        assert!(matches!(first, Err(CpuControllerError::ApplyDir(_))));
        assert!(second.is_ok());
        assert_eq!(controller.path(), Some(tmp.path()));
    }

    #[test]
    fn test_apply_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = attached(tmp.path());

        let result = controller.apply(
            &TestResolver::with_path(tmp.path()),
            &TestAttacher::default(),
            &target(),
            &CpuResources::default(),
        );

        assert!(matches!(
            result,
            Err(CpuControllerError::InvalidState {
                operation: "apply",
                ..
            })
        ));
    }

    #[test]
    fn test_apply_and_set_on_cgroup_files() {
        // arrange
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("cpu/youki/container")).unwrap();
        set_cpu_fixtures(&root.join("cpu/youki/container")).unwrap();
        let mut controller = CpuController::new();

        // act
        controller
            .apply(
                &FixedRootResolver::new(root),
                &CgroupProcsAttacher,
                &target(),
                &CpuResources {
                    realtime_runtime: 950000,
                    ..Default::default()
                },
            )
            .expect("apply cpu controller");
        controller
            .set(&CpuResources {
                period: 100000,
                quota: 50000,
                ..Default::default()
            })
            .expect("set cpu controller");

        // assert
        let cgroup = root.join("cpu/youki/container");
        let read = |file: &str| fs::read_to_string(cgroup.join(file)).unwrap();
        assert_eq!(read(CGROUP_CPU_RT_RUNTIME), "950000");
        assert_eq!(read(CGROUP_PROCS), "1000");
        assert_eq!(read(CGROUP_CPU_PERIOD), "100000");
        assert_eq!(read(CGROUP_CPU_QUOTA), "50000");
    }

    #[test]
    fn test_set_before_apply() {
        let controller = CpuController::with_writer(TestWriter::default());

        let result = controller.set(&CpuResources::default());

        assert!(matches!(
            result,
            Err(CpuControllerError::InvalidState {
                operation: "set",
                state: ControllerState::Unattached,
            })
        ));
    }

    #[test]
    fn test_set_is_repeatable() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = attached(tmp.path());
        let resources = CpuResources {
            shares: 1024,
            ..Default::default()
        };

        controller.set(&resources).expect("first set");
        controller.set(&resources).expect("second set");

        assert_eq!(
            controller.cpu.writer().get_params(),
            vec!["cpu.shares", "cpu.shares"]
        );
    }

    #[test]
    fn test_set_after_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let cgroup = tmp.path().join("youki");
        let mut controller = attached(&cgroup);
        controller
            .remove(&TestResolver::with_path(&cgroup), &target())
            .expect("remove cgroup");

        let result = controller.set(&CpuResources::default());

        assert!(matches!(
            result,
            Err(CpuControllerError::InvalidState {
                state: ControllerState::Removed,
                ..
            })
        ));
    }

    #[test]
    fn test_stats() {
        // arrange
        let tmp = tempfile::tempdir().unwrap();
        let controller = attached(tmp.path());
        set_fixture(
            tmp.path(),
            CGROUP_CPU_STAT,
            "nr_periods 10\nnr_throttled 2\nthrottled_time 500000\n",
        )
        .unwrap();
        let mut stats = Stats::default();

        // act
        controller
            .stats(&FlatKeyedParser, &mut stats)
            .expect("read cpu stats");

        // assert
        assert_eq!(
            stats.cpu.throttling,
            CpuThrottling {
                periods: 10,
                throttled_periods: 2,
                throttled_time: 500000,
            }
        );
    }

    #[test]
    fn test_stats_before_apply() {
        let controller = CpuController::with_writer(TestWriter::default());
        let parser = MockKeyValueParser::new();
        let mut stats = Stats::default();

        controller
            .stats(&parser, &mut stats)
            .expect("read cpu stats");

        assert_eq!(stats, Stats::default());
    }

    #[test]
    fn test_stats_after_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let cgroup = tmp.path().join("youki");
        let mut controller = attached(&cgroup);
        controller
            .remove(&TestResolver::with_path(&cgroup), &target())
            .expect("remove cgroup");

        let result = controller.stats(&FlatKeyedParser, &mut Stats::default());

        assert!(matches!(result, Err(CpuControllerError::InvalidState { .. })));
    }

    #[test]
    fn test_remove() {
        // arrange
        let tmp = tempfile::tempdir().unwrap();
        let cgroup = tmp.path().join("youki");
        let mut controller = attached(&cgroup);
        fs::create_dir_all(cgroup.join("child")).unwrap();

        // act
        controller
            .remove(&TestResolver::with_path(&cgroup), &target())
            .expect("remove cgroup");

        // assert
        assert!(!cgroup.exists());
        assert_eq!(controller.state(), &ControllerState::Removed);
    }

    #[test]
    fn test_remove_absent_cgroup() {
        let tmp = tempfile::tempdir().unwrap();
        let mut controller = CpuController::with_writer(TestWriter::default());

        let result = controller.remove(
            &TestResolver::with_path(tmp.path().join("absent")),
            &target(),
        );

        assert!(result.is_ok());
        assert_eq!(controller.state(), &ControllerState::Removed);
    }

    #[test]
    fn test_remove_without_cpu_subsystem() {
        let mut controller = CpuController::with_writer(TestWriter::default());

        let result = controller.remove(&TestResolver::not_mounted(), &target());

        assert!(result.is_ok());
    }

    #[test]
    fn test_remove_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = TestResolver::with_path(tmp.path().join("youki"));
        let mut controller = CpuController::with_writer(TestWriter::default());
        controller.remove(&resolver, &target()).expect("remove cgroup");

        let result = controller.remove(&resolver, &target());

        assert!(matches!(
            result,
            Err(CpuControllerError::InvalidState {
                operation: "remove",
                ..
            })
        ));
        assert_eq!(resolver.resolve_calls(), 1);
    }

    #[test]
    fn test_failed_remove_keeps_state() {
        let tmp = tempfile::tempdir().unwrap();
        let cgroup = tmp.path().join("youki");
        let mut controller = attached(&cgroup);
        set_fixture(&cgroup, "cpu.shares", "1024").unwrap();

        let result = controller.remove(&TestResolver::with_path(&cgroup), &target());

        assert!(matches!(result, Err(CpuControllerError::WrappedIo(_))));
        assert_eq!(controller.path(), Some(cgroup.as_path()));
    }

    #[test]
    fn test_controller_name() {
        assert_eq!(CpuController::new().name(), "cpu");
    }

    #[test]
    fn test_remove_with_empty_cgroup_path_keeps_hierarchy() {
        // arrange
        let tmp = tempfile::tempdir().unwrap();
        let mount_point = tmp.path().join("cpu");
        fs::create_dir_all(mount_point.join("other_container/child")).unwrap();
        fs::create_dir_all(mount_point.join("system.slice")).unwrap();
        let mut controller = CpuController::new();

        // act
        let result = controller.remove(
            &FixedRootResolver::new(tmp.path()),
            &ControllerTarget::new("", Pid::from_raw(1000)),
        );

        // assert
        assert!(result.is_ok());
        assert!(mount_point.join("other_container/child").is_dir());
        assert!(mount_point.join("system.slice").is_dir());
    }

    #[test]
    fn test_remove_with_root_cgroup_path_keeps_hierarchy() {
        let tmp = tempfile::tempdir().unwrap();
        let mount_point = tmp.path().join("cpu");
        fs::create_dir_all(mount_point.join("system.slice")).unwrap();
        let mut controller = CpuController::new();

        let result = controller.remove(
            &FixedRootResolver::new(tmp.path()),
            &ControllerTarget::new("/", Pid::from_raw(1000)),
        );

        assert!(result.is_ok());
        assert!(mount_point.join("system.slice").is_dir());
    }

    #[test]
    fn test_apply_with_empty_cgroup_path_is_inactive() {
        // arrange
        let tmp = tempfile::tempdir().unwrap();
        let mount_point = tmp.path().join("cpu");
        fs::create_dir_all(&mount_point).unwrap();
        set_cpu_fixtures(&mount_point).unwrap();
        let mut controller = CpuController::new();
        let resources = CpuResources {
            realtime_runtime: 950000,
            ..Default::default()
        };

        // act
        controller
            .apply(
                &FixedRootResolver::new(tmp.path()),
                &CgroupProcsAttacher,
                &ControllerTarget::new("", Pid::from_raw(1000)),
                &resources,
            )
            .expect("apply cpu controller");
        controller.set(&resources).expect("set on inactive controller");

        // assert
        assert_eq!(controller.path(), None);
        let read = |file: &str| fs::read_to_string(mount_point.join(file)).unwrap();
        assert_eq!(read(CGROUP_PROCS), "");
        assert_eq!(read(CGROUP_CPU_RT_RUNTIME), "");
    }

    #[test]
    fn test_apply_outside_hierarchy() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("cpu")).unwrap();
        let mut controller = CpuController::with_writer(TestWriter::default());

        let result = controller.apply(
            &FixedRootResolver::new(tmp.path()),
            &TestAttacher::default(),
            &ControllerTarget::new("../escape", Pid::from_raw(1000)),
            &CpuResources::default(),
        );

        assert!(matches!(result, Err(CpuControllerError::Resolve(_))));
        assert!(!tmp.path().join("escape").exists());
        assert_eq!(controller.state(), &ControllerState::Unattached);
    }
}

