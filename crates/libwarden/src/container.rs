//! The container collaborator as volumes and the launcher see it: a name,
//! a namespace root on the host, and a coarse lifecycle status.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::unistd::Pid;

use warden_common::fsutil;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ContainerStatus {
    #[default]
    Stopped,
    Starting,
    Running,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Starting | ContainerStatus::Running)
    }
}

#[derive(Debug)]
struct ContainerRuntime {
    status: ContainerStatus,
    pid: Option<Pid>,
}

#[derive(Debug)]
pub struct Container {
    name: String,
    root: PathBuf,
    runtime: Mutex<ContainerRuntime>,
}

impl Container {
    pub fn new<N: Into<String>, P: Into<PathBuf>>(name: N, root: P) -> Self {
        Container {
            name: name.into(),
            root: root.into(),
            runtime: Mutex::new(ContainerRuntime {
                status: ContainerStatus::Stopped,
                pid: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host path of this container's mount namespace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status(&self) -> ContainerStatus {
        self.runtime.lock().unwrap().status
    }

    pub fn pid(&self) -> Option<Pid> {
        self.runtime.lock().unwrap().pid
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    pub fn set_starting(&self) {
        let mut runtime = self.runtime.lock().unwrap();
        runtime.status = ContainerStatus::Starting;
    }

    pub fn set_running(&self, pid: Pid) {
        let mut runtime = self.runtime.lock().unwrap();
        runtime.status = ContainerStatus::Running;
        runtime.pid = Some(pid);
    }

    pub fn set_stopped(&self) {
        let mut runtime = self.runtime.lock().unwrap();
        runtime.status = ContainerStatus::Stopped;
        runtime.pid = None;
    }

    /// Resolves a container-namespace path to the host path it lands on.
    pub fn compose_path(&self, target: &Path) -> PathBuf {
        fsutil::join_under(&self.root, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        let ct = Container::new("a", "/run/warden/a/root");
        assert!(!ct.is_running());
        ct.set_starting();
        assert!(ct.is_running());
        ct.set_running(Pid::from_raw(100));
        assert_eq!(ct.pid(), Some(Pid::from_raw(100)));
        ct.set_stopped();
        assert!(!ct.is_running());
        assert_eq!(ct.pid(), None);
    }

    #[test]
    fn compose_path_resolves_into_root() {
        let ct = Container::new("a", "/run/warden/a/root");
        assert_eq!(
            ct.compose_path(Path::new("/data")),
            PathBuf::from("/run/warden/a/root/data")
        );
    }
}
