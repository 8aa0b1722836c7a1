//! The task-launcher boundary. The launcher proper forks and wires
//! namespaces elsewhere; this is the contract it consumes per container
//! start: leaf cgroups to attach the child to, volume links to bind into
//! the new mount namespace, and the freezer used to verify attachment
//! before the child is resumed.

use std::collections::HashMap;
use std::sync::Arc;

use nix::unistd::Pid;

use libcgroups::mount;
use libcgroups::{Cgroup, Freezer, Subsystem};

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use crate::container::Container;
use crate::volume::VolumeLink;

pub struct LaunchSpec {
    /// Cgroups the child pid must land in, one per controller.
    pub leaf_cgroups: HashMap<Arc<Subsystem>, Arc<Cgroup>>,
    /// Volume links to bind, in definition order.
    pub links: Vec<VolumeLink>,
    /// Freezer cgroup the attachment check runs against.
    pub freezer: Arc<Cgroup>,
}

impl LaunchSpec {
    pub fn new(freezer: Arc<Cgroup>) -> Self {
        LaunchSpec {
            leaf_cgroups: HashMap::new(),
            links: Vec::new(),
            freezer,
        }
    }

    /// Attaches a freshly cloned pid to every leaf cgroup. Runs before the
    /// child is resumed.
    pub fn attach(&self, pid: Pid) -> Result<()> {
        for cgroup in self.leaf_cgroups.values() {
            cgroup.attach(pid)?;
        }
        Ok(())
    }

    /// Binds the volume links into the container's mount namespace root.
    /// A failing required link aborts the start; optional ones only warn.
    pub fn bind_links(&self, container: &Container) -> Result<()> {
        for link in &self.links {
            if link.target.as_os_str().is_empty() {
                continue;
            }
            let host_target = container.compose_path(&link.target);
            let bound = fsutil::create_dir_all(&host_target)
                .and_then(|()| mount::bind(&link.volume_path, &host_target, link.read_only));
            match bound {
                Ok(()) => {
                    tracing::debug!(
                        volume = %link.volume_path.display(),
                        target = %host_target.display(),
                        "volume bound into container"
                    );
                }
                Err(err) if link.required => {
                    tracing::error!(
                        volume = %link.volume_path.display(),
                        %err,
                        "required volume link failed, aborting start"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        volume = %link.volume_path.display(),
                        %err,
                        "optional volume link failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Verifies every pid under the freezer sits in every intended leaf
    /// cgroup, re-attaching stragglers. With `freeze` the check runs
    /// against a stopped world and thaws afterwards even on failure.
    pub fn sync_cgroups(&self, freeze: bool) -> Result<()> {
        if freeze {
            Freezer::freeze(&self.freezer)?;
        }
        let verified = self.verify_attached();
        if freeze {
            let thawed = Freezer::unfreeze(&self.freezer);
            verified.and(thawed)
        } else {
            verified
        }
    }

    fn verify_attached(&self) -> Result<()> {
        for pid in self.freezer.processes()? {
            let cgroups: Vec<procfs::ProcessCGroup> =
                procfs::process::Process::new(pid.as_raw())
                    .and_then(|p| p.cgroups())
                    .map_err(|err| {
                        Error::Unknown(format!("failed to read cgroups of pid {pid}: {err}"))
                    })?
                    .into_iter()
                    .collect();

            for (subsystem, cgroup) in &self.leaf_cgroups {
                let wanted = cgroup.relative_path();
                let attached = cgroups
                    .iter()
                    .find(|c| c.controllers.iter().any(|ctrl| ctrl == subsystem.name()))
                    .map(|c| c.pathname.as_str() == wanted)
                    .unwrap_or(false);
                if !attached {
                    tracing::warn!(
                        pid = pid.as_raw(),
                        subsystem = subsystem.name(),
                        cgroup = %wanted,
                        "pid escaped its leaf cgroup, re-attaching"
                    );
                    cgroup.attach(pid)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcgroups::{CgroupRegistry, Mount, CGROUP_PROCS};
    use nix::mount::MsFlags;
    use std::path::{Path, PathBuf};
    use std::sync::Weak;
    use warden_common::test_utils::set_fixture;

    fn freezer_root(registry: &CgroupRegistry, dir: &Path) -> Arc<Cgroup> {
        let freezer = registry.subsystem("freezer");
        let mount = Mount::new(
            "cgroup",
            dir,
            "cgroup",
            MsFlags::empty(),
            ["freezer".to_string()],
        );
        registry.get_root(mount, vec![freezer])
    }

    fn link(volume_path: PathBuf, target: &str, required: bool) -> VolumeLink {
        VolumeLink {
            volume_path,
            container: Weak::new(),
            container_name: "web".into(),
            target: PathBuf::from(target),
            host_target: PathBuf::new(),
            read_only: false,
            required,
            busy: false,
        }
    }

    #[test]
    fn attach_reaches_every_leaf_cgroup() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = freezer_root(&registry, tmp.path());
        let leaf = registry.get("ct-1", &root);
        std::fs::create_dir(leaf.path()).unwrap();
        set_fixture(&leaf.path(), CGROUP_PROCS, "").unwrap();

        let mut spec = LaunchSpec::new(Arc::clone(&leaf));
        spec.leaf_cgroups
            .insert(registry.subsystem("freezer"), Arc::clone(&leaf));

        spec.attach(Pid::from_raw(4321)).unwrap();
        assert_eq!(leaf.processes().unwrap(), vec![Pid::from_raw(4321)]);
    }

    #[test]
    fn sync_cgroups_freezes_and_thaws_an_empty_cgroup() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = freezer_root(&registry, tmp.path());
        let leaf = registry.get("ct-1", &root);
        std::fs::create_dir(leaf.path()).unwrap();
        set_fixture(&leaf.path(), CGROUP_PROCS, "").unwrap();
        set_fixture(&leaf.path(), "freezer.state", "THAWED").unwrap();

        let spec = LaunchSpec::new(Arc::clone(&leaf));
        spec.sync_cgroups(true).unwrap();
        assert_eq!(
            std::fs::read_to_string(leaf.path().join("freezer.state")).unwrap(),
            "THAWED"
        );
    }

    #[test]
    fn required_link_failure_aborts_bind() {
        let tmp = tempfile::tempdir().unwrap();
        let ct = Container::new("web", tmp.path().join("root"));

        let mut spec = LaunchSpec::new(freezer_root(
            &CgroupRegistry::with_anchor(tmp.path()),
            tmp.path(),
        ));
        // pinning links with no target are skipped entirely
        spec.links.push(link(tmp.path().join("vol-a"), "", false));
        // an optional link to a missing volume is tolerated
        spec.links
            .push(link(tmp.path().join("missing-a"), "/opt", false));
        spec.bind_links(&ct).unwrap();

        // a required link to a missing volume aborts
        spec.links
            .push(link(tmp.path().join("missing-b"), "/data", true));
        assert!(spec.bind_links(&ct).is_err());
    }
}
