//! Discovery of the full cgroup forest from the mount table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use warden_common::error::Result;

use crate::cgroup::{Cgroup, CgroupRegistry};
use crate::mount::Mount;
use crate::subsystem::{canonical_csv, Subsystem, KNOWN_SUBSYSTEMS};

/// The current forest: every cgroup directory reachable from the mounted
/// hierarchies of known subsystems, plus the controller handles seen.
pub struct CgroupSnapshot {
    pub cgroups: Vec<Arc<Cgroup>>,
    pub subsystems: HashMap<String, Arc<Subsystem>>,
}

impl CgroupSnapshot {
    /// Discovers from the live mount table.
    pub fn snapshot(registry: &CgroupRegistry) -> Result<Self> {
        Self::from_mounts(registry, Mount::snapshot()?)
    }

    /// Discovers from an explicit mount table. If two mounts carry the same
    /// subsystem set, the first encountered wins.
    pub fn from_mounts(registry: &CgroupRegistry, mounts: Vec<Mount>) -> Result<Self> {
        let mut snapshot = CgroupSnapshot {
            cgroups: Vec::new(),
            subsystems: HashMap::new(),
        };
        let mut seen_sets: HashSet<String> = HashSet::new();

        for mount in mounts {
            // canonical order falls out of iterating KNOWN_SUBSYSTEMS
            let names: Vec<&str> = KNOWN_SUBSYSTEMS
                .iter()
                .copied()
                .filter(|name| mount.options.contains(*name))
                .collect();
            if names.is_empty() {
                continue;
            }

            let csv = canonical_csv(names.iter().copied());
            if !seen_sets.insert(csv.clone()) {
                tracing::debug!(
                    mountpoint = %mount.mountpoint.display(),
                    subsystems = %csv,
                    "skipping duplicate subsystem-set mount"
                );
                continue;
            }

            let controllers: Vec<Arc<Subsystem>> =
                names.iter().map(|name| registry.subsystem(name)).collect();
            for controller in &controllers {
                snapshot
                    .subsystems
                    .insert(controller.name().to_string(), Arc::clone(controller));
            }

            let root = registry.get_root(mount, controllers);
            snapshot.cgroups.extend(root.find_children(registry)?);
        }

        Ok(snapshot)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Arc<Cgroup>> {
        self.cgroups.iter().filter(|cg| cg.is_root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::mount::MsFlags;
    use std::path::Path;

    fn cgroup_mount(dir: &Path, subsystems: &[&str]) -> Mount {
        Mount::new(
            "cgroup",
            dir,
            "cgroup",
            MsFlags::empty(),
            subsystems.iter().map(|s| s.to_string()),
        )
    }

    #[test]
    fn discovers_identical_tree_shape_per_hierarchy() {
        let tmp = tempfile::tempdir().unwrap();
        let memory_dir = tmp.path().join("memory");
        let cpuacct_dir = tmp.path().join("cpuacct");
        for dir in [&memory_dir, &cpuacct_dir] {
            std::fs::create_dir_all(dir.join("a/b")).unwrap();
        }

        let registry = CgroupRegistry::with_anchor(tmp.path());
        let snapshot = CgroupSnapshot::from_mounts(
            &registry,
            vec![
                cgroup_mount(&memory_dir, &["memory"]),
                cgroup_mount(&cpuacct_dir, &["cpuacct"]),
            ],
        )
        .unwrap();

        assert_eq!(snapshot.roots().count(), 2);
        // root + /a + /a/b under each hierarchy
        assert_eq!(snapshot.cgroups.len(), 6);
        for dir in [&memory_dir, &cpuacct_dir] {
            assert!(snapshot
                .cgroups
                .iter()
                .any(|cg| cg.path() == dir.join("a/b")));
        }
        assert!(snapshot.subsystems.contains_key("memory"));
        assert!(snapshot.subsystems.contains_key("cpuacct"));
    }

    #[test]
    fn ignores_unknown_mounts_and_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("freezer");
        let second = tmp.path().join("freezer2");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(second.join("stale")).unwrap();

        let registry = CgroupRegistry::with_anchor(tmp.path());
        let snapshot = CgroupSnapshot::from_mounts(
            &registry,
            vec![
                Mount::new(
                    "proc",
                    tmp.path().join("proc"),
                    "proc",
                    MsFlags::empty(),
                    [],
                ),
                cgroup_mount(&first, &["freezer"]),
                cgroup_mount(&second, &["freezer"]),
            ],
        )
        .unwrap();

        // the duplicate freezer mount is skipped, first one wins
        assert_eq!(snapshot.roots().count(), 1);
        assert_eq!(snapshot.cgroups.len(), 1);
        assert_eq!(snapshot.cgroups[0].path(), first);
    }

    #[test]
    fn comounted_controllers_share_one_root() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("cpu,cpuacct");
        std::fs::create_dir_all(&dir).unwrap();

        let registry = CgroupRegistry::with_anchor(tmp.path());
        let snapshot = CgroupSnapshot::from_mounts(
            &registry,
            // mount options carry both controller names plus noise
            vec![cgroup_mount(&dir, &["cpuacct", "cpu", "rw"])],
        )
        .unwrap();

        assert_eq!(snapshot.roots().count(), 1);
        let root = snapshot.roots().next().unwrap();
        let names: Vec<&str> = root.subsystems().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["cpu", "cpuacct"]);
        assert_eq!(snapshot.subsystems.len(), 2);
    }
}
