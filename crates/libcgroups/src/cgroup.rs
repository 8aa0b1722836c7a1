//! The interned cgroup tree. Nodes mediate kernel state through knob I/O
//! under their computed paths; the registry holds the single owning handle
//! for every live node so discovered subtrees stay alive mid-walk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use crate::mount::Mount;
use crate::subsystem::{canonical_csv, Subsystem};

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_TASKS: &str = "tasks";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

const DEFAULT_MODE: u32 = 0o755;
const DRAIN_POLL: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Drain rounds that get SIGINT before escalation to SIGKILL.
const DRAIN_SIGINT_ROUNDS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CgroupKey {
    /// Roots are identified by their canonical subsystem set.
    Root(String),
    /// Non-roots by their full path; parents are interned, so equal
    /// (parent, name) pairs always compute equal paths.
    Node(PathBuf),
}

/// Process-wide interning registry for subsystems and cgroup nodes.
/// Lookup and insertion take the registry lock; operations on a returned
/// handle do not, the kernel serializes concurrent knob I/O.
pub struct CgroupRegistry {
    anchor: PathBuf,
    nodes: Mutex<HashMap<CgroupKey, Arc<Cgroup>>>,
    subsystems: Mutex<HashMap<String, Arc<Subsystem>>>,
}

impl CgroupRegistry {
    pub fn new() -> Self {
        Self::with_anchor(DEFAULT_CGROUP_ROOT)
    }

    /// A registry whose cgroup filesystems anchor at `anchor` instead of
    /// the default tmpfs root.
    pub fn with_anchor<P: Into<PathBuf>>(anchor: P) -> Self {
        CgroupRegistry {
            anchor: anchor.into(),
            nodes: Mutex::new(HashMap::new()),
            subsystems: Mutex::new(HashMap::new()),
        }
    }

    pub fn anchor(&self) -> &Path {
        &self.anchor
    }

    /// Interns a subsystem by name.
    pub fn subsystem(&self, name: &str) -> Arc<Subsystem> {
        let mut subsystems = self.subsystems.lock().unwrap();
        Arc::clone(
            subsystems
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Subsystem::new(name))),
        )
    }

    pub fn memory(&self) -> Arc<Subsystem> {
        self.subsystem("memory")
    }

    pub fn freezer(&self) -> Arc<Subsystem> {
        self.subsystem("freezer")
    }

    pub fn cpu(&self) -> Arc<Subsystem> {
        self.subsystem("cpu")
    }

    /// Returns the interned node for (parent, name). Does not touch the
    /// kernel.
    pub fn get(&self, name: &str, parent: &Arc<Cgroup>) -> Arc<Cgroup> {
        self.get_with_mode(name, parent, DEFAULT_MODE)
    }

    /// Like [`get`](Self::get) with an explicit mkdir mode. The mode only
    /// sticks on the first interning of a node.
    pub fn get_with_mode(&self, name: &str, parent: &Arc<Cgroup>, mode: u32) -> Arc<Cgroup> {
        let key = CgroupKey::Node(parent.path().join(name));
        let mut nodes = self.nodes.lock().unwrap();
        Arc::clone(nodes.entry(key).or_insert_with(|| {
            Arc::new(Cgroup {
                name: name.to_string(),
                parent: Some(Arc::clone(parent)),
                depth: parent.depth + 1,
                mount: None,
                subsystems: Vec::new(),
                mode,
                children: Mutex::new(Vec::new()),
            })
        }))
    }

    /// Returns the interned root node for a mounted subsystem set.
    pub fn get_root(&self, mount: Mount, subsystems: Vec<Arc<Subsystem>>) -> Arc<Cgroup> {
        let key = CgroupKey::Root(canonical_csv(subsystems.iter().map(|s| s.name())));
        let mut nodes = self.nodes.lock().unwrap();
        Arc::clone(nodes.entry(key).or_insert_with(|| {
            Arc::new(Cgroup {
                name: "/".to_string(),
                parent: None,
                depth: 0,
                mount: Some(mount),
                subsystems,
                mode: DEFAULT_MODE,
                children: Mutex::new(Vec::new()),
            })
        }))
    }

    /// Returns the root for a subsystem set that is not mounted yet,
    /// synthesizing its mount under the registry anchor.
    pub fn get_root_for(&self, subsystems: &[Arc<Subsystem>]) -> Arc<Cgroup> {
        let csv = canonical_csv(subsystems.iter().map(|s| s.name()));
        let mount = Mount::new(
            "cgroup",
            self.anchor.join(&csv),
            "cgroup",
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            subsystems.iter().map(|s| s.name().to_string()),
        );
        self.get_root(mount, subsystems.to_vec())
    }
}

impl Default for CgroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A node of the cgroup forest. Roots carry the mount and the subsystem
/// set; non-roots carry a strong reference to their parent. Children are
/// weak back-references populated by discovery.
pub struct Cgroup {
    name: String,
    parent: Option<Arc<Cgroup>>,
    depth: u32,
    mount: Option<Mount>,
    subsystems: Vec<Arc<Subsystem>>,
    mode: u32,
    children: Mutex<Vec<Weak<Cgroup>>>,
}

impl Cgroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Cgroup>> {
        self.parent.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn subsystems(&self) -> &[Arc<Subsystem>] {
        &self.subsystems
    }

    pub fn mount(&self) -> Option<&Mount> {
        self.mount.as_ref()
    }

    /// Children discovered so far, strongest handles the registry still
    /// holds.
    pub fn children(&self) -> Vec<Arc<Cgroup>> {
        self.children
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// The node's kernel directory: the mount point for a root, the
    /// parent's path plus this node's name otherwise.
    pub fn path(&self) -> PathBuf {
        if let Some(mount) = &self.mount {
            mount.mountpoint.clone()
        } else if let Some(parent) = &self.parent {
            parent.path().join(&self.name)
        } else {
            PathBuf::from("/")
        }
    }

    /// The node's path relative to its hierarchy root, in the form
    /// `/proc/<pid>/cgroup` reports it.
    pub fn relative_path(&self) -> String {
        match &self.parent {
            None => "/".to_string(),
            Some(parent) if parent.is_root() => format!("/{}", self.name),
            Some(parent) => format!("{}/{}", parent.relative_path(), self.name),
        }
    }

    /// Idempotently materializes the kernel directory. A root mounts its
    /// subsystem set (and the shared tmpfs anchor first, when absent); a
    /// non-root creates its ancestors recursively, then itself.
    pub fn create(&self) -> Result<()> {
        if let Some(mount) = &self.mount {
            let anchor_dir = mount
                .mountpoint
                .parent()
                .unwrap_or_else(|| Path::new("/"))
                .to_path_buf();
            let anchor = Mount::new(
                "tmpfs",
                anchor_dir.clone(),
                "tmpfs",
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                ["mode=755".to_string()],
            );

            let mut mount_anchor = true;
            for present in Mount::snapshot()? {
                if present == anchor {
                    mount_anchor = false;
                }
                if present == *mount {
                    return Ok(());
                }
            }

            if mount_anchor {
                fsutil::create_dir_all(&anchor_dir)?;
                anchor.mount()?;
            }
            if !fsutil::exists(&mount.mountpoint) {
                fsutil::create_dir_mode(&mount.mountpoint, self.mode)?;
            }
            mount.mount()
        } else {
            if let Some(parent) = &self.parent {
                parent.create()?;
            }
            let path = self.path();
            if !fsutil::exists(&path) {
                fsutil::create_dir_mode(&path, self.mode)?;
            }
            Ok(())
        }
    }

    /// Tears the kernel directory down. A root is unmounted; a non-root is
    /// drained first, escalating from SIGINT to SIGKILL, bounded by
    /// `DRAIN_TIMEOUT`. Removing an already-absent cgroup is success.
    pub fn remove(&self) -> Result<()> {
        self.remove_with_timeout(DRAIN_TIMEOUT)
    }

    pub fn remove_with_timeout(&self, timeout: Duration) -> Result<()> {
        let path = self.path();
        if let Some(mount) = &self.mount {
            match mount.umount() {
                Ok(()) => {}
                Err(Error::Sys { source, .. })
                    if source == Errno::EINVAL || source == Errno::ENOENT => {}
                Err(err) => return Err(err),
            }
        } else if fsutil::exists(&path) {
            let deadline = Instant::now() + timeout;
            let mut round = 0u32;
            while !self.is_empty() {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(format!(
                        "draining cgroup {}",
                        path.display()
                    )));
                }
                let signal = if round < DRAIN_SIGINT_ROUNDS {
                    Signal::SIGINT
                } else {
                    Signal::SIGKILL
                };
                self.kill_all(signal)?;
                round += 1;
                thread::sleep(DRAIN_POLL);
            }
        }
        fsutil::remove_dir(&path)
    }

    /// Signals every task in this cgroup. Tasks that exit in between are
    /// not an error.
    pub fn kill_all(&self, signal: Signal) -> Result<()> {
        if self.is_root() {
            return Ok(());
        }
        for pid in self.tasks()? {
            tracing::debug!(pid = pid.as_raw(), %signal, cgroup = %self.path().display(), "signalling task");
            let _ = kill(pid, signal);
        }
        Ok(())
    }

    pub fn processes(&self) -> Result<Vec<Pid>> {
        Ok(fsutil::read_ints(&self.path().join(CGROUP_PROCS))?
            .into_iter()
            .map(Pid::from_raw)
            .collect())
    }

    pub fn tasks(&self) -> Result<Vec<Pid>> {
        Ok(fsutil::read_ints(&self.path().join(CGROUP_TASKS))?
            .into_iter()
            .map(Pid::from_raw)
            .collect())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().map(|tasks| tasks.is_empty()).unwrap_or(true)
    }

    /// Moves `pid` into this cgroup. Attaching to a root is a no-op, the
    /// root holds everything not attached elsewhere.
    pub fn attach(&self, pid: Pid) -> Result<()> {
        if self.is_root() {
            return Ok(());
        }
        fsutil::append_knob(&self.path().join(CGROUP_PROCS), &format!("{pid}\n"))
    }

    pub fn read_knob(&self, knob: &str) -> Result<String> {
        fsutil::read_to_string(&self.path().join(knob))
    }

    pub fn read_knob_lines(&self, knob: &str) -> Result<Vec<String>> {
        fsutil::read_lines(&self.path().join(knob))
    }

    pub fn write_knob(&self, knob: &str, value: &str, append: bool) -> Result<()> {
        let path = self.path().join(knob);
        if append {
            fsutil::append_knob(&path, value)
        } else {
            fsutil::write_knob(&path, value)
        }
    }

    /// Walks the kernel directory, registering every subdirectory as a
    /// child node, and returns the flat subtree including this node.
    pub fn find_children(self: &Arc<Self>, registry: &CgroupRegistry) -> Result<Vec<Arc<Cgroup>>> {
        let mut found = Vec::new();
        let mut children = Vec::new();
        for name in fsutil::list_subdirs(&self.path())? {
            let child = registry.get(&name, self);
            children.push(Arc::downgrade(&child));
            found.extend(child.find_children(registry)?);
        }
        *self.children.lock().unwrap() = children;
        found.push(Arc::clone(self));
        Ok(found)
    }
}

impl PartialEq for Cgroup {
    fn eq(&self, other: &Self) -> bool {
        match (&self.parent, &other.parent) {
            (None, None) => {
                canonical_csv(self.subsystems.iter().map(|s| s.name()))
                    == canonical_csv(other.subsystems.iter().map(|s| s.name()))
            }
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) && self.name == other.name,
            _ => false,
        }
    }
}

impl Eq for Cgroup {}

impl std::fmt::Debug for Cgroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cgroup")
            .field("path", &self.path())
            .field("depth", &self.depth)
            .field(
                "subsystems",
                &self
                    .subsystems
                    .iter()
                    .map(|s| s.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use warden_common::test_utils::set_fixture;

    fn test_root(registry: &CgroupRegistry, dir: &Path) -> Arc<Cgroup> {
        let memory = registry.subsystem("memory");
        let mount = Mount::new(
            "cgroup",
            dir,
            "cgroup",
            MsFlags::empty(),
            ["memory".to_string()],
        );
        registry.get_root(mount, vec![memory])
    }

    #[test]
    fn interning_returns_same_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = test_root(&registry, tmp.path());
        let a1 = registry.get("a", &root);
        let a2 = registry.get("a", &root);
        assert!(Arc::ptr_eq(&a1, &a2));

        let root_again = test_root(&registry, tmp.path());
        assert!(Arc::ptr_eq(&root, &root_again));
    }

    #[test]
    fn subsystem_interning_by_name() {
        let registry = CgroupRegistry::new();
        assert!(Arc::ptr_eq(&registry.memory(), &registry.subsystem("memory")));
        assert!(!Arc::ptr_eq(&registry.memory(), &registry.cpu()));
    }

    #[test]
    fn path_composes_from_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = test_root(&registry, tmp.path());
        let a = registry.get("a", &root);
        let b = registry.get("b", &a);
        assert_eq!(a.path(), tmp.path().join("a"));
        assert_eq!(b.path(), root.path().join("a").join("b"));
        assert_eq!(b.relative_path(), "/a/b");
        assert_eq!(root.relative_path(), "/");
        assert_eq!(b.depth(), 2);
    }

    #[test]
    fn synthesized_root_lands_under_anchor() {
        let registry = CgroupRegistry::with_anchor("/sys/fs/cgroup");
        let cpu = registry.cpu();
        let cpuacct = registry.subsystem("cpuacct");
        let root = registry.get_root_for(&[cpuacct, cpu]);
        assert_eq!(root.path(), PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"));
        let mount = root.mount().unwrap();
        assert_eq!(mount.fstype, "cgroup");
        assert!(mount.options.contains("cpu"));
        assert!(mount.options.contains("cpuacct"));
    }

    #[test]
    fn attach_appends_to_procs() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = test_root(&registry, tmp.path());
        let a = registry.get("a", &root);
        std::fs::create_dir(a.path()).unwrap();
        set_fixture(&a.path(), CGROUP_PROCS, "").unwrap();

        a.attach(Pid::from_raw(1234)).unwrap();
        a.attach(Pid::from_raw(5678)).unwrap();
        assert_eq!(
            a.processes().unwrap(),
            vec![Pid::from_raw(1234), Pid::from_raw(5678)]
        );

        // attaching to the root is a no-op
        root.attach(Pid::from_raw(1)).unwrap();
    }

    #[test]
    fn knob_io_round_trips() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = test_root(&registry, tmp.path());
        set_fixture(tmp.path(), "memory.limit_in_bytes", "0\n")?;

        root.write_knob("memory.limit_in_bytes", "65536", false)
            .context("write memory knob")?;
        assert_eq!(
            root.read_knob("memory.limit_in_bytes")
                .context("read memory knob")?,
            "65536"
        );

        set_fixture(tmp.path(), "memory.stat", "cache 1\nrss 2\n")?;
        assert_eq!(
            root.read_knob_lines("memory.stat")?,
            vec!["cache 1".to_string(), "rss 2".to_string()]
        );
        Ok(())
    }

    #[test]
    fn find_children_discovers_subtree() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = test_root(&registry, tmp.path());
        std::fs::create_dir_all(tmp.path().join("a/b"))?;
        std::fs::create_dir_all(tmp.path().join("c"))?;

        let all = root
            .find_children(&registry)
            .context("discover the fixture subtree")?;
        assert_eq!(all.len(), 4);
        assert!(all.iter().any(|cg| cg.path() == tmp.path().join("a/b")));
        assert!(all.iter().any(|cg| Arc::ptr_eq(cg, &root)));
        assert_eq!(root.children().len(), 2);
        Ok(())
    }

    #[test]
    fn remove_empty_cgroup_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = test_root(&registry, tmp.path());
        let a = registry.get("a", &root);
        std::fs::create_dir(a.path()).unwrap();
        // no tasks file at all reads as empty, like a fresh kernel dir
        a.remove().unwrap();
        assert!(!a.path().exists());
        // removing again is a no-op
        a.remove().unwrap();
    }

    #[test]
    fn remove_times_out_on_undrainable_cgroup() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path());
        let root = test_root(&registry, tmp.path());
        let a = registry.get("a", &root);
        std::fs::create_dir(a.path()).unwrap();
        // a pid that does not exist; the fixture never drains
        set_fixture(&a.path(), CGROUP_TASKS, "999999999\n").unwrap();

        let err = a.remove_with_timeout(Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
