//! Cgroup controllers as interned value objects, and the freezer state
//! machine built on top of one of them.

use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};

use warden_common::error::{Error, Result};

use crate::cgroup::Cgroup;

/// Controllers recognized at snapshot time, in canonical order. Mounts whose
/// option flags intersect this set form the discovered forest.
pub const KNOWN_SUBSYSTEMS: &[&str] = &[
    "cpuset",
    "cpu",
    "cpuacct",
    "memory",
    "devices",
    "freezer",
    "net_cls",
    "net_prio",
    "blkio",
    "perf_event",
    "hugetlb",
    "name=systemd",
];

/// One cgroup controller, named by its lowercase identifier. Handles are
/// interned by the [`crate::CgroupRegistry`], so two handles with equal
/// names are the same allocation.
#[derive(Debug)]
pub struct Subsystem {
    name: String,
}

impl Subsystem {
    pub(crate) fn new(name: &str) -> Self {
        Subsystem {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Subsystem {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Subsystem {}

impl std::hash::Hash for Subsystem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Sorts controller names into the canonical order and joins them with
/// commas; names outside the known set sort last, alphabetically.
pub fn canonical_csv<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_by_key(|name| {
        (
            KNOWN_SUBSYSTEMS
                .iter()
                .position(|known| known == name)
                .unwrap_or(KNOWN_SUBSYSTEMS.len()),
            *name,
        )
    });
    names.dedup();
    names.join(",")
}

pub const FREEZER_STATE: &str = "freezer.state";
const FREEZER_FROZEN: &str = "FROZEN";
const FREEZER_THAWED: &str = "THAWED";
const FREEZER_FREEZING: &str = "FREEZING";

const FREEZER_POLL: Duration = Duration::from_millis(10);
const FREEZER_TIMEOUT: Duration = Duration::from_secs(10);

/// Freezer controller operations. Writes to `freezer.state` are
/// asynchronous, so both directions poll for convergence.
pub struct Freezer;

impl Freezer {
    pub fn freeze(cg: &Cgroup) -> Result<()> {
        Self::freeze_with_deadline(cg, FREEZER_TIMEOUT)
    }

    pub fn freeze_with_deadline(cg: &Cgroup, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut retries = 0u32;
        loop {
            cg.write_knob(FREEZER_STATE, FREEZER_FROZEN, false)?;
            let state = cg.read_knob(FREEZER_STATE)?;
            match state.trim() {
                FREEZER_FROZEN => {
                    if retries > 0 {
                        tracing::debug!(cgroup = %cg.path().display(), retries, "frozen");
                    }
                    return Ok(());
                }
                FREEZER_FREEZING => {}
                other => {
                    // Leaving a cgroup FREEZING is dangerous, thaw it back.
                    let _ = cg.write_knob(FREEZER_STATE, FREEZER_THAWED, false);
                    return Err(Error::Unknown(format!(
                        "unexpected freezer state {other:?} in {}",
                        cg.path().display()
                    )));
                }
            }
            if Instant::now() >= deadline {
                let _ = cg.write_knob(FREEZER_STATE, FREEZER_THAWED, false);
                return Err(Error::Timeout(format!(
                    "freezing cgroup {}",
                    cg.path().display()
                )));
            }
            retries += 1;
            thread::sleep(FREEZER_POLL);
        }
    }

    pub fn unfreeze(cg: &Cgroup) -> Result<()> {
        Self::unfreeze_with_deadline(cg, FREEZER_TIMEOUT)
    }

    pub fn unfreeze_with_deadline(cg: &Cgroup, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            cg.write_knob(FREEZER_STATE, FREEZER_THAWED, false)?;
            if cg.read_knob(FREEZER_STATE)?.trim() == FREEZER_THAWED {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "thawing cgroup {}",
                    cg.path().display()
                )));
            }
            thread::sleep(FREEZER_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupRegistry;
    use crate::mount::Mount;
    use nix::mount::MsFlags;
    use warden_common::test_utils::set_fixture;

    fn fixture_root(registry: &CgroupRegistry, dir: &std::path::Path) -> std::sync::Arc<Cgroup> {
        let freezer = registry.subsystem("freezer");
        let mount = Mount::new("cgroup", dir, "cgroup", MsFlags::empty(), ["freezer".to_string()]);
        registry.get_root(mount, vec![freezer])
    }

    #[test]
    fn canonical_order_matches_known_set() {
        assert_eq!(canonical_csv(["cpuacct", "cpu"]), "cpu,cpuacct");
        assert_eq!(canonical_csv(["memory"]), "memory");
        assert_eq!(canonical_csv(["net_prio", "net_cls"]), "net_cls,net_prio");
        assert_eq!(canonical_csv(["zzz", "memory"]), "memory,zzz");
    }

    #[test]
    fn freeze_and_unfreeze_converge() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), FREEZER_STATE, "THAWED").unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path().parent().unwrap());
        let cg = fixture_root(&registry, tmp.path());

        Freezer::freeze(&cg).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join(FREEZER_STATE)).unwrap(),
            "FROZEN"
        );

        Freezer::unfreeze(&cg).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join(FREEZER_STATE)).unwrap(),
            "THAWED"
        );
    }

    #[test]
    fn freeze_fails_without_knob() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = CgroupRegistry::with_anchor(tmp.path().parent().unwrap());
        let cg = fixture_root(&registry, tmp.path());
        assert!(Freezer::freeze(&cg).is_err());
    }
}
