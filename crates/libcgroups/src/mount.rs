//! Snapshot reader of the process's mount table plus the imperative
//! mount/unmount operators the cgroup and volume managers share.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use procfs::process::{MountInfo, Process};

use warden_common::error::{Error, Result};

/// One mount table entry. Equality is structural across all five fields;
/// kernels reject duplicate mounts differently across versions, so nothing
/// is normalized after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub flags: MsFlags,
    pub options: BTreeSet<String>,
}

impl Mount {
    pub fn new<S, P, F, I>(source: S, mountpoint: P, fstype: F, flags: MsFlags, options: I) -> Self
    where
        S: Into<String>,
        P: Into<PathBuf>,
        F: Into<String>,
        I: IntoIterator<Item = String>,
    {
        Mount {
            source: source.into(),
            mountpoint: mountpoint.into(),
            fstype: fstype.into(),
            flags,
            options: options.into_iter().collect(),
        }
    }

    /// Reads the live mount table of this process.
    pub fn snapshot() -> Result<Vec<Mount>> {
        let mounts = Process::myself()
            .map_err(|err| Error::Unknown(format!("failed to read /proc/self: {err}")))?
            .mountinfo()
            .map_err(|err| Error::Unknown(format!("failed to read mountinfo: {err}")))?;
        Ok(mounts.into_iter().map(Mount::from_mount_info).collect())
    }

    fn from_mount_info(mi: MountInfo) -> Self {
        let mut flags = MsFlags::empty();
        let mut options = BTreeSet::new();
        let raw = mi.mount_options.into_iter().chain(mi.super_options);
        for (opt, value) in raw {
            match flag_for(&opt) {
                Some(flag) => flags |= flag,
                // "rw" is the absence of MS_RDONLY, not an option flag
                None if opt == "rw" => {}
                None => {
                    options.insert(match value {
                        Some(value) => format!("{opt}={value}"),
                        None => opt,
                    });
                }
            }
        }
        Mount {
            source: mi.mount_source.unwrap_or_default(),
            mountpoint: mi.mount_point,
            fstype: mi.fs_type,
            flags,
            options,
        }
    }

    /// Whether anything is currently mounted at `path`.
    pub fn is_mounted(path: &Path) -> Result<bool> {
        Ok(Mount::snapshot()?.iter().any(|m| m.mountpoint == path))
    }

    pub fn data(&self) -> String {
        self.options
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn mount(&self) -> Result<()> {
        tracing::debug!(
            source = %self.source,
            target = %self.mountpoint.display(),
            fstype = %self.fstype,
            "mounting"
        );
        let data = self.data();
        mount(
            Some(self.source.as_str()),
            &self.mountpoint,
            Some(self.fstype.as_str()),
            self.flags,
            if data.is_empty() {
                None
            } else {
                Some(data.as_str())
            },
        )
        .map_err(|source| Error::Sys {
            msg: format!(
                "failed to mount {} at {}",
                self.source,
                self.mountpoint.display()
            ),
            source,
        })
    }

    pub fn umount(&self) -> Result<()> {
        umount(&self.mountpoint)
    }
}

fn flag_for(option: &str) -> Option<MsFlags> {
    match option {
        "ro" => Some(MsFlags::MS_RDONLY),
        "nosuid" => Some(MsFlags::MS_NOSUID),
        "nodev" => Some(MsFlags::MS_NODEV),
        "noexec" => Some(MsFlags::MS_NOEXEC),
        "noatime" => Some(MsFlags::MS_NOATIME),
        "nodiratime" => Some(MsFlags::MS_NODIRATIME),
        "relatime" => Some(MsFlags::MS_RELATIME),
        "strictatime" => Some(MsFlags::MS_STRICTATIME),
        "sync" => Some(MsFlags::MS_SYNCHRONOUS),
        _ => None,
    }
}

pub fn umount(target: &Path) -> Result<()> {
    tracing::debug!(target = %target.display(), "unmounting");
    umount2(target, MntFlags::empty()).map_err(|source| Error::Sys {
        msg: format!("failed to unmount {}", target.display()),
        source,
    })
}

/// Lazy unmount; succeeds if nothing is mounted at `target`.
pub fn umount_detach(target: &Path) -> Result<()> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(source) => Err(Error::Sys {
            msg: format!("failed to unmount {}", target.display()),
            source,
        }),
    }
}

/// Bind-mounts `source` onto `target`; a read-only bind needs the second
/// remount step, the first mount call ignores MS_RDONLY.
pub fn bind(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        read_only,
        "bind mounting"
    );
    let bind_flags = MsFlags::MS_BIND | MsFlags::MS_REC;
    mount(
        Some(source),
        target,
        None::<&str>,
        bind_flags,
        None::<&str>,
    )
    .map_err(|source_err| Error::Sys {
        msg: format!(
            "failed to bind {} at {}",
            source.display(),
            target.display()
        ),
        source: source_err,
    })?;
    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            bind_flags | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|source_err| Error::Sys {
            msg: format!("failed to remount {} read-only", target.display()),
            source: source_err,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural() {
        let a = Mount::new(
            "cgroup",
            "/sys/fs/cgroup/memory",
            "cgroup",
            MsFlags::MS_NOSUID,
            ["memory".to_string()],
        );
        let mut b = a.clone();
        assert_eq!(a, b);

        b.flags |= MsFlags::MS_NODEV;
        assert_ne!(a, b);

        let mut c = a.clone();
        c.options.insert("cpuacct".to_string());
        assert_ne!(a, c);
    }

    #[test]
    fn known_flags_fold_out_of_options() {
        assert_eq!(flag_for("ro"), Some(MsFlags::MS_RDONLY));
        assert_eq!(flag_for("relatime"), Some(MsFlags::MS_RELATIME));
        assert_eq!(flag_for("memory"), None);
        assert_eq!(flag_for("mode=755"), None);
    }

    #[test]
    fn data_joins_options() {
        let m = Mount::new(
            "tmpfs",
            "/tmp/t",
            "tmpfs",
            MsFlags::empty(),
            ["size=64M".to_string(), "nr_inodes=1024".to_string()],
        );
        assert_eq!(m.data(), "nr_inodes=1024,size=64M");
    }

    #[test]
    fn snapshot_reads_live_table() {
        let mounts = Mount::snapshot().unwrap();
        assert!(mounts.iter().any(|m| m.mountpoint == Path::new("/")));
    }
}
