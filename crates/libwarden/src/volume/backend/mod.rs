//! Pluggable storage backends. The operation set is closed: configure,
//! restore, build, delete, stat_fs, resize, claim_place. Backends are
//! stateless; everything they learn (device names, loop indices) lands on
//! the volume, which the journal persists.

mod bind;
mod loopdev;
mod lvm;
mod overlay;
mod plain;
mod quota;
mod rbd;
mod tmpfs;

use std::path::Path;
use std::process::Command;

use nix::sys::statvfs::statvfs;

use warden_common::error::{Error, Result};

use super::{BackendType, Volume};

/// Filesystem usage as a backend reports it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub space_used: u64,
    pub space_avail: u64,
    pub inode_used: u64,
    pub inode_avail: u64,
}

pub trait VolumeBackend: Send {
    fn backend_type(&self) -> BackendType;

    /// Validates the spec and resolves defaults. Must not touch disk.
    fn configure(&self, _volume: &mut Volume) -> Result<()> {
        Ok(())
    }

    /// Re-attaches to persisted state after a restart. Must tolerate the
    /// prior build having completed, not started, or stopped halfway.
    fn restore(&self, _volume: &mut Volume) -> Result<()> {
        Ok(())
    }

    /// Materializes the backing store and mounts it at the volume path.
    /// On error every partial effect is rolled back before returning.
    fn build(&self, volume: &mut Volume) -> Result<()>;

    /// Unmounts and releases the backing store. Idempotent.
    fn delete(&self, volume: &mut Volume) -> Result<()>;

    fn stat_fs(&self, volume: &Volume) -> Result<StatFs> {
        statvfs_for(&volume.path)
    }

    fn resize(&self, _volume: &mut Volume, _space_limit: u64, _inode_limit: u64) -> Result<()> {
        Err(Error::NotSupported(format!(
            "{} backend cannot resize",
            self.backend_type()
        )))
    }

    /// The key space consumption is accounted under; by default the
    /// volume's place.
    fn claim_place(&self, volume: &Volume) -> String {
        volume.place.display().to_string()
    }
}

pub fn open_backend(kind: BackendType) -> Box<dyn VolumeBackend> {
    match kind {
        BackendType::Plain => Box::new(plain::PlainBackend),
        BackendType::Bind => Box::new(bind::BindBackend),
        BackendType::Rbd => Box::new(rbd::RbdBackend),
        BackendType::Loop => Box::new(loopdev::LoopBackend),
        BackendType::Overlay => Box::new(overlay::OverlayBackend),
        BackendType::Tmpfs => Box::new(tmpfs::TmpfsBackend { huge: false }),
        BackendType::HugeTmpfs => Box::new(tmpfs::TmpfsBackend { huge: true }),
        BackendType::Quota => Box::new(quota::QuotaBackend),
        BackendType::Lvm => Box::new(lvm::LvmBackend),
    }
}

pub(crate) fn statvfs_for(path: &Path) -> Result<StatFs> {
    let stat = statvfs(path).map_err(|source| Error::Sys {
        msg: format!("failed to statvfs {}", path.display()),
        source,
    })?;
    let frag = stat.fragment_size();
    Ok(StatFs {
        space_used: (stat.blocks() - stat.blocks_free()) * frag,
        space_avail: stat.blocks_available() * frag,
        inode_used: stat.files() - stat.files_free(),
        inode_avail: stat.files_available(),
    })
}

/// Runs an external storage tool and returns its trimmed stdout.
pub(crate) fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    tracing::debug!(program, ?args, "running storage tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| Error::Io {
            op: "spawn",
            path: program.into(),
            source,
        })?;
    if !output.status.success() {
        return Err(Error::Unknown(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statvfs_reports_something_sane() {
        let tmp = tempfile::tempdir().unwrap();
        let stat = statvfs_for(tmp.path()).unwrap();
        assert!(stat.space_avail > 0);
        assert!(stat.inode_avail > 0);
    }

    #[test]
    fn every_backend_type_opens() {
        for kind in [
            BackendType::Plain,
            BackendType::Bind,
            BackendType::Rbd,
            BackendType::Loop,
            BackendType::Overlay,
            BackendType::Tmpfs,
            BackendType::HugeTmpfs,
            BackendType::Quota,
            BackendType::Lvm,
        ] {
            assert_eq!(open_backend(kind).backend_type(), kind);
        }
    }

    #[test]
    fn resize_defaults_to_not_supported() {
        let backend = open_backend(BackendType::Bind);
        let mut volume = Volume::empty("1".into());
        assert!(matches!(
            backend.resize(&mut volume, 1 << 20, 0),
            Err(Error::NotSupported(_))
        ));
    }
}
