//! Overlay volume: stacked read-only lower layers with an optional
//! writable upper kept in the volume's internal directory.

use std::path::{Path, PathBuf};

use libcgroups::mount::{self, Mount};
use nix::mount::MsFlags;

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use super::{statvfs_for, StatFs, VolumeBackend};
use crate::volume::{BackendType, Volume};

const UPPER_DIR: &str = "upper";
const WORK_DIR: &str = "work";

pub struct OverlayBackend;

impl OverlayBackend {
    pub(crate) fn upper_dir(volume: &Volume) -> PathBuf {
        volume.internal_dir().join(UPPER_DIR)
    }

    fn work_dir(volume: &Volume) -> PathBuf {
        volume.internal_dir().join(WORK_DIR)
    }

    /// Assembles the mount data. The kernel lists lowerdir top-first, the
    /// volume keeps layers bottom-to-top, hence the reversal.
    pub(crate) fn mount_options(lower: &[PathBuf], upper: Option<(&Path, &Path)>) -> Vec<String> {
        let lowerdir = lower
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let mut options = vec![format!("lowerdir={lowerdir}")];
        if let Some((upperdir, workdir)) = upper {
            options.push(format!("upperdir={}", upperdir.display()));
            options.push(format!("workdir={}", workdir.display()));
        }
        options
    }

    fn mount_for(volume: &Volume) -> Result<Mount> {
        let mut lower = Vec::with_capacity(volume.layers.len());
        for layer in &volume.layers {
            let path = volume.layer_path(layer);
            if !fsutil::exists(&path) {
                return Err(Error::LayerNotFound(layer.clone()));
            }
            lower.push(path);
        }
        let upper_dirs;
        let upper = if volume.read_only {
            None
        } else {
            upper_dirs = (Self::upper_dir(volume), Self::work_dir(volume));
            Some((upper_dirs.0.as_path(), upper_dirs.1.as_path()))
        };
        let mut flags = MsFlags::empty();
        if volume.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        let options = Self::mount_options(&lower, upper);
        Ok(Mount::new(
            "overlay",
            volume.path.clone(),
            "overlay",
            flags,
            options,
        ))
    }
}

impl VolumeBackend for OverlayBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Overlay
    }

    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if !volume.have_layers() {
            return Err(Error::InvalidValue("overlay volume requires layers".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for layer in &volume.layers {
            if !seen.insert(layer) {
                return Err(Error::InvalidValue(format!("duplicate layer {layer:?}")));
            }
        }
        Ok(())
    }

    fn build(&self, volume: &mut Volume) -> Result<()> {
        if !volume.read_only {
            fsutil::create_dir_all(&Self::upper_dir(volume))?;
            fsutil::create_dir_all(&Self::work_dir(volume))?;
        }
        if !fsutil::exists(&volume.path) {
            fsutil::create_dir_mode(&volume.path, volume.permissions)?;
        }
        let mnt = Self::mount_for(volume)?;
        if let Err(err) = mnt.mount() {
            let _ = fsutil::remove_all(&volume.internal_dir());
            if volume.is_auto_path {
                let _ = fsutil::remove_dir(&volume.path);
            }
            return Err(err);
        }
        Ok(())
    }

    fn restore(&self, volume: &mut Volume) -> Result<()> {
        if !Mount::is_mounted(&volume.path)? {
            self.build(volume)?;
        }
        Ok(())
    }

    fn delete(&self, volume: &mut Volume) -> Result<()> {
        mount::umount_detach(&volume.path)?;
        fsutil::remove_all(&volume.internal_dir())?;
        if volume.is_auto_path {
            fsutil::remove_dir(&volume.path)?;
        }
        Ok(())
    }

    /// Usage of the writable upper; a read-only stack reports the merged
    /// mount itself.
    fn stat_fs(&self, volume: &Volume) -> Result<StatFs> {
        if volume.read_only {
            statvfs_for(&volume.path)
        } else {
            statvfs_for(&Self::upper_dir(volume))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_layers_stack_bottom_to_top() {
        let lower = vec![PathBuf::from("/l/base"), PathBuf::from("/l/patch")];
        let options = OverlayBackend::mount_options(&lower, None);
        // index 0 is the lowest layer, so it goes last in lowerdir
        assert_eq!(options, vec!["lowerdir=/l/patch:/l/base".to_string()]);
    }

    #[test]
    fn writable_stack_gets_upper_and_work() {
        let lower = vec![PathBuf::from("/l/base")];
        let options = OverlayBackend::mount_options(
            &lower,
            Some((Path::new("/v/upper"), Path::new("/v/work"))),
        );
        assert_eq!(
            options,
            vec![
                "lowerdir=/l/base".to_string(),
                "upperdir=/v/upper".to_string(),
                "workdir=/v/work".to_string(),
            ]
        );
    }

    #[test]
    fn duplicate_layers_are_rejected() {
        let mut volume = Volume::empty("1".into());
        volume.layers = vec!["base".into(), "base".into()];
        assert!(matches!(
            OverlayBackend.configure(&mut volume),
            Err(Error::InvalidValue(_))
        ));
        volume.layers = vec!["base".into(), "patch".into()];
        OverlayBackend.configure(&mut volume).unwrap();
    }

    #[test]
    fn missing_layer_surfaces_as_layer_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mut volume = Volume::empty("1".into());
        volume.place = tmp.path().to_path_buf();
        volume.path = tmp.path().join("merged");
        volume.layers = vec!["ghost".into()];
        volume.read_only = true;
        let err = OverlayBackend::mount_for(&volume).unwrap_err();
        assert!(matches!(err, Error::LayerNotFound(_)));
    }
}
