//! Plain directory volume: the path itself is the storage, optionally
//! bound from a separate storage directory, with a project quota when
//! limits are set.

use libcgroups::mount;

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use super::{quota, VolumeBackend};
use crate::volume::{BackendType, Volume};

pub struct PlainBackend;

impl VolumeBackend for PlainBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Plain
    }

    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if volume.have_storage() {
            volume.storage_path = volume.resolve_storage();
            if volume.storage_path == volume.path {
                return Err(Error::InvalidValue(
                    "plain storage equals the volume path".into(),
                ));
            }
        }
        Ok(())
    }

    fn build(&self, volume: &mut Volume) -> Result<()> {
        if !fsutil::exists(&volume.path) {
            fsutil::create_dir_mode(&volume.path, volume.permissions)?;
        }
        if volume.have_storage() {
            fsutil::create_dir_all(&volume.storage_path)?;
            if let Err(err) = mount::bind(&volume.storage_path, &volume.path, volume.read_only) {
                if volume.is_auto_path {
                    let _ = fsutil::remove_dir(&volume.path);
                }
                return Err(err);
            }
        }
        if volume.have_quota() {
            if let Err(err) = quota::set_project_quota(
                &volume.path,
                &volume.id,
                volume.space_limit,
                volume.inode_limit,
            ) {
                if volume.have_storage() {
                    let _ = mount::umount_detach(&volume.path);
                }
                if volume.is_auto_path {
                    let _ = fsutil::remove_all(&volume.path);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn restore(&self, volume: &mut Volume) -> Result<()> {
        if !fsutil::exists(&volume.path) {
            fsutil::create_dir_mode(&volume.path, volume.permissions)?;
        }
        if volume.have_storage() && !libcgroups::Mount::is_mounted(&volume.path)? {
            mount::bind(&volume.storage_path, &volume.path, volume.read_only)?;
        }
        Ok(())
    }

    fn delete(&self, volume: &mut Volume) -> Result<()> {
        if volume.have_storage() {
            mount::umount_detach(&volume.path)?;
        }
        if volume.have_quota() {
            quota::clear_project_quota(&volume.path, &volume.id);
        }
        if volume.is_auto_path && !volume.keep_storage {
            fsutil::remove_all(&volume.path)?;
        }
        Ok(())
    }

    fn resize(&self, volume: &mut Volume, space_limit: u64, inode_limit: u64) -> Result<()> {
        if !volume.have_quota() {
            return Err(Error::NotSupported(
                "plain volume without quota cannot resize".into(),
            ));
        }
        quota::set_project_quota(&volume.path, &volume.id, space_limit, inode_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn builds_and_deletes_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut volume = Volume::empty("1".into());
        volume.place = tmp.path().to_path_buf();
        volume.path = tmp.path().join("volumes/1/volume");
        volume.is_auto_path = true;
        std::fs::create_dir_all(volume.path.parent().unwrap()).unwrap();

        let backend = PlainBackend;
        backend.build(&mut volume).unwrap();
        assert!(volume.path.is_dir());

        backend.delete(&mut volume).unwrap();
        assert!(!volume.path.exists());
        // idempotent
        backend.delete(&mut volume).unwrap();
    }

    #[test]
    fn rejects_storage_equal_to_path() {
        let mut volume = Volume::empty("1".into());
        volume.path = PathBuf::from("/data");
        volume.storage = "/data".into();
        assert!(PlainBackend.configure(&mut volume).is_err());
    }
}
