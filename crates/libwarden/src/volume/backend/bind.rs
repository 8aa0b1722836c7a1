//! Bind volume: an existing directory bound at the volume path, no
//! filesystem ownership at all.

use libcgroups::mount;

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use super::VolumeBackend;
use crate::volume::{BackendType, Volume};

pub struct BindBackend;

impl VolumeBackend for BindBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Bind
    }

    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if !volume.have_storage() || !volume.user_storage() {
            return Err(Error::InvalidValue(
                "bind backend requires an absolute storage path".into(),
            ));
        }
        volume.storage_path = volume.resolve_storage();
        // the bound tree is not ours to delete
        volume.keep_storage = true;
        Ok(())
    }

    fn build(&self, volume: &mut Volume) -> Result<()> {
        if !fsutil::exists(&volume.storage_path) {
            return Err(Error::NotFound(format!(
                "bind storage {} does not exist",
                volume.storage_path.display()
            )));
        }
        if !fsutil::exists(&volume.path) {
            fsutil::create_dir_mode(&volume.path, volume.permissions)?;
        }
        if let Err(err) = mount::bind(&volume.storage_path, &volume.path, volume.read_only) {
            if volume.is_auto_path {
                let _ = fsutil::remove_dir(&volume.path);
            }
            return Err(err);
        }
        Ok(())
    }

    fn restore(&self, volume: &mut Volume) -> Result<()> {
        if !libcgroups::Mount::is_mounted(&volume.path)? {
            if !fsutil::exists(&volume.path) {
                fsutil::create_dir_mode(&volume.path, volume.permissions)?;
            }
            mount::bind(&volume.storage_path, &volume.path, volume.read_only)?;
        }
        Ok(())
    }

    fn delete(&self, volume: &mut Volume) -> Result<()> {
        mount::umount_detach(&volume.path)?;
        if volume.is_auto_path {
            fsutil::remove_dir(&volume.path)?;
        }
        Ok(())
    }
}
