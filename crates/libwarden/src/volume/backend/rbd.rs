//! RBD volume: maps a remote block image, formats it on first use and
//! mounts it at the volume path. The mapped device is exclusive to one
//! volume.

use nix::mount::MsFlags;

use libcgroups::mount::{self, Mount};

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use super::{run_tool, VolumeBackend};
use crate::volume::{BackendType, Volume};

pub struct RbdBackend;

impl RbdBackend {
    fn mount_for(volume: &Volume) -> Mount {
        let mut flags = MsFlags::empty();
        if volume.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        Mount::new(
            volume.device_name.clone(),
            volume.path.clone(),
            "ext4",
            flags,
            [],
        )
    }

    /// A device with no recognizable filesystem gets formatted; an already
    /// populated image is left alone.
    fn format_if_fresh(device: &str) -> Result<()> {
        if run_tool("blkid", &["-p", device]).is_err() {
            run_tool("mkfs.ext4", &["-q", device])?;
        }
        Ok(())
    }

    fn unmap(volume: &mut Volume) {
        if !volume.device_name.is_empty() {
            if let Err(err) = run_tool("rbd", &["unmap", &volume.device_name]) {
                tracing::warn!(volume = %volume.id, %err, "failed to unmap rbd device");
            }
            volume.device_name.clear();
        }
    }
}

impl VolumeBackend for RbdBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Rbd
    }

    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if !volume.have_storage() {
            return Err(Error::InvalidValue(
                "rbd volume requires storage as pool/image".into(),
            ));
        }
        Ok(())
    }

    fn build(&self, volume: &mut Volume) -> Result<()> {
        let device = run_tool("rbd", &["map", &volume.storage])?;
        volume.device_name = device.clone();

        let result = (|| {
            if !volume.read_only {
                Self::format_if_fresh(&device)?;
            }
            if !fsutil::exists(&volume.path) {
                fsutil::create_dir_mode(&volume.path, volume.permissions)?;
            }
            Self::mount_for(volume).mount()
        })();

        if let Err(err) = result {
            Self::unmap(volume);
            if volume.is_auto_path {
                let _ = fsutil::remove_dir(&volume.path);
            }
            return Err(err);
        }
        Ok(())
    }

    fn restore(&self, volume: &mut Volume) -> Result<()> {
        if volume.device_name.is_empty() || !fsutil::exists(std::path::Path::new(&volume.device_name)) {
            volume.device_name = run_tool("rbd", &["map", &volume.storage])?;
        }
        if !Mount::is_mounted(&volume.path)? {
            if !fsutil::exists(&volume.path) {
                fsutil::create_dir_mode(&volume.path, volume.permissions)?;
            }
            Self::mount_for(volume).mount()?;
        }
        Ok(())
    }

    fn delete(&self, volume: &mut Volume) -> Result<()> {
        mount::umount_detach(&volume.path)?;
        Self::unmap(volume);
        if volume.is_auto_path {
            fsutil::remove_dir(&volume.path)?;
        }
        Ok(())
    }
}
