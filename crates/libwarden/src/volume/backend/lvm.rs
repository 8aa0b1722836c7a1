//! LVM volume: a logical volume claimed from a volume group, formatted on
//! first use and mounted at the volume path. Storage names either an
//! existing logical volume (`vg/lv`) or a group (`vg`) to carve a new one
//! from.

use nix::mount::MsFlags;

use libcgroups::mount::{self, Mount};

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use super::{run_tool, VolumeBackend};
use crate::volume::{BackendType, Volume};

pub struct LvmBackend;

impl LvmBackend {
    /// Whether the logical volume is ours to create and remove.
    fn owns_device(volume: &Volume) -> bool {
        !volume.storage.contains('/')
    }

    fn device_for(volume: &Volume) -> String {
        if Self::owns_device(volume) {
            format!("/dev/{}/warden-{}", volume.storage, volume.id)
        } else {
            format!("/dev/{}", volume.storage)
        }
    }

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

    fn remove_device(volume: &mut Volume) {
        if Self::owns_device(volume) && !volume.device_name.is_empty() {
            let lv = format!("{}/warden-{}", volume.storage, volume.id);
            if let Err(err) = run_tool("lvremove", &["-f", &lv]) {
                tracing::warn!(volume = %volume.id, %err, "failed to remove logical volume");
            }
        }
        volume.device_name.clear();
    }
}

impl VolumeBackend for LvmBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Lvm
    }

    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if !volume.have_storage() || volume.user_storage() {
            return Err(Error::InvalidValue(
                "lvm volume requires storage as vg or vg/lv".into(),
            ));
        }
        if Self::owns_device(volume) && volume.space_limit == 0 {
            return Err(Error::InvalidValue(
                "lvm volume carved from a group requires a space_limit".into(),
            ));
        }
        Ok(())
    }

    fn build(&self, volume: &mut Volume) -> Result<()> {
        let device = Self::device_for(volume);
        let mut created = false;
        if Self::owns_device(volume) {
            run_tool(
                "lvcreate",
                &[
                    "-y",
                    "-L",
                    &format!("{}b", volume.space_limit),
                    "-n",
                    &format!("warden-{}", volume.id),
                    &volume.storage,
                ],
            )?;
            created = true;
            run_tool("mkfs.ext4", &["-q", &device]).map_err(|err| {
                let _ = run_tool("lvremove", &["-f", &format!("{}/warden-{}", volume.storage, volume.id)]);
                err
            })?;
        } else if !volume.read_only && run_tool("blkid", &["-p", &device]).is_err() {
            run_tool("mkfs.ext4", &["-q", &device])?;
        }
        volume.device_name = device;

        if !fsutil::exists(&volume.path) {
            fsutil::create_dir_mode(&volume.path, volume.permissions)?;
        }
        if let Err(err) = Self::mount_for(volume).mount() {
            if created {
                Self::remove_device(volume);
            } else {
                volume.device_name.clear();
            }
            if volume.is_auto_path {
                let _ = fsutil::remove_dir(&volume.path);
            }
            return Err(err);
        }
        Ok(())
    }

    fn restore(&self, volume: &mut Volume) -> Result<()> {
        let device = Self::device_for(volume);
        if !fsutil::exists(std::path::Path::new(&device)) {
            return Err(Error::NotFound(format!(
                "logical volume {device} is gone"
            )));
        }
        volume.device_name = device;
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
        Self::remove_device(volume);
        if volume.is_auto_path {
            fsutil::remove_dir(&volume.path)?;
        }
        Ok(())
    }

    fn resize(&self, volume: &mut Volume, space_limit: u64, _inode_limit: u64) -> Result<()> {
        if !Self::owns_device(volume) {
            return Err(Error::NotSupported(
                "cannot resize a pre-existing logical volume".into(),
            ));
        }
        run_tool(
            "lvresize",
            &["-y", "-L", &format!("{space_limit}b"), &volume.device_name],
        )?;
        run_tool("resize2fs", &[&volume.device_name])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_forms_resolve_to_devices() {
        let mut volume = Volume::empty("4".into());
        volume.storage = "vg0".into();
        assert!(LvmBackend::owns_device(&volume));
        assert_eq!(LvmBackend::device_for(&volume), "/dev/vg0/warden-4");

        volume.storage = "vg0/data".into();
        assert!(!LvmBackend::owns_device(&volume));
        assert_eq!(LvmBackend::device_for(&volume), "/dev/vg0/data");
    }

    #[test]
    fn carving_requires_space_limit() {
        let mut volume = Volume::empty("4".into());
        volume.storage = "vg0".into();
        assert!(LvmBackend.configure(&mut volume).is_err());
        volume.space_limit = 1 << 30;
        LvmBackend.configure(&mut volume).unwrap();
    }
}
