//! Loop volume: a sparse ext4 image on the place, attached to a loop
//! device and mounted at the volume path.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

use libcgroups::mount::{self, Mount};

use warden_common::error::{Error, IoResultExt, Result};
use warden_common::fsutil;

use super::{run_tool, VolumeBackend};
use crate::volume::{BackendType, Volume};

const LOOP_IMAGE: &str = "loop.img";

pub struct LoopBackend;

impl LoopBackend {
    fn image_path(volume: &Volume) -> PathBuf {
        if volume.have_storage() {
            volume.resolve_storage()
        } else {
            volume.internal_dir().join(LOOP_IMAGE)
        }
    }

    fn mount_flags(volume: &Volume) -> MsFlags {
        if volume.read_only {
            MsFlags::MS_RDONLY
        } else {
            MsFlags::empty()
        }
    }

    fn attach(image: &Path) -> Result<(String, i32)> {
        let device = run_tool(
            "losetup",
            &["--find", "--show", &image.display().to_string()],
        )?;
        let index = device
            .trim_start_matches("/dev/loop")
            .parse()
            .map_err(|_| Error::Unknown(format!("unexpected losetup output {device:?}")))?;
        Ok((device, index))
    }

    fn detach(volume: &mut Volume) {
        if volume.device_index >= 0 {
            if let Err(err) = run_tool("losetup", &["--detach", &volume.device_name]) {
                tracing::warn!(volume = %volume.id, %err, "failed to release loop device");
            }
            volume.device_name.clear();
            volume.device_index = -1;
        }
    }
}

impl VolumeBackend for LoopBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Loop
    }

    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if volume.space_limit == 0 {
            return Err(Error::InvalidValue(
                "loop volume requires a space_limit".into(),
            ));
        }
        volume.storage_path = Self::image_path(volume);
        if !volume.storage_path.starts_with(&volume.place) {
            return Err(Error::InvalidValue(format!(
                "loop storage {} is not on place {}",
                volume.storage_path.display(),
                volume.place.display()
            )));
        }
        Ok(())
    }

    fn build(&self, volume: &mut Volume) -> Result<()> {
        let image = volume.storage_path.clone();
        let fresh_image = !fsutil::exists(&image);
        if fresh_image {
            if let Some(parent) = image.parent() {
                fsutil::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&image)
                .path_context("create", &image)?;
            file.set_len(volume.space_limit).path_context("truncate", &image)?;
            run_tool("mkfs.ext4", &["-q", "-F", &image.display().to_string()]).map_err(|err| {
                let _ = fsutil::remove_all(&image);
                err
            })?;
        }

        let (device, index) = Self::attach(&image).map_err(|err| {
            if fresh_image {
                let _ = fsutil::remove_all(&image);
            }
            err
        })?;
        volume.device_name = device;
        volume.device_index = index;

        if !fsutil::exists(&volume.path) {
            fsutil::create_dir_mode(&volume.path, volume.permissions)?;
        }
        let mnt = Mount::new(
            volume.device_name.clone(),
            volume.path.clone(),
            "ext4",
            Self::mount_flags(volume),
            [],
        );
        if let Err(err) = mnt.mount() {
            Self::detach(volume);
            if fresh_image {
                let _ = fsutil::remove_all(&image);
            }
            if volume.is_auto_path {
                let _ = fsutil::remove_dir(&volume.path);
            }
            return Err(err);
        }
        Ok(())
    }

    fn restore(&self, volume: &mut Volume) -> Result<()> {
        let image = volume.storage_path.clone();
        if !fsutil::exists(&image) {
            // the crash predates the image; a fresh build will recreate it
            volume.device_index = -1;
            volume.device_name.clear();
            return Ok(());
        }
        let attached = run_tool("losetup", &["--associated", &image.display().to_string()])?;
        match attached.split(':').next().filter(|d| !d.is_empty()) {
            Some(device) => {
                volume.device_name = device.to_string();
                volume.device_index = device
                    .trim_start_matches("/dev/loop")
                    .parse()
                    .unwrap_or(-1);
            }
            None => {
                let (device, index) = Self::attach(&image)?;
                volume.device_name = device;
                volume.device_index = index;
            }
        }
        if !Mount::is_mounted(&volume.path)? {
            if !fsutil::exists(&volume.path) {
                fsutil::create_dir_mode(&volume.path, volume.permissions)?;
            }
            Mount::new(
                volume.device_name.clone(),
                volume.path.clone(),
                "ext4",
                Self::mount_flags(volume),
                [],
            )
            .mount()?;
        }
        Ok(())
    }

    fn delete(&self, volume: &mut Volume) -> Result<()> {
        mount::umount_detach(&volume.path)?;
        Self::detach(volume);
        if !volume.keep_storage && !volume.user_storage() {
            fsutil::remove_all(&volume.storage_path)?;
            fsutil::remove_all(&volume.internal_dir())?;
        }
        if volume.is_auto_path {
            fsutil::remove_dir(&volume.path)?;
        }
        Ok(())
    }

    /// Grows the image and the filesystem in it; shrinking is refused.
    fn resize(&self, volume: &mut Volume, space_limit: u64, _inode_limit: u64) -> Result<()> {
        if space_limit < volume.space_limit {
            return Err(Error::NotSupported(
                "loop volume cannot shrink".into(),
            ));
        }
        if space_limit == volume.space_limit {
            return Ok(());
        }
        let image = &volume.storage_path;
        OpenOptions::new()
            .write(true)
            .open(image)
            .path_context("open", image)?
            .set_len(space_limit)
            .path_context("truncate", image)?;
        if volume.device_index >= 0 {
            run_tool("losetup", &["--set-capacity", &volume.device_name])?;
            run_tool("resize2fs", &[&volume.device_name])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_requires_space_limit() {
        let mut volume = Volume::empty("1".into());
        volume.place = PathBuf::from("/place");
        assert!(matches!(
            LoopBackend.configure(&mut volume),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn configure_pins_storage_to_place() {
        let mut volume = Volume::empty("1".into());
        volume.place = PathBuf::from("/place");
        volume.space_limit = 64 << 20;
        LoopBackend.configure(&mut volume).unwrap();
        assert_eq!(
            volume.storage_path,
            PathBuf::from("/place/volumes/1/loop.img")
        );

        volume.storage = "/elsewhere/data.img".into();
        assert!(matches!(
            LoopBackend.configure(&mut volume),
            Err(Error::InvalidValue(_))
        ));
    }
}
