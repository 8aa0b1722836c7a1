//! tmpfs and hugetlbfs volumes. Space accounting goes against RAM, not the
//! place, so the claim key is the filesystem kind.

use nix::mount::MsFlags;

use libcgroups::mount::{self, Mount};

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use super::VolumeBackend;
use crate::volume::{BackendType, Volume};

pub struct TmpfsBackend {
    pub huge: bool,
}

impl TmpfsBackend {
    fn fstype(&self) -> &'static str {
        if self.huge {
            "hugetlbfs"
        } else {
            "tmpfs"
        }
    }

    fn options(volume: &Volume) -> Vec<String> {
        let mut options = vec![format!("size={}", volume.space_limit)];
        if volume.inode_limit != 0 {
            options.push(format!("nr_inodes={}", volume.inode_limit));
        }
        options
    }

    fn mount_for(&self, volume: &Volume) -> Mount {
        let mut flags = MsFlags::empty();
        if volume.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        Mount::new(
            self.fstype(),
            volume.path.clone(),
            self.fstype(),
            flags,
            Self::options(volume),
        )
    }
}

impl VolumeBackend for TmpfsBackend {
    fn backend_type(&self) -> BackendType {
        if self.huge {
            BackendType::HugeTmpfs
        } else {
            BackendType::Tmpfs
        }
    }

    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if volume.space_limit == 0 {
            return Err(Error::InvalidValue(format!(
                "{} volume requires a space_limit",
                self.fstype()
            )));
        }
        if volume.have_storage() {
            return Err(Error::InvalidValue(format!(
                "{} volume takes no storage",
                self.fstype()
            )));
        }
        Ok(())
    }

    fn build(&self, volume: &mut Volume) -> Result<()> {
        if !fsutil::exists(&volume.path) {
            fsutil::create_dir_mode(&volume.path, volume.permissions)?;
        }
        if let Err(err) = self.mount_for(volume).mount() {
            if volume.is_auto_path {
                let _ = fsutil::remove_dir(&volume.path);
            }
            return Err(err);
        }
        Ok(())
    }

    fn restore(&self, volume: &mut Volume) -> Result<()> {
        if !Mount::is_mounted(&volume.path)? {
            // tmpfs contents did not survive the restart, remount empty
            self.build(volume)?;
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

    /// Remounting adjusts tmpfs limits in place.
    fn resize(&self, volume: &mut Volume, space_limit: u64, inode_limit: u64) -> Result<()> {
        let mut resized = volume.clone();
        resized.space_limit = space_limit;
        resized.inode_limit = inode_limit;
        let mut mnt = self.mount_for(&resized);
        mnt.flags |= MsFlags::MS_REMOUNT;
        mnt.mount()
    }

    fn claim_place(&self, _volume: &Volume) -> String {
        self.fstype().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn options_carry_limits() {
        let mut volume = Volume::empty("1".into());
        volume.space_limit = 64 << 20;
        volume.inode_limit = 1024;
        assert_eq!(
            TmpfsBackend::options(&volume),
            vec!["size=67108864".to_string(), "nr_inodes=1024".to_string()]
        );
        volume.inode_limit = 0;
        assert_eq!(TmpfsBackend::options(&volume), vec!["size=67108864".to_string()]);
    }

    #[test]
    fn requires_space_limit_and_no_storage() {
        let backend = TmpfsBackend { huge: false };
        let mut volume = Volume::empty("1".into());
        assert!(backend.configure(&mut volume).is_err());
        volume.space_limit = 1 << 20;
        backend.configure(&mut volume).unwrap();
        volume.storage = "/somewhere".into();
        assert!(backend.configure(&mut volume).is_err());
    }

    #[test]
    fn claims_against_ram_not_place() {
        let mut volume = Volume::empty("1".into());
        volume.place = PathBuf::from("/place");
        assert_eq!(TmpfsBackend { huge: false }.claim_place(&volume), "tmpfs");
        assert_eq!(TmpfsBackend { huge: true }.claim_place(&volume), "hugetlbfs");
    }
}
