//! Project-quota volume: installs a quota on an existing directory
//! without mounting anything new. Also lends its mechanism to the plain
//! backend when limits are set there.

use std::path::Path;

use warden_common::error::{Error, Result};
use warden_common::fsutil;

use super::{run_tool, VolumeBackend};
use crate::volume::{BackendType, Volume};

/// Project ids live above this base so they never collide with uids used
/// as project ids by other tooling.
const PROJECT_ID_BASE: u32 = 10000;

fn project_id(volume_id: &str) -> Result<u32> {
    let id: u32 = volume_id
        .parse()
        .map_err(|_| Error::Quota(format!("volume id {volume_id:?} is not numeric")))?;
    Ok(PROJECT_ID_BASE + id)
}

pub(crate) fn set_project_quota(
    path: &Path,
    volume_id: &str,
    space_limit: u64,
    inode_limit: u64,
) -> Result<()> {
    let project = project_id(volume_id)?;
    let path = path.display().to_string();
    run_tool(
        "chattr",
        &["-R", "-p", &project.to_string(), "+P", &path],
    )?;
    let space_kb = space_limit.div_ceil(1024);
    run_tool(
        "setquota",
        &[
            "-P",
            &project.to_string(),
            "0",
            &space_kb.to_string(),
            "0",
            &inode_limit.to_string(),
            &path,
        ],
    )
    .map(|_| ())
    .map_err(|err| Error::Quota(err.to_string()))
}

/// Clearing is best-effort; a volume must stay deletable when the quota
/// tooling is gone.
pub(crate) fn clear_project_quota(path: &Path, volume_id: &str) {
    let project = match project_id(volume_id) {
        Ok(project) => project,
        Err(_) => return,
    };
    let path = path.display().to_string();
    if let Err(err) = run_tool(
        "setquota",
        &["-P", &project.to_string(), "0", "0", "0", "0", &path],
    ) {
        tracing::warn!(%err, path, "failed to drop project quota limits");
    }
    if let Err(err) = run_tool("chattr", &["-R", "-p", "0", "-P", &path]) {
        tracing::warn!(%err, path, "failed to strip project id");
    }
}

pub struct QuotaBackend;

impl VolumeBackend for QuotaBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Quota
    }

    fn configure(&self, volume: &mut Volume) -> Result<()> {
        if volume.is_auto_path {
            return Err(Error::InvalidValue(
                "quota backend needs an existing directory path".into(),
            ));
        }
        if !volume.have_quota() {
            return Err(Error::InvalidValue(
                "quota backend requires space_limit or inode_limit".into(),
            ));
        }
        Ok(())
    }

    fn build(&self, volume: &mut Volume) -> Result<()> {
        if !fsutil::exists(&volume.path) {
            return Err(Error::NotFound(format!(
                "quota target {} does not exist",
                volume.path.display()
            )));
        }
        set_project_quota(
            &volume.path,
            &volume.id,
            volume.space_limit,
            volume.inode_limit,
        )
    }

    fn delete(&self, volume: &mut Volume) -> Result<()> {
        if fsutil::exists(&volume.path) {
            clear_project_quota(&volume.path, &volume.id);
        }
        Ok(())
    }

    fn resize(&self, volume: &mut Volume, space_limit: u64, inode_limit: u64) -> Result<()> {
        set_project_quota(&volume.path, &volume.id, space_limit, inode_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn project_ids_are_offset_and_numeric() {
        assert_eq!(project_id("7").unwrap(), PROJECT_ID_BASE + 7);
        assert!(project_id("vol").is_err());
    }

    #[test]
    fn configure_requires_existing_path_and_limits() {
        let mut volume = Volume::empty("1".into());
        volume.path = PathBuf::from("/data");
        assert!(QuotaBackend.configure(&mut volume).is_err());
        volume.space_limit = 1 << 20;
        QuotaBackend.configure(&mut volume).unwrap();
        volume.is_auto_path = true;
        assert!(QuotaBackend.configure(&mut volume).is_err());
    }
}
