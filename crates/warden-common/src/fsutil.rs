//! Typed path I/O for kernel interfaces and volume metadata. Knob files
//! under cgroupfs must never be created or truncated by the writer, so the
//! open-option discipline here is part of the contract.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};

use crate::error::{Error, IoResultExt, Result};

pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).path_context("read", path)
}

/// Reads a file as a list of non-empty lines.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    Ok(read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Reads a file as a list of integers, one per line.
pub fn read_ints(path: &Path) -> Result<Vec<i32>> {
    read_lines(path)?
        .iter()
        .map(|line| {
            line.parse()
                .map_err(|_| Error::InvalidValue(format!("bad integer {line:?} in {}", path.display())))
        })
        .collect()
}

/// Overwrites an existing file in place. The file is not created and not
/// truncated, which is what cgroup knobs expect.
pub fn write_knob(path: &Path, data: &str) -> Result<()> {
    OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)
        .path_context("open", path)?
        .write_all(data.as_bytes())
        .path_context("write", path)
}

/// Appends to an existing file.
pub fn append_knob(path: &Path, data: &str) -> Result<()> {
    OpenOptions::new()
        .create(false)
        .append(true)
        .open(path)
        .path_context("open", path)?
        .write_all(data.as_bytes())
        .path_context("append", path)
}

/// Creates or truncates a regular file with the given contents.
pub fn write_file(path: &Path, data: &str) -> Result<()> {
    fs::write(path, data).path_context("write", path)
}

pub fn create_dir_mode(path: &Path, mode: u32) -> Result<()> {
    DirBuilder::new()
        .mode(mode)
        .create(path)
        .path_context("create dir", path)
}

pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).path_context("create dir", path)
}

/// Removes an empty directory; an already-absent one is success.
pub fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).path_context("remove dir", path),
    }
}

/// Removes a file or a whole directory tree; absence is success.
pub fn remove_all(path: &Path) -> Result<()> {
    let res = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => Err(err),
    };
    match res {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).path_context("remove", path),
    }
}

/// Names of the immediate subdirectories of `path`, unsorted.
pub fn list_subdirs(path: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(path).path_context("read dir", path)? {
        let entry = entry.path_context("read dir", path)?;
        if entry.file_type().path_context("stat", entry.path())?.is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(out)
}

pub fn set_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }
    chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw)).map_err(|source| Error::Sys {
        msg: format!("failed to chown {}", path.display()),
        source,
    })
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).path_context("chmod", path)
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Joins `rel` under `base`, treating an absolute `rel` as rooted at `base`.
pub fn join_under(base: &Path, rel: &Path) -> PathBuf {
    match rel.strip_prefix("/") {
        Ok(stripped) => base.join(stripped),
        Err(_) => base.join(rel),
    }
}
