use std::path::PathBuf;

/// Stable error taxonomy of the supervisor core. Every operation either
/// succeeds (`Ok`) or reports one of these; kernel interactions keep the
/// underlying OS error as a source so the raw errno stays recoverable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("no space: {0}")]
    NoSpace(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("volume {} already exists", .0.display())]
    VolumeAlreadyExists(PathBuf),
    #[error("volume {0} is not ready")]
    VolumeNotReady(String),
    #[error("layer {0} not found")]
    LayerNotFound(String),
    #[error("quota: {0}")]
    Quota(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("failed to {op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{msg}: {source}")]
    Sys {
        msg: String,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("unknown: {0}")]
    Unknown(String),
}

impl Error {
    /// The raw OS error behind this failure, if any kernel call produced one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            Error::Sys { source, .. } => Some(*source as i32),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches the operation and path to a raw I/O result.
pub trait IoResultExt<T> {
    fn path_context<P: Into<PathBuf>>(self, op: &'static str, path: P) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn path_context<P: Into<PathBuf>>(self, op: &'static str, path: P) -> Result<T> {
        self.map_err(|source| Error::Io {
            op,
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_surfaces_from_io() {
        let err = std::io::Error::from_raw_os_error(libc_enoent());
        let wrapped: Result<()> = Err(err).path_context("read", "/does/not/exist");
        assert_eq!(wrapped.unwrap_err().errno(), Some(libc_enoent()));
    }

    #[test]
    fn errno_absent_for_logic_errors() {
        assert_eq!(Error::InvalidValue("x".into()).errno(), None);
    }

    #[test]
    fn display_includes_path() {
        let err = Error::Io {
            op: "open",
            path: PathBuf::from("/tmp/knob"),
            source: std::io::Error::from_raw_os_error(libc_enoent()),
        };
        assert!(err.to_string().contains("/tmp/knob"));
    }

    fn libc_enoent() -> i32 {
        nix::errno::Errno::ENOENT as i32
    }
}
