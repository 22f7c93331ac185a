//! Error types for sdcardfs-perms

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    /// The configured global OBB location cannot be resolved. Lookups of
    /// the OBB anchor report this as "not found".
    #[error("Global OBB path is not available: {0}")]
    RedirectUnresolvable(String),

    #[error("Package list error: {0}")]
    PackageList(String),

    #[error("Ownership fix-up failed: {0}")]
    Fixup(#[from] FixupError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map to the errno a VFS-facing caller should report
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::RedirectUnresolvable(_) | Error::PathNotFound(_) | Error::NodeNotFound(_) => {
                libc::ENOENT
            }
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Fixup(FixupError::PolicyDenied { .. }) => libc::EPERM,
            Error::InvalidConfig(_) => libc::EINVAL,
            _ => libc::EIO,
        }
    }
}

/// Failure of a best-effort ownership fix-up on a lower object.
///
/// These never abort the operation that triggered the fix-up; callers log
/// and drop them.
#[derive(Debug, Error)]
pub enum FixupError {
    #[error("ownership change of {path:?} denied: {reason}")]
    PolicyDenied { path: PathBuf, reason: String },

    #[error("failed to write attributes of {path:?}: {source}")]
    AttributeWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stat {path:?}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            Error::RedirectUnresolvable("/data/media/obb".into()).to_errno(),
            libc::ENOENT
        );
        assert_eq!(Error::NodeNotFound(7).to_errno(), libc::ENOENT);

        let denied = Error::from(FixupError::PolicyDenied {
            path: PathBuf::from("/x"),
            reason: "no CAP_CHOWN".into(),
        });
        assert_eq!(denied.to_errno(), libc::EPERM);

        let io = Error::from(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(io.to_errno(), libc::EACCES);
    }
}
