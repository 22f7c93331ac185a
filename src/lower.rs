//! Lower filesystem accessors
//!
//! The overlay keeps no real ownership of its own; fix-up writes the derived
//! uid/gid onto the objects of the lower (real) filesystem through this
//! interface.

use crate::error::{Error, FixupError, Result};
use crate::multiuser::{Gid, Uid};
use crate::tree::NodeKind;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Ownership and mode of a lower object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerAttr {
    pub uid: Uid,
    pub gid: Gid,
    /// Full st_mode including file type bits
    pub mode: u32,
}

impl LowerAttr {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    #[cfg(unix)]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
        }
    }
}

/// Directory entry from the lower filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerDirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Restricted attribute change: owner and group, optionally dropping
/// set-uid/set-gid and file capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerChange {
    pub uid: Uid,
    pub gid: Gid,
    pub kill_priv: bool,
}

/// Operations fix-up and OBB redirection need from the lower filesystem
pub trait LowerFs: Send + Sync {
    /// Current ownership and mode of a lower object
    fn getattr(&self, path: &Path) -> std::result::Result<LowerAttr, FixupError>;

    /// Security gate consulted before any ownership change
    fn check_chown(&self, path: &Path, uid: Uid, gid: Gid) -> std::result::Result<(), FixupError>;

    /// Apply an ownership change
    fn change_owner(&self, path: &Path, change: &OwnerChange) -> std::result::Result<(), FixupError>;

    /// Resolve a path to an existing directory, following symlinks
    fn resolve_dir(&self, path: &Path) -> Result<PathBuf>;

    /// Whether the object at `path` is still linked into the filesystem
    fn is_linked(&self, path: &Path) -> bool;

    /// Entries of a lower directory in name order
    fn read_dir(&self, path: &Path) -> Result<Vec<LowerDirEntry>>;
}

/// The host's real filesystem
#[derive(Debug, Default, Clone)]
pub struct HostFs;

impl HostFs {
    pub fn new() -> Self {
        HostFs
    }
}

impl LowerFs for HostFs {
    fn getattr(&self, path: &Path) -> std::result::Result<LowerAttr, FixupError> {
        fs::symlink_metadata(path)
            .map(|m| LowerAttr::from_metadata(&m))
            .map_err(|source| FixupError::Stat {
                path: path.to_path_buf(),
                source,
            })
    }

    fn check_chown(&self, path: &Path, uid: Uid, _gid: Gid) -> std::result::Result<(), FixupError> {
        // Without CAP_CHOWN the owner cannot change.
        if nix::unistd::geteuid().is_root() {
            return Ok(());
        }
        let current = self.getattr(path)?;
        if current.uid != uid {
            return Err(FixupError::PolicyDenied {
                path: path.to_path_buf(),
                reason: format!("changing owner {} -> {} requires CAP_CHOWN", current.uid, uid),
            });
        }
        Ok(())
    }

    fn change_owner(&self, path: &Path, change: &OwnerChange) -> std::result::Result<(), FixupError> {
        let write_err = |source: std::io::Error| FixupError::AttributeWriteFailed {
            path: path.to_path_buf(),
            source,
        };

        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(change.uid)),
            Some(nix::unistd::Gid::from_raw(change.gid)),
        )
        .map_err(|errno| write_err(std::io::Error::from_raw_os_error(errno as i32)))?;

        if change.kill_priv {
            use std::os::unix::fs::PermissionsExt;

            let meta = fs::symlink_metadata(path).map_err(write_err)?;
            if !meta.file_type().is_symlink() {
                let mode = meta.permissions().mode();
                let stripped = mode & !(libc::S_ISUID | libc::S_ISGID);
                if stripped != mode {
                    fs::set_permissions(path, fs::Permissions::from_mode(stripped))
                        .map_err(write_err)?;
                }
                remove_capabilities(path).map_err(write_err)?;
            }
        }

        Ok(())
    }

    fn resolve_dir(&self, path: &Path) -> Result<PathBuf> {
        let resolved = fs::canonicalize(path)
            .map_err(|_| Error::PathNotFound(path.to_string_lossy().to_string()))?;
        if !resolved.is_dir() {
            return Err(Error::PathNotFound(path.to_string_lossy().to_string()));
        }
        Ok(resolved)
    }

    fn is_linked(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<LowerDirEntry>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(path).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let file_type = entry.file_type().map_err(Error::Io)?;
            entries.push(LowerDirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind: NodeKind::from(file_type),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[cfg(target_os = "linux")]
fn remove_capabilities(path: &Path) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let name = b"security.capability\0";
    let rc = unsafe { libc::lremovexattr(c_path.as_ptr(), name.as_ptr() as *const libc::c_char) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENODATA) | Some(libc::ENOTSUP) => return Ok(()),
            _ => return Err(err),
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn remove_capabilities(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// In-memory lower filesystem.
///
/// Objects are plain path entries; directories named in `add_dir` resolve
/// for OBB redirection. Paths listed in `deny_chown` fail the security gate.
#[derive(Debug, Default)]
pub struct MemoryLowerFs {
    objects: RwLock<HashMap<PathBuf, LowerAttr>>,
    denied: RwLock<Vec<PathBuf>>,
    failing: RwLock<Vec<PathBuf>>,
    writes: RwLock<Vec<(PathBuf, OwnerChange)>>,
}

impl MemoryLowerFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>, uid: Uid, gid: Gid) {
        self.objects.write().insert(
            path.into(),
            LowerAttr {
                uid,
                gid,
                mode: libc::S_IFDIR | 0o775,
            },
        );
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, uid: Uid, gid: Gid, perm: u32) {
        self.objects.write().insert(
            path.into(),
            LowerAttr {
                uid,
                gid,
                mode: libc::S_IFREG | (perm & 0o7777),
            },
        );
    }

    /// Unlink an object
    pub fn remove(&self, path: &Path) -> Option<LowerAttr> {
        self.objects.write().remove(path)
    }

    pub fn attr(&self, path: &Path) -> Option<LowerAttr> {
        self.objects.read().get(path).copied()
    }

    /// Make the security gate reject ownership changes of `path`
    pub fn deny_chown(&self, path: impl Into<PathBuf>) {
        self.denied.write().push(path.into());
    }

    /// Make attribute writes to `path` fail
    pub fn fail_writes(&self, path: impl Into<PathBuf>) {
        self.failing.write().push(path.into());
    }

    /// Ownership changes applied so far, in order
    pub fn writes(&self) -> Vec<(PathBuf, OwnerChange)> {
        self.writes.read().clone()
    }
}

impl LowerFs for MemoryLowerFs {
    fn getattr(&self, path: &Path) -> std::result::Result<LowerAttr, FixupError> {
        self.attr(path).ok_or_else(|| FixupError::Stat {
            path: path.to_path_buf(),
            source: std::io::Error::from_raw_os_error(libc::ENOENT),
        })
    }

    fn check_chown(&self, path: &Path, _uid: Uid, _gid: Gid) -> std::result::Result<(), FixupError> {
        if self.denied.read().iter().any(|p| p == path) {
            return Err(FixupError::PolicyDenied {
                path: path.to_path_buf(),
                reason: "denied by policy".to_string(),
            });
        }
        Ok(())
    }

    fn change_owner(&self, path: &Path, change: &OwnerChange) -> std::result::Result<(), FixupError> {
        if self.failing.read().iter().any(|p| p == path) {
            return Err(FixupError::AttributeWriteFailed {
                path: path.to_path_buf(),
                source: std::io::Error::from_raw_os_error(libc::EIO),
            });
        }

        let mut objects = self.objects.write();
        let attr = objects.get_mut(path).ok_or_else(|| FixupError::AttributeWriteFailed {
            path: path.to_path_buf(),
            source: std::io::Error::from_raw_os_error(libc::ENOENT),
        })?;
        attr.uid = change.uid;
        attr.gid = change.gid;
        if change.kill_priv {
            attr.mode &= !(libc::S_ISUID | libc::S_ISGID);
        }
        drop(objects);

        self.writes.write().push((path.to_path_buf(), *change));
        Ok(())
    }

    fn resolve_dir(&self, path: &Path) -> Result<PathBuf> {
        match self.attr(path) {
            Some(attr) if attr.is_dir() => Ok(path.to_path_buf()),
            _ => Err(Error::PathNotFound(path.to_string_lossy().to_string())),
        }
    }

    fn is_linked(&self, path: &Path) -> bool {
        self.objects.read().contains_key(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<LowerDirEntry>> {
        match self.attr(path) {
            Some(attr) if attr.is_dir() => {}
            _ => return Err(Error::PathNotFound(path.to_string_lossy().to_string())),
        }

        let mut entries: Vec<LowerDirEntry> = self
            .objects
            .read()
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .filter_map(|(p, attr)| {
                Some(LowerDirEntry {
                    name: p.file_name()?.to_string_lossy().to_string(),
                    kind: if attr.is_dir() {
                        NodeKind::Directory
                    } else {
                        NodeKind::File
                    },
                })
            })
            .collect();

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_change_owner_strips_priv() {
        let lower = MemoryLowerFs::new();
        lower.add_file("/lower/0/a.bin", 0, 0, 0o6755);

        let change = OwnerChange {
            uid: 1023,
            gid: 1023,
            kill_priv: true,
        };
        lower.change_owner(Path::new("/lower/0/a.bin"), &change).unwrap();

        let attr = lower.attr(Path::new("/lower/0/a.bin")).unwrap();
        assert_eq!((attr.uid, attr.gid), (1023, 1023));
        assert_eq!(attr.mode & 0o7777, 0o755);
        assert_eq!(lower.writes().len(), 1);
    }

    #[test]
    fn test_memory_resolve_dir() {
        let lower = MemoryLowerFs::new();
        lower.add_dir("/data/media/obb", 0, 0);
        lower.add_file("/data/media/file", 0, 0, 0o644);

        assert!(lower.resolve_dir(Path::new("/data/media/obb")).is_ok());
        assert!(lower.resolve_dir(Path::new("/data/media/file")).is_err());
        assert!(lower.resolve_dir(Path::new("/nope")).is_err());
    }

    #[test]
    fn test_read_dir() {
        let lower = MemoryLowerFs::new();
        lower.add_dir("/lower", 0, 0);
        lower.add_dir("/lower/b", 0, 0);
        lower.add_file("/lower/a.txt", 0, 0, 0o644);
        lower.add_file("/lower/b/nested", 0, 0, 0o644);

        let entries = lower.read_dir(Path::new("/lower")).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b"]);
        assert_eq!(entries[1].kind, NodeKind::Directory);
        assert!(lower.read_dir(Path::new("/lower/a.txt")).is_err());

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file1.txt"), b"1").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        let host = HostFs::new().read_dir(dir.path()).unwrap();
        assert_eq!(host.len(), 2);
        assert_eq!(host[1].kind, NodeKind::Directory);
    }

    #[test]
    fn test_host_getattr_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("test.txt");
        fs::write(&file, b"hello").unwrap();

        let host = HostFs::new();
        let attr = host.getattr(&file).unwrap();
        assert!(!attr.is_dir());
        assert!(host.getattr(dir.path()).unwrap().is_dir());

        assert!(host.resolve_dir(dir.path()).is_ok());
        assert!(host.resolve_dir(&file).is_err());
        assert!(host.is_linked(&file));
        assert!(!host.is_linked(&dir.path().join("missing")));
    }

    #[test]
    fn test_host_noop_chown_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mine.txt");
        fs::write(&file, b"x").unwrap();

        let host = HostFs::new();
        let attr = host.getattr(&file).unwrap();
        assert!(host.check_chown(&file, attr.uid, attr.gid).is_ok());
        host.change_owner(
            &file,
            &OwnerChange {
                uid: attr.uid,
                gid: attr.gid,
                kill_priv: true,
            },
        )
        .unwrap();
    }
}
