//! Package and extension registry
//!
//! Maps installed package names to app ids and file extensions to the
//! media group that should own such files. The registry is populated by
//! whoever tracks installed packages; the derivation engine only reads it,
//! possibly from many threads at once.

use crate::error::{Error, Result};
use crate::multiuser::{AppId, Gid};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Read-only lookups consumed by the permission deriver and fix-up
pub trait AppIdRegistry: Send + Sync {
    /// App id of an installed package, if known
    fn lookup_by_package(&self, name: &str) -> Option<AppId>;

    /// Media group for a file extension (without the leading dot)
    fn lookup_by_extension(&self, ext: &str) -> Option<Gid>;
}

/// On-disk JSON form of a package list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageListFile {
    #[serde(default)]
    pub packages: BTreeMap<String, AppId>,
    #[serde(default)]
    pub extensions: BTreeMap<String, Gid>,
}

/// Concurrent in-memory registry. Keys are case-insensitive.
#[derive(Debug, Default)]
pub struct PackageList {
    packages: DashMap<String, AppId>,
    extensions: DashMap<String, Gid>,
}

impl PackageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a package
    pub fn insert_package(&self, name: &str, appid: AppId) {
        self.packages.insert(name.to_ascii_lowercase(), appid);
    }

    pub fn remove_package(&self, name: &str) -> Option<AppId> {
        self.packages
            .remove(&name.to_ascii_lowercase())
            .map(|(_, appid)| appid)
    }

    /// Map a file extension to a media group
    pub fn insert_extension(&self, ext: &str, gid: Gid) {
        self.extensions.insert(ext.to_ascii_lowercase(), gid);
    }

    pub fn remove_extension(&self, ext: &str) -> Option<Gid> {
        self.extensions
            .remove(&ext.to_ascii_lowercase())
            .map(|(_, gid)| gid)
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn extension_count(&self) -> usize {
        self.extensions.len()
    }

    /// Load a JSON package list
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::PackageList(format!("Failed to read package list: {}", e))
        })?;

        let file: PackageListFile = serde_json::from_str(&content).map_err(|e| {
            Error::PackageList(format!("Failed to parse package list: {}", e))
        })?;

        Ok(Self::from_file(&file))
    }

    pub fn from_file(file: &PackageListFile) -> Self {
        let list = Self::new();
        for (name, appid) in &file.packages {
            list.insert_package(name, *appid);
        }
        for (ext, gid) in &file.extensions {
            list.insert_extension(ext, *gid);
        }
        list
    }

    /// Snapshot the registry into its JSON form
    pub fn to_file(&self) -> PackageListFile {
        PackageListFile {
            packages: self
                .packages
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            extensions: self
                .extensions
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    /// Parse Android's `packages.list` format.
    ///
    /// Each line is `<name> <uid> <debuggable> <data dir> ...`; only the first
    /// two columns are used. Blank lines and `#` comments are skipped.
    pub fn parse_packages_list(text: &str) -> Result<Self> {
        let list = Self::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let name = fields.next();
            let uid = fields.next();
            match (name, uid) {
                (Some(name), Some(uid)) => {
                    let appid = uid.parse::<AppId>().map_err(|_| {
                        Error::PackageList(format!(
                            "line {}: invalid uid {:?} for {}",
                            lineno + 1,
                            uid,
                            name
                        ))
                    })?;
                    list.insert_package(name, appid);
                }
                _ => {
                    return Err(Error::PackageList(format!(
                        "line {}: expected '<name> <uid>'",
                        lineno + 1
                    )))
                }
            }
        }

        Ok(list)
    }
}

impl AppIdRegistry for PackageList {
    fn lookup_by_package(&self, name: &str) -> Option<AppId> {
        self.packages
            .get(&name.to_ascii_lowercase())
            .map(|v| *v)
            .filter(|&appid| appid != 0)
    }

    fn lookup_by_extension(&self, ext: &str) -> Option<Gid> {
        self.extensions
            .get(&ext.to_ascii_lowercase())
            .map(|v| *v)
            .filter(|&gid| gid != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiuser::AID_MEDIA_AUDIO;
    use std::sync::Arc;

    #[test]
    fn test_case_insensitive_lookup() {
        let list = PackageList::new();
        list.insert_package("com.example.Game", 10057);
        list.insert_extension("MP3", AID_MEDIA_AUDIO);

        assert_eq!(list.lookup_by_package("com.example.game"), Some(10057));
        assert_eq!(list.lookup_by_package("COM.EXAMPLE.GAME"), Some(10057));
        assert_eq!(list.lookup_by_extension("mp3"), Some(AID_MEDIA_AUDIO));
        assert_eq!(list.lookup_by_package("com.other"), None);

        assert_eq!(list.remove_package("COM.EXAMPLE.game"), Some(10057));
        assert_eq!(list.lookup_by_package("com.example.game"), None);
        assert_eq!(list.remove_extension("Mp3"), Some(AID_MEDIA_AUDIO));
        assert_eq!(list.extension_count(), 0);
    }

    #[test]
    fn test_zero_appid_is_unknown() {
        let list = PackageList::new();
        list.insert_package("com.zero", 0);
        assert_eq!(list.lookup_by_package("com.zero"), None);
    }

    #[test]
    fn test_parse_packages_list() {
        let text = "\
# generated
com.android.chrome 10071 0 /data/user/0/com.android.chrome default 3003
com.example.game 10057 1 /data/user/0/com.example.game default none

";
        let list = PackageList::parse_packages_list(text).unwrap();
        assert_eq!(list.package_count(), 2);
        assert_eq!(list.lookup_by_package("com.android.chrome"), Some(10071));

        assert!(PackageList::parse_packages_list("com.bad notanumber").is_err());
        assert!(PackageList::parse_packages_list("lonely").is_err());
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packages.json");
        std::fs::write(
            &path,
            r#"{"packages": {"com.example.game": 10057}, "extensions": {"ogg": 1041}}"#,
        )
        .unwrap();

        let list = PackageList::load(&path).unwrap();
        assert_eq!(list.lookup_by_package("com.example.game"), Some(10057));
        assert_eq!(list.lookup_by_extension("OGG"), Some(1041));

        let file = list.to_file();
        assert_eq!(file.packages.get("com.example.game"), Some(&10057));
    }

    #[test]
    fn test_concurrent_lookups() {
        let list = Arc::new(PackageList::new());
        list.insert_package("com.example.game", 10057);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    list.insert_package(&format!("com.thread{}", i), 10100 + i);
                    for _ in 0..100 {
                        assert_eq!(list.lookup_by_package("com.example.game"), Some(10057));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.package_count(), 5);
    }
}
