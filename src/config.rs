//! Mount configuration for sdcardfs-perms
//!
//! Supplied once at mount time and treated as immutable afterwards. It is
//! threaded through every derivation and fix-up call as an explicit value.

use crate::derived::{DerivedState, PermissionClass};
use crate::error::{Error, Result};
use crate::multiuser::{Gid, Uid, UserId, AID_MEDIA_RW, AID_ROOT, AID_SDCARD_RW};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the volume-global OBB directory
pub const DEFAULT_OBB_PATH: &str = "/data/media/obb";

/// Mount options consumed by the derivation engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountConfig {
    /// Top level of the overlay holds one directory per user
    pub multiuser_enabled: bool,

    /// Push derived uid/gid onto the lower filesystem
    pub gid_derivation_enabled: bool,

    /// Base uid of lower objects (fs_low_uid)
    pub fallback_uid: Uid,

    /// Base gid of lower objects (fs_low_gid)
    pub fallback_gid: Gid,

    /// Lower path every user's Android/obb is redirected to
    pub global_obb_path: String,

    /// Owning user of the root in single-user mode
    pub userid: UserId,

    /// Group reported on overlay nodes
    pub gid: Gid,

    /// Mode bits masked off overlay nodes
    pub mask: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            multiuser_enabled: true,
            gid_derivation_enabled: true,
            fallback_uid: AID_MEDIA_RW,
            fallback_gid: AID_MEDIA_RW,
            global_obb_path: DEFAULT_OBB_PATH.to_string(),
            userid: 0,
            gid: AID_SDCARD_RW,
            mask: 0,
        }
    }
}

impl MountConfig {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: MountConfig = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Default configuration with environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = MountConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("SDCARDFS_MULTIUSER") {
            self.multiuser_enabled = v;
        }

        if let Some(v) = env_bool("SDCARDFS_GID_DERIVATION") {
            self.gid_derivation_enabled = v;
        }

        if let Ok(path) = std::env::var("SDCARDFS_OBB_PATH") {
            let path = path.trim().to_string();
            if !path.is_empty() {
                self.global_obb_path = path;
            }
        }

        if let Ok(userid) = std::env::var("SDCARDFS_USERID") {
            if let Ok(id) = userid.trim().parse::<UserId>() {
                self.userid = id;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.global_obb_path.is_empty() {
            return Err(Error::InvalidConfig(
                "Global OBB path is required".to_string(),
            ));
        }

        if !Path::new(&self.global_obb_path).is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "Global OBB path must be absolute: {}",
                self.global_obb_path
            )));
        }

        if self.mask & !0o777 != 0 {
            return Err(Error::InvalidConfig(format!(
                "Mask {:o} has bits outside 0777",
                self.mask
            )));
        }

        Ok(())
    }

    pub fn global_obb_path(&self) -> PathBuf {
        PathBuf::from(&self.global_obb_path)
    }

    /// Derived state of the mount root
    pub fn root_state(&self) -> DerivedState {
        if self.multiuser_enabled {
            DerivedState::new(PermissionClass::PreRoot, 0, AID_ROOT, false)
        } else {
            DerivedState::new(PermissionClass::Root, self.userid, AID_ROOT, false)
        }
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sdcardfs-perms")
            .join("config.json")
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
