//! sdcardfs-perms - Derived permissions for emulated Android shared storage
//!
//! A stacked filesystem exposing one storage volume as a multi-user Android
//! shared-storage tree has no real per-object ownership. This library
//! derives each node's owner and permission class from its position in the
//! `<userid>/Android/{data,obb,media}/<package>` hierarchy, pushes the
//! result onto the lower filesystem, and redirects every user's
//! `Android/obb` to one volume-global directory.

pub mod config;
pub mod derived;
pub mod error;
pub mod lower;
pub mod multiuser;
pub mod packages;
pub mod tree;

pub use config::MountConfig;
pub use derived::{DerivedPermissions, DerivedState, PermissionClass};
pub use error::{Error, FixupError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MountConfig;
    pub use crate::derived::{DerivedPermissions, DerivedState, PermissionClass};
    pub use crate::error::{Error, Result};
    pub use crate::lower::{HostFs, LowerFs};
    pub use crate::packages::{AppIdRegistry, PackageList};
    pub use crate::tree::{NodeId, NodeKind, ROOT_ID};
}
