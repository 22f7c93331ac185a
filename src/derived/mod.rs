//! Derived permissions
//!
//! Ownership on the overlay is not stored anywhere; it is computed from a
//! node's position in the shared-storage hierarchy:
//!
//! ```text
//! /                       PreRoot  (multi-user)
//! /<userid>               Root
//! /<userid>/Android       Android
//! /<userid>/Android/data  AndroidData   (obb, media likewise)
//! /<userid>/Android/data/<package>      owner_uid = the package's app uid
//! ```
//!
//! The derived class drives the attributes reported by the overlay and the
//! uid/gid pushed onto the lower filesystem by fix-up.

mod attrs;
mod fixup;
mod obb;
mod perm;
mod perms;
mod walk;

pub use attrs::{visible_attrs, VisibleAttrs};
pub use fixup::{fixup_lower_ownership, resolve_class, target_owner, FixupContext, FixupOutcome};
pub use obb::{is_base_obb_anchor, is_obb_anchor, ObbBinding};
pub use perm::{derive, parse_userid};
pub use perms::DerivedPermissions;
pub use walk::{descendant_may_need_fixup, needs_fixup, Limit};

use crate::multiuser::{Uid, UserId, AID_ROOT};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Synthetic role of a node in the storage hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionClass {
    /// Top of a multi-user view; children are user ids
    PreRoot,
    /// Top of one user's storage
    Root,
    /// Copies the parent's derived fields verbatim
    Inherit,
    Android,
    AndroidData,
    AndroidObb,
    AndroidMedia,
    AndroidPackage,
    AndroidPackageCache,
}

impl PermissionClass {
    /// Position along a root-to-leaf path. `Inherit` has none.
    pub fn depth(self) -> Option<u8> {
        match self {
            PermissionClass::PreRoot => Some(0),
            PermissionClass::Root => Some(1),
            PermissionClass::Android => Some(2),
            PermissionClass::AndroidData
            | PermissionClass::AndroidObb
            | PermissionClass::AndroidMedia => Some(3),
            PermissionClass::AndroidPackage => Some(4),
            PermissionClass::AndroidPackageCache => Some(5),
            PermissionClass::Inherit => None,
        }
    }

    /// Classes whose nodes may carry an app-specific `owner_uid`
    pub fn is_app_scoped(self) -> bool {
        matches!(
            self,
            PermissionClass::AndroidData
                | PermissionClass::AndroidObb
                | PermissionClass::AndroidMedia
                | PermissionClass::AndroidPackage
                | PermissionClass::AndroidPackageCache
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionClass::PreRoot => "pre-root",
            PermissionClass::Root => "root",
            PermissionClass::Inherit => "inherit",
            PermissionClass::Android => "android",
            PermissionClass::AndroidData => "android-data",
            PermissionClass::AndroidObb => "android-obb",
            PermissionClass::AndroidMedia => "android-media",
            PermissionClass::AndroidPackage => "android-package",
            PermissionClass::AndroidPackageCache => "android-package-cache",
        }
    }
}

impl fmt::Display for PermissionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived ownership state attached to every overlay node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedState {
    pub class: PermissionClass,
    /// Effective class: the nearest non-`Inherit` class on the path to the
    /// root, self included. A package directory stays `Inherit` and reads
    /// its data/obb/media class from here.
    pub top: PermissionClass,
    /// User whose storage this subtree belongs to
    pub owner_user: UserId,
    /// App uid owning the subtree (only set below data/obb/media)
    pub owner_uid: Uid,
    pub under_android: bool,
    pub under_obb: bool,
    pub under_cache: bool,
    /// Direct child of an Android/data, obb or media directory
    pub package_dir: bool,
}

impl DerivedState {
    pub fn new(
        class: PermissionClass,
        owner_user: UserId,
        owner_uid: Uid,
        under_android: bool,
    ) -> Self {
        Self {
            class,
            top: class,
            owner_user,
            owner_uid,
            under_android,
            under_obb: false,
            under_cache: false,
            package_dir: false,
        }
    }

    /// Fresh `Inherit` state copying the parent's fields
    pub fn inherit_from(parent: &DerivedState) -> Self {
        Self {
            class: PermissionClass::Inherit,
            top: parent.top,
            owner_user: parent.owner_user,
            owner_uid: parent.owner_uid,
            under_android: parent.under_android,
            under_obb: parent.under_obb,
            under_cache: parent.under_cache,
            package_dir: false,
        }
    }
}

impl Default for DerivedState {
    fn default() -> Self {
        Self::new(PermissionClass::Inherit, 0, AID_ROOT, false)
    }
}
