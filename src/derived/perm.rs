//! Permission derivation state machine

use super::{DerivedState, PermissionClass};
use crate::multiuser::{multiuser_get_uid, UserId};
use crate::packages::AppIdRegistry;
use tracing::debug;

/// Directory names with a fixed meaning in the storage layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WellKnownName {
    Android,
    Data,
    Obb,
    Media,
    Cache,
}

const WELL_KNOWN_NAMES: [(&str, WellKnownName); 5] = [
    ("Android", WellKnownName::Android),
    ("data", WellKnownName::Data),
    ("obb", WellKnownName::Obb),
    ("media", WellKnownName::Media),
    ("cache", WellKnownName::Cache),
];

impl WellKnownName {
    /// Case-insensitive match, as storage directory names always were
    fn parse(name: &str) -> Option<Self> {
        WELL_KNOWN_NAMES
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, w)| *w)
    }
}

/// Parse a top-level user directory name.
///
/// Leading decimal digits are taken as the user id; a name without any, or
/// one that overflows, yields user 0.
pub fn parse_userid(name: &str) -> UserId {
    let digits: &str = {
        let end = name
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(name.len());
        &name[..end]
    };

    if digits.len() != name.len() {
        debug!("non-numeric user directory {:?}", name);
    }

    digits.parse::<UserId>().unwrap_or(0)
}

/// Derive a child's state from its parent's state and the child's name.
///
/// The child first inherits the parent's owner user, app uid and
/// under-android flag, then at most one rule keyed on the parent's class
/// refines it.
pub fn derive(parent: &DerivedState, name: &str, registry: &dyn AppIdRegistry) -> DerivedState {
    let mut child = DerivedState::inherit_from(parent);
    let known = WellKnownName::parse(name);

    match (parent.class, known) {
        (PermissionClass::Inherit, _) => {}
        (PermissionClass::PreRoot, _) => {
            // Legacy layout places users at the top level
            child.class = PermissionClass::Root;
            child.owner_user = parse_userid(name);
            // The volume-global obb directory sits beside the user dirs
            if known == Some(WellKnownName::Obb) {
                child.under_obb = true;
            }
        }
        (PermissionClass::Root, Some(WellKnownName::Android)) => {
            child.class = PermissionClass::Android;
            child.under_android = true;
        }
        (PermissionClass::Root, _) => {}
        (PermissionClass::Android, Some(WellKnownName::Data)) => {
            child.class = PermissionClass::AndroidData;
        }
        (PermissionClass::Android, Some(WellKnownName::Obb)) => {
            child.class = PermissionClass::AndroidObb;
            child.under_obb = true;
        }
        (PermissionClass::Android, Some(WellKnownName::Media)) => {
            child.class = PermissionClass::AndroidMedia;
        }
        (PermissionClass::Android, _) => {}
        (
            PermissionClass::AndroidData
            | PermissionClass::AndroidObb
            | PermissionClass::AndroidMedia,
            _,
        ) => {
            child.package_dir = true;
            if let Some(appid) = registry.lookup_by_package(name) {
                child.owner_uid = multiuser_get_uid(parent.owner_user, appid);
            }
        }
        (PermissionClass::AndroidPackage | PermissionClass::AndroidPackageCache, _) => {}
    }

    if parent.package_dir && known == Some(WellKnownName::Cache) {
        child.under_cache = true;
    }

    child.top = match child.class {
        PermissionClass::Inherit => parent.top,
        class => class,
    };

    child
}
