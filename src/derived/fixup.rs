//! Lower ownership fix-up
//!
//! Writes the derived uid/gid onto the lower object so that the lower
//! filesystem's own permission checks agree with the overlay.

use super::{DerivedState, PermissionClass};
use crate::config::MountConfig;
use crate::error::FixupError;
use crate::lower::{LowerFs, OwnerChange};
use crate::multiuser::{
    multiuser_get_ext_cache_gid, multiuser_get_ext_gid, multiuser_get_uid, uid_is_app, Gid, Uid,
    AID_MEDIA_OBB, AID_MEDIA_RW,
};
use crate::packages::AppIdRegistry;
use parking_lot::Mutex;
use std::path::Path;
use tracing::debug;

/// Everything fix-up reads besides the node itself
#[derive(Clone, Copy)]
pub struct FixupContext<'a> {
    pub config: &'a MountConfig,
    pub registry: &'a dyn AppIdRegistry,
    pub lower: &'a dyn LowerFs,
}

/// What a fix-up call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupOutcome {
    /// gid derivation is off for this mount
    Disabled,
    /// Lower object already had the target owner
    Unchanged,
    Updated { uid: Uid, gid: Gid },
}

/// Class fix-up acts on.
///
/// Sticky OBB and cache placement override the nominal class; `Inherit`
/// resolves to the nearest classified ancestor.
pub fn resolve_class(state: &DerivedState) -> PermissionClass {
    if state.under_obb {
        PermissionClass::AndroidObb
    } else if state.under_cache {
        PermissionClass::AndroidPackageCache
    } else if state.class == PermissionClass::Inherit {
        state.top
    } else {
        state.class
    }
}

/// Media group for a file name, from its extension
fn extension_group(name: &str, registry: &dyn AppIdRegistry) -> Gid {
    match name.rfind('.') {
        Some(dot) if dot + 1 < name.len() => registry
            .lookup_by_extension(&name[dot + 1..])
            .unwrap_or(AID_MEDIA_RW),
        _ => AID_MEDIA_RW,
    }
}

/// Owner the lower object of a node should have
pub fn target_owner(
    state: &DerivedState,
    is_dir: bool,
    name: &str,
    config: &MountConfig,
    registry: &dyn AppIdRegistry,
) -> (Uid, Gid) {
    let class = resolve_class(state);

    let uid = match class {
        PermissionClass::Root
        | PermissionClass::Android
        | PermissionClass::AndroidData
        | PermissionClass::AndroidMedia
        | PermissionClass::AndroidPackage
        | PermissionClass::AndroidPackageCache => {
            multiuser_get_uid(state.owner_user, config.fallback_uid)
        }
        PermissionClass::AndroidObb => AID_MEDIA_OBB,
        PermissionClass::PreRoot | PermissionClass::Inherit => config.fallback_uid,
    };

    let gid = match class {
        PermissionClass::Root
        | PermissionClass::Android
        | PermissionClass::AndroidData
        | PermissionClass::AndroidMedia => {
            if is_dir {
                multiuser_get_uid(state.owner_user, AID_MEDIA_RW)
            } else {
                multiuser_get_uid(state.owner_user, extension_group(name, registry))
            }
        }
        PermissionClass::AndroidObb => AID_MEDIA_OBB,
        PermissionClass::AndroidPackage => {
            if uid_is_app(state.owner_uid) {
                multiuser_get_ext_gid(state.owner_uid)
            } else {
                multiuser_get_uid(state.owner_user, AID_MEDIA_RW)
            }
        }
        PermissionClass::AndroidPackageCache => {
            if uid_is_app(state.owner_uid) {
                multiuser_get_ext_cache_gid(state.owner_uid)
            } else {
                multiuser_get_uid(state.owner_user, AID_MEDIA_RW)
            }
        }
        PermissionClass::PreRoot | PermissionClass::Inherit => config.fallback_gid,
    };

    (uid, gid)
}

/// Push a node's derived owner onto its lower object.
///
/// `lower_lock` is held across the stat, the security check and the write.
/// Failures are logged at debug level and returned; they are never fatal to
/// the operation that triggered the fix-up.
pub fn fixup_lower_ownership(
    ctx: FixupContext<'_>,
    state: &DerivedState,
    is_dir: bool,
    name: &str,
    lower_path: &Path,
    lower_lock: &Mutex<()>,
) -> Result<FixupOutcome, FixupError> {
    if !ctx.config.gid_derivation_enabled {
        return Ok(FixupOutcome::Disabled);
    }

    let (uid, gid) = target_owner(state, is_dir, name, ctx.config, ctx.registry);

    let _guard = lower_lock.lock();
    apply_owner(ctx.lower, lower_path, uid, gid).map_err(|e| {
        debug!("failed to touch up lower fs gid/uid for {}: {}", name, e);
        e
    })
}

fn apply_owner(
    lower: &dyn LowerFs,
    path: &Path,
    uid: Uid,
    gid: Gid,
) -> Result<FixupOutcome, FixupError> {
    let current = lower.getattr(path)?;
    if current.uid == uid && current.gid == gid {
        return Ok(FixupOutcome::Unchanged);
    }

    let change = OwnerChange {
        uid,
        gid,
        // A new owner must not inherit set-id or capability privileges
        kill_priv: !current.is_dir(),
    };

    lower.check_chown(path, uid, gid)?;
    lower.change_owner(path, &change)?;

    debug!("fixed lower owner of {:?} to {}:{}", path, uid, gid);
    Ok(FixupOutcome::Updated { uid, gid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::derive;
    use crate::lower::MemoryLowerFs;
    use crate::multiuser::{AID_MEDIA_AUDIO, AID_MEDIA_IMAGE, AID_MEDIA_VIDEO, AID_ROOT};
    use crate::packages::PackageList;

    fn registry() -> PackageList {
        let list = PackageList::new();
        list.insert_package("com.example.game", 10057);
        list.insert_extension("mp3", AID_MEDIA_AUDIO);
        list.insert_extension("mp4", AID_MEDIA_VIDEO);
        list.insert_extension("jpg", AID_MEDIA_IMAGE);
        list
    }

    fn state(class: PermissionClass, user: u32, owner_uid: Uid) -> DerivedState {
        DerivedState::new(class, user, owner_uid, true)
    }

    #[test]
    fn test_resolve_class() {
        let mut s = state(PermissionClass::Inherit, 0, 0);
        s.top = PermissionClass::AndroidMedia;
        assert_eq!(resolve_class(&s), PermissionClass::AndroidMedia);

        s.under_cache = true;
        assert_eq!(resolve_class(&s), PermissionClass::AndroidPackageCache);

        s.under_obb = true;
        assert_eq!(resolve_class(&s), PermissionClass::AndroidObb);
    }

    #[test]
    fn test_media_extension_groups() {
        let config = MountConfig::default();
        let list = registry();
        let media = state(PermissionClass::AndroidMedia, 10, AID_ROOT);

        let (uid, gid) = target_owner(&media, false, "song.mp3", &config, &list);
        assert_eq!(uid, multiuser_get_uid(10, AID_MEDIA_RW));
        assert_eq!(gid, multiuser_get_uid(10, AID_MEDIA_AUDIO));

        let (_, gid) = target_owner(&media, false, "clip.MP4", &config, &list);
        assert_eq!(gid, multiuser_get_uid(10, AID_MEDIA_VIDEO));

        let (_, gid) = target_owner(&media, false, "photo.jpg", &config, &list);
        assert_eq!(gid, multiuser_get_uid(10, AID_MEDIA_IMAGE));

        let (_, gid) = target_owner(&media, false, "blob.xyz", &config, &list);
        assert_eq!(gid, multiuser_get_uid(10, AID_MEDIA_RW));

        let (_, gid) = target_owner(&media, false, "noext", &config, &list);
        assert_eq!(gid, multiuser_get_uid(10, AID_MEDIA_RW));

        let (_, gid) = target_owner(&media, false, "trailing.", &config, &list);
        assert_eq!(gid, multiuser_get_uid(10, AID_MEDIA_RW));

        // directories always get media_rw
        let (_, gid) = target_owner(&media, true, "song.mp3", &config, &list);
        assert_eq!(gid, multiuser_get_uid(10, AID_MEDIA_RW));
    }

    #[test]
    fn test_package_groups() {
        let config = MountConfig::default();
        let list = registry();

        let app = state(PermissionClass::AndroidPackage, 0, 10057);
        assert_eq!(target_owner(&app, true, "x", &config, &list).1, 30057);

        let not_app = state(PermissionClass::AndroidPackage, 2, AID_ROOT);
        assert_eq!(
            target_owner(&not_app, true, "x", &config, &list).1,
            multiuser_get_uid(2, AID_MEDIA_RW)
        );

        let cache = state(PermissionClass::AndroidPackageCache, 0, 10057);
        assert_eq!(target_owner(&cache, true, "x", &config, &list).1, 40057);
    }

    #[test]
    fn test_obb_and_pre_root() {
        let config = MountConfig::default();
        let list = registry();

        let obb = state(PermissionClass::AndroidObb, 5, AID_ROOT);
        assert_eq!(
            target_owner(&obb, true, "obb", &config, &list),
            (AID_MEDIA_OBB, AID_MEDIA_OBB)
        );

        let pre = state(PermissionClass::PreRoot, 0, AID_ROOT);
        assert_eq!(
            target_owner(&pre, true, "", &config, &list),
            (config.fallback_uid, config.fallback_gid)
        );
    }

    #[test]
    fn test_fixup_applies_and_strips_priv() {
        let config = MountConfig::default();
        let list = registry();
        let lower = MemoryLowerFs::new();
        lower.add_file("/lower/0/run.sh", 0, 0, 0o4755);
        let ctx = FixupContext {
            config: &config,
            registry: &list,
            lower: &lower,
        };
        let lock = Mutex::new(());
        let root = state(PermissionClass::Root, 0, AID_ROOT);

        let outcome =
            fixup_lower_ownership(ctx, &root, false, "run.sh", Path::new("/lower/0/run.sh"), &lock)
                .unwrap();
        assert_eq!(
            outcome,
            FixupOutcome::Updated {
                uid: AID_MEDIA_RW,
                gid: AID_MEDIA_RW
            }
        );
        let attr = lower.attr(Path::new("/lower/0/run.sh")).unwrap();
        assert_eq!(attr.mode & 0o7777, 0o755);

        let again =
            fixup_lower_ownership(ctx, &root, false, "run.sh", Path::new("/lower/0/run.sh"), &lock)
                .unwrap();
        assert_eq!(again, FixupOutcome::Unchanged);
    }

    #[test]
    fn test_fixup_directory_keeps_mode() {
        let config = MountConfig::default();
        let list = registry();
        let lower = MemoryLowerFs::new();
        lower.add_dir("/lower/0", 0, 0);
        let ctx = FixupContext {
            config: &config,
            registry: &list,
            lower: &lower,
        };
        let root = state(PermissionClass::Root, 0, AID_ROOT);

        fixup_lower_ownership(ctx, &root, true, "0", Path::new("/lower/0"), &Mutex::new(()))
            .unwrap();
        let writes = lower.writes();
        assert_eq!(writes.len(), 1);
        assert!(!writes[0].1.kill_priv);
    }

    #[test]
    fn test_fixup_disabled_for_every_class() {
        let config = MountConfig {
            gid_derivation_enabled: false,
            ..MountConfig::default()
        };
        let list = registry();
        let lower = MemoryLowerFs::new();
        let ctx = FixupContext {
            config: &config,
            registry: &list,
            lower: &lower,
        };

        let classes = [
            PermissionClass::PreRoot,
            PermissionClass::Root,
            PermissionClass::Inherit,
            PermissionClass::Android,
            PermissionClass::AndroidData,
            PermissionClass::AndroidObb,
            PermissionClass::AndroidMedia,
            PermissionClass::AndroidPackage,
            PermissionClass::AndroidPackageCache,
        ];
        for class in classes {
            for (obb, cache) in [(false, false), (true, false), (false, true)] {
                let mut s = state(class, 1, 10057);
                s.under_obb = obb;
                s.under_cache = cache;
                let outcome =
                    fixup_lower_ownership(ctx, &s, false, "f", Path::new("/missing"), &Mutex::new(()))
                        .unwrap();
                assert_eq!(outcome, FixupOutcome::Disabled);
            }
        }
        assert!(lower.writes().is_empty());
    }

    #[test]
    fn test_fixup_errors_are_reported() {
        let config = MountConfig::default();
        let list = registry();
        let lower = MemoryLowerFs::new();
        lower.add_dir("/lower/0", 0, 0);
        lower.add_dir("/lower/1", 0, 0);
        lower.deny_chown("/lower/0");
        lower.fail_writes("/lower/1");
        let ctx = FixupContext {
            config: &config,
            registry: &list,
            lower: &lower,
        };
        let root = state(PermissionClass::Root, 0, AID_ROOT);
        let lock = Mutex::new(());

        let denied = fixup_lower_ownership(ctx, &root, true, "0", Path::new("/lower/0"), &lock);
        assert!(matches!(denied, Err(FixupError::PolicyDenied { .. })));

        let failed = fixup_lower_ownership(ctx, &root, true, "1", Path::new("/lower/1"), &lock);
        assert!(matches!(failed, Err(FixupError::AttributeWriteFailed { .. })));

        let missing = fixup_lower_ownership(ctx, &root, true, "2", Path::new("/lower/2"), &lock);
        assert!(matches!(missing, Err(FixupError::Stat { .. })));

        // nothing changed on the denied object
        assert_eq!(lower.attr(Path::new("/lower/0")).unwrap().uid, 0);
    }

    #[test]
    fn test_fixup_package_dir_from_derivation() {
        let config = MountConfig::default();
        let list = registry();
        let data = state(PermissionClass::AndroidData, 0, AID_ROOT);
        let pkg = derive(&data, "com.example.game", &list);

        // package directories resolve to their parent's leaf class
        assert_eq!(resolve_class(&pkg), PermissionClass::AndroidData);
        assert_eq!(
            target_owner(&pkg, true, "com.example.game", &config, &list),
            (AID_MEDIA_RW, AID_MEDIA_RW)
        );
    }
}
