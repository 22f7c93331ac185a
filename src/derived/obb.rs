//! OBB redirection
//!
//! Every user's `Android/obb` is backed by one volume-global directory. The
//! anchor node remembers its own lower path so it can still create or
//! remove itself, while lookups below it go to the global location.

use super::{DerivedPermissions, DerivedState, PermissionClass};
use crate::config::MountConfig;
use crate::error::{Error, Result};
use crate::tree::Node;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Per-node OBB binding, guarded separately from the derived state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObbBinding {
    original_path: Option<PathBuf>,
    redirected_path: Option<PathBuf>,
}

impl ObbBinding {
    /// The node's own lower location
    pub fn original_path(&self) -> Option<&Path> {
        self.original_path.as_deref()
    }

    /// The global OBB location the node stands for
    pub fn redirected_path(&self) -> Option<&Path> {
        self.redirected_path.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.original_path.is_some()
    }
}

fn is_obb_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("obb")
}

/// Whether a child `name` of `parent` must be grafted onto the global OBB
/// directory.
///
/// The primary user's `Android/obb` on a single-user mount is itself the
/// global directory and is not redirected.
pub fn is_obb_anchor(parent: &DerivedState, name: &str, config: &MountConfig) -> bool {
    parent.class == PermissionClass::Android
        && is_obb_name(name)
        && (config.multiuser_enabled || parent.owner_user != 0)
}

/// Whether a child `name` of `parent` is the canonical global OBB directory
pub fn is_base_obb_anchor(parent: &DerivedState, name: &str, config: &MountConfig) -> bool {
    if !is_obb_name(name) {
        return false;
    }
    if config.multiuser_enabled {
        parent.class == PermissionClass::PreRoot
    } else {
        parent.class == PermissionClass::Android
    }
}

impl DerivedPermissions {
    /// Whether lookups of `name` under a parent with `parent_state` must be
    /// redirected
    pub fn needs_redirect(&self, parent_state: &DerivedState, name: &str) -> bool {
        is_obb_anchor(parent_state, name, self.config())
    }

    pub fn is_base_obb(&self, parent_state: &DerivedState, name: &str) -> bool {
        is_base_obb_anchor(parent_state, name, self.config())
    }

    /// Bind an OBB anchor to the global OBB directory.
    ///
    /// `real_path` is the anchor's own lower location. If the global
    /// directory cannot be resolved the node stays unbound and the error
    /// must be reported as "not found".
    pub fn bind_redirect(&self, node: &Node, real_path: &Path) -> Result<PathBuf> {
        let global = self.config().global_obb_path();

        let resolved = match self.lower().resolve_dir(&global) {
            Ok(resolved) => {
                info!("global obb path {:?} is found", global);
                resolved
            }
            Err(e) => {
                info!("global obb path {:?} is not available: {}", global, e);
                return Err(Error::RedirectUnresolvable(
                    self.config().global_obb_path.clone(),
                ));
            }
        };

        let mut binding = node.obb();
        binding.original_path = Some(real_path.to_path_buf());
        binding.redirected_path = Some(resolved.clone());
        debug!("bound {:?} -> {:?}", real_path, resolved);

        Ok(resolved)
    }

    /// Whether a node's OBB binding no longer points at a live global
    /// directory. Unbound nodes are never stale.
    pub fn is_redirect_stale(&self, node: &Node) -> bool {
        let binding = node.obb();
        if binding.original_path.is_none() {
            return false;
        }
        let redirected = match &binding.redirected_path {
            Some(path) => path,
            None => return true,
        };

        if !self.lower().is_linked(redirected) || self.lower().resolve_dir(redirected).is_err() {
            return true;
        }

        !redirected
            .to_string_lossy()
            .eq_ignore_ascii_case(&self.config().global_obb_path)
    }

    /// Drop a node's binding so the next lookup binds again
    pub fn invalidate_redirect(&self, node: &Node) -> ObbBinding {
        std::mem::take(&mut *node.obb())
    }

    /// Snapshot of a node's binding
    pub fn redirect_of(&self, node: &Node) -> ObbBinding {
        node.obb().clone()
    }

    /// Lower object a node currently stands for.
    ///
    /// Every binding on the way up is checked first; a stale one is dropped
    /// and bound again, and fails as "not found" when the global directory
    /// is gone. An anchor left unbound is bound again by `refresh`.
    pub fn lower_path(&self, node: &Node) -> Result<PathBuf> {
        if node.is_root() {
            return Ok(self.tree().lower_root().to_path_buf());
        }
        let parent = self.tree().node(node.parent())?;
        let real = self.lower_path(&parent)?.join(node.name());

        let bound = node.obb().is_bound();
        if bound && self.is_redirect_stale(node) {
            let stale = self.invalidate_redirect(node);
            warn!(
                "obb binding of {:?} went stale ({:?}), binding again",
                real,
                stale.redirected_path()
            );
            return self.bind_redirect(node, &real);
        }

        match node.obb().redirected_path() {
            Some(redirected) => Ok(redirected.to_path_buf()),
            None => Ok(real),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::derive;
    use crate::lower::MemoryLowerFs;
    use crate::packages::PackageList;
    use crate::tree::NodeKind;
    use std::sync::Arc;

    fn engine(config: MountConfig, lower: Arc<MemoryLowerFs>) -> DerivedPermissions {
        DerivedPermissions::new(
            config,
            Arc::new(PackageList::new()),
            lower,
            PathBuf::from("/data/media"),
        )
    }

    fn android(user: u32) -> DerivedState {
        DerivedState::new(PermissionClass::Android, user, 0, true)
    }

    #[test]
    fn test_obb_anchor_multiuser() {
        let config = MountConfig::default();
        let list = PackageList::new();
        let pre_root = config.root_state();
        let user0 = derive(&pre_root, "0", &list);
        let android0 = derive(&user0, "Android", &list);

        // 0/Android/obb is redirected but is not the base obb
        assert!(is_obb_anchor(&android0, "obb", &config));
        assert!(!is_base_obb_anchor(&android0, "obb", &config));

        // the top-level obb directory is the base
        assert!(is_base_obb_anchor(&pre_root, "obb", &config));
        assert!(is_base_obb_anchor(&pre_root, "OBB", &config));
        assert!(!is_obb_anchor(&pre_root, "obb", &config));
    }

    #[test]
    fn test_obb_anchor_single_user() {
        let config = MountConfig {
            multiuser_enabled: false,
            ..MountConfig::default()
        };

        assert!(!is_obb_anchor(&android(0), "obb", &config));
        assert!(is_base_obb_anchor(&android(0), "Obb", &config));
        assert!(is_obb_anchor(&android(10), "obb", &config));
        assert!(!is_obb_anchor(&android(10), "data", &config));
    }

    #[test]
    fn test_bind_unresolvable_leaves_node_unbound() {
        let lower = Arc::new(MemoryLowerFs::new());
        let perms = engine(MountConfig::default(), lower);
        let node = perms.tree().root();

        let err = perms
            .bind_redirect(&node, Path::new("/data/media/0/Android/obb"))
            .unwrap_err();
        assert!(matches!(err, Error::RedirectUnresolvable(_)));
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert_eq!(perms.redirect_of(&node), ObbBinding::default());
        assert!(!perms.is_redirect_stale(&node));
    }

    #[test]
    fn test_bind_and_staleness() {
        let lower = Arc::new(MemoryLowerFs::new());
        lower.add_dir("/data/media", 0, 0);
        lower.add_dir("/data/media/0", 0, 0);
        lower.add_dir("/data/media/0/Android", 0, 0);
        lower.add_dir("/data/media/obb", 0, 0);
        let perms = engine(MountConfig::default(), Arc::clone(&lower));

        let user = perms.create(crate::tree::ROOT_ID, "0", NodeKind::Directory).unwrap();
        let android = perms.create(user.id(), "Android", NodeKind::Directory).unwrap();
        assert!(perms.needs_redirect(&android.state(), "obb"));

        let obb = perms
            .tree()
            .insert(
                android.id(),
                "obb",
                NodeKind::Directory,
                derive(&android.state(), "obb", &PackageList::new()),
            )
            .unwrap();
        let real = PathBuf::from("/data/media/0/Android/obb");
        let target = perms.bind_redirect(&obb, &real).unwrap();

        assert_eq!(target, PathBuf::from("/data/media/obb"));
        assert_eq!(perms.lower_path(&obb).unwrap(), target);
        assert_eq!(
            perms.redirect_of(&obb).original_path(),
            Some(Path::new("/data/media/0/Android/obb"))
        );
        assert!(!perms.is_redirect_stale(&obb));

        // the global directory disappears
        lower.remove(Path::new("/data/media/obb"));
        assert!(perms.is_redirect_stale(&obb));

        let old = perms.invalidate_redirect(&obb);
        assert!(old.is_bound());
        assert!(!perms.is_redirect_stale(&obb));
        assert_eq!(perms.lower_path(&obb).unwrap(), real);
    }

    #[test]
    fn test_stale_when_config_path_differs() {
        let lower = Arc::new(MemoryLowerFs::new());
        lower.add_dir("/data/media/obb", 0, 0);
        lower.add_dir("/mnt/obb", 0, 0);
        let perms = engine(MountConfig::default(), Arc::clone(&lower));
        let node = perms.tree().root();

        perms.bind_redirect(&node, Path::new("/data/media/x")).unwrap();
        assert!(!perms.is_redirect_stale(&node));

        let moved = engine(
            MountConfig {
                global_obb_path: "/mnt/obb".into(),
                ..MountConfig::default()
            },
            lower,
        );
        *moved.tree().root().obb() = perms.redirect_of(&node);
        assert!(moved.is_redirect_stale(&moved.tree().root()));
    }

    #[test]
    fn test_lower_path_rebinds_stale_binding() {
        let lower = Arc::new(MemoryLowerFs::new());
        lower.add_dir("/data/media", 0, 0);
        lower.add_dir("/data/media/10", 0, 0);
        lower.add_dir("/data/media/10/Android", 0, 0);
        lower.add_dir("/data/media/obb", 0, 0);
        lower.add_dir("/data/media/obb/com.example.game", 0, 0);
        let perms = engine(MountConfig::default(), Arc::clone(&lower));

        let user = perms.create(crate::tree::ROOT_ID, "10", NodeKind::Directory).unwrap();
        let android = perms.create(user.id(), "Android", NodeKind::Directory).unwrap();
        let obb = perms.create(android.id(), "obb", NodeKind::Directory).unwrap();
        let pkg = perms
            .create(obb.id(), "com.example.game", NodeKind::Directory)
            .unwrap();

        // a binding left over from an old global location
        *obb.obb() = ObbBinding {
            original_path: Some(PathBuf::from("/data/media/10/Android/obb")),
            redirected_path: Some(PathBuf::from("/mnt/old-obb")),
        };
        assert!(perms.is_redirect_stale(&obb));

        assert_eq!(
            perms.lower_path(&pkg).unwrap(),
            PathBuf::from("/data/media/obb/com.example.game")
        );
        assert_eq!(
            perms.redirect_of(&obb).redirected_path(),
            Some(Path::new("/data/media/obb"))
        );

        // the global directory is gone: lookups fail and nothing stays bound
        lower.remove(Path::new("/data/media/obb"));
        let err = perms.lower_path(&obb).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert!(!perms.redirect_of(&obb).is_bound());

        // the next refresh binds again
        lower.add_dir("/data/media/obb", 0, 0);
        perms.refresh(obb.id()).unwrap();
        assert!(perms.redirect_of(&obb).is_bound());
        assert_eq!(
            perms.lower_path(&obb).unwrap(),
            PathBuf::from("/data/media/obb")
        );
    }
}
