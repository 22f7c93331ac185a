//! Recursive re-derivation after structural changes
//!
//! Locks are taken top-down and a node's lock is held until its whole
//! subtree has been processed, so nobody observes a half-updated subtree.

use super::{derive, DerivedPermissions, DerivedState, PermissionClass};
use crate::error::Result;
use crate::multiuser::UserId;
use crate::tree::{Node, NodeId};
use tracing::debug;

/// Restricts a limited walk to the parts of the tree that can be affected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limit {
    /// Only descend into this user's storage
    pub userid: Option<UserId>,
}

impl Limit {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn user(userid: UserId) -> Self {
        Self {
            userid: Some(userid),
        }
    }
}

/// Whether anything below a node in `state` can need new derivation
pub fn descendant_may_need_fixup(state: &DerivedState, limit: &Limit) -> bool {
    match state.class {
        PermissionClass::Root => limit.userid.map_or(true, |u| u == state.owner_user),
        PermissionClass::PreRoot | PermissionClass::Android => true,
        _ => false,
    }
}

/// Whether the direct children of a node of `class` are package directories
pub fn needs_fixup(class: PermissionClass) -> bool {
    matches!(
        class,
        PermissionClass::AndroidData | PermissionClass::AndroidObb | PermissionClass::AndroidMedia
    )
}

impl DerivedPermissions {
    /// Re-derive and fix up every descendant of `id` from its current state.
    ///
    /// Entry point after a directory move.
    pub fn recursive_refresh(&self, id: NodeId) -> Result<()> {
        let node = self.tree().node(id)?;
        let state = node.lock();
        self.walk_children(&node, &state);
        Ok(())
    }

    fn walk_children(&self, parent: &Node, parent_state: &DerivedState) {
        for child in self.tree().children_of(parent.id()) {
            let mut guard = child.lock();
            *guard = derive(parent_state, &child.name(), self.registry());
            let _ = self.fixup_node(&child, &guard);
            let child_state = *guard;
            self.walk_children(&child, &child_state);
        }
    }

    /// Re-derive only the nodes whose state can depend on the registry:
    /// package directories and the path leading to them.
    ///
    /// Entry point after packages are added, removed or change app id.
    pub fn recursive_refresh_limited(&self, id: NodeId, limit: Limit) -> Result<()> {
        let node = self.tree().node(id)?;
        let state = node.lock();
        debug!("limited refresh of {} ({:?})", id, limit);
        self.walk_limited(&node, &state, &limit);
        Ok(())
    }

    fn walk_limited(&self, parent: &Node, parent_state: &DerivedState, limit: &Limit) {
        if needs_fixup(parent_state.class) {
            for child in self.tree().children_of(parent.id()) {
                let mut guard = child.lock();
                *guard = derive(parent_state, &child.name(), self.registry());
                let _ = self.fixup_node(&child, &guard);
            }
        } else if descendant_may_need_fixup(parent_state, limit) {
            for child in self.tree().children_of(parent.id()) {
                let mut guard = child.lock();
                *guard = derive(parent_state, &child.name(), self.registry());
                let _ = self.fixup_node(&child, &guard);
                let child_state = *guard;
                self.walk_limited(&child, &child_state, limit);
            }
        }
    }
}
