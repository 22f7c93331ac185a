//! Entry points used by the VFS-facing layer
//!
//! Lock discipline: a node's state lock is held while its state is derived
//! and its lower owner fixed up. Only the recursive walk holds more than one
//! state lock, always parent before child. Everything here snapshots the
//! parent's state before locking the child, never the other way around.

use super::fixup::{fixup_lower_ownership, FixupContext, FixupOutcome};
use super::{derive, visible_attrs, DerivedState, VisibleAttrs};
use crate::config::MountConfig;
use crate::error::{Error, FixupError, Result};
use crate::lower::LowerFs;
use crate::packages::AppIdRegistry;
use crate::tree::{Node, NodeId, NodeKind, NodeTree};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Derived-permission engine for one mounted overlay
pub struct DerivedPermissions {
    config: MountConfig,
    registry: Arc<dyn AppIdRegistry>,
    lower: Arc<dyn LowerFs>,
    tree: NodeTree,
}

impl DerivedPermissions {
    /// Set up the engine for a mount whose root is backed by `lower_root`
    pub fn new(
        config: MountConfig,
        registry: Arc<dyn AppIdRegistry>,
        lower: Arc<dyn LowerFs>,
        lower_root: PathBuf,
    ) -> Self {
        let tree = NodeTree::new(config.root_state(), lower_root);
        Self {
            config,
            registry,
            lower,
            tree,
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn registry(&self) -> &dyn AppIdRegistry {
        self.registry.as_ref()
    }

    pub fn lower(&self) -> &dyn LowerFs {
        self.lower.as_ref()
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    fn fixup_context(&self) -> FixupContext<'_> {
        FixupContext {
            config: &self.config,
            registry: self.registry.as_ref(),
            lower: self.lower.as_ref(),
        }
    }

    /// State a new child `child_name` of a parent in `parent_state` gets
    pub fn derive_on_create(&self, parent_state: &DerivedState, child_name: &str) -> DerivedState {
        derive(parent_state, child_name, self.registry.as_ref())
    }

    /// Re-derive `node` as if it were named `name_source`.
    ///
    /// During a rename the new name is known before the node is moved: the
    /// node keeps its identity while its state is derived from the new name.
    pub fn derive_on_create_with_alias(
        &self,
        parent_state: &DerivedState,
        node: &Node,
        name_source: &str,
    ) -> DerivedState {
        let mut state = node.lock();
        *state = derive(parent_state, name_source, self.registry.as_ref());
        *state
    }

    /// Fix up the lower owner of `node`; the caller holds its state lock
    /// and passes the locked state.
    pub fn fixup_node(
        &self,
        node: &Node,
        state: &DerivedState,
    ) -> std::result::Result<FixupOutcome, FixupError> {
        self.fixup_named(node, state, &node.name())
    }

    fn fixup_named(
        &self,
        node: &Node,
        state: &DerivedState,
        name: &str,
    ) -> std::result::Result<FixupOutcome, FixupError> {
        if !self.config.gid_derivation_enabled {
            return Ok(FixupOutcome::Disabled);
        }
        let path = match self.lower_path(node) {
            Ok(path) => path,
            Err(e) => {
                debug!("no lower path for {:?}: {}", name, e);
                return Err(FixupError::Stat {
                    path: PathBuf::from(name),
                    source: std::io::Error::from_raw_os_error(libc::ENOENT),
                });
            }
        };
        fixup_lower_ownership(
            self.fixup_context(),
            state,
            node.is_dir(),
            name,
            &path,
            node.lower_lock(),
        )
    }

    /// Register a new child, derive its state and fix up its lower object.
    ///
    /// An OBB anchor is bound to the global OBB directory first; when that
    /// directory is missing the child is not created and the error reads as
    /// "not found".
    pub fn create(&self, parent: NodeId, name: &str, kind: NodeKind) -> Result<Arc<Node>> {
        let parent_node = self.tree.node(parent)?;
        let parent_state = parent_node.state();

        let state = self.derive_on_create(&parent_state, name);
        let node = self.tree.insert(parent, name, kind, state)?;

        if kind == NodeKind::Directory && self.needs_redirect(&parent_state, name) {
            let real = match self.lower_path(&parent_node) {
                Ok(path) => path.join(name),
                Err(e) => {
                    self.tree.remove(node.id())?;
                    return Err(e);
                }
            };
            if let Err(e) = self.bind_redirect(&node, &real) {
                self.tree.remove(node.id())?;
                return Err(e);
            }
        }

        {
            let guard = node.lock();
            // Fix-up failures never fail the create
            let _ = self.fixup_node(&node, &guard);
        }

        Ok(node)
    }

    /// Re-derive a node from its current parent and fix up its lower owner.
    ///
    /// The mount root keeps the state it was given at mount time.
    pub fn refresh(&self, id: NodeId) -> Result<DerivedState> {
        let node = match self.tree.get(id) {
            Some(node) => node,
            None => {
                error!("refresh: invalid node {}", id);
                return Err(Error::NodeNotFound(id));
            }
        };

        let parent_state = if node.is_root() {
            None
        } else {
            Some(self.tree.node(node.parent())?.state())
        };

        // An anchor whose binding was dropped is bound again before its
        // owner is touched
        if let Some(parent_state) = &parent_state {
            let bound = node.obb().is_bound();
            if !bound && node.is_dir() && self.needs_redirect(parent_state, &node.name()) {
                let parent = self.tree.node(node.parent())?;
                let real = self.lower_path(&parent)?.join(node.name());
                self.bind_redirect(&node, &real)?;
            }
        }

        let mut state = node.lock();
        if let Some(parent_state) = parent_state {
            *state = derive(&parent_state, &node.name(), self.registry.as_ref());
        }
        let _ = self.fixup_node(&node, &state);

        Ok(*state)
    }

    /// Move a node and re-derive it, and for directories its whole subtree.
    ///
    /// The lower object is expected to have been renamed by the caller.
    ///
    /// A directory moved onto an OBB anchor name is bound to the global OBB
    /// directory first, and nothing moves if that fails. A bound anchor
    /// moved anywhere else loses its binding.
    pub fn rename(&self, id: NodeId, new_parent: NodeId, new_name: &str) -> Result<DerivedState> {
        let node = self.tree.node(id)?;
        let parent_node = self.tree.node(new_parent)?;
        let parent_state = parent_node.state();

        let previous = self.redirect_of(&node);
        if node.is_dir() && self.needs_redirect(&parent_state, new_name) {
            let real = self.lower_path(&parent_node)?.join(new_name);
            self.bind_redirect(&node, &real)?;
        } else if previous.is_bound() {
            debug!("{:?} is no longer an obb anchor", new_name);
            self.invalidate_redirect(&node);
        }

        self.derive_on_create_with_alias(&parent_state, &node, new_name);
        if let Err(e) = self.tree.reparent(id, new_parent, new_name) {
            *node.obb() = previous;
            let _ = self.refresh(id);
            return Err(e);
        }

        let state = {
            let guard = node.lock();
            let _ = self.fixup_named(&node, &guard, new_name);
            *guard
        };

        if node.is_dir() {
            self.recursive_refresh(id)?;
        }

        Ok(state)
    }

    /// Mirror the lower tree below `id` into the overlay, deriving and
    /// fixing up each new node. OBB anchors without a global OBB directory
    /// are skipped. Returns the number of nodes created.
    pub fn populate(&self, id: NodeId) -> Result<usize> {
        let node = self.tree.node(id)?;
        let path = self.lower_path(&node)?;
        let mut created = 0;

        for entry in self.lower.read_dir(&path)? {
            let child = match self.tree.lookup(id, &entry.name) {
                Some(child) if child.kind() != entry.kind => {
                    warn!("{:?} changed type on the lower filesystem", entry.name);
                    continue;
                }
                Some(child) => child,
                None => match self.create(id, &entry.name, entry.kind) {
                    Ok(child) => {
                        created += 1;
                        child
                    }
                    Err(Error::RedirectUnresolvable(obb)) => {
                        warn!("skipping {:?}: global obb path {} is not available", entry.name, obb);
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };
            if child.is_dir() {
                created += self.populate(child.id())?;
            }
        }

        Ok(created)
    }

    /// Attributes the overlay reports for a node
    pub fn visible_attrs(&self, id: NodeId) -> Result<VisibleAttrs> {
        let node = self.tree.node(id)?;
        let state = node.state();
        let path = self.lower_path(&node)?;
        let attr = self
            .lower
            .getattr(&path)
            .map_err(|e| Error::PathNotFound(format!("{}: {}", path.display(), e)))?;
        Ok(visible_attrs(&state, attr.mode, &self.config))
    }
}
