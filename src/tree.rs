//! Overlay node arena
//!
//! Nodes are addressed by stable ids. Each node carries two independent
//! guards: the state lock protecting its derived state (and the fix-up
//! read-modify-write of its lower object), and a lightweight guard over its
//! OBB binding.

use crate::derived::{DerivedState, ObbBinding};
use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type NodeId = u64;

/// Id of the mount root
pub const ROOT_ID: NodeId = 1;

/// File type of an overlay node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

impl From<std::fs::FileType> for NodeKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            NodeKind::Directory
        } else {
            NodeKind::File
        }
    }
}

#[derive(Debug, Clone)]
struct NodeLink {
    parent: NodeId,
    name: String,
}

/// An entry of the overlay
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    link: RwLock<NodeLink>,
    state: Mutex<DerivedState>,
    obb: Mutex<ObbBinding>,
    /// Serializes ownership changes of the lower object
    lower_lock: Mutex<()>,
}

impl Node {
    fn new(id: NodeId, parent: NodeId, name: String, kind: NodeKind, state: DerivedState) -> Self {
        Self {
            id,
            kind,
            link: RwLock::new(NodeLink { parent, name }),
            state: Mutex::new(state),
            obb: Mutex::new(ObbBinding::default()),
            lower_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub fn parent(&self) -> NodeId {
        self.link.read().parent
    }

    pub fn name(&self) -> String {
        self.link.read().name.clone()
    }

    /// Take the node's exclusive state lock
    pub fn lock(&self) -> MutexGuard<'_, DerivedState> {
        self.state.lock()
    }

    /// Copy of the current derived state
    pub fn state(&self) -> DerivedState {
        *self.state.lock()
    }

    pub(crate) fn obb(&self) -> MutexGuard<'_, ObbBinding> {
        self.obb.lock()
    }

    pub(crate) fn lower_lock(&self) -> &Mutex<()> {
        &self.lower_lock
    }
}

/// Arena of overlay nodes
pub struct NodeTree {
    next_id: AtomicU64,
    root: Arc<Node>,
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    /// Parent id -> (name -> child id)
    children: RwLock<HashMap<NodeId, BTreeMap<String, NodeId>>>,
    /// Lower path backing the root
    lower_root: PathBuf,
}

impl NodeTree {
    pub fn new(root_state: DerivedState, lower_root: PathBuf) -> Self {
        let root = Arc::new(Node::new(
            ROOT_ID,
            ROOT_ID,
            String::new(),
            NodeKind::Directory,
            root_state,
        ));

        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, Arc::clone(&root));

        Self {
            next_id: AtomicU64::new(ROOT_ID + 1),
            root,
            nodes: RwLock::new(nodes),
            children: RwLock::new(HashMap::new()),
            lower_root,
        }
    }

    pub fn lower_root(&self) -> &Path {
        &self.lower_root
    }

    pub fn root(&self) -> Arc<Node> {
        Arc::clone(&self.root)
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.read().get(&id).cloned()
    }

    /// Get a node or report it as missing
    pub fn node(&self, id: NodeId) -> Result<Arc<Node>> {
        self.get(id).ok_or(Error::NodeNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new child with an already derived state
    pub fn insert(
        &self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        state: DerivedState,
    ) -> Result<Arc<Node>> {
        let parent_node = self.node(parent)?;
        if !parent_node.is_dir() {
            return Err(Error::Internal(format!(
                "cannot add {:?} under non-directory {}",
                name, parent
            )));
        }

        let mut children = self.children.write();
        let siblings = children.entry(parent).or_default();
        if siblings.contains_key(name) {
            return Err(Error::Internal(format!(
                "{:?} already exists under {}",
                name, parent
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(Node::new(id, parent, name.to_string(), kind, state));
        siblings.insert(name.to_string(), id);
        self.nodes.write().insert(id, Arc::clone(&node));

        Ok(node)
    }

    pub fn lookup(&self, parent: NodeId, name: &str) -> Option<Arc<Node>> {
        let id = self.children.read().get(&parent)?.get(name).copied()?;
        self.get(id)
    }

    /// Direct children in name order
    pub fn children_of(&self, id: NodeId) -> Vec<Arc<Node>> {
        let ids: Vec<NodeId> = match self.children.read().get(&id) {
            Some(map) => map.values().copied().collect(),
            None => return Vec::new(),
        };
        let nodes = self.nodes.read();
        ids.iter().filter_map(|i| nodes.get(i).cloned()).collect()
    }

    /// Resolve a path relative to the overlay root
    pub fn resolve(&self, path: &Path) -> Option<Arc<Node>> {
        let mut node = self.root();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => continue,
                Component::Normal(name) => {
                    node = self.lookup(node.id(), &name.to_string_lossy())?;
                }
                _ => return None,
            }
        }
        Some(node)
    }

    /// Overlay path of a node
    pub fn path_of(&self, id: NodeId) -> Result<PathBuf> {
        let mut names = Vec::new();
        let mut current = self.node(id)?;
        while !current.is_root() {
            names.push(current.name());
            current = self.node(current.parent())?;
        }
        let mut path = PathBuf::from("/");
        for name in names.iter().rev() {
            path.push(name);
        }
        Ok(path)
    }

    /// Move a node under a new parent and name
    pub fn reparent(&self, id: NodeId, new_parent: NodeId, new_name: &str) -> Result<()> {
        if id == ROOT_ID {
            return Err(Error::Internal("cannot move the root".to_string()));
        }
        let node = self.node(id)?;
        let target = self.node(new_parent)?;
        if !target.is_dir() {
            return Err(Error::Internal(format!("{} is not a directory", new_parent)));
        }

        // Refuse to move a directory into its own subtree.
        let mut cursor = target;
        while !cursor.is_root() {
            if cursor.id() == id {
                return Err(Error::Internal(format!("cannot move {} into itself", id)));
            }
            cursor = self.node(cursor.parent())?;
        }

        let mut children = self.children.write();
        if let Some(existing) = children.get(&new_parent).and_then(|m| m.get(new_name)) {
            if *existing != id {
                return Err(Error::Internal(format!(
                    "{:?} already exists under {}",
                    new_name, new_parent
                )));
            }
        }

        let mut link = node.link.write();
        if let Some(siblings) = children.get_mut(&link.parent) {
            siblings.remove(&link.name);
        }
        children
            .entry(new_parent)
            .or_default()
            .insert(new_name.to_string(), id);
        link.parent = new_parent;
        link.name = new_name.to_string();

        Ok(())
    }

    /// Remove a node and its whole subtree
    pub fn remove(&self, id: NodeId) -> Result<Arc<Node>> {
        if id == ROOT_ID {
            return Err(Error::Internal("cannot remove the root".to_string()));
        }
        let node = self.node(id)?;

        let mut pending = vec![id];
        let mut doomed = Vec::new();
        {
            let children = self.children.read();
            while let Some(current) = pending.pop() {
                doomed.push(current);
                if let Some(map) = children.get(&current) {
                    pending.extend(map.values().copied());
                }
            }
        }

        let mut children = self.children.write();
        if let Some(siblings) = children.get_mut(&node.parent()) {
            siblings.remove(&node.name());
        }
        let mut nodes = self.nodes.write();
        for doomed_id in doomed {
            children.remove(&doomed_id);
            nodes.remove(&doomed_id);
        }

        Ok(node)
    }
}
