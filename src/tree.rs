//! Generic ownership tree: arena-backed nodes, branches, and named groups.
//!
//! Nodes live in a [`Tree`] arena and are addressed by [`NodeId`] handles.
//! Parent links are plain indices, never a second ownership edge; the branch
//! owns its child list and attachment is exclusive. A [`Group`] keys the
//! top-level entry points of a forest by unique name and accepts a pluggable
//! validator on insertion.

use std::collections::HashMap;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Handle to a node inside a [`Tree`] arena.
///
/// Ids are only meaningful for the tree that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

/// What a node is: a terminal leaf carrying a payload, or a branch owning an
/// unordered collection of children.
#[derive(Debug, Clone)]
pub enum NodeKind<L> {
    Leaf(L),
    Branch(Vec<NodeId>),
}

#[derive(Debug, Clone)]
struct NodeData<L> {
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind<L>,
}

/// Arena of nodes forming one or more trees.
///
/// Detached nodes are simply left in place in the arena; they are small and
/// the arena lives only for one load/resolve/save cycle.
#[derive(Debug, Clone)]
pub struct Tree<L> {
    nodes: Vec<NodeData<L>>,
}

impl<L> Default for Tree<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> Tree<L> {
    pub fn new() -> Self {
        Tree { nodes: Vec::new() }
    }

    /// Create a detached leaf node.
    pub fn new_leaf(&mut self, name: impl Into<String>, payload: L) -> NodeId {
        self.push(name.into(), NodeKind::Leaf(payload))
    }

    /// Create a detached branch node with no children.
    pub fn new_branch(&mut self, name: impl Into<String>) -> NodeId {
        self.push(name.into(), NodeKind::Branch(Vec::new()))
    }

    fn push(&mut self, name: String, kind: NodeKind<L>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData {
            name,
            parent: None,
            kind,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if `id` was issued by this tree.
    pub fn contains_id(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) {
        self.nodes[id.0].name = name.into();
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind<L> {
        &self.nodes[id.0].kind
    }

    pub fn is_branch(&self, id: NodeId) -> bool {
        matches!(self.nodes[id.0].kind, NodeKind::Branch(_))
    }

    /// Leaf payload, `None` for branches.
    pub fn payload(&self, id: NodeId) -> Option<&L> {
        match &self.nodes[id.0].kind {
            NodeKind::Leaf(payload) => Some(payload),
            NodeKind::Branch(_) => None,
        }
    }

    pub fn payload_mut(&mut self, id: NodeId) -> Option<&mut L> {
        match &mut self.nodes[id.0].kind {
            NodeKind::Leaf(payload) => Some(payload),
            NodeKind::Branch(_) => None,
        }
    }

    /// Direct children of a branch; empty for leaves.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.nodes[id.0].kind {
            NodeKind::Branch(children) => children,
            NodeKind::Leaf(_) => &[],
        }
    }

    /// Attach `child` under `parent`.
    ///
    /// Fails with [`Error::NodeTaken`] if the child already has a parent and
    /// with [`Error::NotBranch`] if the target is a leaf. Attachment is
    /// exclusive: a node has at most one parent at any time.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<(), Error> {
        if !self.is_branch(parent) {
            return Err(Error::NotBranch(self.name(parent).to_string()));
        }
        if parent == child || self.nodes[child.0].parent.is_some() {
            return Err(Error::NodeTaken(self.name(child).to_string()));
        }
        if let NodeKind::Branch(children) = &mut self.nodes[parent.0].kind {
            children.push(child);
        }
        self.nodes[child.0].parent = Some(parent);
        Ok(())
    }

    /// Detach `child` from `parent`, failing with [`Error::NotChild`] if it
    /// is not a direct child.
    pub fn detach(&mut self, parent: NodeId, child: NodeId) -> Result<(), Error> {
        let present = match &self.nodes[parent.0].kind {
            NodeKind::Branch(children) => children.contains(&child),
            NodeKind::Leaf(_) => false,
        };
        if !present {
            return Err(Error::NotChild {
                parent: self.name(parent).to_string(),
                child: self.name(child).to_string(),
            });
        }
        if let NodeKind::Branch(children) = &mut self.nodes[parent.0].kind {
            children.retain(|&c| c != child);
        }
        self.nodes[child.0].parent = None;
        Ok(())
    }

    /// Detach every direct child of `branch`.
    pub fn clear(&mut self, branch: NodeId) -> Result<(), Error> {
        if !self.is_branch(branch) {
            return Err(Error::NotBranch(self.name(branch).to_string()));
        }
        for child in self.children(branch).to_vec() {
            self.detach(branch, child)?;
        }
        Ok(())
    }

    /// Pre-order traversal of the descendants of `start` (exclusive), with
    /// early termination when the visitor breaks.
    pub fn walk<B>(
        &self,
        start: NodeId,
        mut visitor: impl FnMut(NodeId) -> ControlFlow<B>,
    ) -> Option<B> {
        let mut stack: Vec<NodeId> = self.children(start).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if let ControlFlow::Break(found) = visitor(id) {
                return Some(found);
            }
            stack.extend(self.children(id).iter().rev());
        }
        None
    }

    /// All leaf descendants of `start`, in pre-order.
    pub fn leaves(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk::<()>(start, |id| {
            if !self.is_branch(id) {
                out.push(id);
            }
            ControlFlow::Continue(())
        });
        out
    }

    /// True if `node` is reachable from `start`.
    pub fn contains(&self, start: NodeId, node: NodeId) -> bool {
        self.walk(start, |id| {
            if id == node {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .is_some()
    }

    /// True if any leaf is reachable from `branch`.
    pub fn has_leaf(&self, branch: NodeId) -> bool {
        self.walk(branch, |id| {
            if !self.is_branch(id) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .is_some()
    }

    /// True if `branch` has any direct child.
    pub fn has_child(&self, branch: NodeId) -> bool {
        !self.children(branch).is_empty()
    }

    /// The root ancestor of `id` (the node itself if detached).
    pub fn top_parent(&self, id: NodeId) -> NodeId {
        let mut node = id;
        while let Some(parent) = self.parent(node) {
            node = parent;
        }
        node
    }
}

/// A set of top-level tree entry points keyed by unique name.
///
/// Iteration preserves insertion order so that emission stays deterministic.
#[derive(Debug, Clone, Default)]
pub struct Group {
    order: Vec<String>,
    map: HashMap<String, NodeId>,
}

impl Group {
    pub fn new() -> Self {
        Group::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.map.get(name).copied()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.order.iter().map(|name| (name.as_str(), self.map[name]))
    }

    /// Register `node` under its tree name.
    ///
    /// Duplicate names always fail with [`Error::DuplicateName`]; the
    /// validator runs after that check and may veto the insertion with any
    /// error of its own.
    pub fn add<L, V>(&mut self, tree: &Tree<L>, node: NodeId, validator: V) -> Result<(), Error>
    where
        V: FnOnce(&Tree<L>, NodeId, &Group) -> Result<(), Error>,
    {
        if !tree.contains_id(node) {
            return Err(Error::UnknownNode(format!("{node:?}")));
        }
        let name = tree.name(node).to_string();
        if self.map.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        validator(tree, node, self)?;
        self.order.push(name.clone());
        self.map.insert(name, node);
        Ok(())
    }

    /// Remove `node` from the group, detaching it from its parent first if it
    /// has one. Fails with [`Error::UnknownNode`] if the node is not a member.
    pub fn remove<L>(&mut self, tree: &mut Tree<L>, node: NodeId) -> Result<(), Error> {
        if !tree.contains_id(node) {
            return Err(Error::UnknownNode(format!("{node:?}")));
        }
        let name = self
            .order
            .iter()
            .find(|n| self.map[*n] == node)
            .cloned()
            .ok_or_else(|| Error::UnknownNode(tree.name(node).to_string()))?;
        if let Some(parent) = tree.parent(node) {
            tree.detach(parent, node)?;
        }
        self.map.remove(&name);
        self.order.retain(|n| *n != name);
        Ok(())
    }

    /// Re-parent `node` under `new_parent`.
    ///
    /// Fails if either endpoint is unknown to the tree or the new parent is
    /// not a branch. A node that was a top-level entry loses its entry, since
    /// it is now owned by the new parent.
    pub fn move_node<L>(
        &mut self,
        tree: &mut Tree<L>,
        node: NodeId,
        new_parent: NodeId,
    ) -> Result<(), Error> {
        if !tree.contains_id(node) || !tree.contains_id(new_parent) {
            return Err(Error::UnknownNode(format!("{node:?}")));
        }
        if !tree.is_branch(new_parent) {
            return Err(Error::NotBranch(tree.name(new_parent).to_string()));
        }
        if let Some(parent) = tree.parent(node) {
            tree.detach(parent, node)?;
        } else if let Some(name) = self.order.iter().find(|n| self.map[*n] == node).cloned() {
            self.map.remove(&name);
            self.order.retain(|n| *n != name);
        }
        tree.attach(new_parent, node)
    }

    /// Replace the entry `old` in place with two freshly named halves, as
    /// produced by a split. Returns false (and changes nothing) if `old` is
    /// not a member, which is the case when a split hits an unregistered
    /// candidate tree.
    pub fn replace_split(
        &mut self,
        old: &str,
        first: (String, NodeId),
        second: (String, NodeId),
    ) -> bool {
        let Some(pos) = self.order.iter().position(|n| n == old) else {
            return false;
        };
        self.map.remove(old);
        self.order
            .splice(pos..=pos, [first.0.clone(), second.0.clone()]);
        self.map.insert(first.0, first.1);
        self.map.insert(second.0, second.1);
        true
    }
}
