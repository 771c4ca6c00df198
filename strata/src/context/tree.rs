//! Append-only context tree
//!
//! Nodes are `(attribute, value, parent)` triples kept in an arena indexed by
//! [`NodeId`]. Identical triples are interned, so threads entering the same
//! region share one node. Nodes are never mutated or removed; a [`NodeRef`] is
//! a shared handle that reads the node and walks its ancestry without locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::attribute::value::ValueKey;
use crate::attribute::{Attribute, Value};
use crate::domain::{AttributeId, NodeId};

/// One immutable node of the context tree
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    attribute: Attribute,
    value: Value,
    parent: Option<NodeRef>,
}

/// Shared handle to a context-tree node
#[derive(Clone)]
pub struct NodeRef(Arc<Node>);

impl NodeRef {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    #[must_use]
    pub fn attribute(&self) -> &Attribute {
        &self.0.attribute
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.0.value
    }

    #[must_use]
    pub fn parent(&self) -> Option<&NodeRef> {
        self.0.parent.as_ref()
    }

    /// Iterate from this node up to the root
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }

    /// Nodes from the root down to this node
    #[must_use]
    pub fn path(&self) -> Vec<NodeRef> {
        let mut path: Vec<NodeRef> = self.ancestors().cloned().collect();
        path.reverse();
        path
    }

    /// Nearest node (this one included) carrying `attr`
    #[must_use]
    pub fn find(&self, attr: &Attribute) -> Option<&NodeRef> {
        self.ancestors().find(|node| node.attribute() == attr)
    }

    /// Depth of this node; root-level nodes have depth 1
    #[must_use]
    pub fn depth(&self) -> usize {
        self.ancestors().count()
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for NodeRef {}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}={})", self.0.id, self.0.attribute.name(), self.0.value)
    }
}

/// Iterator over a node and its ancestors, leaf first
pub struct Ancestors<'a> {
    next: Option<&'a NodeRef>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a NodeRef;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.parent();
        Some(node)
    }
}

#[derive(PartialEq, Eq, Hash)]
struct NodeKey {
    parent: Option<NodeId>,
    attribute: AttributeId,
    value: ValueKey,
}

#[derive(Default)]
struct TreeState {
    nodes: Vec<NodeRef>,
    index: HashMap<NodeKey, NodeId>,
}

/// Arena of interned context-tree nodes
///
/// Only node creation is synchronized; reads go through [`NodeRef`].
#[derive(Default)]
pub struct ContextTree {
    state: Mutex<TreeState>,
}

impl ContextTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the child of `parent` holding `(attr, value)`, creating it if needed
    pub fn make_entry(&self, attr: &Attribute, value: Value, parent: Option<&NodeRef>) -> NodeRef {
        let key = NodeKey { parent: parent.map(NodeRef::id), attribute: attr.id(), value: value.key() };
        let mut state = self.state();

        if let Some(id) = state.index.get(&key) {
            return state.nodes[id.0 as usize].clone();
        }

        let id = NodeId(u32::try_from(state.nodes.len()).unwrap_or(u32::MAX));
        let node = NodeRef(Arc::new(Node { id, attribute: attr.clone(), value, parent: parent.cloned() }));

        state.nodes.push(node.clone());
        state.index.insert(key, id);
        node
    }

    /// Append a chain of `(attr, value)` entries below `parent`, returning the leaf
    pub fn make_path(&self, entries: &[(Attribute, Value)], parent: Option<&NodeRef>) -> Option<NodeRef> {
        let mut leaf = parent.cloned();
        for (attr, value) in entries {
            leaf = Some(self.make_entry(attr, value.clone(), leaf.as_ref()));
        }
        leaf
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<NodeRef> {
        self.state().nodes.get(id.0 as usize).cloned()
    }

    /// Number of nodes created so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
