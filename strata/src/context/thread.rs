//! Per-thread context cursor
//!
//! A [`ThreadContext`] holds one thread's current position in the context
//! tree. `begin` pushes a child node and makes it current, `end` pops back to
//! the parent. Only the innermost open scope can be ended; anything else is a
//! caller bug and is returned as a [`ScopeMismatchError`].

use std::sync::Arc;

use super::tree::{ContextTree, NodeRef};
use crate::attribute::{Attribute, Value};
use crate::domain::ScopeMismatchError;

/// One thread's nested attribute state
pub struct ThreadContext {
    tree: Arc<ContextTree>,
    current: Option<NodeRef>,
}

impl ThreadContext {
    #[must_use]
    pub fn new(tree: Arc<ContextTree>) -> Self {
        Self { tree, current: None }
    }

    /// Open a nested `(attr, value)` scope and return its node
    pub fn begin(&mut self, attr: &Attribute, value: Value) -> NodeRef {
        let node = self.tree.make_entry(attr, value, self.current.as_ref());
        self.current = Some(node.clone());
        node
    }

    /// Close the innermost scope, which must belong to `attr`.
    ///
    /// Returns the node that was closed. On mismatch the context is unchanged.
    pub fn end(&mut self, attr: &Attribute) -> Result<NodeRef, ScopeMismatchError> {
        match self.current.take() {
            Some(node) if node.attribute() == attr => {
                self.current = node.parent().cloned();
                Ok(node)
            }
            other => {
                let open = other.as_ref().map(|node| node.attribute().name().to_string());
                self.current = other;
                Err(ScopeMismatchError { attribute: attr.name().to_string(), open })
            }
        }
    }

    /// Innermost node, i.e. the leaf of the root→leaf path
    #[must_use]
    pub fn current(&self) -> Option<NodeRef> {
        self.current.clone()
    }

    /// Nearest open scope of `attr`
    #[must_use]
    pub fn get(&self, attr: &Attribute) -> Option<NodeRef> {
        self.current.as_ref().and_then(|node| node.find(attr)).cloned()
    }

    /// Number of open scopes
    #[must_use]
    pub fn depth(&self) -> usize {
        self.current.as_ref().map_or(0, NodeRef::depth)
    }

    #[must_use]
    pub fn tree(&self) -> &Arc<ContextTree> {
        &self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttrFlags, AttrType, AttributeRegistry};

    fn setup() -> (ThreadContext, Attribute, Attribute) {
        let registry = AttributeRegistry::new();
        let region = registry.create_or_get("region", AttrType::Str, AttrFlags::NESTED, &[]);
        let phase = registry.create_or_get("phase", AttrType::Str, AttrFlags::DEFAULT, &[]);
        (ThreadContext::new(Arc::new(ContextTree::new())), region, phase)
    }

    #[test]
    fn test_begin_end_restores_previous_context() {
        let (mut ctx, region, phase) = setup();

        ctx.begin(&region, Value::from("main"));
        let before = ctx.current();

        ctx.begin(&phase, Value::from("init"));
        ctx.begin(&region, Value::from("inner"));
        assert_eq!(ctx.depth(), 3);

        ctx.end(&region).unwrap();
        ctx.end(&phase).unwrap();
        assert_eq!(ctx.current(), before);
    }

    #[test]
    fn test_end_of_non_innermost_scope_is_rejected() {
        let (mut ctx, region, phase) = setup();

        ctx.begin(&region, Value::from("main"));
        ctx.begin(&phase, Value::from("init"));
        let before = ctx.current();

        let err = ctx.end(&region).unwrap_err();
        assert_eq!(err.attribute, "region");
        assert_eq!(err.open.as_deref(), Some("phase"));
        assert_eq!(ctx.current(), before);
    }

    #[test]
    fn test_end_without_open_scope() {
        let (mut ctx, region, _) = setup();
        let err = ctx.end(&region).unwrap_err();
        assert_eq!(err.open, None);
        assert!(ctx.current().is_none());
    }

    #[test]
    fn test_get_finds_nearest_scope() {
        let (mut ctx, region, phase) = setup();
        ctx.begin(&region, Value::from("outer"));
        ctx.begin(&phase, Value::from("p"));
        ctx.begin(&region, Value::from("inner"));
        ctx.begin(&phase, Value::from("q"));

        assert_eq!(ctx.get(&region).map(|n| n.value().to_string()), Some("inner".to_string()));
    }
}
