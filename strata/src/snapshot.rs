//! # Snapshot Records
//!
//! A snapshot is one emitted telemetry record: immediate `(attribute, value)`
//! fields plus references to context-tree branches whose ancestry the record
//! inherits. Records are built in a [`FixedSnapshot`], a fixed-capacity buffer
//! that lives on the stack and never reallocates. When the capacity is
//! reached, further entries are dropped, counted, and reported once per record.
//!
//! Subscribers receive a read-only [`SnapshotView`]; branches are shared
//! [`NodeRef`]s, so handing a view to many subscribers copies nothing.

use log::warn;

use crate::attribute::{Attribute, Value};
use crate::context::NodeRef;
use crate::domain::CapacityExceeded;

/// One snapshot entry
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    /// Field stored directly in the record
    Immediate(Attribute, Value),
    /// Inherited context branch (leaf node; ancestors are implied)
    Reference(NodeRef),
}

/// Fixed-capacity snapshot storage
pub struct FixedSnapshot<const N: usize> {
    slots: [Option<Entry>; N],
    len: usize,
    dropped: usize,
}

impl<const N: usize> FixedSnapshot<N> {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: std::array::from_fn(|_| None), len: 0, dropped: 0 }
    }

    /// Builder appending into this record
    pub fn builder(&mut self) -> SnapshotBuilder<'_> {
        SnapshotBuilder { slots: &mut self.slots, len: &mut self.len, dropped: &mut self.dropped }
    }

    #[must_use]
    pub fn view(&self) -> SnapshotView<'_> {
        SnapshotView { slots: &self.slots[..self.len] }
    }

    /// Entries rejected because the record was full
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl<const N: usize> Default for FixedSnapshot<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends entries to a fixed-capacity record
pub struct SnapshotBuilder<'a> {
    slots: &'a mut [Option<Entry>],
    len: &'a mut usize,
    dropped: &'a mut usize,
}

impl<'a> SnapshotBuilder<'a> {
    fn push(&mut self, entry: Entry) -> Result<(), CapacityExceeded> {
        let capacity = self.slots.len();
        if *self.len >= capacity {
            *self.dropped += 1;
            if *self.dropped == 1 {
                warn!("snapshot capacity of {capacity} entries exceeded; dropping entries");
            }
            return Err(CapacityExceeded { capacity });
        }

        self.slots[*self.len] = Some(entry);
        *self.len += 1;
        Ok(())
    }

    /// Add an immediate field
    pub fn append(&mut self, attr: &Attribute, value: Value) -> Result<(), CapacityExceeded> {
        self.push(Entry::Immediate(attr.clone(), value))
    }

    /// Add an inherited context branch
    pub fn append_branch(&mut self, node: NodeRef) -> Result<(), CapacityExceeded> {
        self.push(Entry::Reference(node))
    }

    /// Copy every entry of `view`. Keeps going after a capacity error so the
    /// dropped count is accurate, then reports the error.
    pub fn append_view(&mut self, view: SnapshotView<'_>) -> Result<(), CapacityExceeded> {
        let mut result = Ok(());
        for entry in view.iter() {
            if let Err(e) = self.push(entry.clone()) {
                result = Err(e);
            }
        }
        result
    }

    #[must_use]
    pub fn len(&self) -> usize {
        *self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn dropped(&self) -> usize {
        *self.dropped
    }

    /// Read-only view of what has been appended so far
    #[must_use]
    pub fn view(&self) -> SnapshotView<'_> {
        SnapshotView { slots: &self.slots[..*self.len] }
    }

    /// Finish building and keep a read-only view of the record
    #[must_use]
    pub fn finalize(self) -> SnapshotView<'a> {
        let slots: &'a [Option<Entry>] = self.slots;
        SnapshotView { slots: &slots[..*self.len] }
    }
}

/// Read-only view of a snapshot record
#[derive(Clone, Copy)]
pub struct SnapshotView<'a> {
    slots: &'a [Option<Entry>],
}

impl<'a> SnapshotView<'a> {
    /// A view with no entries
    #[must_use]
    pub fn empty() -> Self {
        SnapshotView { slots: &[] }
    }

    /// Entries in append order
    pub fn iter(&self) -> impl Iterator<Item = &'a Entry> + 'a {
        let slots = self.slots;
        slots.iter().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Immediate fields in append order
    pub fn immediates(&self) -> impl Iterator<Item = (&'a Attribute, &'a Value)> + 'a {
        self.iter().filter_map(|entry| match entry {
            Entry::Immediate(attr, value) => Some((attr, value)),
            Entry::Reference(_) => None,
        })
    }

    /// Inherited branches in append order
    pub fn references(&self) -> impl Iterator<Item = &'a NodeRef> + 'a {
        self.iter().filter_map(|entry| match entry {
            Entry::Reference(node) => Some(node),
            Entry::Immediate(..) => None,
        })
    }

    /// Value of `attr`: immediate fields first, then the nearest node on any branch
    #[must_use]
    pub fn get(&self, attr: &Attribute) -> Option<&'a Value> {
        self.immediates().find(|(a, _)| *a == attr).map(|(_, v)| v).or_else(|| {
            self.references().find_map(|node| node.find(attr)).map(NodeRef::value)
        })
    }

    /// Like [`SnapshotView::get`], by attribute name
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&'a Value> {
        self.immediates().find(|(a, _)| a.name() == name).map(|(_, v)| v).or_else(|| {
            self.references()
                .find_map(|node| node.ancestors().find(|n| n.attribute().name() == name))
                .map(NodeRef::value)
        })
    }

    /// Flatten into `(attribute, value)` pairs; branches expand root → leaf
    #[must_use]
    pub fn unpack(&self) -> Vec<(Attribute, Value)> {
        let mut out = Vec::with_capacity(self.len());
        for entry in self.iter() {
            match entry {
                Entry::Immediate(attr, value) => out.push((attr.clone(), value.clone())),
                Entry::Reference(node) => out.extend(
                    node.path().into_iter().map(|n| (n.attribute().clone(), n.value().clone())),
                ),
            }
        }
        out
    }

    /// Owned copy for subscribers that keep records beyond the callback
    #[must_use]
    pub fn to_owned_snapshot(&self) -> OwnedSnapshot {
        OwnedSnapshot { slots: self.slots.to_vec() }
    }
}

/// Heap copy of a snapshot record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnedSnapshot {
    slots: Vec<Option<Entry>>,
}

impl OwnedSnapshot {
    #[must_use]
    pub fn view(&self) -> SnapshotView<'_> {
        SnapshotView { slots: &self.slots }
    }

    /// Value of the attribute called `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.view().get_by_name(name)
    }

    /// Values of every node named `name` along inherited branches, root first
    #[must_use]
    pub fn path(&self, name: &str) -> Vec<Value> {
        self.view()
            .unpack()
            .into_iter()
            .filter(|(attr, _)| attr.name() == name)
            .map(|(_, value)| value)
            .collect()
    }

    /// Leaf node of the first inherited branch
    #[must_use]
    pub fn branch(&self) -> Option<&NodeRef> {
        self.view().references().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttrFlags, AttrType, AttributeRegistry};
    use crate::context::ContextTree;

    fn registry() -> AttributeRegistry {
        AttributeRegistry::new()
    }

    #[test]
    fn test_fields_keep_append_order() {
        let reg = registry();
        let attrs: Vec<_> = (0..5)
            .map(|i| reg.create_or_get(&format!("f{i}"), AttrType::Uint, AttrFlags::ASVALUE, &[]))
            .collect();

        let mut rec = FixedSnapshot::<8>::new();
        let mut builder = rec.builder();
        for (i, attr) in attrs.iter().enumerate() {
            builder.append(attr, Value::Uint(i as u64)).unwrap();
        }
        let view = builder.finalize();

        let names: Vec<_> = view.immediates().map(|(a, _)| a.name().to_string()).collect();
        assert_eq!(names, ["f0", "f1", "f2", "f3", "f4"]);
        assert_eq!(view.len(), 5);
    }

    #[test]
    fn test_capacity_exceeded_drops_and_counts() {
        let reg = registry();
        let attr = reg.create_or_get("x", AttrType::Uint, AttrFlags::ASVALUE, &[]);

        let mut rec = FixedSnapshot::<2>::new();
        {
            let mut builder = rec.builder();
            assert!(builder.append(&attr, Value::Uint(1)).is_ok());
            assert!(builder.append(&attr, Value::Uint(2)).is_ok());
            assert_eq!(builder.append(&attr, Value::Uint(3)), Err(CapacityExceeded { capacity: 2 }));
            assert_eq!(builder.append(&attr, Value::Uint(4)), Err(CapacityExceeded { capacity: 2 }));
        }

        assert_eq!(rec.view().len(), 2);
        assert_eq!(rec.dropped(), 2);
    }

    #[test]
    fn test_branch_lookup_and_unpack() {
        let reg = registry();
        let region = reg.create_or_get("region", AttrType::Str, AttrFlags::NESTED, &[]);
        let duration = reg.create_or_get("duration", AttrType::Uint, AttrFlags::ASVALUE, &[]);
        let tree = ContextTree::new();
        let outer = tree.make_entry(&region, Value::from("main"), None);
        let leaf = tree.make_entry(&region, Value::from("solve"), Some(&outer));

        let mut rec = FixedSnapshot::<4>::new();
        let mut builder = rec.builder();
        builder.append(&duration, Value::Uint(500)).unwrap();
        builder.append_branch(leaf.clone()).unwrap();
        let view = builder.finalize();

        assert_eq!(view.get(&duration), Some(&Value::Uint(500)));
        assert_eq!(view.get(&region), Some(&Value::from("solve")));
        assert_eq!(view.references().next(), Some(&leaf));

        let unpacked: Vec<_> = view.unpack().into_iter().map(|(a, v)| format!("{a}={v}")).collect();
        assert_eq!(unpacked, ["duration=500", "region=main", "region=solve"]);

        let owned = view.to_owned_snapshot();
        assert_eq!(owned.path("region"), [Value::from("main"), Value::from("solve")]);
        assert_eq!(owned.get("duration"), Some(&Value::Uint(500)));
    }

    #[test]
    fn test_append_view_merges_entries() {
        let reg = registry();
        let attr = reg.create_or_get("x", AttrType::Uint, AttrFlags::ASVALUE, &[]);

        let mut first = FixedSnapshot::<4>::new();
        first.builder().append(&attr, Value::Uint(1)).unwrap();

        let mut second = FixedSnapshot::<1>::new();
        second.builder().append_view(first.view()).unwrap();
        assert_eq!(second.view().get(&attr), Some(&Value::Uint(1)));

        assert!(second.builder().append_view(first.view()).is_err());
        assert_eq!(second.dropped(), 1);
    }

    #[test]
    fn test_empty_view() {
        let view = SnapshotView::empty();
        assert!(view.is_empty());
        assert!(view.unpack().is_empty());
    }
}
