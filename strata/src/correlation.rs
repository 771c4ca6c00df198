//! # Correlation Store
//!
//! Links the context captured when an asynchronous operation starts (on the
//! instrumented thread) to its completion record (delivered later, usually on
//! a thread owned by the event source).
//!
//! This is the only structure in the core that is shared across threads for
//! writing; a single mutex guards the map, which makes `store`/`take` on the
//! same id linearizable. A `take` racing ahead of a late `store` observes a
//! miss; the late entry then stays until teardown, where `abandon` counts it.
//!
//! ```text
//! app thread                 source thread
//! ──────────                 ─────────────
//! begin(api, "launch")
//! store(42, node) ─────┐
//! end(api)             │
//!                      └───▶ take(42) → Some(node)   found += 1
//!                            take(42) → None         missed += 1
//! ```

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::context::NodeRef;
use crate::domain::CorrelationId;

/// Counter snapshot of a [`CorrelationStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub stored: u64,
    pub found: u64,
    pub missed: u64,
    /// Stores that replaced a still-pending entry for the same id
    pub duplicates: u64,
}

/// Mutex-guarded map from correlation id to the originating context node
#[derive(Default)]
pub struct CorrelationStore {
    entries: Mutex<HashMap<CorrelationId, NodeRef>>,
    stored: AtomicU64,
    found: AtomicU64,
    missed: AtomicU64,
    duplicates: AtomicU64,
}

impl CorrelationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CorrelationId, NodeRef>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember `node` for `id`, replacing a stale entry with the same id.
    ///
    /// A replacement means the source reused an id before its completion was
    /// delivered; it is reported and counted but not treated as fatal.
    pub fn store(&self, id: CorrelationId, node: NodeRef) {
        let previous = self.entries().insert(id, node);
        self.stored.fetch_add(1, Ordering::Relaxed);

        if previous.is_some() {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            warn!("correlation {id} stored twice before completion; replacing stale entry");
        }
    }

    /// Remove and return the entry for `id`, if any
    pub fn take(&self, id: CorrelationId) -> Option<NodeRef> {
        let node = self.entries().remove(&id);

        if node.is_some() {
            self.found.fetch_add(1, Ordering::Relaxed);
        } else {
            self.missed.fetch_add(1, Ordering::Relaxed);
            debug!("no context stored for {id}");
        }
        node
    }

    /// Number of entries still waiting for a completion record
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries().len()
    }

    /// Drop all pending entries, counting each as missed. Returns how many.
    pub fn abandon(&self) -> usize {
        let orphaned = {
            let mut entries = self.entries();
            let count = entries.len();
            entries.clear();
            count
        };

        self.missed.fetch_add(orphaned as u64, Ordering::Relaxed);
        orphaned
    }

    #[must_use]
    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            stored: self.stored.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttrFlags, AttrType, AttributeRegistry, Value};
    use crate::context::ContextTree;
    use std::sync::Arc;

    fn node(name: &str) -> NodeRef {
        let registry = AttributeRegistry::new();
        let attr = registry.create_or_get("kernel", AttrType::Str, AttrFlags::DEFAULT, &[]);
        ContextTree::new().make_entry(&attr, Value::from(name), None)
    }

    #[test]
    fn test_take_after_store_returns_node_once() {
        let store = CorrelationStore::new();
        let n = node("matmul");

        store.store(CorrelationId(42), n.clone());
        assert_eq!(store.take(CorrelationId(42)), Some(n));
        assert_eq!(store.take(CorrelationId(42)), None);

        let stats = store.stats();
        assert_eq!((stats.stored, stats.found, stats.missed), (1, 1, 1));
    }

    #[test]
    fn test_take_of_unknown_id_counts_one_miss_per_call() {
        let store = CorrelationStore::new();
        assert!(store.take(CorrelationId(99)).is_none());
        assert!(store.take(CorrelationId(99)).is_none());
        assert_eq!(store.stats().missed, 2);
        assert_eq!(store.stats().found, 0);
    }

    #[test]
    fn test_duplicate_store_overwrites() {
        let store = CorrelationStore::new();
        let first = node("a");
        let second = node("b");

        store.store(CorrelationId(1), first);
        store.store(CorrelationId(1), second.clone());

        assert_eq!(store.pending(), 1);
        assert_eq!(store.take(CorrelationId(1)), Some(second));
        assert_eq!(store.stats().duplicates, 1);
        assert_eq!(store.stats().stored, 2);
    }

    #[test]
    fn test_abandon_counts_orphans_as_missed() {
        let store = CorrelationStore::new();
        store.store(CorrelationId(1), node("a"));
        store.store(CorrelationId(2), node("b"));

        assert_eq!(store.abandon(), 2);
        assert_eq!(store.pending(), 0);
        assert_eq!(store.stats().missed, 2);
    }

    #[test]
    fn test_concurrent_store_and_take_deliver_each_id_once() {
        let store = Arc::new(CorrelationStore::new());
        let n = node("k");

        let producer = {
            let store = Arc::clone(&store);
            let n = n.clone();
            std::thread::spawn(move || {
                for id in 0..1000 {
                    store.store(CorrelationId(id), n.clone());
                }
            })
        };
        producer.join().unwrap();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..1000).filter(|id| store.take(CorrelationId(*id)).is_some()).count()
                })
            })
            .collect();

        let delivered: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(delivered, 1000);
        assert_eq!(store.stats().found, 1000);
        assert_eq!(store.stats().missed, 3000);
    }
}
