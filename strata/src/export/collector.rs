//! In-memory record collection

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::Channel;
use crate::snapshot::OwnedSnapshot;

/// Keeps an owned copy of every record a channel processes
#[derive(Clone, Default)]
pub struct SnapshotCollector {
    records: Arc<Mutex<Vec<OwnedSnapshot>>>,
}

impl SnapshotCollector {
    /// Attach a new collector to `channel`
    pub fn register(channel: &Channel) -> Self {
        let collector = Self::default();
        {
            let collector = collector.clone();
            channel.events().on_process_snapshot(move |_, record| {
                collector.guard().push(record.to_owned_snapshot());
            });
        }
        collector
    }

    fn guard(&self) -> MutexGuard<'_, Vec<OwnedSnapshot>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of everything collected so far, in delivery order
    #[must_use]
    pub fn records(&self) -> Vec<OwnedSnapshot> {
        self.guard().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Remove and return everything collected so far
    pub fn take(&self) -> Vec<OwnedSnapshot> {
        std::mem::take(&mut *self.guard())
    }
}
