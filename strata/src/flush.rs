//! # Asynchronous Flush Pipeline
//!
//! Turns a buffer of externally produced completion records into snapshot
//! records, one per completion record, delivered through the channel's
//! `process_snapshot` handlers.
//!
//! ## Per-record flow
//!
//! ```text
//! buffer ──▶ next_record() ──▶ decode() ──▶ take(corr id) ──▶ process_snapshot
//!              │ None             │ Skip        │ miss
//!              ▼                  ▼             ▼
//!         stop, report       skipped += 1   record without branch
//!         remaining bytes
//! ```
//!
//! The record layout is owned by the source, so walking the buffer goes
//! through [`RecordFormat::next_record`] rather than a fixed stride. The drain
//! runs on whatever thread delivers the buffer and never touches the
//! instrumented threads' cursors.

use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::Channel;
use crate::correlation::CorrelationStore;
use crate::domain::CorrelationId;
use crate::snapshot::{FixedSnapshot, SnapshotBuilder};

/// Capacity of records built from completion records
pub const FLUSH_RECORD_CAPACITY: usize = 8;

/// Outcome of decoding one completion record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Emit a record; its originating context is stored under this id
    Correlated(CorrelationId),
    /// Emit a record without inherited context
    Uncorrelated,
    /// Not a record this format reports on
    Skip,
}

/// Source-defined completion record layout
pub trait RecordFormat {
    /// Length of the record at the start of `rest`, or `None` if no record
    /// boundary can be determined
    fn next_record(&self, rest: &[u8]) -> Option<usize>;

    /// Decode `record`, appending its fields to `builder`
    fn decode(&self, record: &[u8], builder: &mut SnapshotBuilder<'_>) -> Decoded;
}

/// Result of draining one buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Completion records walked
    pub records: u64,
    /// Records delivered as snapshots
    pub flushed: u64,
    /// Records the format declined
    pub skipped: u64,
    /// Delivered records whose context could not be found
    pub uncorrelated: u64,
    /// Trailing bytes abandoned because the next boundary was unknown
    pub remaining_bytes: usize,
}

impl DrainSummary {
    /// True if the whole buffer was walked
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.remaining_bytes == 0
    }
}

/// Counter snapshot of a [`FlushPipeline`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Buffers drained
    pub flushes: u64,
    pub records: u64,
    pub flushed: u64,
    pub skipped: u64,
    /// Buffers abandoned part way through
    pub truncated_buffers: u64,
    /// Fields dropped from full records
    pub fields_dropped: u64,
}

/// Drains completion buffers into a channel
#[derive(Debug, Default)]
pub struct FlushPipeline {
    flushes: AtomicU64,
    records: AtomicU64,
    flushed: AtomicU64,
    skipped: AtomicU64,
    truncated_buffers: AtomicU64,
    fields_dropped: AtomicU64,
}

impl FlushPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `buffer` and deliver one snapshot per reportable record.
    ///
    /// Counters are updated even if the channel has no subscribers.
    pub fn drain<F: RecordFormat + ?Sized>(
        &self,
        channel: &Channel,
        correlations: &CorrelationStore,
        format: &F,
        buffer: &[u8],
    ) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let mut rest = buffer;

        while !rest.is_empty() {
            let Some(len) = format.next_record(rest).filter(|len| *len > 0 && *len <= rest.len())
            else {
                summary.remaining_bytes = rest.len();
                break;
            };
            let (record, tail) = rest.split_at(len);
            rest = tail;
            summary.records += 1;

            let mut snapshot = FixedSnapshot::<FLUSH_RECORD_CAPACITY>::new();
            let mut builder = snapshot.builder();

            let node = match format.decode(record, &mut builder) {
                Decoded::Skip => {
                    summary.skipped += 1;
                    continue;
                }
                Decoded::Uncorrelated => None,
                Decoded::Correlated(id) => correlations.take(id),
            };

            match node {
                Some(node) => {
                    let _ = builder.append_branch(node);
                }
                None => summary.uncorrelated += 1,
            }

            let view = builder.finalize();
            channel.process_snapshot(view);
            summary.flushed += 1;

            let dropped = snapshot.dropped();
            if dropped > 0 {
                channel.note_dropped(dropped);
                self.fields_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            }
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(summary.records, Ordering::Relaxed);
        self.flushed.fetch_add(summary.flushed, Ordering::Relaxed);
        self.skipped.fetch_add(summary.skipped, Ordering::Relaxed);

        if summary.is_complete() {
            debug!(
                "{}: flushed {} of {} records ({} skipped, {} without context)",
                channel.name(),
                summary.flushed,
                summary.records,
                summary.skipped,
                summary.uncorrelated
            );
        } else {
            self.truncated_buffers.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}: cannot find next record boundary after {} records; abandoning {} trailing bytes",
                channel.name(),
                summary.records,
                summary.remaining_bytes
            );
        }

        summary
    }

    #[must_use]
    pub fn stats(&self) -> FlushStats {
        FlushStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            truncated_buffers: self.truncated_buffers.load(Ordering::Relaxed),
            fields_dropped: self.fields_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttrFlags, AttrType, Attribute, Value};
    use crate::channel::Instrumentation;
    use crate::config::ChannelConfig;
    use crate::snapshot::OwnedSnapshot;
    use std::sync::{Arc, Mutex};

    /// `[len, kind, id]` triples; kind 0 = skip, 1 = correlated, 2 = uncorrelated
    struct Triples {
        value: Attribute,
    }

    impl RecordFormat for Triples {
        fn next_record(&self, rest: &[u8]) -> Option<usize> {
            rest.first().map(|len| usize::from(*len)).filter(|len| *len >= 3)
        }

        fn decode(&self, record: &[u8], builder: &mut SnapshotBuilder<'_>) -> Decoded {
            let id = u64::from(record[2]);
            match record[1] {
                1 => {
                    builder.append(&self.value, Value::Uint(id)).unwrap();
                    Decoded::Correlated(CorrelationId(id))
                }
                2 => {
                    builder.append(&self.value, Value::Uint(id)).unwrap();
                    Decoded::Uncorrelated
                }
                _ => Decoded::Skip,
            }
        }
    }

    fn setup() -> (Arc<Channel>, Triples, Arc<Mutex<Vec<OwnedSnapshot>>>) {
        let instr = Instrumentation::new();
        let value = instr.create_attribute("value", AttrType::Uint, AttrFlags::ASVALUE, &[]);
        let channel = instr.create_channel("flush", ChannelConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            channel.events().on_process_snapshot(move |_, rec| seen.lock().unwrap().push(rec.to_owned_snapshot()));
        }
        (channel, Triples { value }, seen)
    }

    #[test]
    fn test_empty_buffer_only_counts_the_flush() {
        let (channel, format, seen) = setup();
        let pipeline = FlushPipeline::new();
        let store = CorrelationStore::new();

        let summary = pipeline.drain(&channel, &store, &format, &[]);

        assert_eq!(summary, DrainSummary::default());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(pipeline.stats(), FlushStats { flushes: 1, ..FlushStats::default() });
        assert_eq!(store.stats(), Default::default());
    }

    #[test]
    fn test_skips_and_misses_are_counted() {
        let (channel, format, seen) = setup();
        let pipeline = FlushPipeline::new();
        let store = CorrelationStore::new();
        let region = channel.instrumentation().create_attribute("region", AttrType::Str, AttrFlags::NESTED, &[]);
        store.store(CorrelationId(7), channel.instrumentation().make_entry(&region, Value::from("k"), None));

        let buffer = [3, 1, 7, 3, 0, 0, 3, 1, 8, 3, 2, 9];
        let summary = pipeline.drain(&channel, &store, &format, &buffer);

        assert_eq!(summary.records, 4);
        assert_eq!(summary.flushed, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.uncorrelated, 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].get("region"), Some(&Value::from("k")));
        assert!(seen[1].branch().is_none());
        assert_eq!(store.stats().missed, 1);
    }

    #[test]
    fn test_unknown_boundary_abandons_remainder() {
        let (channel, format, seen) = setup();
        let pipeline = FlushPipeline::new();
        let store = CorrelationStore::new();

        let buffer = [3, 2, 1, 0, 9, 9];
        let summary = pipeline.drain(&channel, &store, &format, &buffer);

        assert_eq!(summary.flushed, 1);
        assert_eq!(summary.remaining_bytes, 3);
        assert!(!summary.is_complete());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(pipeline.stats().truncated_buffers, 1);
    }

    #[test]
    fn test_oversized_length_is_not_trusted() {
        let (channel, format, _seen) = setup();
        let pipeline = FlushPipeline::new();

        let summary = pipeline.drain(&channel, &CorrelationStore::new(), &format, &[200, 2, 1]);
        assert_eq!(summary.records, 0);
        assert_eq!(summary.remaining_bytes, 3);
    }
}
