//! Allocator statistics
//!
//! Adds process-wide allocation totals to every channel snapshot. With
//! `per_allocator_statistics`, each snapshot also produces one record per
//! allocator that goes straight to `process_snapshot`, carrying the
//! snapshot's trigger info and context. Those records skip the `snapshot`
//! event so repeated snapshots at the same spot are not amplified.

use log::info;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::attribute::{AttrFlags, AttrType, Attribute, Value};
use crate::channel::{Channel, Instrumentation};
use crate::context::ThreadContext;
use crate::snapshot::{FixedSnapshot, SnapshotBuilder, SnapshotView};

const SERVICE: &str = "allocator";

/// Capacity of per-allocator records
pub const ALLOCATOR_RECORD_CAPACITY: usize = 64;

/// Context copied into each per-allocator record; leaves room for its fields
const CONTEXT_CAPACITY: usize = ALLOCATOR_RECORD_CAPACITY - 4;

/// Statistics of one named allocator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub name: String,
    /// Bytes reserved from the system
    pub actual_size: u64,
    /// Bytes currently handed out
    pub current_size: u64,
    pub high_watermark: u64,
    pub allocation_count: u64,
}

/// Something that can list its allocators
pub trait AllocatorSource: Send + Sync {
    fn allocators(&self) -> Vec<AllocatorStats>;
}

/// Thread-safe in-memory allocator bookkeeping
#[derive(Debug, Default)]
pub struct AllocatorTable {
    allocators: Mutex<BTreeMap<String, AllocatorStats>>,
}

impl AllocatorTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocators_guard(&self) -> MutexGuard<'_, BTreeMap<String, AllocatorStats>> {
        self.allocators.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_allocator<R>(&self, name: &str, f: impl FnOnce(&mut AllocatorStats) -> R) -> R {
        let mut allocators = self.allocators_guard();
        let stats = allocators
            .entry(name.to_string())
            .or_insert_with(|| AllocatorStats { name: name.to_string(), ..AllocatorStats::default() });
        f(stats)
    }

    /// Record an allocation of `bytes` from `name`, creating the allocator on first use
    pub fn allocate(&self, name: &str, bytes: u64) {
        self.with_allocator(name, |stats| {
            stats.current_size = stats.current_size.saturating_add(bytes);
            stats.actual_size = stats.actual_size.max(stats.current_size);
            stats.high_watermark = stats.high_watermark.max(stats.current_size);
            stats.allocation_count = stats.allocation_count.saturating_add(1);
        });
    }

    /// Record a release of `bytes` back to `name`
    pub fn deallocate(&self, name: &str, bytes: u64) {
        self.with_allocator(name, |stats| {
            stats.current_size = stats.current_size.saturating_sub(bytes);
            stats.allocation_count = stats.allocation_count.saturating_sub(1);
        });
    }

    /// Replace the statistics of `stats.name`
    pub fn set(&self, stats: AllocatorStats) {
        self.allocators_guard().insert(stats.name.clone(), stats);
    }
}

impl AllocatorSource for AllocatorTable {
    fn allocators(&self) -> Vec<AllocatorStats> {
        self.allocators_guard().values().cloned().collect()
    }
}

struct AllocatorAttributes {
    name: Attribute,
    actual_size: Attribute,
    current_size: Attribute,
    high_watermark: Attribute,
    count: Attribute,
    total_size: Attribute,
    total_count: Attribute,
}

impl AllocatorAttributes {
    fn create(instr: &Instrumentation) -> Self {
        let aggregatable = [(instr.builtins().class_aggregatable.clone(), Value::Bool(true))];
        let stat = |name: &str| {
            instr.create_attribute(name, AttrType::Uint, AttrFlags::ASVALUE | AttrFlags::SKIP_EVENTS, &aggregatable)
        };

        Self {
            name: instr.create_attribute("alloc.name", AttrType::Str, AttrFlags::SKIP_EVENTS, &[]),
            actual_size: stat("alloc.actual.size"),
            current_size: stat("alloc.current.size"),
            high_watermark: stat("alloc.highwatermark"),
            count: stat("alloc.count"),
            total_size: stat("alloc.total.size"),
            total_count: stat("alloc.total.count"),
        }
    }
}

/// Allocator statistics service
pub struct AllocatorService {
    source: Arc<dyn AllocatorSource>,
    attrs: AllocatorAttributes,
    per_allocator: bool,
}

impl AllocatorService {
    /// Subscribe the service to `channel`'s `snapshot` event
    pub fn register(channel: &Arc<Channel>, source: Arc<dyn AllocatorSource>) {
        let service = Arc::new(Self {
            source,
            attrs: AllocatorAttributes::create(channel.instrumentation()),
            per_allocator: channel.config().allocator.per_allocator_statistics,
        });

        {
            let service = Arc::clone(&service);
            channel.events().on_snapshot(move |ch, ctx, trigger, builder| service.snapshot(ch, ctx, trigger, builder));
        }
        channel.events().on_finish(|ch| info!("{}: finished {SERVICE} service", ch.name()));

        info!("{}: registered {SERVICE} service", channel.name());
    }

    fn snapshot(&self, channel: &Channel, ctx: &ThreadContext, trigger: SnapshotView<'_>, rec: &mut SnapshotBuilder<'_>) {
        let mut context = FixedSnapshot::<CONTEXT_CAPACITY>::new();
        if self.per_allocator {
            let mut builder = context.builder();
            let _ = builder.append_view(trigger);
            channel.pull_context(ctx, &mut builder);
        }

        let mut total_size = 0u64;
        let mut total_count = 0u64;

        for stats in self.source.allocators() {
            total_size = total_size.saturating_add(stats.current_size);
            total_count = total_count.saturating_add(stats.allocation_count);

            if self.per_allocator {
                self.emit_allocator(channel, &stats, context.view());
            }
        }

        let _ = rec.append(&self.attrs.total_size, Value::Uint(total_size));
        let _ = rec.append(&self.attrs.total_count, Value::Uint(total_count));
    }

    fn emit_allocator(&self, channel: &Channel, stats: &AllocatorStats, context: SnapshotView<'_>) {
        let mut record = FixedSnapshot::<ALLOCATOR_RECORD_CAPACITY>::new();
        {
            let mut builder = record.builder();
            let _ = builder.append_view(context);
            let a = &self.attrs;
            for (attr, value) in [
                (&a.name, Value::from(stats.name.as_str())),
                (&a.actual_size, Value::Uint(stats.actual_size)),
                (&a.current_size, Value::Uint(stats.current_size)),
                (&a.high_watermark, Value::Uint(stats.high_watermark)),
                (&a.count, Value::Uint(stats.allocation_count)),
            ] {
                if builder.append(attr, value).is_err() {
                    break;
                }
            }
        }

        channel.process_snapshot(record.view());
        channel.note_dropped(record.dropped());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::export::SnapshotCollector;

    fn table() -> Arc<AllocatorTable> {
        let table = Arc::new(AllocatorTable::new());
        table.allocate("device", 1024);
        table.allocate("device", 512);
        table.deallocate("device", 512);
        table.allocate("host", 64);
        table
    }

    #[test]
    fn test_table_tracks_high_watermark() {
        let allocators = table().allocators();
        assert_eq!(allocators.len(), 2);
        assert_eq!(allocators[0].name, "device");
        assert_eq!(allocators[0].current_size, 1024);
        assert_eq!(allocators[0].high_watermark, 1536);
        assert_eq!(allocators[0].allocation_count, 1);
    }

    #[test]
    fn test_snapshot_gets_totals_and_per_allocator_records() {
        let instr = Instrumentation::new();
        let channel = instr.create_channel("test", ChannelConfig::default());
        let region = instr.create_attribute("region", AttrType::Str, AttrFlags::NESTED, &[]);
        AllocatorService::register(&channel, table());
        let collector = SnapshotCollector::register(&channel);
        channel.init();

        let mut ctx = instr.thread_context();
        ctx.begin(&region, Value::from("step"));
        channel.push_snapshot(&ctx, SnapshotView::empty());

        let records = collector.records();
        assert_eq!(records.len(), 3);

        let device = &records[0];
        assert_eq!(device.get("alloc.name"), Some(&Value::from("device")));
        assert_eq!(device.get("alloc.highwatermark"), Some(&Value::Uint(1536)));
        assert_eq!(device.get("region"), Some(&Value::from("step")));

        let snapshot = &records[2];
        assert_eq!(snapshot.get("alloc.total.size"), Some(&Value::Uint(1088)));
        assert_eq!(snapshot.get("alloc.total.count"), Some(&Value::Uint(2)));
        assert!(snapshot.get("alloc.name").is_none());
    }

    #[test]
    fn test_oversized_totals_saturate() {
        let table = Arc::new(AllocatorTable::new());
        table.allocate("device", u64::MAX - 1);
        table.allocate("device", 16);
        table.set(AllocatorStats { name: "host".to_string(), current_size: 8, ..AllocatorStats::default() });
        assert_eq!(table.allocators()[0].current_size, u64::MAX);

        let instr = Instrumentation::new();
        let mut config = ChannelConfig::default();
        config.allocator.per_allocator_statistics = false;
        let channel = instr.create_channel("test", config);
        AllocatorService::register(&channel, table);
        let collector = SnapshotCollector::register(&channel);
        channel.init();

        channel.push_snapshot(&instr.thread_context(), SnapshotView::empty());

        let records = collector.records();
        assert_eq!(records[0].get("alloc.total.size"), Some(&Value::Uint(u64::MAX)));
        assert_eq!(records[0].get("alloc.total.count"), Some(&Value::Uint(2)));
    }

    #[test]
    fn test_per_allocator_records_can_be_disabled() {
        let instr = Instrumentation::new();
        let mut config = ChannelConfig::default();
        config.allocator.per_allocator_statistics = false;
        let channel = instr.create_channel("test", config);
        AllocatorService::register(&channel, table());
        let collector = SnapshotCollector::register(&channel);
        channel.init();

        channel.push_snapshot(&instr.thread_context(), SnapshotView::empty());

        let records = collector.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("alloc.total.size"), Some(&Value::Uint(1088)));
    }
}
