//! # Coprocessor Activity Tracing
//!
//! Bridges a coprocessor runtime ([`ActivitySource`]) into a channel:
//!
//! 1. API callbacks open a `gpu.api` scope on the calling thread for the
//!    duration of each runtime call. When tracing, the scope's node (or a
//!    `gpu.kernel.name` child of it) is stored under the call's correlation id.
//! 2. Completion buffers arrive on the runtime's delivery thread and are drained
//!    through the [`FlushPipeline`], one record per device/queue operation,
//!    each inheriting the context stored at launch.
//! 3. `pre_flush` asks the runtime to push out whatever it still buffers.
//!
//! Setup failures only switch off the affected feature; the channel keeps
//! running.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use strata_common::{op_name, ActivityRecord, OP_COPY};

use crate::attribute::{AttrFlags, AttrType, Attribute, Value};
use crate::channel::{Channel, Instrumentation};
use crate::config::ActivityConfig;
use crate::correlation::{CorrelationStats, CorrelationStore};
use crate::domain::{CapacityExceeded, CorrelationId};
use crate::flush::{Decoded, FlushPipeline, FlushStats, RecordFormat};
use crate::snapshot::SnapshotBuilder;
use crate::source::{ActivityDomain, ActivitySource, ApiCallback, ApiCallbackData, ApiPhase, BufferCallback};

const SERVICE: &str = "activity";

/// Domains whose completion records become snapshots
const TRACED_DOMAINS: [ActivityDomain; 2] = [ActivityDomain::DeviceOps, ActivityDomain::QueueOps];

struct ActivityAttributes {
    api: Attribute,
    start: Attribute,
    end: Attribute,
    duration: Attribute,
    name: Attribute,
    queue: Attribute,
    device: Attribute,
    bytes: Attribute,
    kernel_name: Attribute,
    flush: Attribute,
}

impl ActivityAttributes {
    fn create(instr: &Instrumentation) -> Self {
        let builtins = instr.builtins();
        let value = AttrFlags::ASVALUE | AttrFlags::SKIP_EVENTS;
        let uint = |name: &str| instr.create_attribute(name, AttrType::Uint, AttrFlags::SKIP_EVENTS, &[]);

        Self {
            api: instr.create_attribute(
                "gpu.api",
                AttrType::Str,
                AttrFlags::NESTED,
                &[(builtins.subscription_event.clone(), Value::Bool(true))],
            ),
            start: instr.create_attribute("gpu.starttime", AttrType::Uint, value, &[]),
            end: instr.create_attribute("gpu.endtime", AttrType::Uint, value, &[]),
            duration: instr.create_attribute(
                "gpu.activity.duration",
                AttrType::Uint,
                value,
                &[(builtins.class_aggregatable.clone(), Value::Bool(true))],
            ),
            name: instr.create_attribute("gpu.activity", AttrType::Str, AttrFlags::SKIP_EVENTS, &[]),
            queue: uint("gpu.activity.queue"),
            device: uint("gpu.activity.device"),
            bytes: uint("gpu.activity.bytes"),
            kernel_name: instr.create_attribute("gpu.kernel.name", AttrType::Str, AttrFlags::SKIP_EVENTS, &[]),
            flush: instr.create_attribute("gpu.flush", AttrType::Str, AttrFlags::DEFAULT, &[]),
        }
    }
}

/// Counters of an [`ActivityService`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityStats {
    pub flush: FlushStats,
    pub correlations: CorrelationStats,
    /// API exits that did not match the innermost open scope
    pub scope_errors: u64,
}

struct ActivityShared {
    channel: Weak<Channel>,
    channel_name: String,
    instrumentation: Arc<Instrumentation>,
    source: Arc<dyn ActivitySource>,
    config: ActivityConfig,
    attrs: ActivityAttributes,
    correlations: CorrelationStore,
    pipeline: FlushPipeline,
    callbacks_enabled: AtomicBool,
    tracing: AtomicBool,
    scope_errors: AtomicU64,
}

/// Handle to the activity service registered on a channel
pub struct ActivityService {
    shared: Arc<ActivityShared>,
}

impl ActivityService {
    /// Create the service's attributes and subscribe it to `channel`'s lifecycle
    pub fn register(channel: &Arc<Channel>, source: Arc<dyn ActivitySource>) -> Self {
        let instrumentation = Arc::clone(channel.instrumentation());
        let shared = Arc::new(ActivityShared {
            channel: Arc::downgrade(channel),
            channel_name: channel.name().to_string(),
            attrs: ActivityAttributes::create(&instrumentation),
            instrumentation,
            source,
            config: channel.config().activity.clone(),
            correlations: CorrelationStore::new(),
            pipeline: FlushPipeline::new(),
            callbacks_enabled: AtomicBool::new(false),
            tracing: AtomicBool::new(false),
            scope_errors: AtomicU64::new(0),
        });

        {
            let shared = Arc::clone(&shared);
            channel.events().on_post_init(move |ch| post_init(&shared, ch));
        }
        {
            let shared = Arc::clone(&shared);
            channel.events().on_pre_finish(move |ch| shared.pre_finish(ch));
        }
        {
            let shared = Arc::clone(&shared);
            channel.events().on_finish(move |ch| shared.finish(ch));
        }

        info!(
            "{}: registered {SERVICE} service; activity tracing is {}",
            channel.name(),
            if shared.config.trace_activities { "on" } else { "off" }
        );
        Self { shared }
    }

    /// True once completion records are being collected
    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.shared.tracing.load(Ordering::Relaxed)
    }

    /// True once API callbacks are installed
    #[must_use]
    pub fn callbacks_enabled(&self) -> bool {
        self.shared.callbacks_enabled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> ActivityStats {
        ActivityStats {
            flush: self.shared.pipeline.stats(),
            correlations: self.shared.correlations.stats(),
            scope_errors: self.shared.scope_errors.load(Ordering::Relaxed),
        }
    }

    /// The `gpu.api` attribute
    #[must_use]
    pub fn api_attribute(&self) -> &Attribute {
        &self.shared.attrs.api
    }
}

/// Callback registered with the source; the source must not keep the service alive
struct SourceHook(Weak<ActivityShared>);

impl ApiCallback for SourceHook {
    fn on_api(&self, data: &ApiCallbackData<'_>) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_api(data);
        }
    }
}

impl BufferCallback for SourceHook {
    fn on_buffer(&self, buffer: &[u8]) {
        match self.0.upgrade() {
            Some(shared) => shared.on_buffer(buffer),
            None => debug!("{SERVICE}: service gone, dropping {} byte buffer", buffer.len()),
        }
    }
}

fn post_init(shared: &Arc<ActivityShared>, channel: &Channel) {
    // callbacks go in before the pool is opened
    let callback: Arc<dyn ApiCallback> = Arc::new(SourceHook(Arc::downgrade(shared)));
    match shared.source.enable_callbacks(ActivityDomain::Api, callback) {
        Ok(()) => {
            shared.callbacks_enabled.store(true, Ordering::Relaxed);
            info!("{}: {SERVICE}: callbacks initialized", channel.name());
        }
        Err(e) => error!("{}: {SERVICE}: {e}", channel.name()),
    }

    if shared.config.trace_activities {
        init_tracing(shared, channel);
    }
}

fn init_tracing(shared: &Arc<ActivityShared>, channel: &Channel) {
    let callback: Arc<dyn BufferCallback> = Arc::new(SourceHook(Arc::downgrade(shared)));
    if let Err(e) = shared.source.open_pool(shared.config.buffer_size, callback) {
        error!("{}: {SERVICE}: {e}", channel.name());
        return;
    }

    for domain in TRACED_DOMAINS {
        if let Err(e) = shared.source.enable_activity(domain) {
            error!("{}: {SERVICE}: {e}", channel.name());
            for enabled in TRACED_DOMAINS {
                shared.source.disable_activity(enabled);
            }
            shared.source.close_pool();
            return;
        }
    }

    shared.tracing.store(true, Ordering::Relaxed);
    {
        let shared = Arc::clone(shared);
        channel.events().on_pre_flush(move |ch| shared.request_flush(ch));
    }
    info!("{}: {SERVICE}: tracing initialized", channel.name());
}

impl ActivityShared {
    fn request_flush(&self, channel: &Channel) {
        if !self.tracing.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.source.flush_activity() {
            warn!("{}: {SERVICE}: {e}", channel.name());
        }
    }

    fn pre_finish(&self, channel: &Channel) {
        if self.callbacks_enabled.swap(false, Ordering::Relaxed) {
            self.source.disable_callbacks(ActivityDomain::Api);
            info!("{}: {SERVICE}: callbacks stopped", channel.name());
        }

        if self.tracing.swap(false, Ordering::Relaxed) {
            for domain in TRACED_DOMAINS {
                self.source.disable_activity(domain);
            }
            self.source.close_pool();
            info!("{}: {SERVICE}: tracing stopped", channel.name());
        }
    }

    fn finish(&self, channel: &Channel) {
        let orphaned = self.correlations.abandon();
        if orphaned > 0 {
            debug!("{}: {SERVICE}: {orphaned} correlations never completed", channel.name());
        }

        if self.config.trace_activities {
            let flush = self.pipeline.stats();
            let corr = self.correlations.stats();
            info!(
                "{}: {SERVICE}: {} activity flushes, {} records processed, {} records flushed",
                channel.name(),
                flush.flushes,
                flush.records,
                flush.flushed
            );
            debug!(
                "{}: {SERVICE}: {} correlations stored; {} found, {} missed",
                channel.name(),
                corr.stored,
                corr.found,
                corr.missed
            );
        }
    }

    fn on_enter(&self, data: &ApiCallbackData<'_>) {
        let tracing = self.tracing.load(Ordering::Relaxed);
        let kernel_name = data
            .kernel_symbol
            .filter(|_| tracing && self.config.record_kernel_names)
            .map(demangle);

        let node = self.instrumentation.with_thread_context(|ctx| {
            let api = ctx.begin(&self.attrs.api, Value::from(data.op.name()));
            if !tracing {
                return None;
            }
            Some(match kernel_name {
                Some(kernel) => ctx.tree().make_entry(&self.attrs.kernel_name, Value::from(kernel), Some(&api)),
                None => api,
            })
        });

        if let Some(node) = node {
            self.correlations.store(data.correlation_id, node);
        }
    }

    fn on_exit(&self, data: &ApiCallbackData<'_>) {
        if let Err(e) = self.instrumentation.end(&self.attrs.api) {
            self.scope_errors.fetch_add(1, Ordering::Relaxed);
            warn!("{}: {SERVICE}: {} exit: {e}", self.channel_name, data.op);
        }
    }
}

/// Demangled kernel name without the trailing hash
fn demangle(symbol: &str) -> String {
    format!("{:#}", rustc_demangle::demangle(symbol))
}

impl ApiCallback for ActivityShared {
    fn on_api(&self, data: &ApiCallbackData<'_>) {
        if data.op.is_call_configuration() {
            return;
        }
        match data.phase {
            ApiPhase::Enter => self.on_enter(data),
            ApiPhase::Exit => self.on_exit(data),
        }
    }
}

impl BufferCallback for ActivityShared {
    fn on_buffer(&self, buffer: &[u8]) {
        let Some(channel) = self.channel.upgrade() else {
            debug!("{}: {SERVICE}: channel gone, dropping {} byte buffer", self.channel_name, buffer.len());
            return;
        };

        self.instrumentation.begin(&self.attrs.flush, "activity flush");
        self.pipeline.drain(&channel, &self.correlations, self, buffer);
        if let Err(e) = self.instrumentation.end(&self.attrs.flush) {
            warn!("{}: {SERVICE}: {e}", channel.name());
        }

        debug!("{}: {SERVICE}: processed {} byte buffer", channel.name(), buffer.len());
    }
}

impl ActivityShared {
    fn append_fields(&self, activity: &ActivityRecord, builder: &mut SnapshotBuilder<'_>) -> Result<(), CapacityExceeded> {
        let a = &self.attrs;
        builder.append(&a.name, Value::from(op_name(activity.domain, activity.op)))?;
        builder.append(&a.start, Value::Uint(activity.begin_ns))?;
        builder.append(&a.end, Value::Uint(activity.end_ns))?;
        builder.append(&a.duration, Value::Uint(activity.duration_ns()))?;
        builder.append(&a.device, Value::from(activity.device_id))?;
        builder.append(&a.queue, Value::from(activity.queue_id))?;
        if activity.op == OP_COPY {
            builder.append(&a.bytes, Value::Uint(activity.bytes))?;
        }
        Ok(())
    }
}

impl RecordFormat for ActivityShared {
    fn next_record(&self, rest: &[u8]) -> Option<usize> {
        self.source.next_record(rest)
    }

    fn decode(&self, record: &[u8], builder: &mut SnapshotBuilder<'_>) -> Decoded {
        let Some(activity) = ActivityRecord::decode(record) else {
            return Decoded::Skip;
        };
        if !ActivityDomain::from_code(activity.domain).is_some_and(|d| TRACED_DOMAINS.contains(&d)) {
            return Decoded::Skip;
        }

        let id = Decoded::Correlated(CorrelationId(activity.correlation_id));
        if self.append_fields(&activity, builder).is_err() {
            debug!("{}: {SERVICE}: record {} truncated", self.channel_name, activity.correlation_id);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::export::SnapshotCollector;
    use crate::source::SimulatedDevice;

    fn setup(config: ChannelConfig) -> (Arc<Channel>, Arc<SimulatedDevice>, ActivityService, SnapshotCollector) {
        let instr = Instrumentation::new();
        let channel = instr.create_channel("test", config);
        let device = Arc::new(SimulatedDevice::new(0));
        let service = ActivityService::register(&channel, device.clone());
        let collector = SnapshotCollector::register(&channel);
        channel.init();
        (channel, device, service, collector)
    }

    #[test]
    fn test_kernel_record_inherits_launch_context() {
        let (channel, device, service, collector) = setup(ChannelConfig::default());
        let instr = Arc::clone(channel.instrumentation());
        let phase = instr.create_attribute("phase", AttrType::Str, AttrFlags::NESTED, &[]);

        instr.begin(&phase, "solve");
        device.launch_kernel("matmul", 500);
        instr.end(&phase).unwrap();
        channel.flush();

        let records = collector.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("gpu.activity.duration"), Some(&Value::Uint(500)));
        assert_eq!(records[0].get("gpu.activity"), Some(&Value::from("KernelExecution")));
        assert_eq!(records[0].get("gpu.api"), Some(&Value::from("LaunchKernel")));
        assert_eq!(records[0].get("phase"), Some(&Value::from("solve")));
        assert!(records[0].get("gpu.activity.bytes").is_none());

        let stats = service.stats();
        assert_eq!((stats.correlations.stored, stats.correlations.found, stats.correlations.missed), (1, 1, 0));
        assert!(instr.current().is_none());
    }

    #[test]
    fn test_kernel_names_are_recorded_when_enabled() {
        let mut config = ChannelConfig::default();
        config.activity.record_kernel_names = true;
        let (channel, device, _service, collector) = setup(config);

        device.launch_kernel("_ZN6solver6matmul17h0123456789abcdefE", 10);
        channel.flush();

        let records = collector.records();
        assert_eq!(records[0].get("gpu.kernel.name"), Some(&Value::from("solver::matmul")));
    }

    #[test]
    fn test_copy_records_carry_bytes() {
        let (channel, device, _service, collector) = setup(ChannelConfig::default());

        device.memcpy(4096, 20);
        device.synchronize();
        channel.flush();

        let records = collector.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("gpu.activity.bytes"), Some(&Value::Uint(4096)));
        assert_eq!(records[0].get("gpu.activity"), Some(&Value::from("CopyMemory")));
    }

    #[test]
    fn test_tracing_off_only_tracks_api_regions() {
        let mut config = ChannelConfig::default();
        config.activity.trace_activities = false;
        let (channel, device, service, collector) = setup(config);

        device.launch_kernel("k", 10);
        channel.flush();

        assert!(service.callbacks_enabled());
        assert!(!service.is_tracing());
        assert!(collector.records().is_empty());
        assert_eq!(service.stats().correlations.stored, 0);
    }

    #[test]
    fn test_pool_failure_disables_tracing_only() {
        let instr = Instrumentation::new();
        let channel = instr.create_channel("test", ChannelConfig::default());
        let device = Arc::new(SimulatedDevice::new(0));
        device.fail_pool("no memory");
        let service = ActivityService::register(&channel, device.clone());
        channel.init();

        assert!(service.callbacks_enabled());
        assert!(!service.is_tracing());

        device.launch_kernel("k", 10);
        channel.flush();
        channel.finish();
        assert_eq!(service.stats().flush.flushes, 0);
    }

    #[test]
    fn test_dropping_without_finish_releases_the_device() {
        let device = Arc::new(SimulatedDevice::new(0));
        let weak = Arc::downgrade(&device);
        {
            let instr = Instrumentation::new();
            let channel = instr.create_channel("test", ChannelConfig::default());
            let service = ActivityService::register(&channel, device.clone());
            channel.init();
            assert!(service.is_tracing());
            device.launch_kernel("k", 10);
        }

        // only the local handle is left; dropping it stops the delivery thread
        assert_eq!(Arc::strong_count(&device), 1);
        drop(device);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_truncated_record_keeps_its_correlation() {
        let (_channel, _device, service, _collector) = setup(ChannelConfig::default());
        let activity = ActivityRecord {
            domain: strata_common::DOMAIN_QUEUE_OPS,
            op: OP_COPY,
            correlation_id: 7,
            begin_ns: 10,
            end_ns: 30,
            device_id: 0,
            queue_id: 1,
            bytes: 64,
        };

        let mut record = crate::snapshot::FixedSnapshot::<3>::new();
        let decoded = service.shared.decode(&activity.to_bytes(), &mut record.builder());

        assert_eq!(decoded, Decoded::Correlated(CorrelationId(7)));
        assert_eq!(record.view().len(), 3);
        assert_eq!(record.dropped(), 1);
    }

    #[test]
    fn test_finish_abandons_pending_correlations() {
        let (channel, device, service, _collector) = setup(ChannelConfig::default());

        device.launch_kernel("k", 10);
        service.shared.correlations.store(CorrelationId(1_000), channel.instrumentation().make_entry(
            service.api_attribute(),
            Value::from("orphan"),
            None,
        ));
        channel.finish();

        let stats = service.stats();
        assert_eq!(stats.correlations.found, 1);
        assert_eq!(stats.correlations.missed, 1);
        assert_eq!(device.records_produced(), 1);
    }
}
