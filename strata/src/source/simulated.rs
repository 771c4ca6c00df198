//! In-process coprocessor runtime
//!
//! Behaves like a vendor runtime from the collector's point of view: it hands
//! out correlation ids, calls API callbacks on the calling thread, packs
//! completion records into a buffer in the `strata-common` layout, and hands
//! full buffers to a delivery thread that runs the buffer callback.

use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use strata_common::{
    next_record_len, ActivityRecord, MarkerRecord, DOMAIN_DEVICE_OPS, DOMAIN_QUEUE_OPS, OP_COPY,
    OP_KERNEL,
};

use super::{ActivityDomain, ActivitySource, ApiCallback, ApiCallbackData, ApiOp, ApiPhase, BufferCallback};
use crate::domain::{CorrelationId, SourceError};

/// Simulated device time between consecutive operations (ns)
const OP_GAP_NS: u64 = 100;

enum Delivery {
    Buffer(Vec<u8>),
    Flush(Sender<()>),
}

struct Pool {
    buffer_size: usize,
    pending: Vec<u8>,
    tx: Sender<Delivery>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct DeviceState {
    api_callbacks: HashMap<ActivityDomain, Arc<dyn ApiCallback>>,
    activity: HashSet<ActivityDomain>,
    failing: HashSet<ActivityDomain>,
    pool_failure: Option<String>,
    pool: Option<Pool>,
}

/// Simulated coprocessor runtime
pub struct SimulatedDevice {
    device_id: u32,
    state: Mutex<DeviceState>,
    next_correlation: AtomicU64,
    clock_ns: AtomicU64,
    records_produced: AtomicU64,
    buffers_delivered: Arc<AtomicU64>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedDevice {
    #[must_use]
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            state: Mutex::new(DeviceState::default()),
            next_correlation: AtomicU64::new(1),
            clock_ns: AtomicU64::new(1_000),
            records_produced: AtomicU64::new(0),
            buffers_delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make enabling `domain` (callbacks or activity) fail
    pub fn fail_domain(&self, domain: ActivityDomain) {
        self.state().failing.insert(domain);
    }

    /// Make `open_pool` fail with `reason`
    pub fn fail_pool(&self, reason: &str) {
        self.state().pool_failure = Some(reason.to_string());
    }

    /// Completion records written into the pool so far
    #[must_use]
    pub fn records_produced(&self) -> u64 {
        self.records_produced.load(Ordering::Relaxed)
    }

    /// Buffers handed to the buffer callback so far
    #[must_use]
    pub fn buffers_delivered(&self) -> u64 {
        self.buffers_delivered.load(Ordering::Relaxed)
    }

    /// Launch a kernel that runs for `duration_ns`
    pub fn launch_kernel(&self, symbol: &str, duration_ns: u64) -> CorrelationId {
        self.api_call(ApiOp::PushCallConfiguration, None);
        let id = self.api_call_with(ApiOp::LaunchKernel, Some(symbol), |id| {
            self.complete(DOMAIN_DEVICE_OPS, OP_KERNEL, id, duration_ns, 0, 0);
        });
        self.api_call(ApiOp::PopCallConfiguration, None);
        id
    }

    /// Copy `bytes` between host and device
    pub fn memcpy(&self, bytes: u64, duration_ns: u64) -> CorrelationId {
        self.api_call_with(ApiOp::Memcpy, None, |id| {
            self.complete(DOMAIN_QUEUE_OPS, OP_COPY, id, duration_ns, 1, bytes);
        })
    }

    /// Wait for the device; leaves a marker record in the pool
    pub fn synchronize(&self) -> CorrelationId {
        self.api_call_with(ApiOp::DeviceSynchronize, None, |_| {
            let marker = MarkerRecord { timestamp_ns: self.clock_ns.load(Ordering::Relaxed), label: b"sync" };
            let mut bytes = vec![0u8; marker.encoded_len()];
            if marker.encode(&mut bytes).is_some() {
                self.write_record(ActivityDomain::QueueOps, &bytes);
            }
        })
    }

    /// Hand `buffer` straight to the buffer callback, bypassing the pool
    pub fn deliver_buffer(&self, buffer: Vec<u8>) -> Result<(), SourceError> {
        let state = self.state();
        let pool = state.pool.as_ref().ok_or(SourceError::PoolNotOpen)?;
        pool.tx
            .send(Delivery::Buffer(buffer))
            .map_err(|_| SourceError::FlushFailed("delivery thread stopped".to_string()))
    }

    fn api_call(&self, op: ApiOp, kernel_symbol: Option<&str>) -> CorrelationId {
        self.api_call_with(op, kernel_symbol, |_| {})
    }

    /// Enter callback, `body`, exit callback
    fn api_call_with(&self, op: ApiOp, kernel_symbol: Option<&str>, body: impl FnOnce(CorrelationId)) -> CorrelationId {
        let correlation_id = CorrelationId(self.next_correlation.fetch_add(1, Ordering::Relaxed));
        let callback = self.state().api_callbacks.get(&ActivityDomain::Api).cloned();

        if let Some(cb) = &callback {
            cb.on_api(&ApiCallbackData { phase: ApiPhase::Enter, op, correlation_id, kernel_symbol });
        }
        body(correlation_id);
        if let Some(cb) = &callback {
            cb.on_api(&ApiCallbackData { phase: ApiPhase::Exit, op, correlation_id, kernel_symbol });
        }
        correlation_id
    }

    fn complete(&self, domain: u32, op: u32, id: CorrelationId, duration_ns: u64, queue_id: u32, bytes: u64) {
        let begin_ns = self.clock_ns.fetch_add(duration_ns + OP_GAP_NS, Ordering::Relaxed);
        let record = ActivityRecord {
            domain,
            op,
            correlation_id: id.0,
            begin_ns,
            end_ns: begin_ns + duration_ns,
            device_id: self.device_id,
            queue_id,
            bytes,
        };
        if let Some(domain) = ActivityDomain::from_code(domain) {
            self.write_record(domain, &record.to_bytes());
        }
    }

    fn write_record(&self, domain: ActivityDomain, bytes: &[u8]) {
        let mut state = self.state();
        if !state.activity.contains(&domain) {
            return;
        }
        let Some(pool) = state.pool.as_mut() else {
            return;
        };

        if !pool.pending.is_empty() && pool.pending.len() + bytes.len() > pool.buffer_size {
            let full = std::mem::take(&mut pool.pending);
            if pool.tx.send(Delivery::Buffer(full)).is_err() {
                warn!("simulated device: delivery thread stopped, dropping buffer");
            }
        }
        pool.pending.extend_from_slice(bytes);
        self.records_produced.fetch_add(1, Ordering::Relaxed);
    }
}

impl ActivitySource for SimulatedDevice {
    fn enable_callbacks(&self, domain: ActivityDomain, callback: Arc<dyn ApiCallback>) -> Result<(), SourceError> {
        let mut state = self.state();
        if state.failing.contains(&domain) {
            return Err(SourceError::CallbackEnableFailed {
                domain: domain.to_string(),
                reason: "domain not supported by device".to_string(),
            });
        }
        state.api_callbacks.insert(domain, callback);
        Ok(())
    }

    fn disable_callbacks(&self, domain: ActivityDomain) {
        self.state().api_callbacks.remove(&domain);
    }

    fn open_pool(&self, buffer_size: usize, callback: Arc<dyn BufferCallback>) -> Result<(), SourceError> {
        let mut state = self.state();
        if let Some(reason) = &state.pool_failure {
            return Err(SourceError::PoolOpenFailed(reason.clone()));
        }
        if state.pool.is_some() {
            return Err(SourceError::PoolOpenFailed("pool already open".to_string()));
        }

        let (tx, rx) = unbounded::<Delivery>();
        let delivered = Arc::clone(&self.buffers_delivered);
        let worker = std::thread::Builder::new()
            .name("device-delivery".to_string())
            .spawn(move || {
                for delivery in rx {
                    match delivery {
                        Delivery::Buffer(buffer) => {
                            callback.on_buffer(&buffer);
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Delivery::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|e| SourceError::PoolOpenFailed(e.to_string()))?;

        state.pool = Some(Pool { buffer_size: buffer_size.max(1), pending: Vec::new(), tx, worker });
        debug!("simulated device {}: opened pool of {buffer_size} bytes", self.device_id);
        Ok(())
    }

    fn enable_activity(&self, domain: ActivityDomain) -> Result<(), SourceError> {
        let mut state = self.state();
        if state.failing.contains(&domain) {
            return Err(SourceError::ActivityEnableFailed {
                domain: domain.to_string(),
                reason: "domain not supported by device".to_string(),
            });
        }
        if state.pool.is_none() {
            return Err(SourceError::PoolNotOpen);
        }
        state.activity.insert(domain);
        Ok(())
    }

    fn disable_activity(&self, domain: ActivityDomain) {
        self.state().activity.remove(&domain);
    }

    fn flush_activity(&self) -> Result<(), SourceError> {
        let (ack_tx, ack_rx) = bounded(1);
        {
            let mut state = self.state();
            let pool = state.pool.as_mut().ok_or(SourceError::PoolNotOpen)?;
            if !pool.pending.is_empty() {
                let pending = std::mem::take(&mut pool.pending);
                pool.tx
                    .send(Delivery::Buffer(pending))
                    .map_err(|_| SourceError::FlushFailed("delivery thread stopped".to_string()))?;
            }
            pool.tx
                .send(Delivery::Flush(ack_tx))
                .map_err(|_| SourceError::FlushFailed("delivery thread stopped".to_string()))?;
        }

        ack_rx.recv().map_err(|_| SourceError::FlushFailed("no acknowledgement from delivery thread".to_string()))
    }

    fn close_pool(&self) {
        let pool = {
            let mut state = self.state();
            state.activity.clear();
            state.pool.take()
        };
        let Some(pool) = pool else {
            return;
        };

        if !pool.pending.is_empty() {
            let _ = pool.tx.send(Delivery::Buffer(pool.pending));
        }
        drop(pool.tx);
        // the last owner may be released from inside a buffer callback
        if pool.worker.thread().id() == std::thread::current().id() {
            debug!("simulated device {}: closed from its delivery thread, not joining", self.device_id);
            return;
        }
        if pool.worker.join().is_err() {
            warn!("simulated device {}: delivery thread panicked", self.device_id);
        }
    }

    fn next_record(&self, rest: &[u8]) -> Option<usize> {
        next_record_len(rest)
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.close_pool();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::ACTIVITY_RECORD_SIZE;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ApiPhase, ApiOp, u64)>>,
        buffers: Mutex<Vec<Vec<u8>>>,
    }

    impl ApiCallback for Recorder {
        fn on_api(&self, data: &ApiCallbackData<'_>) {
            self.calls.lock().unwrap().push((data.phase, data.op, data.correlation_id.0));
        }
    }

    impl BufferCallback for Recorder {
        fn on_buffer(&self, buffer: &[u8]) {
            self.buffers.lock().unwrap().push(buffer.to_vec());
        }
    }

    fn records(device: &SimulatedDevice, buffer: &[u8]) -> Vec<ActivityRecord> {
        let mut out = Vec::new();
        let mut rest = buffer;
        while let Some(len) = device.next_record(rest) {
            if let Some(record) = ActivityRecord::decode(&rest[..len]) {
                out.push(record);
            }
            rest = &rest[len..];
        }
        out
    }

    #[test]
    fn test_api_callbacks_bracket_each_call() {
        let device = SimulatedDevice::new(0);
        let recorder = Arc::new(Recorder::default());
        device.enable_callbacks(ActivityDomain::Api, recorder.clone()).unwrap();

        let id = device.launch_kernel("k", 10);

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 6);
        assert_eq!(calls[2], (ApiPhase::Enter, ApiOp::LaunchKernel, id.0));
        assert_eq!(calls[3], (ApiPhase::Exit, ApiOp::LaunchKernel, id.0));
        assert!(calls[0].1.is_call_configuration());
    }

    #[test]
    fn test_flush_delivers_pending_records() {
        let device = SimulatedDevice::new(3);
        let recorder = Arc::new(Recorder::default());
        device.open_pool(4096, recorder.clone()).unwrap();
        device.enable_activity(ActivityDomain::DeviceOps).unwrap();
        device.enable_activity(ActivityDomain::QueueOps).unwrap();

        let kernel = device.launch_kernel("k", 500);
        let copy = device.memcpy(64, 20);
        device.synchronize();
        device.flush_activity().unwrap();

        let buffers = recorder.buffers.lock().unwrap();
        assert_eq!(buffers.len(), 1);
        let decoded = records(&device, &buffers[0]);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].correlation_id, kernel.0);
        assert_eq!(decoded[0].duration_ns(), 500);
        assert_eq!(decoded[0].device_id, 3);
        assert_eq!(decoded[1].correlation_id, copy.0);
        assert_eq!(decoded[1].bytes, 64);
        assert_eq!(device.records_produced(), 3);
    }

    #[test]
    fn test_full_buffer_is_delivered_without_flush() {
        let device = SimulatedDevice::new(0);
        let recorder = Arc::new(Recorder::default());
        device.open_pool(ACTIVITY_RECORD_SIZE * 2, recorder.clone()).unwrap();
        device.enable_activity(ActivityDomain::DeviceOps).unwrap();

        for _ in 0..5 {
            device.launch_kernel("k", 1);
        }
        device.close_pool();

        let buffers = recorder.buffers.lock().unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(buffers.iter().map(Vec::len).sum::<usize>(), ACTIVITY_RECORD_SIZE * 5);
        assert_eq!(device.buffers_delivered(), 3);
    }

    #[test]
    fn test_failing_domains_and_pool() {
        let device = SimulatedDevice::new(0);
        device.fail_domain(ActivityDomain::Api);
        let recorder = Arc::new(Recorder::default());

        assert!(matches!(
            device.enable_callbacks(ActivityDomain::Api, recorder.clone()),
            Err(SourceError::CallbackEnableFailed { .. })
        ));
        assert_eq!(device.enable_activity(ActivityDomain::DeviceOps), Err(SourceError::PoolNotOpen));
        assert_eq!(device.flush_activity(), Err(SourceError::PoolNotOpen));

        device.fail_pool("out of memory");
        assert_eq!(
            device.open_pool(16, recorder),
            Err(SourceError::PoolOpenFailed("out of memory".to_string()))
        );
    }

    #[test]
    fn test_records_outside_enabled_domains_are_not_produced() {
        let device = SimulatedDevice::new(0);
        let recorder = Arc::new(Recorder::default());
        device.open_pool(4096, recorder.clone()).unwrap();
        device.enable_activity(ActivityDomain::DeviceOps).unwrap();

        device.memcpy(8, 1);
        device.flush_activity().unwrap();

        assert!(recorder.buffers.lock().unwrap().is_empty());
        assert_eq!(device.records_produced(), 0);
    }
}
