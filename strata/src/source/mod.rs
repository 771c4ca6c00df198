//! # External Event Sources
//!
//! The coprocessor runtime is a black box that talks to strata through three
//! channels:
//!
//! - **API callbacks** on the instrumented thread, once on entry and once on
//!   exit of each runtime call, carrying the correlation id the runtime
//!   assigned to the call
//! - **Buffer callbacks** on a runtime-owned thread, carrying a byte range of
//!   completion records in the runtime's own layout
//! - **Explicit flush**, asking the runtime to push everything it has buffered
//!
//! [`SimulatedDevice`] implements [`ActivitySource`] in-process for the demo
//! binary and the tests.

pub mod simulated;

pub use simulated::SimulatedDevice;

use std::fmt;
use std::sync::Arc;

use strata_common::{DOMAIN_API, DOMAIN_DEVICE_OPS, DOMAIN_QUEUE_OPS};

use crate::domain::{CorrelationId, SourceError};

/// Event categories a source can enable independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityDomain {
    /// Runtime API calls
    Api,
    /// Work executed on the device (kernels)
    DeviceOps,
    /// Queue operations (copies, barriers)
    QueueOps,
}

impl ActivityDomain {
    /// Wire code used in completion records
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            ActivityDomain::Api => DOMAIN_API,
            ActivityDomain::DeviceOps => DOMAIN_DEVICE_OPS,
            ActivityDomain::QueueOps => DOMAIN_QUEUE_OPS,
        }
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            DOMAIN_API => Some(ActivityDomain::Api),
            DOMAIN_DEVICE_OPS => Some(ActivityDomain::DeviceOps),
            DOMAIN_QUEUE_OPS => Some(ActivityDomain::QueueOps),
            _ => None,
        }
    }
}

impl fmt::Display for ActivityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityDomain::Api => "api",
            ActivityDomain::DeviceOps => "device_ops",
            ActivityDomain::QueueOps => "queue_ops",
        };
        f.write_str(name)
    }
}

/// Which side of a runtime call an API callback reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiPhase {
    Enter,
    Exit,
}

/// Runtime API calls reported through [`ApiCallback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOp {
    LaunchKernel,
    Memcpy,
    DeviceSynchronize,
    /// Launch bookkeeping emitted around kernel launches
    PushCallConfiguration,
    PopCallConfiguration,
}

impl ApiOp {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ApiOp::LaunchKernel => "LaunchKernel",
            ApiOp::Memcpy => "Memcpy",
            ApiOp::DeviceSynchronize => "DeviceSynchronize",
            ApiOp::PushCallConfiguration => "PushCallConfiguration",
            ApiOp::PopCallConfiguration => "PopCallConfiguration",
        }
    }

    /// Bookkeeping calls that never produce device activity
    #[must_use]
    pub fn is_call_configuration(self) -> bool {
        matches!(self, ApiOp::PushCallConfiguration | ApiOp::PopCallConfiguration)
    }
}

impl fmt::Display for ApiOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments of one API callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCallbackData<'a> {
    pub phase: ApiPhase,
    pub op: ApiOp,
    pub correlation_id: CorrelationId,
    /// Mangled symbol of the launched kernel, for kernel launches
    pub kernel_symbol: Option<&'a str>,
}

/// Receives API callbacks on the thread making the call
pub trait ApiCallback: Send + Sync {
    fn on_api(&self, data: &ApiCallbackData<'_>);
}

/// Receives completion buffers on a source-owned thread
pub trait BufferCallback: Send + Sync {
    fn on_buffer(&self, buffer: &[u8]);
}

/// A coprocessor runtime's tracing interface
pub trait ActivitySource: Send + Sync {
    fn enable_callbacks(&self, domain: ActivityDomain, callback: Arc<dyn ApiCallback>) -> Result<(), SourceError>;

    fn disable_callbacks(&self, domain: ActivityDomain);

    /// Open the completion record pool; full buffers go to `callback`
    fn open_pool(&self, buffer_size: usize, callback: Arc<dyn BufferCallback>) -> Result<(), SourceError>;

    fn enable_activity(&self, domain: ActivityDomain) -> Result<(), SourceError>;

    fn disable_activity(&self, domain: ActivityDomain);

    /// Deliver every buffered record through the buffer callback before returning
    fn flush_activity(&self) -> Result<(), SourceError>;

    /// Deliver what is left and release the pool and its callback
    fn close_pool(&self);

    /// Length of the record at the start of `rest`
    fn next_record(&self, rest: &[u8]) -> Option<usize>;
}
