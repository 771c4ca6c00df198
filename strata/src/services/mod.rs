//! Service adapters
//!
//! Each service turns one external event source into attributes, context and
//! snapshot records on a channel. Services are registered on a channel before
//! `init()`; the channel config's `services` list picks which ones
//! [`register_configured`] installs.

pub mod activity;
pub mod allocator;
pub mod metadata;

pub use activity::{ActivityService, ActivityStats};
pub use allocator::{AllocatorService, AllocatorSource, AllocatorStats, AllocatorTable};
pub use metadata::{Category, MetaEntry, MetaValue, MetadataService, MetadataSource, MetadataTable};

use log::warn;
use std::sync::Arc;

use crate::channel::Channel;
use crate::source::ActivitySource;

/// Known service names
pub const SERVICE_NAMES: [&str; 3] = ["activity", "allocator", "metadata"];

/// External sources available to services
#[derive(Default, Clone)]
pub struct ServiceSources {
    pub activity: Option<Arc<dyn ActivitySource>>,
    pub allocator: Option<Arc<dyn AllocatorSource>>,
    pub metadata: Option<Arc<dyn MetadataSource>>,
}

/// Handles of the services [`register_configured`] installed
#[derive(Default)]
pub struct RegisteredServices {
    pub activity: Option<ActivityService>,
    pub allocator: bool,
    pub metadata: Option<Arc<MetadataService>>,
}

/// Register every service named in the channel config for which a source exists
pub fn register_configured(channel: &Arc<Channel>, sources: &ServiceSources) -> RegisteredServices {
    let mut registered = RegisteredServices::default();

    for name in &channel.config().services {
        match name.as_str() {
            "activity" => match &sources.activity {
                Some(source) => registered.activity = Some(ActivityService::register(channel, Arc::clone(source))),
                None => warn!("{}: no activity source available, skipping activity service", channel.name()),
            },
            "allocator" => match &sources.allocator {
                Some(source) => {
                    AllocatorService::register(channel, Arc::clone(source));
                    registered.allocator = true;
                }
                None => warn!("{}: no allocator source available, skipping allocator service", channel.name()),
            },
            "metadata" => match &sources.metadata {
                Some(source) => registered.metadata = Some(MetadataService::register(channel, Arc::clone(source))),
                None => warn!("{}: no metadata source available, skipping metadata service", channel.name()),
            },
            other => warn!("{}: unknown service '{other}' (known: {})", channel.name(), SERVICE_NAMES.join(", ")),
        }
    }

    registered
}
