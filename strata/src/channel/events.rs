//! # Event Dispatch
//!
//! Each channel keeps an ordered list of handlers per lifecycle event. Firing
//! an event calls every handler synchronously, in registration order, on the
//! firing thread.
//!
//! | event              | fired by                         | typical use |
//! |--------------------|----------------------------------|-------------|
//! | `post_init`        | [`Channel::init`], once          | install external-source hooks |
//! | `pre_flush`        | [`Channel::flush`]               | ask sources to push buffered records |
//! | `post_flush`       | [`Channel::flush`], after `pre_flush` | write out aggregated results |
//! | `snapshot`         | [`Channel::push_snapshot`]       | append fields to the record being built |
//! | `process_snapshot` | every completed record           | aggregation, serialization |
//! | `pre_finish`       | [`Channel::finish`], once        | disable external hooks |
//! | `finish`           | [`Channel::finish`], once        | publish counters, release resources |
//!
//! The handler list is copied before dispatch, so a handler may subscribe new
//! handlers (e.g. `post_init` subscribing `pre_flush`). Firing the same event
//! kind recursively from inside one of its handlers is not supported.

use log::error;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use super::Channel;
use crate::context::ThreadContext;
use crate::snapshot::{SnapshotBuilder, SnapshotView};

pub type LifecycleHandler = dyn Fn(&Channel) + Send + Sync;
pub type SnapshotHandler =
    dyn Fn(&Channel, &ThreadContext, SnapshotView<'_>, &mut SnapshotBuilder<'_>) + Send + Sync;
pub type ProcessSnapshotHandler = dyn Fn(&Channel, SnapshotView<'_>) + Send + Sync;

/// Lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PostInit,
    PreFlush,
    PostFlush,
    Snapshot,
    ProcessSnapshot,
    PreFinish,
    Finish,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::PostInit => "post_init",
            EventKind::PreFlush => "pre_flush",
            EventKind::PostFlush => "post_flush",
            EventKind::Snapshot => "snapshot",
            EventKind::ProcessSnapshot => "process_snapshot",
            EventKind::PreFinish => "pre_finish",
            EventKind::Finish => "finish",
        };
        f.write_str(name)
    }
}

struct HandlerList<F: ?Sized> {
    handlers: RwLock<Vec<Arc<F>>>,
}

impl<F: ?Sized> Default for HandlerList<F> {
    fn default() -> Self {
        Self { handlers: RwLock::new(Vec::new()) }
    }
}

impl<F: ?Sized> HandlerList<F> {
    fn push(&self, handler: Arc<F>) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    fn current(&self) -> Vec<Arc<F>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn clear(&self) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Per-channel handler lists
#[derive(Default)]
pub struct ChannelEvents {
    post_init: HandlerList<LifecycleHandler>,
    pre_flush: HandlerList<LifecycleHandler>,
    post_flush: HandlerList<LifecycleHandler>,
    snapshot: HandlerList<SnapshotHandler>,
    process_snapshot: HandlerList<ProcessSnapshotHandler>,
    pre_finish: HandlerList<LifecycleHandler>,
    finish: HandlerList<LifecycleHandler>,
}

impl ChannelEvents {
    pub fn on_post_init<F>(&self, handler: F)
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.post_init.push(Arc::new(handler));
    }

    pub fn on_pre_flush<F>(&self, handler: F)
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.pre_flush.push(Arc::new(handler));
    }

    pub fn on_post_flush<F>(&self, handler: F)
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.post_flush.push(Arc::new(handler));
    }

    pub fn on_snapshot<F>(&self, handler: F)
    where
        F: Fn(&Channel, &ThreadContext, SnapshotView<'_>, &mut SnapshotBuilder<'_>) + Send + Sync + 'static,
    {
        self.snapshot.push(Arc::new(handler));
    }

    pub fn on_process_snapshot<F>(&self, handler: F)
    where
        F: Fn(&Channel, SnapshotView<'_>) + Send + Sync + 'static,
    {
        self.process_snapshot.push(Arc::new(handler));
    }

    pub fn on_pre_finish<F>(&self, handler: F)
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.pre_finish.push(Arc::new(handler));
    }

    pub fn on_finish<F>(&self, handler: F)
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.finish.push(Arc::new(handler));
    }

    /// Number of handlers subscribed to `kind`
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::PostInit => self.post_init.len(),
            EventKind::PreFlush => self.pre_flush.len(),
            EventKind::PostFlush => self.post_flush.len(),
            EventKind::Snapshot => self.snapshot.len(),
            EventKind::ProcessSnapshot => self.process_snapshot.len(),
            EventKind::PreFinish => self.pre_finish.len(),
            EventKind::Finish => self.finish.len(),
        }
    }

    pub(crate) fn fire(&self, kind: EventKind, channel: &Channel) {
        let list = match kind {
            EventKind::PostInit => &self.post_init,
            EventKind::PreFlush => &self.pre_flush,
            EventKind::PostFlush => &self.post_flush,
            EventKind::PreFinish => &self.pre_finish,
            EventKind::Finish => &self.finish,
            EventKind::Snapshot | EventKind::ProcessSnapshot => {
                error!("{}: {kind} cannot be fired as a lifecycle event", channel.name());
                return;
            }
        };
        for handler in list.current() {
            handler(channel);
        }
    }

    pub(crate) fn fire_snapshot(
        &self,
        channel: &Channel,
        ctx: &ThreadContext,
        trigger: SnapshotView<'_>,
        builder: &mut SnapshotBuilder<'_>,
    ) {
        for handler in self.snapshot.current() {
            handler(channel, ctx, trigger, &mut *builder);
        }
    }

    pub(crate) fn fire_process_snapshot(&self, channel: &Channel, record: SnapshotView<'_>) {
        for handler in self.process_snapshot.current() {
            handler(channel, record);
        }
    }

    /// Drop every handler; the channel owns handler lifetime
    pub(crate) fn clear(&self) {
        self.post_init.clear();
        self.pre_flush.clear();
        self.post_flush.clear();
        self.snapshot.clear();
        self.process_snapshot.clear();
        self.pre_finish.clear();
        self.finish.clear();
    }
}
