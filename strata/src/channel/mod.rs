//! # Instrumentation Sessions and Channels
//!
//! [`Instrumentation`] is the session object: it owns the attribute registry
//! and the context tree, and is shared by `Arc`. A [`Channel`] is an
//! independently configured consumer of that session with its own services,
//! event handlers, channel-scoped globals and counters. Several channels can
//! run side by side; nothing here is process-global.
//!
//! ## Lifecycle
//!
//! ```text
//! create_channel ──▶ init() ──▶ flush()* ──▶ finish()
//!                    post_init   pre_flush    pre_finish, finish
//! ```

pub mod events;

pub use events::{ChannelEvents, EventKind};

use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::attribute::{AttrFlags, AttrType, Attribute, AttributeRegistry, Value};
use crate::config::ChannelConfig;
use crate::context::{ContextTree, NodeRef, ThreadContext};
use crate::domain::{ChannelId, ScopeMismatchError};
use crate::snapshot::{FixedSnapshot, SnapshotBuilder, SnapshotView};

/// Capacity of records produced by [`Channel::push_snapshot`]
pub const CHANNEL_SNAPSHOT_CAPACITY: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// This thread's context in every live session, keyed by session id
    static THREAD_CONTEXTS: RefCell<HashMap<u64, ThreadContext>> = RefCell::new(HashMap::new());
}

/// Meta-attributes every session provides
pub struct Builtins {
    /// Marks values that aggregation may sum up
    pub class_aggregatable: Attribute,
    /// Marks attributes whose begin/end should trigger snapshots
    pub subscription_event: Attribute,
}

/// Instrumentation session: attribute registry + context tree
pub struct Instrumentation {
    id: u64,
    registry: AttributeRegistry,
    tree: Arc<ContextTree>,
    builtins: Builtins,
    next_channel: AtomicU32,
}

impl Instrumentation {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let registry = AttributeRegistry::new();
        let builtins = Builtins {
            class_aggregatable: registry.create_or_get(
                "class.aggregatable",
                AttrType::Bool,
                AttrFlags::SKIP_EVENTS,
                &[],
            ),
            subscription_event: registry.create_or_get(
                "subscription_event",
                AttrType::Bool,
                AttrFlags::SKIP_EVENTS,
                &[],
            ),
        };

        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            tree: Arc::new(ContextTree::new()),
            builtins,
            next_channel: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    #[must_use]
    pub fn tree(&self) -> &Arc<ContextTree> {
        &self.tree
    }

    #[must_use]
    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    /// Shorthand for [`AttributeRegistry::create_or_get`]
    pub fn create_attribute(
        &self,
        name: &str,
        attr_type: AttrType,
        flags: AttrFlags,
        metadata: &[(Attribute, Value)],
    ) -> Attribute {
        self.registry.create_or_get(name, attr_type, flags, metadata)
    }

    #[must_use]
    pub fn get_attribute(&self, name: &str) -> Option<Attribute> {
        self.registry.get(name)
    }

    /// Shorthand for [`ContextTree::make_entry`]
    pub fn make_entry(&self, attr: &Attribute, value: Value, parent: Option<&NodeRef>) -> NodeRef {
        self.tree.make_entry(attr, value, parent)
    }

    /// A fresh, empty thread context for this session
    #[must_use]
    pub fn thread_context(&self) -> ThreadContext {
        ThreadContext::new(Arc::clone(&self.tree))
    }

    /// Run `f` on the calling thread's context in this session.
    ///
    /// `f` must not call back into `with_thread_context` (or the `begin`,
    /// `end`, `current`, `get` shorthands) of any session.
    pub fn with_thread_context<R>(&self, f: impl FnOnce(&mut ThreadContext) -> R) -> R {
        THREAD_CONTEXTS.with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            let ctx = contexts.entry(self.id).or_insert_with(|| self.thread_context());
            f(ctx)
        })
    }

    /// Begin a scope on the calling thread
    pub fn begin(&self, attr: &Attribute, value: impl Into<Value>) -> NodeRef {
        let value = value.into();
        self.with_thread_context(|ctx| ctx.begin(attr, value))
    }

    /// End a scope on the calling thread
    pub fn end(&self, attr: &Attribute) -> Result<NodeRef, ScopeMismatchError> {
        self.with_thread_context(|ctx| ctx.end(attr))
    }

    /// Innermost open scope on the calling thread
    #[must_use]
    pub fn current(&self) -> Option<NodeRef> {
        self.with_thread_context(|ctx| ctx.current())
    }

    /// Nearest open scope of `attr` on the calling thread
    #[must_use]
    pub fn get(&self, attr: &Attribute) -> Option<NodeRef> {
        self.with_thread_context(|ctx| ctx.get(attr))
    }

    /// Create a channel on this session
    pub fn create_channel(self: &Arc<Self>, name: &str, config: ChannelConfig) -> Arc<Channel> {
        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        Arc::new(Channel {
            id,
            name: name.to_string(),
            instrumentation: Arc::clone(self),
            config,
            events: ChannelEvents::default(),
            globals: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::Created),
            snapshots: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            fields_dropped: AtomicU64::new(0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Active,
    Finished,
}

/// Channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Records delivered to `process_snapshot` handlers
    pub snapshots: u64,
    /// Completed `flush()` calls
    pub flushes: u64,
    /// Entries dropped from full records
    pub fields_dropped: u64,
}

/// An independently configured instrumentation channel
pub struct Channel {
    id: ChannelId,
    name: String,
    instrumentation: Arc<Instrumentation>,
    config: ChannelConfig,
    events: ChannelEvents,
    globals: Mutex<Vec<(Attribute, Value)>>,
    lifecycle: Mutex<Lifecycle>,
    snapshots: AtomicU64,
    flushes: AtomicU64,
    fields_dropped: AtomicU64,
}

impl Channel {
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> &ChannelEvents {
        &self.events
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn globals_guard(&self) -> MutexGuard<'_, Vec<(Attribute, Value)>> {
        self.globals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        *self.lifecycle() == Lifecycle::Active
    }

    /// Activate the channel and fire `post_init`
    pub fn init(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != Lifecycle::Created {
                warn!("{}: init() called on a channel that is {:?}, ignoring", self.name, *lifecycle);
                return;
            }
            *lifecycle = Lifecycle::Active;
        }

        self.events.fire(EventKind::PostInit, self);
        info!("{}: channel initialized", self.name);
    }

    /// Fire `pre_flush`, asking external sources to deliver buffered records,
    /// then `post_flush` once they have been processed
    pub fn flush(&self) {
        if !self.is_active() {
            warn!("{}: flush() on inactive channel, ignoring", self.name);
            return;
        }

        self.events.fire(EventKind::PreFlush, self);
        self.events.fire(EventKind::PostFlush, self);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Fire `pre_finish` and `finish`, then release every handler
    pub fn finish(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != Lifecycle::Active {
                warn!("{}: finish() called on a channel that is {:?}, ignoring", self.name, *lifecycle);
                return;
            }
            *lifecycle = Lifecycle::Finished;
        }

        self.events.fire(EventKind::PreFinish, self);
        self.events.fire(EventKind::Finish, self);
        self.events.clear();
        info!("{}: channel finished", self.name);
    }

    /// Set a channel-scoped value, replacing a previous value of `attr`
    pub fn set_global(&self, attr: &Attribute, value: Value) {
        let mut globals = self.globals_guard();
        if let Some(slot) = globals.iter_mut().find(|(a, _)| a == attr) {
            slot.1 = value;
        } else {
            globals.push((attr.clone(), value));
        }
    }

    /// Remove the channel-scoped value of `attr`; false if it was not set
    pub fn unset_global(&self, attr: &Attribute) -> bool {
        let mut globals = self.globals_guard();
        let before = globals.len();
        globals.retain(|(a, _)| a != attr);
        globals.len() != before
    }

    #[must_use]
    pub fn global(&self, attr: &Attribute) -> Option<Value> {
        self.globals_guard().iter().find(|(a, _)| a == attr).map(|(_, v)| v.clone())
    }

    #[must_use]
    pub fn globals(&self) -> Vec<(Attribute, Value)> {
        self.globals_guard().clone()
    }

    /// Append channel globals and the thread's current branch to `builder`
    pub fn pull_context(&self, ctx: &ThreadContext, builder: &mut SnapshotBuilder<'_>) {
        for (attr, value) in self.globals_guard().iter() {
            if builder.append(attr, value.clone()).is_err() {
                break;
            }
        }
        if let Some(node) = ctx.current() {
            if let Err(err) = builder.append_branch(node) {
                debug!("{}: branch not recorded: {err}", self.name);
            }
        }
    }

    /// Take a snapshot of `ctx`: trigger info, channel context and whatever the
    /// `snapshot` handlers append, then deliver it to `process_snapshot`.
    ///
    /// Returns false if the channel is not active.
    pub fn push_snapshot(&self, ctx: &ThreadContext, trigger: SnapshotView<'_>) -> bool {
        if !self.is_active() {
            return false;
        }

        let mut record = FixedSnapshot::<CHANNEL_SNAPSHOT_CAPACITY>::new();
        {
            let mut builder = record.builder();
            let _ = builder.append_view(trigger);
            self.pull_context(ctx, &mut builder);
            self.events.fire_snapshot(self, ctx, trigger, &mut builder);
        }

        self.process_snapshot(record.view());
        self.note_dropped(record.dropped());
        true
    }

    /// Deliver a finished record to the `process_snapshot` handlers
    pub fn process_snapshot(&self, record: SnapshotView<'_>) {
        self.events.fire_process_snapshot(self, record);
        self.snapshots.fetch_add(1, Ordering::Relaxed);
    }

    /// Count entries dropped from a full record built outside `push_snapshot`
    pub fn note_dropped(&self, dropped: usize) {
        if dropped > 0 {
            self.fields_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            snapshots: self.snapshots.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            fields_dropped: self.fields_dropped.load(Ordering::Relaxed),
        }
    }
}
