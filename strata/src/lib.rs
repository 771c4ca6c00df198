//! # Strata - Event-to-Snapshot Instrumentation Core
//!
//! Strata lets independent service plugins contribute named, typed facts into
//! a per-thread nested context, correlates that context with operations that
//! complete asynchronously on another thread (coprocessor kernels, copies),
//! and turns everything into snapshot records fanned out to subscribers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Instrumented Application                      │
//! │          begin/end nested regions on many threads               │
//! └──────────┬───────────────────────────────────┬──────────────────┘
//!            │ API calls                         │ begin / end
//!            ▼                                   ▼
//! ┌──────────────────────┐            ┌──────────────────────────┐
//! │  Coprocessor Runtime │ API cb     │      Context Tree        │
//! │  (ActivitySource)    │──────────▶ │  interned, append-only   │
//! │                      │ corr id    │  per-thread cursors      │
//! └──────────┬───────────┘            └────────────┬─────────────┘
//!            │ completion buffers                  │ store(id, node)
//!            │ (runtime thread)                    ▼
//!            │                        ┌──────────────────────────┐
//!            └──────────────────────▶ │   Correlation Store      │
//!                  take(id)           │  one mutex, once-only    │
//!                                     └────────────┬─────────────┘
//!                                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Flush Pipeline → Snapshot Record                │
//! │        decoded fields + inherited branch, fixed capacity        │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 ▼ process_snapshot
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Channel Event Bus → subscribers (collect, JSON)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core
//!
//! - [`attribute`]: Typed, flagged attribute descriptors and the registry
//!   that hands them out (first registration wins)
//! - [`context`]: The shared context tree and per-thread cursors
//! - [`correlation`]: Cross-thread map from correlation id to launch context
//! - [`snapshot`]: Fixed-capacity record builder and read-only views
//! - [`channel`]: Sessions, channels, lifecycle and the event bus
//! - [`flush`]: Draining completion buffers into records
//!
//! ### Adapters and Outputs
//!
//! - [`source`]: The external runtime interface and an in-process simulation
//! - [`services`]: Activity tracing, allocator statistics, run metadata
//! - [`export`]: In-memory collection and JSON Lines output
//!
//! ### Support
//!
//! - [`config`]: Per-channel configuration (JSON, all keys optional)
//! - [`cli`]: Command-line arguments of the demo binary
//! - [`domain`]: Id newtypes and error types
//!
//! ## Typical Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata::channel::Instrumentation;
//! use strata::config::ChannelConfig;
//! use strata::export::SnapshotCollector;
//! use strata::services::ActivityService;
//! use strata::source::SimulatedDevice;
//!
//! let instr = Instrumentation::new();
//! let channel = instr.create_channel("main", ChannelConfig::default());
//! let device = Arc::new(SimulatedDevice::new(0));
//! let activity = ActivityService::register(&channel, device.clone());
//! let records = SnapshotCollector::register(&channel);
//! channel.init();
//!
//! device.launch_kernel("matmul", 500);
//! channel.flush();
//! channel.finish();
//!
//! assert_eq!(records.len(), 1);
//! assert_eq!(activity.stats().correlations.found, 1);
//! ```
//!
//! ## Key Concepts
//!
//! - **Attribute**: a named, typed telemetry dimension
//! - **Branch**: a context-tree leaf whose ancestors a record inherits
//! - **Correlation id**: links an operation's launch to its completion record
//! - **Channel**: independently configured consumer with its own services and counters
//! - **Flush**: draining buffered completion records into snapshots

pub mod attribute;
pub mod channel;
pub mod cli;
pub mod config;
pub mod context;
pub mod correlation;
pub mod domain;
pub mod export;
pub mod flush;
pub mod services;
pub mod snapshot;
pub mod source;
