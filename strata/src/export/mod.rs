//! Snapshot subscribers
//!
//! Consumers of finished records, attached to a channel's `process_snapshot`
//! event. Subscribers never fail the flush path: I/O problems are logged and
//! counted.

pub mod collector;
pub mod json_lines;

pub use collector::SnapshotCollector;
pub use json_lines::{record_to_json, JsonLinesWriter};
