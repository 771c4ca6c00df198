//! Domain model for strata
//!
//! This module contains core identifier types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{AttributeId, ChannelId, CorrelationId, NodeId};

pub use errors::{CapacityExceeded, ConfigError, ExportError, ScopeMismatchError, SourceError};
