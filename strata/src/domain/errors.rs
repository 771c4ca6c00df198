//! Structured error types for strata
//!
//! Scope, capacity, source, config and export failures each get their own
//! type. Nothing here is fatal to the host process: every error is recovered at the
//! call site and at worst reduces telemetry fidelity.

use thiserror::Error;

/// A thread tried to end a scope that is not its innermost open scope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot end '{attribute}': innermost open scope is {}", describe_open(.open.as_deref()))]
pub struct ScopeMismatchError {
    /// Attribute the caller tried to end
    pub attribute: String,
    /// Attribute of the innermost open scope, if any
    pub open: Option<String>,
}

fn describe_open(open: Option<&str>) -> String {
    open.map_or_else(|| "<none>".to_string(), |name| format!("'{name}'"))
}

/// A snapshot record ran out of field slots
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("snapshot capacity of {capacity} entries exceeded")]
pub struct CapacityExceeded {
    pub capacity: usize,
}

/// Setup failures reported by an external event source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Failed to enable {domain} callbacks: {reason}")]
    CallbackEnableFailed { domain: String, reason: String },

    #[error("Failed to enable {domain} activity: {reason}")]
    ActivityEnableFailed { domain: String, reason: String },

    #[error("Failed to open activity pool: {0}")]
    PoolOpenFailed(String),

    #[error("No activity pool is open")]
    PoolNotOpen,

    #[error("Activity flush failed: {0}")]
    FlushFailed(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid category list '{0}'")]
    InvalidCategories(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
