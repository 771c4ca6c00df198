//! Channel configuration
//!
//! Every section has defaults, so a config file only needs the keys it changes:
//!
//! ```json
//! {
//!   "services": ["activity", "allocator"],
//!   "activity": { "record_kernel_names": true },
//!   "metadata": { "categories": [1] }
//! }
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::domain::ConfigError;

/// Default activity pool size (16 MiB)
pub const DEFAULT_BUFFER_SIZE: usize = 0x100_0000;

/// Configuration of one channel and the services registered on it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Services to register, by name (`activity`, `allocator`, `metadata`)
    pub services: Vec<String>,
    pub activity: ActivityConfig,
    pub allocator: AllocatorConfig,
    pub metadata: MetadataConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            services: vec!["activity".to_string()],
            activity: ActivityConfig::default(),
            allocator: AllocatorConfig::default(),
            metadata: MetadataConfig::default(),
        }
    }
}

/// Coprocessor activity tracing
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Collect completion records (otherwise only API regions are tracked)
    pub trace_activities: bool,
    /// Attach demangled kernel names to correlated context
    pub record_kernel_names: bool,
    /// Size of the source's record buffer in bytes
    pub buffer_size: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self { trace_activities: true, record_kernel_names: false, buffer_size: DEFAULT_BUFFER_SIZE }
    }
}

/// Allocator statistics
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Emit one record per allocator in addition to the totals
    pub per_allocator_statistics: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self { per_allocator_statistics: true }
    }
}

/// Run-metadata import
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Categories to import; 1 imports everything (default: general, performance)
    pub categories: Vec<u32>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self { categories: vec![2, 3] }
    }
}

impl ChannelConfig {
    /// Parse a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse a JSON config string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// True if the service called `name` is enabled
    #[must_use]
    pub fn has_service(&self, name: &str) -> bool {
        self.services.iter().any(|s| s == name)
    }
}

/// Parse a comma-separated category list such as `"2,3"`
pub fn parse_categories(list: &str) -> Result<Vec<u32>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map_err(|_| ConfigError::InvalidCategories(list.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert!(config.has_service("activity"));
        assert!(config.activity.trace_activities);
        assert!(!config.activity.record_kernel_names);
        assert_eq!(config.activity.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.allocator.per_allocator_statistics);
        assert_eq!(config.metadata.categories, [2, 3]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ChannelConfig::from_json(r#"{ "activity": { "record_kernel_names": true } }"#).unwrap();
        assert!(config.activity.record_kernel_names);
        assert!(config.activity.trace_activities);
        assert_eq!(config.services, ["activity"]);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(matches!(ChannelConfig::from_json("{ services: }"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_parse_categories() {
        assert_eq!(parse_categories("2,3").unwrap(), [2, 3]);
        assert_eq!(parse_categories(" 1 ").unwrap(), [1]);
        assert!(parse_categories("").unwrap().is_empty());
        assert!(matches!(parse_categories("2,x"), Err(ConfigError::InvalidCategories(_))));
    }
}
