//! Identifier types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent passing a node index where an attribute id
//! is expected, and make function signatures more expressive.

use std::fmt;

/// Attribute ID
///
/// Index of an attribute in its registry. Stable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u32);

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attr#{}", self.0)
    }
}

/// Context-tree node ID
///
/// Index of a node in the context-tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Correlation ID
///
/// Opaque 64-bit id assigned by an external event source to link the start of
/// an asynchronous operation with its completion record. Uniqueness is the
/// source's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corr:{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        CorrelationId(id)
    }
}

/// Channel ID
///
/// Distinguishes channels sharing one instrumentation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        assert_eq!(CorrelationId(42).to_string(), "corr:42");
        assert_eq!(NodeId(3).to_string(), "node#3");
        assert_eq!(AttributeId(0).to_string(), "attr#0");
    }
}
