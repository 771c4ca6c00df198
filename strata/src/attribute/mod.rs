//! # Attributes
//!
//! An attribute is a named, typed telemetry dimension ("gpu.api",
//! "alloc.total.size", ...). Attributes are created through the
//! [`AttributeRegistry`], which de-duplicates them by name, and are immutable
//! afterwards. Cloning an [`Attribute`] is cheap (shared handle).
//!
//! ## Flags
//!
//! | flag          | meaning |
//! |---------------|---------|
//! | `ASVALUE`     | stored as an immediate value, not as a context-tree node |
//! | `NOMERGE`     | never merged with other attributes' nodes |
//! | `SKIP_EVENTS` | begin/end of this attribute never triggers events |
//! | `HIDDEN`      | not shown by default in output |
//! | `NESTED`      | strictly nested region attribute |
//! | `GLOBAL`      | channel-scoped metadata value |
//! | `UNALIGNED`   | begin/end may be called out of order (informational) |

pub mod registry;
pub mod value;

pub use registry::AttributeRegistry;
pub use value::Value;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::BitOr;
use std::sync::Arc;

use crate::domain::AttributeId;

/// Value type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Invalid,
    Str,
    Uint,
    Int,
    Double,
    Bool,
}

impl AttrType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AttrType::Invalid => "inv",
            AttrType::Str => "string",
            AttrType::Uint => "uint",
            AttrType::Int => "int",
            AttrType::Double => "double",
            AttrType::Bool => "bool",
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attribute property bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AttrFlags(u32);

impl AttrFlags {
    pub const DEFAULT: AttrFlags = AttrFlags(0);
    pub const ASVALUE: AttrFlags = AttrFlags(1);
    pub const NOMERGE: AttrFlags = AttrFlags(1 << 1);
    pub const SKIP_EVENTS: AttrFlags = AttrFlags(1 << 2);
    pub const HIDDEN: AttrFlags = AttrFlags(1 << 3);
    pub const NESTED: AttrFlags = AttrFlags(1 << 4);
    pub const GLOBAL: AttrFlags = AttrFlags(1 << 5);
    pub const UNALIGNED: AttrFlags = AttrFlags(1 << 6);

    const NAMES: [(AttrFlags, &'static str); 7] = [
        (AttrFlags::ASVALUE, "asvalue"),
        (AttrFlags::NOMERGE, "nomerge"),
        (AttrFlags::SKIP_EVENTS, "skip_events"),
        (AttrFlags::HIDDEN, "hidden"),
        (AttrFlags::NESTED, "nested"),
        (AttrFlags::GLOBAL, "global"),
        (AttrFlags::UNALIGNED, "unaligned"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set
    #[must_use]
    pub fn contains(self, other: AttrFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttrFlags {
    type Output = AttrFlags;

    fn bitor(self, rhs: AttrFlags) -> AttrFlags {
        AttrFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for AttrFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("default");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct AttributeInner {
    id: AttributeId,
    name: String,
    attr_type: AttrType,
    flags: AttrFlags,
    metadata: Vec<(Attribute, Value)>,
}

/// Shared handle to an immutable attribute descriptor
///
/// Equality and hashing use the attribute id, which is unique per registry.
#[derive(Clone)]
pub struct Attribute(Arc<AttributeInner>);

impl Attribute {
    pub(crate) fn new(
        id: AttributeId,
        name: &str,
        attr_type: AttrType,
        flags: AttrFlags,
        metadata: Vec<(Attribute, Value)>,
    ) -> Self {
        Attribute(Arc::new(AttributeInner { id, name: name.to_string(), attr_type, flags, metadata }))
    }

    #[must_use]
    pub fn id(&self) -> AttributeId {
        self.0.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn attr_type(&self) -> AttrType {
        self.0.attr_type
    }

    #[must_use]
    pub fn flags(&self) -> AttrFlags {
        self.0.flags
    }

    #[must_use]
    pub fn metadata(&self) -> &[(Attribute, Value)] {
        &self.0.metadata
    }

    /// Look up a metadata value by its meta-attribute name
    #[must_use]
    pub fn meta(&self, name: &str) -> Option<&Value> {
        self.0.metadata.iter().find(|(attr, _)| attr.name() == name).map(|(_, value)| value)
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.0.flags.contains(AttrFlags::GLOBAL)
    }

    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.0.flags.contains(AttrFlags::NESTED)
    }

    #[must_use]
    pub fn store_as_value(&self) -> bool {
        self.0.flags.contains(AttrFlags::ASVALUE)
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.id == other.0.id
    }
}

impl Eq for Attribute {}

impl Hash for Attribute {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attribute({} {}:{} [{}])", self.0.id, self.0.name, self.0.attr_type, self.0.flags)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}
