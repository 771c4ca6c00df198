//! Attribute registry
//!
//! Maps names to attribute descriptors. Creation is idempotent by name: the
//! first registration wins and later calls with the same name return the
//! existing attribute regardless of the type or flags they pass. There is no
//! deletion; attributes live as long as the registry.

use log::debug;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{AttrFlags, AttrType, Attribute, Value};
use crate::domain::AttributeId;

#[derive(Default)]
struct RegistryState {
    by_name: HashMap<String, Attribute>,
    by_id: Vec<Attribute>,
}

/// Thread-safe name → attribute table
#[derive(Default)]
pub struct AttributeRegistry {
    state: Mutex<RegistryState>,
}

impl AttributeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an attribute, or return the existing one with the same name.
    pub fn create_or_get(
        &self,
        name: &str,
        attr_type: AttrType,
        flags: AttrFlags,
        metadata: &[(Attribute, Value)],
    ) -> Attribute {
        let mut state = self.state();

        if let Some(existing) = state.by_name.get(name) {
            if existing.attr_type() != attr_type || existing.flags() != flags {
                debug!(
                    "attribute {name}: keeping first registration ({} [{}]), ignoring ({attr_type} [{flags}])",
                    existing.attr_type(),
                    existing.flags()
                );
            }
            return existing.clone();
        }

        let id = AttributeId(u32::try_from(state.by_id.len()).unwrap_or(u32::MAX));
        let attr = Attribute::new(id, name, attr_type, flags, metadata.to_vec());

        state.by_name.insert(name.to_string(), attr.clone());
        state.by_id.push(attr.clone());
        attr
    }

    /// Look up an attribute by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Attribute> {
        self.state().by_name.get(name).cloned()
    }

    #[must_use]
    pub fn get_by_id(&self, id: AttributeId) -> Option<Attribute> {
        self.state().by_id.get(id.0 as usize).cloned()
    }

    /// Number of registered attributes
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All attributes in creation order
    #[must_use]
    pub fn attributes(&self) -> Vec<Attribute> {
        self.state().by_id.clone()
    }
}
