//! Plugin instance registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::instance::PluginInstance;

/// Registry of loaded plugin instances.
pub struct InstanceRegistry {
    instances: HashMap<String, Arc<PluginInstance>>,
}

impl InstanceRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: HashMap::new(),
        }
    }

    /// Register an instance, returning the one it replaced.
    pub fn register(&mut self, instance: Arc<PluginInstance>) -> Option<Arc<PluginInstance>> {
        self.instances.insert(instance.id().to_string(), instance)
    }

    /// Get an instance by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<PluginInstance>> {
        self.instances.get(id)
    }

    /// Remove an instance by ID.
    pub fn remove(&mut self, id: &str) -> Option<Arc<PluginInstance>> {
        self.instances.remove(id)
    }

    /// Whether an instance is registered under `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// List all plugin IDs, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.instances.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and return every instance.
    pub fn drain(&mut self) -> Vec<Arc<PluginInstance>> {
        self.instances.drain().map(|(_, instance)| instance).collect()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
