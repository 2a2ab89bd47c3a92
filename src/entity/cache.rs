//! Identity cache: at most one live instance per (entity type, primary key).

use super::instance::Entity;
use crate::value::Value;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: HashMap<String, HashMap<String, Entity>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &str, primary: &Value) -> Option<Entity> {
        let key = primary.cache_key()?;
        self.entries.get(entity)?.get(&key).cloned()
    }

    /// Cache `instance` under its persisted primary key. Instances without
    /// one are not cacheable and are ignored.
    pub fn insert(&mut self, instance: &Entity) -> bool {
        let Some(key) = instance.primary_key().and_then(|pk| pk.cache_key()) else {
            return false;
        };
        self.entries
            .entry(instance.entity_type().to_string())
            .or_default()
            .insert(key, instance.clone());
        true
    }

    pub fn remove(&mut self, entity: &str, primary: &Value) -> Option<Entity> {
        let key = primary.cache_key()?;
        self.entries.get_mut(entity)?.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
