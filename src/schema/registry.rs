//! Schema registry - per-type descriptor store
//!
//! Populated once at startup, then shared read-only (`Arc<Registry>`) by the
//! query builder and the entity manager.

use super::descriptor::{EntityDescriptor, Relation};
use crate::entity::{Entity, Model};
use crate::value::Value;
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Handle returned when a type is defined; names the type for later calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityType {
    name: Arc<str>,
}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl AsRef<str> for EntityType {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    entities: HashMap<String, Arc<EntityDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. A second registration under the same name is
    /// merged into the first rather than replacing it.
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<EntityType> {
        let name = descriptor.name.clone();
        let merged = match self.entities.get(&name) {
            Some(existing) => {
                let mut merged = existing.as_ref().clone();
                merged.merge(descriptor);
                merged
            }
            None => descriptor,
        };
        merged.validate()?;
        tracing::debug!("Registered entity {} ({} fields)", name, merged.fields.len());
        self.entities.insert(name.clone(), Arc::new(merged));
        Ok(EntityType { name: name.into() })
    }

    /// Register a typed model's descriptor.
    pub fn register_model<M: Model>(&mut self) -> Result<EntityType> {
        let descriptor = M::descriptor();
        if descriptor.name != M::ENTITY {
            return Err(Error::InvalidDescriptor(format!(
                "model {} declares descriptor named {}",
                M::ENTITY,
                descriptor.name
            )));
        }
        self.register(descriptor)
    }

    pub fn is_registered(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    pub fn get(&self, entity: &str) -> Result<Arc<EntityDescriptor>> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| Error::UnregisteredType(entity.to_string()))
    }

    fn descriptor(&self, entity: &str) -> Result<&EntityDescriptor> {
        self.entities
            .get(entity)
            .map(Arc::as_ref)
            .ok_or_else(|| Error::UnregisteredType(entity.to_string()))
    }

    pub fn primary(&self, entity: &str) -> Result<&str> {
        Ok(&self.descriptor(entity)?.primary)
    }

    pub fn default_values(&self, entity: &str) -> Result<&BTreeMap<String, Value>> {
        Ok(&self.descriptor(entity)?.defaults)
    }

    pub fn fields(&self, entity: &str) -> Result<&[String]> {
        Ok(&self.descriptor(entity)?.fields)
    }

    /// Whether either side declares a relation to the other.
    pub fn has_relation(&self, entity: &str, related: &str) -> Result<bool> {
        Ok(self.relation(entity, related)?.is_some())
    }

    /// Resolve the relation from `entity` to `related`, falling back to the
    /// reverse declaration seen from `entity`'s side.
    pub fn relation(&self, entity: &str, related: &str) -> Result<Option<Relation>> {
        let source = self.descriptor(entity)?;
        let target = self.descriptor(related)?;
        if let Some(relation) = source.relations.get(related) {
            return Ok(Some(relation.clone()));
        }
        Ok(target.relations.get(entity).map(Relation::reversed))
    }

    /// Connector entity type for a many:many pair, from either side.
    pub fn connector(&self, entity: &str, related: &str) -> Result<Option<String>> {
        let source = self.descriptor(entity)?;
        let target = self.descriptor(related)?;
        Ok(source
            .connectors
            .get(related)
            .or_else(|| target.connectors.get(entity))
            .cloned())
    }

    /// All descriptors, sorted by entity name.
    pub fn entity_types(&self) -> Vec<Arc<EntityDescriptor>> {
        let mut all: Vec<_> = self.entities.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// A fresh, unsaved instance of `entity`.
    pub fn create(&self, entity: &str) -> Result<Entity> {
        Ok(Entity::new(self.get(entity)?))
    }
}
