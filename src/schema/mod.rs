//! Schema Registry - declarative entity metadata
//!
//! - `descriptor`: per-type table, fields, defaults, relations, indexes, migrations
//! - `registry`: the lookup store every other component consults
//! - schema files: descriptors declared in TOML (`[[entity]]` tables)

pub mod descriptor;
pub mod registry;

pub use descriptor::{Direction, EntityDescriptor, Migration, OrderSpec, Relation, RelationKind};
pub use registry::{EntityType, Registry};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A TOML schema file: a list of entity descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub entity: Vec<EntityDescriptor>,
}

impl SchemaFile {
    /// Register every descriptor in the file.
    pub fn into_registry(self) -> crate::Result<Registry> {
        let mut registry = Registry::new();
        for descriptor in self.entity {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }
}

pub fn load_schema(path: &Path) -> anyhow::Result<SchemaFile> {
    let contents = std::fs::read_to_string(path)?;
    let schema: SchemaFile = toml::from_str(&contents)?;
    Ok(schema)
}
