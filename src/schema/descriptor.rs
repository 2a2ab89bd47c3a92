//! Entity descriptors - static schema metadata per entity type
//!
//! A descriptor names the backing table, the primary key and the field list,
//! and carries everything the engine needs to create, migrate, seed and join
//! the table. Descriptors are built in code or deserialised from TOML.

use crate::value::{Row, Value};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// How two entity types relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// 1:1, both sides share the key convention
    Single,
    /// 1:many through a foreign key column
    Foreign,
    /// many:many through a connector entity
    Many,
    /// Caller-supplied join columns
    Custom,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Single => "single",
            RelationKind::Foreign => "foreign",
            RelationKind::Many => "many",
            RelationKind::Custom => "custom",
        }
    }
}

impl FromStr for RelationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "single" | "one" => Ok(RelationKind::Single),
            "foreign" => Ok(RelationKind::Foreign),
            "many" => Ok(RelationKind::Many),
            "custom" => Ok(RelationKind::Custom),
            _ => Err(Error::InvalidDescriptor(format!("Unknown relation kind: {}", s))),
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A relation entry in a descriptor's relation map.
///
/// `Custom` columns are spliced into the join verbatim; they are trusted
/// schema input, never user data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Relation {
    Single,
    Foreign,
    Many,
    Custom {
        /// Column on the declaring entity's table
        source: String,
        /// Column on the related entity's table
        target: String,
    },
}

impl Relation {
    pub fn kind(&self) -> RelationKind {
        match self {
            Relation::Single => RelationKind::Single,
            Relation::Foreign => RelationKind::Foreign,
            Relation::Many => RelationKind::Many,
            Relation::Custom { .. } => RelationKind::Custom,
        }
    }

    /// The same relation seen from the other side.
    pub fn reversed(&self) -> Relation {
        match self {
            Relation::Custom { source, target } => Relation::Custom {
                source: target.clone(),
                target: source.clone(),
            },
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Default ordering applied when a query does not specify one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// One versioned migration: statements that must all succeed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub version: u32,
    pub statements: Vec<String>,
}

/// Static schema metadata for one entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity type name, e.g. `Episode`
    pub name: String,
    /// Backing table, e.g. `Episodes`
    pub table: String,
    /// Primary key column
    pub primary: String,
    /// Ordered column list; always contains `primary`
    #[serde(default)]
    pub fields: Vec<String>,
    /// Columns holding structured values stored as JSON text
    #[serde(default)]
    pub serialized: Vec<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    /// Related entity type → relation
    #[serde(default)]
    pub relations: BTreeMap<String, Relation>,
    /// Related entity type → connector entity type, for `Many` relations
    #[serde(default)]
    pub connectors: BTreeMap<String, String>,
    /// Index column lists, comma separated (`"ID_Serie,watched"`)
    #[serde(default)]
    pub indexes: Vec<String>,
    #[serde(default)]
    pub create_statement: Option<String>,
    #[serde(default)]
    pub migrations: Vec<Migration>,
    /// Seed rows inserted right after the table is created
    #[serde(default)]
    pub fixtures: Vec<Row>,
    #[serde(default)]
    pub order: Option<OrderSpec>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>, primary: impl Into<String>) -> Self {
        let primary = primary.into();
        Self {
            name: name.into(),
            table: table.into(),
            fields: vec![primary.clone()],
            primary,
            ..Default::default()
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            if !self.fields.contains(&field) {
                self.fields.push(field);
            }
        }
        self
    }

    pub fn serialized<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.serialized.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn default_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(field.into(), value.into());
        self
    }

    pub fn relation(mut self, entity: impl Into<String>, relation: Relation) -> Self {
        self.relations.insert(entity.into(), relation);
        self
    }

    pub fn connector(mut self, entity: impl Into<String>, connector: impl Into<String>) -> Self {
        self.connectors.insert(entity.into(), connector.into());
        self
    }

    pub fn index(mut self, columns: impl Into<String>) -> Self {
        self.indexes.push(columns.into());
        self
    }

    pub fn create_statement(mut self, sql: impl Into<String>) -> Self {
        self.create_statement = Some(sql.into());
        self
    }

    pub fn migration<I, S>(mut self, version: u32, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.migrations.push(Migration {
            version,
            statements: statements.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn fixture(mut self, row: Row) -> Self {
        self.fixtures.push(row);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order = Some(OrderSpec {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    pub fn is_serialized(&self, field: &str) -> bool {
        self.serialized.iter().any(|f| f == field)
    }

    /// Highest declared migration version, or 1 when none are declared.
    pub fn latest_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(1)
    }

    /// Migrations sorted by ascending version.
    pub fn sorted_migrations(&self) -> Vec<&Migration> {
        let mut migrations: Vec<_> = self.migrations.iter().collect();
        migrations.sort_by_key(|m| m.version);
        migrations
    }

    /// Index name and column list for every declared index.
    pub fn index_definitions(&self) -> Vec<(String, String)> {
        self.indexes
            .iter()
            .map(|definition| {
                let columns: Vec<&str> = definition.split(',').map(str::trim).filter(|c| !c.is_empty()).collect();
                let name = format!("idx_{}_{}", self.table, columns.join("_"));
                (name, columns.join(", "))
            })
            .collect()
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.table.is_empty() || self.primary.is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "entity '{}' needs a name, a table and a primary key",
                self.name
            )));
        }
        if !self.has_field(&self.primary) {
            return Err(Error::InvalidDescriptor(format!(
                "primary key '{}' of {} is not in its field list",
                self.primary, self.name
            )));
        }
        let referenced = self
            .defaults
            .keys()
            .chain(self.serialized.iter())
            .chain(self.order.iter().map(|o| &o.field));
        for field in referenced {
            if !self.has_field(field) {
                return Err(Error::UnknownField {
                    entity: self.name.clone(),
                    field: field.clone(),
                });
            }
        }
        for (entity, relation) in &self.relations {
            if relation.kind() == RelationKind::Many && !self.connectors.contains_key(entity) {
                return Err(Error::InvalidDescriptor(format!(
                    "many relation {} -> {} has no connector entity",
                    self.name, entity
                )));
            }
        }
        Ok(())
    }

    /// Fold a second registration of the same type into this one.
    ///
    /// Fields are unioned; maps are extended; scalar options and lists of the
    /// newcomer replace ours when set.
    pub fn merge(&mut self, other: EntityDescriptor) {
        for field in other.fields {
            if !self.fields.contains(&field) {
                self.fields.push(field);
            }
        }
        for field in other.serialized {
            if !self.serialized.contains(&field) {
                self.serialized.push(field);
            }
        }
        self.defaults.extend(other.defaults);
        self.relations.extend(other.relations);
        self.connectors.extend(other.connectors);
        for index in other.indexes {
            if !self.indexes.contains(&index) {
                self.indexes.push(index);
            }
        }
        if !other.table.is_empty() {
            self.table = other.table;
        }
        if other.create_statement.is_some() {
            self.create_statement = other.create_statement;
        }
        if !other.migrations.is_empty() {
            self.migrations = other.migrations;
        }
        if !other.fixtures.is_empty() {
            self.fixtures = other.fixtures;
        }
        if other.order.is_some() {
            self.order = other.order;
        }
    }
}
