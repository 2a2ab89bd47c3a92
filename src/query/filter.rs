//! Filter objects
//!
//! A filter is an ordered list of predicates. Leaf equality predicates are
//! always bound as parameters. Raw fragments are trusted SQL spliced into the
//! WHERE clause as-is: they exist for custom boolean expressions and must
//! never carry user input.

use crate::schema::Registry;
use crate::value::Value;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterEntry {
    /// `table.field = ?`
    Field(String, Value),
    /// Unescaped SQL fragment
    Raw(String),
    /// Predicates on a related entity type; adds a join
    Related(String, Filter),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    entries: Vec<FilterEntry>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Equality on a field of the filtered entity.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push(FilterEntry::Field(field.into(), value.into()));
        self
    }

    /// Raw SQL fragment. Not parameter-bound.
    pub fn raw(mut self, sql: impl Into<String>) -> Self {
        self.entries.push(FilterEntry::Raw(sql.into()));
        self
    }

    /// Nested predicates on a related entity type.
    pub fn related(mut self, entity: impl Into<String>, filter: Filter) -> Self {
        self.entries.push(FilterEntry::Related(entity.into(), filter));
        self
    }

    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a filter from a JSON object.
    ///
    /// Keys are classified in this order: a numeric-like key carries a raw
    /// SQL fragment as its value; a registered entity type name carries a
    /// nested filter object; anything else must be a field of `entity`.
    pub fn from_json(registry: &Registry, entity: &str, json: &serde_json::Value) -> Result<Self> {
        let descriptor = registry.get(entity)?;
        let object = match json {
            serde_json::Value::Null => return Ok(Filter::new()),
            serde_json::Value::Object(object) => object,
            other => {
                return Err(Error::InvalidFilter(format!(
                    "filter for {} must be an object, got {}",
                    entity, other
                )))
            }
        };

        let mut filter = Filter::new();
        for (key, value) in object {
            if is_numeric_key(key) {
                let sql = value.as_str().ok_or_else(|| {
                    Error::InvalidFilter(format!("raw filter fragment '{}' must be a string", key))
                })?;
                filter = filter.raw(sql);
            } else if registry.is_registered(key) && !descriptor.has_field(key) {
                filter = filter.related(key.clone(), Filter::from_json(registry, key, value)?);
            } else if descriptor.has_field(key) {
                filter = filter.eq(key.clone(), Value::from(value.clone()));
            } else {
                return Err(Error::UnknownField {
                    entity: entity.to_string(),
                    field: key.clone(),
                });
            }
        }
        Ok(filter)
    }
}

/// Keys like `"0"`, `"1"`, `"-2.5"`; names such as `inf` or `nan` are fields.
fn is_numeric_key(key: &str) -> bool {
    let key = key.trim();
    key.chars().any(|c| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.'))
}
