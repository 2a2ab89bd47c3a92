//! Query builder
//!
//! Translates a (possibly nested) [`Filter`] into a single parameterised
//! SELECT. Nested filters on related types become joins; placeholders and
//! parameters are emitted in the same left-to-right order.

use super::filter::{Filter, FilterEntry};
use crate::schema::{EntityDescriptor, Registry, Relation};
use crate::value::Value;
use crate::{Error, Result};

/// Row cap applied when the caller does not ask for a limit.
pub const DEFAULT_LIMIT: u32 = 2000;

/// Options for a find.
///
/// `order_by`, `group_by` and non-identifier `just_fields` entries are trusted
/// SQL and are spliced in verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub order_by: Option<String>,
    pub group_by: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub just_fields: Option<Vec<String>>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    pub fn group_by(mut self, group: impl Into<String>) -> Self {
        self.group_by = Some(group.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn just_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.just_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct Clauses {
    joins: Vec<String>,
    conditions: Vec<String>,
    params: Vec<Value>,
}

impl Clauses {
    fn add_join(&mut self, join: String) {
        if !self.joins.contains(&join) {
            self.joins.push(join);
        }
    }

    fn render(&self, sql: &mut String) {
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
    }
}

pub struct QueryBuilder<'a> {
    registry: &'a Registry,
    default_limit: u32,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            default_limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit;
        self
    }

    /// Build the SELECT for `entity` matching `filter`.
    pub fn select(&self, entity: &str, filter: &Filter, options: &FindOptions) -> Result<BuiltQuery> {
        let descriptor = self.registry.get(entity)?;
        let mut clauses = Clauses::default();
        self.collect(&descriptor, filter, &mut clauses)?;

        let fields = self.projection(&descriptor, options)?;
        let mut sql = format!("SELECT {} FROM {}", fields.join(", "), descriptor.table);
        clauses.render(&mut sql);

        if let Some(group) = &options.group_by {
            sql.push_str(" GROUP BY ");
            sql.push_str(group);
        }

        let order = options.order_by.clone().or_else(|| {
            descriptor
                .order
                .as_ref()
                .map(|o| format!("{}.{} {}", descriptor.table, o.field, o.direction.as_str()))
        });
        if let Some(order) = order {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }

        sql.push_str(&format!(" LIMIT {}", options.limit.unwrap_or(self.default_limit)));
        if let Some(offset) = options.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        tracing::debug!(entity, sql = %sql, params = clauses.params.len(), "built select");
        Ok(BuiltQuery {
            sql,
            params: clauses.params,
        })
    }

    /// Build the row-count variant: distinct primary keys matching `filter`.
    pub fn count(&self, entity: &str, filter: &Filter) -> Result<BuiltQuery> {
        let descriptor = self.registry.get(entity)?;
        let mut clauses = Clauses::default();
        self.collect(&descriptor, filter, &mut clauses)?;

        let mut sql = format!(
            "SELECT COUNT(DISTINCT {}.{}) AS count FROM {}",
            descriptor.table, descriptor.primary, descriptor.table
        );
        clauses.render(&mut sql);
        Ok(BuiltQuery {
            sql,
            params: clauses.params,
        })
    }

    fn collect(&self, descriptor: &EntityDescriptor, filter: &Filter, clauses: &mut Clauses) -> Result<()> {
        for entry in filter.entries() {
            match entry {
                FilterEntry::Field(field, value) => {
                    if !descriptor.has_field(field) {
                        return Err(Error::UnknownField {
                            entity: descriptor.name.clone(),
                            field: field.clone(),
                        });
                    }
                    if value.is_null() {
                        clauses.conditions.push(format!("{}.{} IS NULL", descriptor.table, field));
                    } else {
                        clauses.conditions.push(format!("{}.{} = ?", descriptor.table, field));
                        clauses.params.push(value.clone());
                    }
                }
                FilterEntry::Raw(sql) => clauses.conditions.push(format!("({})", sql)),
                FilterEntry::Related(related, nested) => {
                    for join in self.joins(descriptor, related)? {
                        clauses.add_join(join);
                    }
                    let related = self.registry.get(related)?;
                    self.collect(&related, nested, clauses)?;
                }
            }
        }
        Ok(())
    }

    /// Join clauses that bring `related` into a query over `source`.
    fn joins(&self, source: &EntityDescriptor, related: &str) -> Result<Vec<String>> {
        let unresolvable = || Error::UnresolvableRelation {
            from: source.name.clone(),
            to: related.to_string(),
        };
        let relation = self.registry.relation(&source.name, related)?.ok_or_else(unresolvable)?;
        let target = self.registry.get(related)?;

        match relation {
            Relation::Single | Relation::Foreign => {
                if target.has_field(&source.primary) {
                    Ok(vec![format!(
                        "LEFT JOIN {} ON {}.{} = {}.{}",
                        target.table, target.table, source.primary, source.table, source.primary
                    )])
                } else if source.has_field(&target.primary) {
                    Ok(vec![format!(
                        "LEFT JOIN {} ON {}.{} = {}.{}",
                        target.table, target.table, target.primary, source.table, target.primary
                    )])
                } else {
                    Err(unresolvable())
                }
            }
            Relation::Many => {
                let connector = self
                    .registry
                    .connector(&source.name, related)?
                    .ok_or_else(unresolvable)?;
                let connector = self.registry.get(&connector)?;
                Ok(vec![
                    format!(
                        "LEFT JOIN {} ON {}.{} = {}.{}",
                        connector.table, connector.table, source.primary, source.table, source.primary
                    ),
                    format!(
                        "LEFT JOIN {} ON {}.{} = {}.{}",
                        target.table, target.table, target.primary, connector.table, target.primary
                    ),
                ])
            }
            Relation::Custom { source: from, target: to } => Ok(vec![format!(
                "LEFT JOIN {} ON {}.{} = {}.{}",
                target.table, target.table, to, source.table, from
            )]),
        }
    }

    fn projection(&self, descriptor: &EntityDescriptor, options: &FindOptions) -> Result<Vec<String>> {
        let fields = options.just_fields.as_ref().unwrap_or(&descriptor.fields);
        fields
            .iter()
            .map(|field| {
                if !is_identifier(field) {
                    return Ok(field.clone());
                }
                if !descriptor.has_field(field) {
                    return Err(Error::UnknownField {
                        entity: descriptor.name.clone(),
                        field: field.clone(),
                    });
                }
                Ok(format!("{}.{}", descriptor.table, field))
            })
            .collect()
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
