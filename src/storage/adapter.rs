//! Connection adapter
//!
//! Turns builder output and dirty-value sets into concrete statements, sends
//! them through the [`Database`] queue and post-processes the results
//! (insert-id capture, affected-row counts, decoding serialized columns).

use super::engine::{Database, RowSet, Statement};
use crate::query::BuiltQuery;
use crate::schema::EntityDescriptor;
use crate::value::{Row, Value};
use crate::Result;

/// `INSERT` for the given values, columns in descriptor field order.
pub fn insert_statement(descriptor: &EntityDescriptor, values: &Row) -> Statement {
    let columns: Vec<&String> = descriptor.fields.iter().filter(|f| values.contains_key(*f)).collect();
    if columns.is_empty() {
        return Statement::new(format!("INSERT INTO {} DEFAULT VALUES", descriptor.table), vec![]);
    }

    let names: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let params = columns.iter().map(|c| values[*c].clone()).collect();
    Statement::new(
        format!("INSERT INTO {} ({}) VALUES ({})", descriptor.table, names.join(", "), placeholders),
        params,
    )
}

/// `UPDATE` of the changed columns, keyed by primary key.
pub fn update_statement(descriptor: &EntityDescriptor, changes: &Row, primary: &Value) -> Statement {
    let columns: Vec<&String> = descriptor
        .fields
        .iter()
        .filter(|f| changes.contains_key(*f) && **f != descriptor.primary)
        .collect();

    let assignments: Vec<String> = columns.iter().map(|c| format!("{} = ?", c)).collect();
    let mut params: Vec<Value> = columns.iter().map(|c| changes[*c].clone()).collect();
    params.push(primary.clone());

    Statement::new(
        format!(
            "UPDATE {} SET {} WHERE {} = ?",
            descriptor.table,
            assignments.join(", "),
            descriptor.primary
        ),
        params,
    )
}

pub fn delete_statement(descriptor: &EntityDescriptor, primary: &Value) -> Statement {
    Statement::new(
        format!("DELETE FROM {} WHERE {} = ?", descriptor.table, descriptor.primary),
        vec![primary.clone()],
    )
}

/// Decode serialized columns of a result row back into structured values.
pub fn decode_row(descriptor: &EntityDescriptor, row: Row) -> Row {
    row.into_iter()
        .map(|(column, value)| {
            if descriptor.is_serialized(&column) {
                (column, value.decode_json())
            } else {
                (column, value)
            }
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct Adapter {
    db: Database,
}

impl Adapter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn select(&self, descriptor: &EntityDescriptor, query: &BuiltQuery) -> Result<Vec<Row>> {
        let result = self.db.execute(query.sql.clone(), query.params.clone()).await?;
        Ok(result.rows.into_iter().map(|row| decode_row(descriptor, row)).collect())
    }

    pub async fn count(&self, query: &BuiltQuery) -> Result<u64> {
        let result = self.db.execute(query.sql.clone(), query.params.clone()).await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0) as u64)
    }

    /// Insert a row. Returns the primary key: the explicit one if the values
    /// carry it, otherwise the store's insert id.
    pub async fn insert(&self, descriptor: &EntityDescriptor, values: &Row) -> Result<Value> {
        let result = self.db.execute_statement(insert_statement(descriptor, values)).await?;
        match values.get(&descriptor.primary).filter(|v| !v.is_null()) {
            Some(primary) => Ok(primary.clone()),
            None => Ok(result.insert_id.map(Value::Integer).unwrap_or_default()),
        }
    }

    pub async fn update(&self, descriptor: &EntityDescriptor, changes: &Row, primary: &Value) -> Result<usize> {
        let result = self
            .db
            .execute_statement(update_statement(descriptor, changes, primary))
            .await?;
        Ok(result.rows_affected.unwrap_or(0))
    }

    pub async fn delete(&self, descriptor: &EntityDescriptor, primary: &Value) -> Result<usize> {
        let result = self.db.execute_statement(delete_statement(descriptor, primary)).await?;
        Ok(result.rows_affected.unwrap_or(0))
    }

    pub async fn raw(&self, sql: &str, params: Vec<Value>) -> Result<RowSet> {
        self.db.execute(sql, params).await
    }
}
