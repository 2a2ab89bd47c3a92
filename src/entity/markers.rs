//! Migration version markers
//!
//! One key per table, `database.version.<table>`, holding the highest
//! migration applied to it.

use crate::lock;
use crate::storage::{Database, Statement};
use crate::value::Value;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

pub fn marker_key(table: &str) -> String {
    format!("database.version.{}", table)
}

#[async_trait]
pub trait VersionMarkers: Send + Sync {
    /// Called once before a verification pass reads any marker.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u32>>;
    async fn set(&self, key: &str, version: u32) -> Result<()>;

    /// A statement recording `version` that can run inside the same script
    /// as the schema change it marks. `None` means call [`set`](Self::set)
    /// after the script instead.
    fn set_statement(&self, _key: &str, _version: u32) -> Option<Statement> {
        None
    }
}

/// Markers kept in a key/value table inside the same store.
pub struct SqliteMarkers {
    db: Database,
}

const MARKER_TABLE: &str = "_lightcrud_markers";

impl SqliteMarkers {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.db
            .execute(
                format!("CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)", MARKER_TABLE),
                vec![],
            )
            .await?;
        Ok(())
    }

    fn upsert(key: &str, version: u32) -> Statement {
        Statement::new(
            format!(
                "INSERT INTO {} (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                MARKER_TABLE
            ),
            vec![Value::from(key), Value::Text(version.to_string())],
        )
    }
}

#[async_trait]
impl VersionMarkers for SqliteMarkers {
    async fn prepare(&self) -> Result<()> {
        self.ensure_table().await
    }

    async fn get(&self, key: &str) -> Result<Option<u32>> {
        self.ensure_table().await?;
        let result = self
            .db
            .execute(format!("SELECT value FROM {} WHERE key = ?", MARKER_TABLE), vec![Value::from(key)])
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get("value"))
            .and_then(Value::as_i64)
            .map(|v| v as u32))
    }

    async fn set(&self, key: &str, version: u32) -> Result<()> {
        self.ensure_table().await?;
        self.db.execute_statement(Self::upsert(key, version)).await?;
        Ok(())
    }

    fn set_statement(&self, key: &str, version: u32) -> Option<Statement> {
        Some(Self::upsert(key, version))
    }
}

/// Process-local markers, for tests and throwaway stores.
#[derive(Debug, Default)]
pub struct MemoryMarkers {
    values: Mutex<HashMap<String, u32>>,
}

impl MemoryMarkers {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionMarkers for MemoryMarkers {
    async fn get(&self, key: &str) -> Result<Option<u32>> {
        Ok(lock(&self.values).get(key).copied())
    }

    async fn set(&self, key: &str, version: u32) -> Result<()> {
        lock(&self.values).insert(key.to_string(), version);
        Ok(())
    }
}
