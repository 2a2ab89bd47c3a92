//! Startup verification
//!
//! Creates missing tables (then seeds them), applies pending versioned
//! migrations, and creates missing indexes. Table creation with its seed
//! rows, and each migration, run as one atomic script. Markers that live in
//! the same store are written inside that script; others are written right
//! after it commits.

use super::markers::{marker_key, VersionMarkers};
use crate::schema::Registry;
use crate::storage::adapter::insert_statement;
use crate::storage::{Adapter, Statement};
use crate::value::Value;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;

/// What a verification pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifyReport {
    /// Tables created (and seeded)
    pub created: Vec<String>,
    /// (table, version) of every migration applied
    pub migrated: Vec<(String, u32)>,
    /// Index names created
    pub indexes: Vec<String>,
}

impl VerifyReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.migrated.is_empty() && self.indexes.is_empty()
    }
}

pub struct Migrator<'a> {
    registry: &'a Registry,
    adapter: &'a Adapter,
    markers: &'a dyn VersionMarkers,
}

impl<'a> Migrator<'a> {
    pub fn new(registry: &'a Registry, adapter: &'a Adapter, markers: &'a dyn VersionMarkers) -> Self {
        Self {
            registry,
            adapter,
            markers,
        }
    }

    pub async fn verify(&self) -> Result<VerifyReport> {
        self.markers.prepare().await?;
        let (mut tables, indexes) = self.existing_objects().await?;
        let mut report = VerifyReport::default();

        for descriptor in self.registry.entity_types() {
            let key = marker_key(&descriptor.table);

            if !tables.contains(&descriptor.table) {
                let create = descriptor
                    .create_statement
                    .as_ref()
                    .ok_or_else(|| Error::MissingCreateStatement(descriptor.name.clone()))?;
                let mut script = vec![Statement::new(create.clone(), vec![])];
                script.extend(descriptor.fixtures.iter().map(|fixture| insert_statement(&descriptor, fixture)));
                if let Err(e) = self.run_marked(script, &key, descriptor.latest_version()).await {
                    tracing::error!("Creating {} failed, nothing kept: {}", descriptor.table, e);
                    return Err(e);
                }
                tracing::info!(
                    "Created table {} ({} seed rows)",
                    descriptor.table,
                    descriptor.fixtures.len()
                );
                tables.insert(descriptor.table.clone());
                report.created.push(descriptor.table.clone());
                continue;
            }

            if descriptor.migrations.is_empty() {
                continue;
            }
            let mut applied = self.markers.get(&key).await?.unwrap_or(1);
            for migration in descriptor.sorted_migrations() {
                if migration.version <= applied {
                    continue;
                }
                let script = migration
                    .statements
                    .iter()
                    .map(|sql| Statement::new(sql.clone(), vec![]))
                    .collect();
                if let Err(e) = self.run_marked(script, &key, migration.version).await {
                    tracing::error!(
                        "Migration {} of {} failed, leaving marker at {}: {}",
                        migration.version,
                        descriptor.table,
                        applied,
                        e
                    );
                    return Err(Error::Migration {
                        table: descriptor.table.clone(),
                        version: migration.version,
                        source: Box::new(e),
                    });
                }
                applied = migration.version;
                tracing::info!("Migrated {} to version {}", descriptor.table, applied);
                report.migrated.push((descriptor.table.clone(), migration.version));
            }
        }

        for descriptor in self.registry.entity_types() {
            for (name, columns) in descriptor.index_definitions() {
                if indexes.contains(&name) {
                    continue;
                }
                self.adapter
                    .raw(
                        &format!("CREATE INDEX IF NOT EXISTS {} ON {} ({})", name, descriptor.table, columns),
                        vec![],
                    )
                    .await?;
                tracing::info!("Created index {}", name);
                report.indexes.push(name);
            }
        }

        Ok(report)
    }

    /// Run `script` atomically and record `version` under `key`.
    async fn run_marked(&self, mut script: Vec<Statement>, key: &str, version: u32) -> Result<()> {
        let inline = self.markers.set_statement(key, version);
        let deferred = inline.is_none();
        script.extend(inline);
        self.adapter.database().execute_script(script).await?;
        if deferred {
            self.markers.set(key, version).await?;
        }
        Ok(())
    }

    async fn existing_objects(&self) -> Result<(HashSet<String>, HashSet<String>)> {
        let result = self
            .adapter
            .raw("SELECT type, name FROM sqlite_master WHERE type IN ('table', 'index')", vec![])
            .await?;

        let mut tables = HashSet::new();
        let mut indexes = HashSet::new();
        for row in result.rows {
            let name = row.get("name").and_then(Value::as_str).map(str::to_string);
            match (row.get("type").and_then(Value::as_str), name) {
                (Some("table"), Some(name)) => {
                    tables.insert(name);
                }
                (Some("index"), Some(name)) => {
                    indexes.insert(name);
                }
                _ => {}
            }
        }
        Ok((tables, indexes))
    }
}
